//! In-process swarm backend for integration tests.

#![allow(dead_code)]

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_tungstenite::{
    accept_async,
    tungstenite::protocol::{CloseFrame, Message, frame::coding::CloseCode},
};

/// What the backend sends back.
pub enum Reply {
    Frame(Value),
    Raw(String),
    Close(u16),
}

pub type Handler = Arc<dyn Fn(&Value, &BackendState) -> Vec<Reply> + Send + Sync>;

#[derive(Default)]
pub struct BackendState {
    pub connections: AtomicUsize,
    pub sessions: AtomicUsize,
    stalled: AtomicUsize,
    received: Mutex<Vec<Value>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Reply>>>,
}

impl BackendState {
    /// Commands received so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.received
            .lock()
            .iter()
            .filter_map(|request| request["command"].as_str().map(str::to_string))
            .collect()
    }

    /// Hold the next `n` TCP connections open without a WebSocket handshake.
    pub fn stall_handshakes(&self, n: usize) {
        self.stalled.store(n, Ordering::SeqCst);
    }

    pub fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| *c == command).count()
    }

    pub fn requests(&self, command: &str) -> Vec<Value> {
        self.received
            .lock()
            .iter()
            .filter(|request| request["command"] == command)
            .cloned()
            .collect()
    }
}

pub struct Backend {
    pub url: String,
    pub state: Arc<BackendState>,
}

impl Backend {
    /// Send a reply on the most recent connection.
    pub fn send(&self, reply: Reply) {
        if let Some(tx) = self.state.outbound.lock().as_ref() {
            let _ = tx.send(reply);
        }
    }
}

/// `{rid, code, data}` answer to `request`.
pub fn reply(request: &Value, code: i64, data: Value) -> Reply {
    Reply::Frame(json!({"rid": request["rid"], "code": code, "data": data}))
}

/// Push frame carrying `updates` keyed by subid.
pub fn push(updates: Value) -> Reply {
    Reply::Frame(json!({"rid": 0, "data": updates}))
}

/// Answers `request_session` with `sid-N`; `None` for other commands.
pub fn session_reply(request: &Value, state: &BackendState) -> Option<Reply> {
    if request["command"] != "request_session" {
        return None;
    }
    let n = state.sessions.fetch_add(1, Ordering::SeqCst) + 1;
    Some(reply(request, 0, json!({"sid": format!("sid-{n}")})))
}

pub async fn start_backend(handler: Handler) -> std::io::Result<Backend> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let state = Arc::new(BackendState::default());

    let server_state = Arc::clone(&state);
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let stall = server_state
                .stalled
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if stall {
                tokio::spawn(async move {
                    let _held = stream;
                    std::future::pending::<()>().await;
                });
                continue;
            }
            let state = Arc::clone(&server_state);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let Ok(ws) = accept_async(stream).await else {
                    return;
                };
                state.connections.fetch_add(1, Ordering::SeqCst);
                let (mut write, mut read) = ws.split();
                let (tx, mut rx) = mpsc::unbounded_channel();
                *state.outbound.lock() = Some(tx.clone());

                loop {
                    tokio::select! {
                        Some(reply) = rx.recv() => match reply {
                            Reply::Frame(value) => {
                                if write.send(Message::text(value.to_string())).await.is_err() {
                                    return;
                                }
                            }
                            Reply::Raw(text) => {
                                if write.send(Message::text(text)).await.is_err() {
                                    return;
                                }
                            }
                            Reply::Close(code) => {
                                let frame = CloseFrame {
                                    code: CloseCode::from(code),
                                    reason: "".into(),
                                };
                                let _ = write.send(Message::Close(Some(frame))).await;
                                return;
                            }
                        },
                        msg = read.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                let Ok(request) = serde_json::from_str::<Value>(text.as_str()) else {
                                    continue;
                                };
                                state.received.lock().push(request.clone());
                                for reply in handler(&request, &state) {
                                    let _ = tx.send(reply);
                                }
                            }
                            Some(Ok(_)) => {}
                            _ => return,
                        },
                    }
                }
            });
        }
    });

    Ok(Backend {
        url: format!("ws://{addr}"),
        state,
    })
}

/// Poll `condition` until it holds, panicking after `limit`.
pub async fn wait_until<F>(limit: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(limit, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Await `future` with a deadline.
pub async fn within<T>(limit: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(limit, future)
        .await
        .expect("operation timed out")
}
