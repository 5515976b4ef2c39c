use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::mpsc,
    time::{sleep, timeout},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::protocol::{CloseFrame, Message, frame::coding::CloseCode},
};
use tracing::{debug, info, warn};

use super::{ControlCommand, DataCommand, Listeners, Shared, SocketState};
use crate::{
    error::TransportError,
    protocol::{Frame, SubscriptionId},
    reconnect::linear_delay,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a connection (or connection attempt) ended.
enum Outcome {
    /// Client asked to stop.
    Shutdown,
    /// Peer closed with a code meaning it is going away on purpose.
    Intentional { code: u16 },
    /// Anything else: failed connect, error, unexpected close.
    Dropped { error: TransportError },
}

pub(super) async fn connection_driver(
    shared: Arc<Shared>,
    mut ctrl_rx: mpsc::Receiver<ControlCommand>,
    mut cmd_rx: mpsc::Receiver<DataCommand>,
) {
    let config = Arc::clone(&shared.config);
    let mut retry_count: u32 = 0;
    let mut was_able_to_connect = false;

    loop {
        let selected = match shared.endpoints.select() {
            Ok(selected) => selected,
            Err(err) => {
                warn!(error = %err, "No socket endpoint left to try");
                give_up(&shared);
                return;
            }
        };

        shared.set_state(SocketState::Connecting);
        debug!(url = %selected.url, "Connecting socket");

        let attempt = tokio::select! {
            biased;
            _ = ctrl_rx.recv() => None,
            result = timeout(config.socket_connect_timeout, connect_async(selected.url.as_str())) => Some(result),
        };

        let outcome = match attempt {
            None => Outcome::Shutdown,
            Some(Ok(Ok((socket, _response)))) => {
                shared.endpoints.record_success(selected.index);
                retry_count = 0;
                was_able_to_connect = true;
                shared.set_state(SocketState::Open);
                info!(url = %selected.url, "Socket open");
                Listeners::fire(&shared.listeners.on_connect);

                connection_task(&shared, &mut ctrl_rx, &mut cmd_rx, socket).await
            }
            Some(Ok(Err(err))) => {
                warn!(url = %selected.url, error = %err, "Socket connect failed");
                Outcome::Dropped {
                    error: TransportError::connect(selected.url.as_str(), err.to_string()),
                }
            }
            Some(Err(_)) => {
                warn!(
                    url = %selected.url,
                    timeout = ?config.socket_connect_timeout,
                    "Socket did not open in time, aborting attempt"
                );
                Outcome::Dropped {
                    error: TransportError::timeout(config.socket_connect_timeout),
                }
            }
        };

        match outcome {
            Outcome::Shutdown => {
                info!("Socket shut down");
                stop(&shared, "socket shut down");
                return;
            }
            Outcome::Intentional { code } => {
                info!(code, "Peer is going away, not reconnecting");
                stop(&shared, "peer is going away");
                return;
            }
            Outcome::Dropped { error } => {
                shared.set_state(SocketState::Closed);
                Listeners::fire(&shared.listeners.on_close);
                shared.pending.clear_with_error(&error.to_string());
                shared.endpoints.record_failure(selected.index);

                if retry_count >= config.socket_max_retries && !was_able_to_connect {
                    warn!(retries = retry_count, "Giving up on socket transport");
                    give_up(&shared);
                    return;
                }

                retry_count = retry_count.saturating_add(1);
                let delay = linear_delay(config.socket_retry_interval, retry_count);
                info!(
                    attempt = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Scheduling socket reconnect"
                );
                shared.metrics.record_reconnect();
                shared.set_state(SocketState::Retrying {
                    attempt: retry_count,
                });

                tokio::select! {
                    biased;
                    _ = ctrl_rx.recv() => {
                        info!("Socket shut down while waiting to reconnect");
                        stop(&shared, "socket shut down");
                        return;
                    }
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}

fn stop(shared: &Shared, reason: &str) {
    shared.pending.clear_with_error(reason);
    shared.set_state(SocketState::Stopped);
}

fn give_up(shared: &Shared) {
    shared.pending.clear_with_error("socket transport unavailable");
    shared.set_state(SocketState::Unavailable);
    Listeners::fire(&shared.listeners.on_unavailable);
}

async fn connection_task(
    shared: &Shared,
    ctrl_rx: &mut mpsc::Receiver<ControlCommand>,
    cmd_rx: &mut mpsc::Receiver<DataCommand>,
    socket: Socket,
) -> Outcome {
    let (mut ws_write, mut ws_read) = socket.split();

    loop {
        tokio::select! {
            biased;
            _ = ctrl_rx.recv() => {
                let close = Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client shutdown".into(),
                }));
                let _ = ws_write.send(close).await;
                return Outcome::Shutdown;
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(DataCommand::Request { rid, text }) => {
                        if !shared.pending.contains(&rid) {
                            debug!(rid = %rid, "Skipping request rejected before it was sent");
                            continue;
                        }
                        if let Err(err) = ws_write.send(Message::text(text)).await {
                            shared
                                .pending
                                .resolve(&rid, Err(TransportError::websocket(err.to_string())));
                            return Outcome::Dropped {
                                error: TransportError::from(err),
                            };
                        }
                    }
                    None => return Outcome::Shutdown,
                }
            }
            msg = ws_read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => dispatch(shared, text.as_str()),
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => dispatch(shared, text),
                        Err(_) => warn!(len = data.len(), "Dropping non UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.as_ref().map(|frame| u16::from(frame.code));
                        if let Some(code) = code
                            && shared.config.intentional_close_codes.contains(&code)
                        {
                            return Outcome::Intentional { code };
                        }
                        return Outcome::Dropped {
                            error: TransportError::connection_closed(format!(
                                "closed by peer (code {code:?})"
                            )),
                        };
                    }
                    // Ping replies are queued by tungstenite itself.
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        return Outcome::Dropped {
                            error: TransportError::from(err),
                        };
                    }
                    None => {
                        return Outcome::Dropped {
                            error: TransportError::connection_closed("stream ended"),
                        };
                    }
                }
            }
        }
    }
}

/// Route one inbound text frame.
fn dispatch(shared: &Shared, text: &str) {
    let frame = match Frame::parse(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, len = text.len(), "Cannot parse socket frame, dropping");
            return;
        }
    };

    match frame {
        Frame::Response { rid, response } => {
            if let Some(stats) = &shared.stats {
                let subid = response.as_ref().ok().and_then(|r| r.subscription_id());
                stats.record_response(&rid, subid, text.len());
            }
            if !shared.pending.resolve(&rid, response.map_err(TransportError::from)) {
                warn!(rid = %rid, "Got second response for request or invalid rid");
            }
        }
        Frame::Push(updates) => {
            if let Some(stats) = &shared.stats {
                for (subid, diff) in &updates {
                    let bytes = serde_json::to_string(diff).map(|s| s.len()).unwrap_or(0);
                    stats.record_update(&SubscriptionId::new(subid.as_str()), bytes);
                }
            }
            shared.metrics.record_push("socket", updates.len());
            shared.listeners.fire_push(&updates);
        }
        Frame::Unexpected(value) => {
            warn!(frame = %value, "Got frame without rid or data, dropping");
        }
    }
}
