//! Persistent WebSocket transport.
//!
//! A spawned driver task owns the socket. It connects to a weighted endpoint,
//! correlates responses with pending requests, fans push frames out to
//! listeners, and reconnects on a linear schedule. Callers talk to it through
//! [`SocketTransport`], which publishes the driver's [`SocketState`] over a
//! `watch` channel.
//!
//! State machine:
//!
//! ```text
//! Disconnected -> Connecting -> Open -> Closed -> Retrying -> Connecting ...
//!                                       Closed -> Unavailable (never connected, retries exhausted)
//!                                 Open -> Stopped (intentional close code or shutdown)
//! ```

mod driver;

use std::{sync::Arc, time::Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::{
    config::SwarmConfig,
    endpoint::{Endpoint, EndpointPool},
    error::{SessionError, TransportError, TransportResult},
    metrics::{StatisticsRecorder, SwarmMetrics},
    pending::{PendingRequestStore, ResponseHook},
    protocol::{Request, RequestId, Response, SubscriptionId, command},
};

/// Lifecycle of the socket transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketState {
    /// Not started yet.
    Disconnected,
    /// Attempting to connect.
    Connecting,
    /// Connected and ready for traffic.
    Open,
    /// The connection dropped; a retry or give-up follows.
    Closed,
    /// Waiting before reconnect attempt `attempt`.
    Retrying { attempt: u32 },
    /// Gave up for good; the client should fall back to polling.
    Unavailable,
    /// Stopped on purpose, will not reconnect.
    Stopped,
}

impl SocketState {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Whether the driver has exited.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Unavailable | Self::Stopped)
    }
}

/// Listener for connection lifecycle events.
pub type LifecycleListener = Arc<dyn Fn() + Send + Sync>;

/// Listener for push frames, keyed by subscription id.
pub type PushListener = Arc<dyn Fn(&Map<String, Value>) + Send + Sync>;

/// Ordered listener lists. Each list is invoked in registration order.
#[derive(Default)]
struct Listeners {
    on_connect: RwLock<Vec<LifecycleListener>>,
    on_close: RwLock<Vec<LifecycleListener>>,
    on_unavailable: RwLock<Vec<LifecycleListener>>,
    on_push: RwLock<Vec<PushListener>>,
}

impl Listeners {
    fn fire(list: &RwLock<Vec<LifecycleListener>>) {
        let snapshot = list.read().clone();
        for listener in snapshot {
            listener();
        }
    }

    fn fire_push(&self, updates: &Map<String, Value>) {
        let snapshot = self.on_push.read().clone();
        for listener in snapshot {
            listener(updates);
        }
    }
}

enum DataCommand {
    Request { rid: RequestId, text: String },
}

enum ControlCommand {
    Close,
}

struct Shared {
    config: Arc<SwarmConfig>,
    state_tx: watch::Sender<SocketState>,
    pending: PendingRequestStore,
    listeners: Listeners,
    endpoints: EndpointPool,
    stats: Option<Arc<StatisticsRecorder>>,
    metrics: SwarmMetrics,
}

impl Shared {
    fn set_state(&self, state: SocketState) {
        debug!(state = ?state, "Socket state");
        self.state_tx.send_replace(state);
    }
}

struct DriverParts {
    ctrl_rx: mpsc::Receiver<ControlCommand>,
    cmd_rx: mpsc::Receiver<DataCommand>,
}

/// Handle to the socket transport.
pub struct SocketTransport {
    shared: Arc<Shared>,
    ctrl_tx: mpsc::Sender<ControlCommand>,
    cmd_tx: mpsc::Sender<DataCommand>,
    driver: Mutex<Option<DriverParts>>,
}

impl SocketTransport {
    /// Create the transport. Nothing connects until [`start`](Self::start).
    pub fn new(
        config: Arc<SwarmConfig>,
        stats: Option<Arc<StatisticsRecorder>>,
        metrics: SwarmMetrics,
    ) -> Self {
        let (ctrl_tx, ctrl_rx) = mpsc::channel(1);
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_channel_capacity);
        let (state_tx, _) = watch::channel(SocketState::Disconnected);

        let shared = Arc::new(Shared {
            pending: PendingRequestStore::new(config.max_pending_requests),
            endpoints: EndpointPool::new(&config.socket_endpoints),
            listeners: Listeners::default(),
            state_tx,
            stats,
            metrics,
            config,
        });

        Self {
            shared,
            ctrl_tx,
            cmd_tx,
            driver: Mutex::new(Some(DriverParts { ctrl_rx, cmd_rx })),
        }
    }

    /// Register a listener fired once per successful (re)connection.
    pub fn on_connect(&self, listener: LifecycleListener) {
        self.shared.listeners.on_connect.write().push(listener);
    }

    /// Register a listener fired when the connection drops unintentionally.
    pub fn on_close(&self, listener: LifecycleListener) {
        self.shared.listeners.on_close.write().push(listener);
    }

    /// Register a listener fired when the transport gives up for good.
    pub fn on_unavailable(&self, listener: LifecycleListener) {
        self.shared.listeners.on_unavailable.write().push(listener);
    }

    /// Register a listener for push frames.
    pub fn add_push_listener(&self, listener: PushListener) {
        self.shared.listeners.on_push.write().push(listener);
    }

    /// Spawn the driver task. Later calls are no-ops.
    pub fn start(&self) -> bool {
        let Some(parts) = self.driver.lock().take() else {
            return false;
        };
        tokio::spawn(driver::connection_driver(
            Arc::clone(&self.shared),
            parts.ctrl_rx,
            parts.cmd_rx,
        ));
        true
    }

    pub fn state(&self) -> SocketState {
        self.shared.state_tx.borrow().clone()
    }

    /// Snapshot of the endpoint pool.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.shared.endpoints.snapshot()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Wait until the socket is open.
    ///
    /// Fails once the transport is unavailable or stopped.
    pub async fn wait_until_open(&self) -> TransportResult<()> {
        let mut rx = self.shared.state_tx.subscribe();
        let state = rx
            .wait_for(|state| state.is_open() || state.is_terminal())
            .await
            .map_err(|_| TransportError::connection_closed("socket driver dropped"))?
            .clone();
        match state {
            SocketState::Open => Ok(()),
            SocketState::Unavailable => Err(TransportError::Unavailable),
            _ => Err(SessionError::Closed.into()),
        }
    }

    /// Send a request and wait for its response.
    ///
    /// `hook` runs inside the driver when the response is dispatched, before
    /// any later frame is processed.
    pub async fn request(
        &self,
        request: &Request,
        hook: Option<ResponseHook>,
    ) -> TransportResult<Response> {
        self.start();
        self.wait_until_open().await?;

        let rid = RequestId::new();
        let text = request.encode(Some(&rid))?;
        let rx = self
            .shared
            .pending
            .add(rid.clone(), hook)
            .ok_or_else(|| TransportError::internal("Too many pending requests"))?;

        if let Some(stats) = &self.shared.stats {
            let unsubscribe = (request.command == command::UNSUBSCRIBE)
                .then(|| request.params.get("subid").and_then(SubscriptionId::from_value))
                .flatten();
            stats.record_sent(&rid, &request.command, unsubscribe.as_ref(), text.len());
        }

        let started = Instant::now();
        if self
            .cmd_tx
            .send(DataCommand::Request {
                rid: rid.clone(),
                text,
            })
            .await
            .is_err()
        {
            self.shared.pending.remove(&rid);
            return Err(TransportError::connection_closed("Socket driver shut down"));
        }

        let result = match rx.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::internal("Request channel dropped")),
        };
        self.shared
            .metrics
            .record_request("socket", started.elapsed(), result.is_ok());
        result
    }

    /// Stop the driver without reconnecting or firing close listeners.
    pub async fn shutdown(&self) {
        if self.driver.lock().take().is_some() {
            // Never started.
            self.shared.set_state(SocketState::Stopped);
            return;
        }
        let _ = self.ctrl_tx.send(ControlCommand::Close).await;
    }
}
