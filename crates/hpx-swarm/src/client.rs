//! Client facade.
//!
//! [`SwarmClient`] ties the transports, the session manager and the
//! subscription registry together. It prefers the socket transport and
//! falls back to polling for good once the socket gives up. Every operation
//! runs through one retry policy:
//!
//! | Code | Action |
//! |---|---|
//! | `0` | return `data` |
//! | `5` SESSION_LOST | drop the session, back off, retry |
//! | `12` NEED_TO_LOGIN | restore the saved login, back off, retry |
//! | other | [`TransportError::Api`] |
//!
//! Retries are bounded by `operation_max_attempts`.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::{
    FutureExt,
    future::{BoxFuture, join_all},
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::{task::JoinHandle, time::sleep};
use tracing::{debug, info, warn};

use crate::{
    auth::{CredentialStore, LoginRequest, MemoryCredentialStore, restore_request},
    config::SwarmConfig,
    endpoint::Endpoint,
    error::{SessionError, SubscriptionError, TransportError, TransportResult},
    hooks::{LocaleMapper, MapLocaleMapper, NoopSink, Notification, NotificationSink},
    metrics::{RequestStatistics, StatisticsRecorder, SwarmMetrics},
    pending::ResponseHook,
    poll::{PollOutcome, PollTransport},
    protocol::{Request, Response, ResponseCode, SubscriptionId, command},
    reconnect::calculate_backoff,
    session::{SessionBackend, SessionManager},
    socket::{SocketState, SocketTransport},
    sync::{SubscriptionRegistry, UpdateCallback},
};

/// Builds a fresh response hook for each attempt of an operation.
type HookFactory = dyn Fn() -> ResponseHook + Send + Sync;

/// Builder for [`SwarmClient`].
pub struct SwarmClientBuilder {
    config: SwarmConfig,
    credentials: Option<Arc<dyn CredentialStore>>,
    locale: Option<Arc<dyn LocaleMapper>>,
    notifications: Option<Arc<dyn NotificationSink>>,
    metrics: Option<SwarmMetrics>,
}

impl SwarmClientBuilder {
    /// Credential storage. Defaults to an in-memory store.
    #[must_use]
    pub fn credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    /// Locale mapping. Defaults to the config's `language_map`.
    #[must_use]
    pub fn locale_mapper(mut self, mapper: Arc<dyn LocaleMapper>) -> Self {
        self.locale = Some(mapper);
        self
    }

    #[must_use]
    pub fn notifications(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifications = Some(sink);
        self
    }

    #[must_use]
    pub fn metrics(mut self, metrics: SwarmMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the configuration and start the preferred transport.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> TransportResult<SwarmClient> {
        self.config.validate().map_err(TransportError::config)?;

        let config = Arc::new(self.config);
        let metrics = self.metrics.unwrap_or_default();
        let stats = config
            .debug_statistics
            .then(|| Arc::new(StatisticsRecorder::new()));
        let poll = if config.poll_endpoints.is_empty() {
            None
        } else {
            Some(PollTransport::new(&config, metrics.clone())?)
        };
        let locale = self
            .locale
            .unwrap_or_else(|| Arc::new(MapLocaleMapper::new(config.language_map.clone())));

        let inner = Arc::new_cyclic(|me: &Weak<ClientInner>| {
            let socket = config.use_socket.then(|| {
                let socket =
                    SocketTransport::new(Arc::clone(&config), stats.clone(), metrics.clone());
                wire_socket(&socket, me);
                socket
            });
            ClientInner {
                me: me.clone(),
                config: Arc::clone(&config),
                socket,
                poll,
                session: SessionManager::new(),
                registry: Arc::new(SubscriptionRegistry::new()),
                credentials: self
                    .credentials
                    .unwrap_or_else(|| Arc::new(MemoryCredentialStore::new())),
                locale,
                notifications: self.notifications.unwrap_or_else(|| Arc::new(NoopSink)),
                stats,
                metrics,
                downgraded: AtomicBool::new(false),
                authorized: AtomicBool::new(false),
                logged_in: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                poll_task: Mutex::new(None),
            }
        });

        match &inner.socket {
            Some(socket) => {
                socket.start();
            }
            None => inner.start_polling(),
        }

        Ok(SwarmClient { inner })
    }
}

fn wire_socket(socket: &SocketTransport, me: &Weak<ClientInner>) {
    let weak = me.clone();
    socket.on_connect(Arc::new(move || {
        if let Some(inner) = weak.upgrade() {
            inner.spawn_session_acquire();
        }
    }));

    let weak = me.clone();
    socket.on_close(Arc::new(move || {
        if let Some(inner) = weak.upgrade() {
            inner.session.invalidate();
            inner.notifications.notify(Notification::ConnectionLost);
        }
    }));

    let weak = me.clone();
    socket.on_unavailable(Arc::new(move || {
        if let Some(inner) = weak.upgrade() {
            inner.downgrade();
        }
    }));

    let weak = me.clone();
    socket.add_push_listener(Arc::new(move |updates: &Map<String, Value>| {
        if let Some(inner) = weak.upgrade() {
            inner.handle_push(updates);
        }
    }));
}

/// Handle to a swarm backend.
///
/// Cheap to clone; clones share the connection, session and subscriptions.
#[derive(Clone)]
pub struct SwarmClient {
    inner: Arc<ClientInner>,
}

impl SwarmClient {
    pub fn builder(config: SwarmConfig) -> SwarmClientBuilder {
        SwarmClientBuilder {
            config,
            credentials: None,
            locale: None,
            notifications: None,
            metrics: None,
        }
    }

    /// Send an arbitrary request and return its `data`.
    pub async fn request(&self, request: &Request) -> TransportResult<Value> {
        self.inner.execute(request, None).await
    }

    /// `get` with the given params.
    pub async fn get(&self, params: Map<String, Value>) -> TransportResult<Value> {
        self.get_with_command(command::GET, params).await
    }

    /// Like [`get`](Self::get) with a different command name.
    pub async fn get_with_command(
        &self,
        command: &str,
        params: Map<String, Value>,
    ) -> TransportResult<Value> {
        let request = Request::with_params(command, params);
        self.inner.execute(&request, None).await
    }

    /// Subscribe to updates.
    ///
    /// Returns the backend's subscription id and the initial full state.
    /// `on_update` then receives the merged full state after every push.
    pub async fn subscribe<F>(
        &self,
        params: Map<String, Value>,
        on_update: F,
    ) -> TransportResult<(SubscriptionId, Value)>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let request = Request::with_params(command::GET, params).param("subscribe", true);
        self.inner
            .subscribe(request, Arc::new(on_update), false)
            .await
    }

    /// Stop updates for `subid`.
    ///
    /// The local entry is removed even if the backend rejects the request.
    pub async fn unsubscribe(&self, subid: &SubscriptionId) -> TransportResult<()> {
        self.inner.unsubscribe(subid).await
    }

    /// Unsubscribe several ids at once, one request per id.
    pub async fn unsubscribe_many(
        &self,
        subids: &[SubscriptionId],
    ) -> Vec<(SubscriptionId, TransportResult<()>)> {
        let results = join_all(subids.iter().map(|subid| self.inner.unsubscribe(subid))).await;
        subids.iter().cloned().zip(results).collect()
    }

    /// Log in and store the returned credentials.
    ///
    /// `extra` is merged into the command params.
    pub async fn login(
        &self,
        login: LoginRequest,
        extra: Map<String, Value>,
    ) -> TransportResult<Value> {
        let request = login.to_request(extra);
        match self.inner.execute(&request, None).await {
            Ok(data) => {
                if let Some(credentials) = login.credentials_from(&data) {
                    self.inner.credentials.set(credentials);
                }
                self.inner.set_logged_in(true);
                info!(command = %request.command, "Logged in");
                Ok(data)
            }
            Err(err) => {
                self.inner.authorized.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Log in again with the saved credentials.
    pub async fn restore_login(&self) -> TransportResult<Value> {
        self.inner.restore_login().await
    }

    /// Log out. Saved credentials are cleared whatever the outcome.
    pub async fn logout(&self) -> TransportResult<Value> {
        let result = self
            .inner
            .execute(&Request::new(command::LOGOUT), None)
            .await;
        self.inner.credentials.clear();
        self.inner.set_logged_in(false);
        result
    }

    pub fn is_authorized(&self) -> bool {
        self.inner.authorized.load(Ordering::Acquire)
    }

    /// Current session id, if one is established.
    pub fn session_id(&self) -> Option<String> {
        self.inner.session.current()
    }

    /// Active subscription ids.
    pub fn subscriptions(&self) -> Vec<SubscriptionId> {
        self.inner.registry.ids()
    }

    /// Socket state, or `None` when the socket is disabled.
    pub fn socket_state(&self) -> Option<SocketState> {
        self.inner.socket.as_ref().map(SocketTransport::state)
    }

    /// Socket endpoint bookkeeping. Empty when the socket is disabled.
    pub fn socket_endpoints(&self) -> Vec<Endpoint> {
        self.inner
            .socket
            .as_ref()
            .map(SocketTransport::endpoints)
            .unwrap_or_default()
    }

    /// Whether the client fell back to polling for good.
    pub fn is_downgraded(&self) -> bool {
        self.inner.downgraded.load(Ordering::Acquire)
    }

    /// Per-request debug statistics. Empty unless `debug_statistics` is on.
    pub fn statistics(&self) -> Vec<RequestStatistics> {
        self.inner
            .stats
            .as_ref()
            .map(|stats| stats.snapshot())
            .unwrap_or_default()
    }

    /// Log the debug statistics.
    pub fn dump_statistics(&self) {
        match &self.inner.stats {
            Some(stats) => stats.dump(),
            None => info!("Debug statistics are disabled"),
        }
    }

    /// Stop both transports. In-flight requests fail with `ConnectionClosed`.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down swarm client");
        if let Some(socket) = &self.inner.socket {
            socket.shutdown().await;
        }
        if let Some(task) = self.inner.poll_task.lock().take() {
            task.abort();
        }
        self.inner.session.invalidate();
    }
}

struct ClientInner {
    me: Weak<ClientInner>,
    config: Arc<SwarmConfig>,
    socket: Option<SocketTransport>,
    poll: Option<PollTransport>,
    session: SessionManager,
    registry: Arc<SubscriptionRegistry>,
    credentials: Arc<dyn CredentialStore>,
    locale: Arc<dyn LocaleMapper>,
    notifications: Arc<dyn NotificationSink>,
    stats: Option<Arc<StatisticsRecorder>>,
    metrics: SwarmMetrics,
    downgraded: AtomicBool,
    authorized: AtomicBool,
    logged_in: AtomicBool,
    closed: AtomicBool,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientInner {
    fn set_logged_in(&self, logged_in: bool) {
        self.logged_in.store(logged_in, Ordering::Release);
        self.authorized.store(logged_in, Ordering::Release);
    }

    fn socket_active(&self) -> Option<&SocketTransport> {
        self.socket
            .as_ref()
            .filter(|_| !self.downgraded.load(Ordering::Acquire))
    }

    /// Send one request on the active transport.
    async fn dispatch(
        &self,
        request: &Request,
        session: Option<&str>,
        hook: Option<ResponseHook>,
    ) -> TransportResult<Response> {
        if let Some(socket) = self.socket_active() {
            let result = socket.request(request, hook).await;
            if matches!(result, Err(TransportError::Unavailable))
                && let Some(inner) = self.me.upgrade()
            {
                inner.downgrade();
            }
            return result;
        }
        match &self.poll {
            Some(poll) => poll.request(request, session, hook).await,
            None => Err(TransportError::NoEndpoint),
        }
    }

    async fn acquire_session(&self) -> TransportResult<String> {
        let backend: Arc<dyn SessionBackend> = self.me.upgrade().ok_or(SessionError::Closed)?;
        Ok(self.session.acquire(backend).await?)
    }

    fn spawn_session_acquire(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = inner.acquire_session().await {
                warn!(error = %err, "Background session acquisition failed");
            }
        });
    }

    fn session_request(&self) -> Request {
        let config = &self.config;
        let mut request = Request::new(command::REQUEST_SESSION)
            .param("language", self.locale.map(&config.language))
            .param("site_id", config.site_id.as_str());
        if config.send_source_in_session_request
            && let Some(source) = &config.source
        {
            request = request.param("source", source.as_str());
        }
        if config.send_terminal_in_session_request
            && let Some(terminal) = &config.terminal_id
        {
            request = request.param("terminal", terminal.as_str());
        }
        request
    }

    /// Run `request` under the retry policy and return the response `data`.
    ///
    /// Boxed because restoring a login re-enters it.
    fn execute<'a>(
        &'a self,
        request: &'a Request,
        hook: Option<&'a HookFactory>,
    ) -> BoxFuture<'a, TransportResult<Value>> {
        async move {
            let max_attempts = self.config.operation_max_attempts;
            let mut attempt = 0;

            loop {
                if self.closed.load(Ordering::Acquire) {
                    return Err(SessionError::Closed.into());
                }
                attempt += 1;

                let (session, result) = self.attempt(request, hook).await;
                match result {
                    Ok(response) => match response.code {
                        ResponseCode::Ok => return Ok(response.data),
                        ResponseCode::SessionLost => {
                            warn!(command = %request.command, attempt, "Session lost, retrying");
                            self.authorized.store(false, Ordering::Release);
                            if let Some(session) = &session {
                                self.session.invalidate_session(session);
                            }
                            self.notifications.notify(Notification::SessionLost);
                        }
                        ResponseCode::NeedToLogin if !command::is_login(&request.command) => {
                            info!(command = %request.command, "Backend requires login, restoring");
                            self.authorized.store(false, Ordering::Release);
                            match self.restore_login().await {
                                Ok(_) => {}
                                Err(TransportError::Session(SessionError::NoCredentials)) => {
                                    return Err(SessionError::NeedToLogin.into());
                                }
                                Err(err) => return Err(err),
                            }
                        }
                        code => return Err(TransportError::api(code.code(), response.data)),
                    },
                    Err(err) if Self::is_retryable(&err) => {
                        debug!(command = %request.command, attempt, error = %err, "Request interrupted, retrying");
                        if matches!(err, TransportError::HttpStatus { .. })
                            && let Some(session) = &session
                        {
                            self.session.invalidate_session(session);
                        }
                    }
                    Err(err) => return Err(err),
                }

                if attempt >= max_attempts {
                    warn!(command = %request.command, attempts = attempt, "Giving up");
                    return Err(SessionError::RetriesExhausted { attempts: attempt }.into());
                }
                sleep(calculate_backoff(self.config.operation_backoff(), attempt - 1)).await;
            }
        }
        .boxed()
    }

    /// One try of `request`, together with the session it ran under.
    async fn attempt(
        &self,
        request: &Request,
        hook: Option<&HookFactory>,
    ) -> (Option<String>, TransportResult<Response>) {
        let session = match self.acquire_session().await {
            Ok(session) => session,
            Err(err) => return (None, Err(err)),
        };
        let result = self
            .dispatch(request, Some(&session), hook.map(|factory| factory()))
            .await;
        (Some(session), result)
    }

    fn is_retryable(err: &TransportError) -> bool {
        match err {
            TransportError::Session(SessionError::AcquisitionFailed { .. }) => true,
            // Poll endpoint does not know the session.
            TransportError::HttpStatus { status, .. } => *status == 404,
            other => other.is_connection_loss(),
        }
    }

    async fn restore_login(&self) -> TransportResult<Value> {
        let Some(credentials) = self.credentials.get() else {
            warn!("Cannot restore login, no saved credentials");
            return Err(SessionError::NoCredentials.into());
        };
        match self.execute(&restore_request(&credentials), None).await {
            Ok(data) => {
                self.set_logged_in(true);
                debug!("Login restored");
                Ok(data)
            }
            Err(err) => {
                self.authorized.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    async fn subscribe(
        &self,
        request: Request,
        callback: UpdateCallback,
        deliver_initial: bool,
    ) -> TransportResult<(SubscriptionId, Value)> {
        let registry = Arc::clone(&self.registry);
        let factory = {
            let request = request.clone();
            let callback = Arc::clone(&callback);
            move || {
                registration_hook(
                    Arc::clone(&registry),
                    request.clone(),
                    Arc::clone(&callback),
                    deliver_initial,
                )
            }
        };

        let data = self.execute(&request, Some(&factory)).await?;
        let subid = data
            .get("subid")
            .and_then(SubscriptionId::from_value)
            .ok_or(SubscriptionError::MissingSubscriptionId)?;
        debug!(subid = %subid, "Subscribed");
        Ok((subid, data.get("data").cloned().unwrap_or(Value::Null)))
    }

    async fn unsubscribe(&self, subid: &SubscriptionId) -> TransportResult<()> {
        self.registry.remove(subid);
        let request = Request::new(command::UNSUBSCRIBE).param("subid", subid.as_str());
        match self.execute(&request, None).await {
            Ok(_) => {
                debug!(subid = %subid, "Unsubscribed");
                Ok(())
            }
            Err(TransportError::Api { code, .. }) => {
                warn!(subid = %subid, code, "Unsubscribe failed");
                Err(SubscriptionError::UnsubscribeFailed {
                    subid: subid.clone(),
                    code,
                }
                .into())
            }
            Err(err) => Err(err),
        }
    }

    /// Reissue every subscription from scratch.
    async fn resubscribe(&self) {
        let replays = self.registry.drain_for_replay();
        if replays.is_empty() {
            return;
        }
        info!(count = replays.len(), "Resubscribing");

        join_all(replays.into_iter().map(|replay| async move {
            match self.subscribe(replay.request, replay.callback, true).await {
                Ok((subid, _)) => {
                    debug!(previous = %replay.previous_id, subid = %subid, "Resubscribed");
                }
                Err(err) => {
                    warn!(previous = %replay.previous_id, error = %err, "Resubscribe failed");
                }
            }
        }))
        .await;
    }

    fn handle_push(&self, updates: &Map<String, Value>) {
        let orphans = self.registry.apply_push(updates);
        if orphans.is_empty() {
            return;
        }
        let Some(inner) = self.me.upgrade() else {
            return;
        };
        for subid in orphans {
            let orphaned = SubscriptionError::Orphaned {
                subid: subid.clone(),
            };
            warn!(error = %orphaned, "Unsubscribing");
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                if let Err(err) = inner.unsubscribe(&subid).await {
                    debug!(subid = %subid, error = %err, "Orphan unsubscribe failed");
                }
            });
        }
    }

    /// Switch to polling for the rest of the client's life.
    fn downgrade(self: &Arc<Self>) {
        if self.downgraded.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("Socket transport unavailable, falling back to polling");
        self.session.invalidate();
        self.notifications.notify(Notification::TransportDowngraded);
        self.start_polling();
        if !self.registry.is_empty() || self.logged_in.load(Ordering::Acquire) {
            self.spawn_session_acquire();
        }
    }

    fn start_polling(self: &Arc<Self>) {
        if self.poll.is_none() {
            warn!("No poll endpoint configured, cannot poll");
            return;
        }
        let mut task = self.poll_task.lock();
        if task.is_none() && !self.closed.load(Ordering::Acquire) {
            *task = Some(tokio::spawn(poll_loop(Arc::downgrade(self))));
        }
    }

    /// One `whats_up` cycle; returns the delay before the next one.
    async fn poll_cycle(&self) -> Duration {
        let config = &self.config;
        let Some(poll) = &self.poll else {
            return config.poll_idle_delay;
        };
        if self.session.current().is_none() && self.registry.is_empty() {
            return config.poll_idle_delay;
        }

        let session = match self.acquire_session().await {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "No session for whats_up");
                return config.poll_failure_delay;
            }
        };

        let outcome = poll.whats_up(&session).await;
        let delay = outcome.next_delay(config);
        match outcome {
            PollOutcome::Updates(updates) => {
                if !updates.is_empty() {
                    self.handle_push(&updates);
                }
            }
            PollOutcome::SessionLost => {
                info!(error = %SessionError::Lost, "whats_up lost the session");
                self.authorized.store(false, Ordering::Release);
                self.session.invalidate_session(&session);
                // A new session replays the subscriptions.
                if let Some(inner) = self.me.upgrade() {
                    inner.spawn_session_acquire();
                }
            }
            PollOutcome::UnknownSession => {
                self.session.invalidate_session(&session);
            }
            PollOutcome::Failed(_) => {}
        }
        delay
    }
}

/// Registers the subscription while the response is dispatched, so a push
/// right behind the response already finds it.
fn registration_hook(
    registry: Arc<SubscriptionRegistry>,
    request: Request,
    callback: UpdateCallback,
    deliver_initial: bool,
) -> ResponseHook {
    Box::new(move |response: &Response| {
        if !response.is_ok() {
            return;
        }
        let Some(subid) = response.subscription_id() else {
            return;
        };
        let state = response.data.get("data").cloned().unwrap_or(Value::Null);
        registry.register(subid, request, Arc::clone(&callback), state.clone());
        if deliver_initial {
            callback(&state);
        }
    })
}

async fn poll_loop(inner: Weak<ClientInner>) {
    loop {
        let Some(client) = inner.upgrade() else {
            return;
        };
        if client.closed.load(Ordering::Acquire) {
            return;
        }
        let delay = client.poll_cycle().await;
        drop(client);
        sleep(delay).await;
    }
}

#[async_trait]
impl SessionBackend for ClientInner {
    async fn request_session(&self) -> Result<String, SessionError> {
        let request = self.session_request();
        debug!(socket = self.socket_active().is_some(), "Requesting session");
        let response = self
            .dispatch(&request, None, None)
            .await
            .map_err(|err| SessionError::acquisition_failed(err.to_string()))?;

        let sid = match response.data.get("sid") {
            Some(Value::String(sid)) => sid.clone(),
            Some(Value::Number(sid)) => sid.to_string(),
            _ => {
                warn!(code = response.code.code(), "request_session response carried no sid");
                return Err(SessionError::acquisition_failed("sid not present"));
            }
        };
        self.metrics.record_session();
        Ok(sid)
    }

    async fn on_session_acquired(&self, _session_id: String) {
        self.notifications.notify(Notification::GotSession);
        if self.logged_in.load(Ordering::Acquire)
            && let Err(err) = self.restore_login().await
        {
            warn!(error = %err, "Could not restore login on the new session");
        }
        self.resubscribe().await;
    }
}
