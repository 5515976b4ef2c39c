//! Client configuration.

use std::{collections::HashMap, time::Duration};

use serde::Deserialize;

use crate::reconnect::BackoffConfig;

/// One weighted backend endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct EndpointConfig {
    /// Socket (`ws://`, `wss://`) or poll (`http://`, `https://`) URL.
    pub url: String,
    /// Relative selection weight.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl EndpointConfig {
    /// Endpoint with weight 1.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            weight: 1,
        }
    }

    /// Endpoint with an explicit weight.
    pub fn weighted(url: impl Into<String>, weight: u32) -> Self {
        Self {
            url: url.into(),
            weight,
        }
    }
}

/// Configuration for [`SwarmClient`](crate::SwarmClient).
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    // Endpoints
    /// Persistent socket endpoints.
    pub socket_endpoints: Vec<EndpointConfig>,
    /// Poll (HTTP) endpoints, used when the socket is disabled or unavailable.
    pub poll_endpoints: Vec<EndpointConfig>,
    /// Prefer the socket transport while it is viable.
    pub use_socket: bool,

    // Socket transport
    /// Deadline for a socket to reach the open state.
    #[serde(rename = "socket_connect_timeout_ms", with = "duration_ms")]
    pub socket_connect_timeout: Duration,
    /// Retries before a never-connected socket is declared unavailable.
    pub socket_max_retries: u32,
    /// Base retry interval; the n-th retry waits `interval * n`.
    #[serde(rename = "socket_retry_interval_ms", with = "duration_ms")]
    pub socket_retry_interval: Duration,
    /// Close codes meaning the peer is going away on purpose.
    pub intentional_close_codes: Vec<u16>,

    // Poll transport
    /// Delay after a successful `whats_up` cycle.
    #[serde(rename = "poll_success_delay_ms", with = "duration_ms")]
    pub poll_success_delay: Duration,
    /// Delay after a failed `whats_up` cycle.
    #[serde(rename = "poll_failure_delay_ms", with = "duration_ms")]
    pub poll_failure_delay: Duration,
    /// Delay while there is no session to poll with.
    #[serde(rename = "poll_idle_delay_ms", with = "duration_ms")]
    pub poll_idle_delay: Duration,
    /// Per-request HTTP timeout.
    #[serde(rename = "poll_request_timeout_ms", with = "duration_ms")]
    pub poll_request_timeout: Duration,
    /// Header carrying the session id on poll requests.
    pub session_header: String,

    // Session request
    /// Backend site identifier.
    pub site_id: String,
    /// Local language tag, mapped through the locale mapper.
    pub language: String,
    /// Local to backend language tags.
    pub language_map: HashMap<String, String>,
    /// Optional source tag.
    pub source: Option<String>,
    /// Optional terminal tag.
    pub terminal_id: Option<String>,
    /// Include `source` in `request_session`.
    pub send_source_in_session_request: bool,
    /// Include `terminal` in `request_session`.
    pub send_terminal_in_session_request: bool,

    // Operation retry
    /// Total attempts per operation across SESSION_LOST/NEED_TO_LOGIN retries.
    pub operation_max_attempts: u32,
    #[serde(rename = "operation_retry_initial_delay_ms", with = "duration_ms")]
    pub operation_retry_initial_delay: Duration,
    #[serde(rename = "operation_retry_max_delay_ms", with = "duration_ms")]
    pub operation_retry_max_delay: Duration,
    pub operation_retry_jitter: f64,

    // Misc
    /// Record per-request debug statistics.
    pub debug_statistics: bool,
    /// Capacity of the socket driver command channel.
    pub command_channel_capacity: usize,
    /// Maximum number of in-flight socket requests.
    pub max_pending_requests: usize,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            socket_endpoints: Vec::new(),
            poll_endpoints: Vec::new(),
            use_socket: true,
            socket_connect_timeout: Duration::from_secs(5),
            socket_max_retries: 5,
            socket_retry_interval: Duration::from_secs(2),
            intentional_close_codes: vec![1001],
            poll_success_delay: Duration::from_millis(500),
            poll_failure_delay: Duration::from_secs(5),
            poll_idle_delay: Duration::from_secs(1),
            poll_request_timeout: Duration::from_secs(30),
            session_header: "swarm-session".to_string(),
            site_id: String::new(),
            language: "eng".to_string(),
            language_map: HashMap::new(),
            source: None,
            terminal_id: None,
            send_source_in_session_request: false,
            send_terminal_in_session_request: false,
            operation_max_attempts: 5,
            operation_retry_initial_delay: Duration::from_millis(100),
            operation_retry_max_delay: Duration::from_secs(5),
            operation_retry_jitter: 0.1,
            debug_statistics: false,
            command_channel_capacity: 64,
            max_pending_requests: 1000,
        }
    }
}

impl SwarmConfig {
    /// Create a configuration for the given site.
    pub fn new(site_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            ..Default::default()
        }
    }

    /// Add a socket endpoint.
    #[must_use]
    pub fn socket_endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.socket_endpoints.push(endpoint);
        self
    }

    /// Add a poll endpoint.
    #[must_use]
    pub fn poll_endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.poll_endpoints.push(endpoint);
        self
    }

    /// Enable or disable the socket transport.
    #[must_use]
    pub fn use_socket(mut self, enabled: bool) -> Self {
        self.use_socket = enabled;
        self
    }

    /// Set the socket connect timeout.
    #[must_use]
    pub fn socket_connect_timeout(mut self, timeout: Duration) -> Self {
        self.socket_connect_timeout = timeout;
        self
    }

    /// Set the retry cap for a socket that never connected.
    #[must_use]
    pub fn socket_max_retries(mut self, retries: u32) -> Self {
        self.socket_max_retries = retries;
        self
    }

    /// Set the base socket retry interval.
    #[must_use]
    pub fn socket_retry_interval(mut self, interval: Duration) -> Self {
        self.socket_retry_interval = interval;
        self
    }

    /// Replace the set of intentional close codes.
    #[must_use]
    pub fn intentional_close_codes(mut self, codes: Vec<u16>) -> Self {
        self.intentional_close_codes = codes;
        self
    }

    /// Set the poll cycle delays.
    #[must_use]
    pub fn poll_delays(mut self, success: Duration, failure: Duration, idle: Duration) -> Self {
        self.poll_success_delay = success;
        self.poll_failure_delay = failure;
        self.poll_idle_delay = idle;
        self
    }

    /// Set the poll HTTP timeout.
    #[must_use]
    pub fn poll_request_timeout(mut self, timeout: Duration) -> Self {
        self.poll_request_timeout = timeout;
        self
    }

    /// Set the session header name.
    #[must_use]
    pub fn session_header(mut self, header: impl Into<String>) -> Self {
        self.session_header = header.into();
        self
    }

    /// Set the local language tag.
    #[must_use]
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Add a local to backend language mapping.
    #[must_use]
    pub fn map_language(mut self, local: impl Into<String>, backend: impl Into<String>) -> Self {
        self.language_map.insert(local.into(), backend.into());
        self
    }

    /// Send `source` with every session request.
    #[must_use]
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self.send_source_in_session_request = true;
        self
    }

    /// Send `terminal` with every session request.
    #[must_use]
    pub fn terminal_id(mut self, terminal_id: impl Into<String>) -> Self {
        self.terminal_id = Some(terminal_id.into());
        self.send_terminal_in_session_request = true;
        self
    }

    /// Set the per-operation attempt budget.
    #[must_use]
    pub fn operation_max_attempts(mut self, attempts: u32) -> Self {
        self.operation_max_attempts = attempts;
        self
    }

    /// Set the backoff between operation attempts.
    #[must_use]
    pub fn operation_retry(mut self, initial: Duration, max: Duration, jitter: f64) -> Self {
        self.operation_retry_initial_delay = initial;
        self.operation_retry_max_delay = max;
        self.operation_retry_jitter = jitter;
        self
    }

    /// Enable per-request debug statistics.
    #[must_use]
    pub fn debug_statistics(mut self, enabled: bool) -> Self {
        self.debug_statistics = enabled;
        self
    }

    /// Set the maximum number of in-flight socket requests.
    #[must_use]
    pub fn max_pending_requests(mut self, max: usize) -> Self {
        self.max_pending_requests = max;
        self
    }

    pub(crate) fn operation_backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: self.operation_retry_initial_delay,
            max_delay: self.operation_retry_max_delay,
            factor: 2.0,
            jitter: self.operation_retry_jitter,
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.site_id.trim().is_empty() {
            return Err("site_id cannot be empty".to_string());
        }
        if self.use_socket && self.socket_endpoints.is_empty() {
            return Err("use_socket requires at least one socket endpoint".to_string());
        }
        if !self.use_socket && self.poll_endpoints.is_empty() {
            return Err("poll transport requires at least one poll endpoint".to_string());
        }
        validate_endpoints(&self.socket_endpoints, &["ws", "wss"])?;
        validate_endpoints(&self.poll_endpoints, &["http", "https"])?;
        if self.socket_connect_timeout.is_zero() {
            return Err("Socket connect timeout must be > 0".to_string());
        }
        if self.socket_retry_interval.is_zero() {
            return Err("Socket retry interval must be > 0".to_string());
        }
        if self.poll_success_delay.is_zero()
            || self.poll_failure_delay.is_zero()
            || self.poll_idle_delay.is_zero()
        {
            return Err("Poll delays must be > 0".to_string());
        }
        if self.poll_request_timeout.is_zero() {
            return Err("Poll request timeout must be > 0".to_string());
        }
        if self.session_header.is_empty() {
            return Err("Session header cannot be empty".to_string());
        }
        if self.operation_max_attempts == 0 {
            return Err("Operation max attempts must be > 0".to_string());
        }
        if self.command_channel_capacity == 0 {
            return Err("Command channel capacity must be > 0".to_string());
        }
        if self.max_pending_requests == 0 {
            return Err("Max pending requests must be > 0".to_string());
        }
        self.operation_backoff().validate()
    }
}

fn validate_endpoints(endpoints: &[EndpointConfig], schemes: &[&str]) -> Result<(), String> {
    for endpoint in endpoints {
        if endpoint.weight == 0 {
            return Err(format!("Endpoint {} has zero weight", endpoint.url));
        }
        let parsed = url::Url::parse(&endpoint.url)
            .map_err(|e| format!("Invalid endpoint URL {}: {e}", endpoint.url))?;
        if !schemes.contains(&parsed.scheme()) {
            return Err(format!(
                "Endpoint {} must use one of {:?}",
                endpoint.url, schemes
            ));
        }
    }
    Ok(())
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
