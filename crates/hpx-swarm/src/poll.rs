//! Poll transport.
//!
//! Every request is a standalone HTTP POST of the JSON envelope, carrying
//! the session id in a header. Push updates are pulled with `whats_up`.

use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode, header::CONTENT_TYPE};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    config::SwarmConfig,
    endpoint::EndpointPool,
    error::{TransportError, TransportResult},
    metrics::SwarmMetrics,
    pending::ResponseHook,
    protocol::{Request, Response, ResponseCode, command},
};

/// Result of one `whats_up` cycle.
#[derive(Debug)]
pub enum PollOutcome {
    /// Push updates keyed by subscription id. May be empty.
    Updates(Map<String, Value>),
    /// The backend answered `SESSION_LOST`.
    SessionLost,
    /// The backend does not know the session (HTTP 404).
    UnknownSession,
    /// Anything else went wrong.
    Failed(TransportError),
}

impl PollOutcome {
    /// Delay before the next cycle.
    pub fn next_delay(&self, config: &SwarmConfig) -> Duration {
        match self {
            Self::Updates(_) | Self::SessionLost => config.poll_success_delay,
            Self::UnknownSession | Self::Failed(_) => config.poll_failure_delay,
        }
    }
}

/// HTTP request channel pinned to one poll endpoint.
pub struct PollTransport {
    client: Client,
    url: String,
    session_header: String,
    metrics: SwarmMetrics,
    // Requests go out one at a time.
    in_flight: Mutex<()>,
}

impl PollTransport {
    /// Build the transport, drawing its endpoint once from the weighted pool.
    pub fn new(config: &SwarmConfig, metrics: SwarmMetrics) -> TransportResult<Self> {
        let url = EndpointPool::new(&config.poll_endpoints).select()?.url;
        let client = Client::builder()
            .timeout(config.poll_request_timeout)
            .build()?;
        debug!(url = %url, "Poll transport pinned to endpoint");

        Ok(Self {
            client,
            url,
            session_header: config.session_header.clone(),
            metrics,
            in_flight: Mutex::new(()),
        })
    }

    /// Post one request.
    ///
    /// A non-success status becomes [`TransportError::HttpStatus`]; the body
    /// is parsed as a response envelope otherwise. `hook` runs before the
    /// next request may go out.
    pub async fn request(
        &self,
        request: &Request,
        session: Option<&str>,
        hook: Option<ResponseHook>,
    ) -> TransportResult<Response> {
        let body = request.encode(None)?;
        let _guard = self.in_flight.lock().await;

        let started = Instant::now();
        let result = self.post(body, session).await;
        self.metrics
            .record_request("poll", started.elapsed(), result.is_ok());
        if let (Ok(response), Some(hook)) = (&result, hook) {
            hook(response);
        }
        result
    }

    async fn post(&self, body: String, session: Option<&str>) -> TransportResult<Response> {
        let mut builder = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(session) = session {
            builder = builder.header(self.session_header.as_str(), session);
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(TransportError::HttpStatus {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(Response::parse(&text)?)
    }

    /// Run one `whats_up` cycle for `session`.
    pub async fn whats_up(&self, session: &str) -> PollOutcome {
        match self
            .request(&Request::new(command::WHATS_UP), Some(session), None)
            .await
        {
            Ok(response) => match response.code {
                ResponseCode::Ok => match response.data {
                    Value::Object(updates) => {
                        if !updates.is_empty() {
                            self.metrics.record_push("poll", updates.len());
                        }
                        PollOutcome::Updates(updates)
                    }
                    _ => PollOutcome::Updates(Map::new()),
                },
                ResponseCode::SessionLost => PollOutcome::SessionLost,
                code => {
                    warn!(code = code.code(), "Unexpected whats_up response");
                    PollOutcome::Failed(TransportError::api(code.code(), response.data))
                }
            },
            Err(TransportError::HttpStatus { status, .. })
                if status == StatusCode::NOT_FOUND.as_u16() =>
            {
                debug!("Poll session unknown to the backend");
                PollOutcome::UnknownSession
            }
            Err(err) => {
                warn!(error = %err, "whats_up failed");
                PollOutcome::Failed(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, header, method},
    };

    use super::*;
    use crate::config::EndpointConfig;

    fn transport(server: &MockServer) -> PollTransport {
        let config = SwarmConfig::new("1")
            .use_socket(false)
            .poll_endpoint(EndpointConfig::new(server.uri()));
        PollTransport::new(&config, SwarmMetrics::new()).expect("transport")
    }

    #[tokio::test]
    async fn test_request_sends_envelope_and_session_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("swarm-session", "sid-1"))
            .and(body_json(json!({"command": "get", "params": {"source": "betting"}})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"code": 0, "data": {"ok": 1}})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport(&server);
        let request = Request::new(command::GET).param("source", "betting");
        let response = transport
            .request(&request, Some("sid-1"), None)
            .await
            .expect("response");
        assert!(response.is_ok());
        assert_eq!(response.data, json!({"ok": 1}));
    }

    #[tokio::test]
    async fn test_whats_up_outcomes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("swarm-session", "live"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"code": 0, "data": {"42": {"price": 3}}})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(header("swarm-session", "lost"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 5, "data": {}})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(header("swarm-session", "gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(header("swarm-session", "broken"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let transport = transport(&server);
        let config = SwarmConfig::default();

        let outcome = transport.whats_up("live").await;
        assert_eq!(outcome.next_delay(&config), Duration::from_millis(500));
        match outcome {
            PollOutcome::Updates(updates) => assert_eq!(updates["42"], json!({"price": 3})),
            other => panic!("unexpected outcome: {other:?}"),
        }

        assert!(matches!(transport.whats_up("lost").await, PollOutcome::SessionLost));

        let outcome = transport.whats_up("gone").await;
        assert!(matches!(outcome, PollOutcome::UnknownSession));
        assert_eq!(outcome.next_delay(&config), Duration::from_secs(5));

        assert!(matches!(
            transport.whats_up("broken").await,
            PollOutcome::Failed(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn test_requires_poll_endpoint() {
        let result = PollTransport::new(&SwarmConfig::new("1"), SwarmMetrics::new());
        assert!(matches!(result, Err(TransportError::NoEndpoint)));
    }
}
