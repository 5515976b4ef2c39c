//! Wire envelope of the swarm protocol.
//!
//! Requests are `{command, params, rid}`. Responses echo the `rid` and carry
//! `{code, data}`. Push frames carry `rid: 0` and a `data` map keyed by
//! subscription id, each value being a partial update for that
//! subscription.

use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ProtocolError;

/// Command names understood by the backend.
pub mod command {
    pub const REQUEST_SESSION: &str = "request_session";
    pub const WHATS_UP: &str = "whats_up";
    pub const GET: &str = "get";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const LOGIN: &str = "login";
    pub const RESTORE_LOGIN: &str = "restore_login";
    pub const FACEBOOK_LOGIN: &str = "facebook_login";
    pub const OK_LOGIN: &str = "ok_login";
    pub const LOGOUT: &str = "logout";

    /// Whether a command authenticates the session.
    pub fn is_login(command: &str) -> bool {
        matches!(command, LOGIN | RESTORE_LOGIN | FACEBOOK_LOGIN | OK_LOGIN)
    }
}

/// Unique identifier for request-response correlation.
/// Uses ULID for lexicographically sortable, unique IDs.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a new unique request ID using ULID.
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Backend-assigned subscription identifier.
///
/// The backend may send it as a number or a string; it is always keyed as a
/// string, matching the keys of push frames.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read a subid from a JSON value.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriptionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<u64> for SubscriptionId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// A command and its parameters, without correlation id.
///
/// Kept by subscriptions so they can be reissued verbatim on replay.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Request {
    pub command: String,
    pub params: Map<String, Value>,
}

#[derive(Serialize)]
struct Envelope<'a> {
    command: &'a str,
    params: &'a Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rid: Option<&'a RequestId>,
}

impl Request {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            params: Map::new(),
        }
    }

    pub fn with_params(command: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            command: command.into(),
            params,
        }
    }

    /// Set a single parameter.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Merge additional parameters, overriding existing keys.
    #[must_use]
    pub fn extend_params(mut self, extra: Map<String, Value>) -> Self {
        self.params.extend(extra);
        self
    }

    /// Encode the request, with `rid` when correlating over the socket.
    pub fn encode(&self, rid: Option<&RequestId>) -> Result<String, serde_json::Error> {
        serde_json::to_string(&Envelope {
            command: &self.command,
            params: &self.params,
            rid,
        })
    }
}

/// Response codes with client-side meaning, plus passthrough for the rest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseCode {
    Ok,
    SessionLost,
    NeedToLogin,
    Other(i64),
}

impl ResponseCode {
    pub const OK: i64 = 0;
    pub const SESSION_LOST: i64 = 5;
    pub const NEED_TO_LOGIN: i64 = 12;

    pub fn from_code(code: i64) -> Self {
        match code {
            Self::OK => Self::Ok,
            Self::SESSION_LOST => Self::SessionLost,
            Self::NEED_TO_LOGIN => Self::NeedToLogin,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Self::Ok => Self::OK,
            Self::SessionLost => Self::SESSION_LOST,
            Self::NeedToLogin => Self::NEED_TO_LOGIN,
            Self::Other(code) => code,
        }
    }
}

/// A decoded `{code, data}` response.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub code: ResponseCode,
    pub data: Value,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            code: ResponseCode::Ok,
            data,
        }
    }

    /// Decode the `code`/`data` fields of a response object.
    pub fn from_object(object: &Map<String, Value>) -> Result<Self, ProtocolError> {
        let code = object
            .get("code")
            .and_then(Value::as_i64)
            .ok_or(ProtocolError::MissingField { field: "code" })?;
        Ok(Self {
            code: ResponseCode::from_code(code),
            data: object.get("data").cloned().unwrap_or(Value::Null),
        })
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::malformed(e.to_string()))?;
        match value {
            Value::Object(object) => Self::from_object(&object),
            other => Err(ProtocolError::unexpected(format!(
                "response is not an object: {other}"
            ))),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ResponseCode::Ok
    }

    /// `data.subid` of a subscribe response.
    pub fn subscription_id(&self) -> Option<SubscriptionId> {
        self.data.get("subid").and_then(SubscriptionId::from_value)
    }
}

/// Classification of one inbound socket frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// Answer to the request with this `rid`.
    Response {
        rid: RequestId,
        response: Result<Response, ProtocolError>,
    },
    /// Partial updates keyed by subscription id.
    Push(Map<String, Value>),
    /// Anything else; logged and dropped by the caller.
    Unexpected(Value),
}

impl Frame {
    /// Parse and classify a text frame.
    ///
    /// Only malformed JSON is an error; shapes that do not fit the envelope
    /// come back as [`Frame::Unexpected`].
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::malformed(e.to_string()))?;
        let Value::Object(object) = value else {
            return Ok(Self::Unexpected(value));
        };

        match correlation_id(object.get("rid")) {
            Some(rid) => {
                let response = Response::from_object(&object);
                Ok(Self::Response { rid, response })
            }
            None => match object.get("data") {
                Some(Value::Object(updates)) => Ok(Self::Push(updates.clone())),
                _ => Ok(Self::Unexpected(Value::Object(object))),
            },
        }
    }
}

/// Non-zero rid, or `None` for a push / missing rid.
fn correlation_id(rid: Option<&Value>) -> Option<RequestId> {
    match rid? {
        Value::String(s) if !s.is_empty() && s != "0" => Some(RequestId(s.clone())),
        Value::Number(n) if n.as_i64() != Some(0) && n.as_u64() != Some(0) => {
            Some(RequestId(n.to_string()))
        }
        _ => None,
    }
}
