//! Login requests and credential storage.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::{Request, command};

/// Saved authentication, enough to restore a login on a new session.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub auth_token: String,
    /// Backend user id, kept opaque.
    pub user_id: Value,
    #[serde(default)]
    pub never_expires: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("auth_token", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("never_expires", &self.never_expires)
            .field("login", &self.login)
            .finish()
    }
}

/// Persistent credential storage provided by the embedding application.
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Option<Credentials>;
    fn set(&self, credentials: Credentials);
    fn clear(&self);
}

/// In-memory [`CredentialStore`].
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    credentials: Mutex<Option<Credentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(credentials: Credentials) -> Self {
        Self {
            credentials: Mutex::new(Some(credentials)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Option<Credentials> {
        self.credentials.lock().clone()
    }

    fn set(&self, credentials: Credentials) {
        *self.credentials.lock() = Some(credentials);
    }

    fn clear(&self) {
        self.credentials.lock().take();
    }
}

/// Ways to log in.
#[derive(Clone)]
pub enum LoginRequest {
    /// `login` with username and password. `remember` asks for credentials
    /// that never expire.
    Password {
        username: String,
        password: String,
        remember: bool,
    },
    /// `facebook_login` with an access token.
    Facebook { access_token: String },
    /// `ok_login` with an access token and session secret.
    Odnoklassniki {
        access_token: String,
        session_secret_key: String,
    },
}

impl fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password {
                username, remember, ..
            } => f
                .debug_struct("Password")
                .field("username", username)
                .field("remember", remember)
                .finish_non_exhaustive(),
            Self::Facebook { .. } => f.write_str("Facebook"),
            Self::Odnoklassniki { .. } => f.write_str("Odnoklassniki"),
        }
    }
}

impl LoginRequest {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Password {
            username: username.into(),
            password: password.into(),
            remember: false,
        }
    }

    /// Build the backend request, merging `extra` into its params.
    pub fn to_request(&self, extra: Map<String, Value>) -> Request {
        let request = match self {
            Self::Password {
                username, password, ..
            } => Request::new(command::LOGIN)
                .param("username", username.as_str())
                .param("password", password.as_str()),
            Self::Facebook { access_token } => {
                Request::new(command::FACEBOOK_LOGIN).param("access_token", access_token.as_str())
            }
            Self::Odnoklassniki {
                access_token,
                session_secret_key,
            } => Request::new(command::OK_LOGIN)
                .param("access_token", access_token.as_str())
                .param("session_secret_key", session_secret_key.as_str()),
        };
        request.extend_params(extra)
    }

    /// Credentials to store from a successful login response.
    ///
    /// `None` when the response carries no `auth_token`.
    pub fn credentials_from(&self, data: &Value) -> Option<Credentials> {
        let auth_token = data.get("auth_token")?.as_str()?.to_string();
        let (never_expires, login) = match self {
            Self::Password {
                username, remember, ..
            } => (*remember, Some(username.clone())),
            _ => (false, None),
        };
        Some(Credentials {
            auth_token,
            user_id: data.get("user_id").cloned().unwrap_or(Value::Null),
            never_expires,
            login,
        })
    }
}

/// `restore_login` request for saved credentials.
pub fn restore_request(credentials: &Credentials) -> Request {
    Request::new(command::RESTORE_LOGIN)
        .param("user_id", credentials.user_id.clone())
        .param("auth_token", credentials.auth_token.as_str())
}
