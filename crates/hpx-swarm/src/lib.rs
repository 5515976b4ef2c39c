//! # hpx-swarm
//!
//! Client for swarm backends: one request/subscribe API over a persistent
//! WebSocket with an HTTP polling fallback.
//!
//! The client takes care of:
//!
//! - **Endpoint selection**: weighted draw over the configured endpoints,
//!   quarantining endpoints that never connect
//! - **Reconnects**: linear retry cadence, permanent fallback to polling once
//!   the socket gives up
//! - **Sessions**: single-flight acquisition, restored login on a new session
//! - **Subscriptions**: partial updates merged into full state, replay after
//!   every session change
//! - **Retries**: SESSION_LOST and NEED_TO_LOGIN answered transparently
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hpx_swarm::{EndpointConfig, SwarmClient, SwarmConfig};
//! use serde_json::{Map, json};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SwarmConfig::new("1")
//!         .socket_endpoint(EndpointConfig::new("wss://swarm.example.com"))
//!         .poll_endpoint(EndpointConfig::new("https://swarm.example.com/poll"));
//!     let client = SwarmClient::builder(config).build()?;
//!
//!     let mut params = Map::new();
//!     params.insert("source".to_string(), json!("betting"));
//!     let (subid, state) = client
//!         .subscribe(params, |state| println!("update: {state}"))
//!         .await?;
//!     println!("{subid}: {state}");
//!
//!     client.unsubscribe(&subid).await?;
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod hooks;
pub mod metrics;
pub mod pending;
pub mod poll;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod socket;
pub mod sync;

pub use auth::{CredentialStore, Credentials, LoginRequest, MemoryCredentialStore};
pub use client::{SwarmClient, SwarmClientBuilder};
pub use config::{EndpointConfig, SwarmConfig};
pub use error::{
    ProtocolError, SessionError, SubscriptionError, TransportError, TransportResult,
};
pub use hooks::{BroadcastSink, LocaleMapper, Notification, NotificationSink};
pub use protocol::{Request, Response, ResponseCode, SubscriptionId};
pub use socket::SocketState;
pub use sync::{UpdateCallback, apply_diff};
