//! Collaborator hooks: locale mapping and notifications.
//!
//! Observers outside the client learn about session and connection changes
//! through a [`NotificationSink`]. The session request maps the local
//! language tag through a [`LocaleMapper`].

use std::{collections::HashMap, fmt};

use tokio::sync::broadcast;

/// Maps a local language tag to the tag the backend expects.
pub trait LocaleMapper: Send + Sync {
    fn map(&self, local: &str) -> String;
}

/// Lookup-table mapper; unknown tags pass through unchanged.
#[derive(Clone, Debug, Default)]
pub struct MapLocaleMapper {
    table: HashMap<String, String>,
}

impl MapLocaleMapper {
    pub fn new(table: HashMap<String, String>) -> Self {
        Self { table }
    }
}

impl LocaleMapper for MapLocaleMapper {
    fn map(&self, local: &str) -> String {
        self.table
            .get(local)
            .cloned()
            .unwrap_or_else(|| local.to_string())
    }
}

/// Events broadcast to observers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    /// A new session was acquired.
    GotSession,
    /// The backend declared the session lost.
    SessionLost,
    /// The socket dropped; it will try to reconnect.
    ConnectionLost,
    /// The socket gave up; the client continues over polling.
    TransportDowngraded,
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::GotSession => "got_session",
            Self::SessionLost => "session_lost",
            Self::ConnectionLost => "connection_lost",
            Self::TransportDowngraded => "transport_downgraded",
        };
        f.write_str(name)
    }
}

/// Receives [`Notification`]s. Called synchronously; must not block.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Discards every notification.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn notify(&self, _notification: Notification) {}
}

/// Fans notifications out over a `tokio::sync::broadcast` channel.
#[derive(Clone, Debug)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl NotificationSink for BroadcastSink {
    fn notify(&self, notification: Notification) {
        // No receivers is fine.
        let _ = self.tx.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locale_mapping_falls_back() {
        let mapper = MapLocaleMapper::new(HashMap::from([("en".to_string(), "eng".to_string())]));
        assert_eq!(mapper.map("en"), "eng");
        assert_eq!(mapper.map("arm"), "arm");
    }

    #[test]
    fn test_broadcast_sink() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        sink.notify(Notification::SessionLost);
        sink.notify(Notification::GotSession);
        assert_eq!(rx.try_recv().ok(), Some(Notification::SessionLost));
        assert_eq!(rx.try_recv().ok(), Some(Notification::GotSession));
        NoopSink.notify(Notification::ConnectionLost);
    }
}
