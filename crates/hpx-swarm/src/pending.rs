//! Lock-free pending request management using `scc::HashMap`.
//!
//! Every socket request gets an entry keyed by its `rid`. The entry is
//! removed when the matching response arrives or when the connection is torn
//! down, in which case the waiter is rejected rather than left hanging.

use tokio::sync::oneshot;

use crate::{
    error::{TransportError, TransportResult},
    protocol::{RequestId, Response},
};

/// Runs synchronously when the response is dispatched, before the waiter
/// wakes up and before the next inbound frame is processed.
pub type ResponseHook = Box<dyn FnOnce(&Response) + Send + Sync>;

/// A pending request awaiting a response.
pub struct PendingRequest {
    pub response_tx: oneshot::Sender<TransportResult<Response>>,
    pub on_response: Option<ResponseHook>,
}

/// Store of outstanding requests.
pub struct PendingRequestStore {
    requests: scc::HashMap<RequestId, PendingRequest>,
    max_pending: usize,
}

impl PendingRequestStore {
    pub fn new(max_pending: usize) -> Self {
        Self {
            requests: scc::HashMap::new(),
            max_pending,
        }
    }

    /// Register a request.
    ///
    /// Returns `None` if capacity is exceeded or the id is already in use.
    pub fn add(
        &self,
        id: RequestId,
        on_response: Option<ResponseHook>,
    ) -> Option<oneshot::Receiver<TransportResult<Response>>> {
        if self.requests.len() >= self.max_pending {
            return None;
        }

        let (tx, rx) = oneshot::channel();
        let pending = PendingRequest {
            response_tx: tx,
            on_response,
        };

        if self.requests.insert(id, pending).is_err() {
            return None;
        }

        Some(rx)
    }

    /// Resolve a pending request.
    ///
    /// Returns `false` when no request with this id is outstanding.
    pub fn resolve(&self, id: &RequestId, result: TransportResult<Response>) -> bool {
        let Some((_, pending)) = self.requests.remove(id) else {
            return false;
        };

        if let (Some(hook), Ok(response)) = (pending.on_response, result.as_ref()) {
            hook(response);
        }
        // Receiver may have been dropped by a cancelled caller.
        let _ = pending.response_tx.send(result);
        true
    }

    /// Remove a pending request without notifying the receiver.
    pub fn remove(&self, id: &RequestId) -> bool {
        self.requests.remove(id).is_some()
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.requests.contains(id)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Reject every outstanding request with `ConnectionClosed`.
    ///
    /// Called on connection teardown.
    pub fn clear_with_error(&self, reason: &str) {
        let mut ids = Vec::new();
        self.requests.retain(|id, _| {
            ids.push(id.clone());
            true
        });

        for id in ids {
            if let Some((_, pending)) = self.requests.remove(&id) {
                let _ = pending
                    .response_tx
                    .send(Err(TransportError::connection_closed(reason)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use serde_json::json;

    use super::*;

    #[test]
    fn test_add_and_resolve() {
        let store = PendingRequestStore::new(10);
        let id = RequestId::new();

        let mut rx = store.add(id.clone(), None).expect("capacity");
        assert_eq!(store.len(), 1);

        assert!(store.resolve(&id, Ok(Response::ok(json!({"a": 1})))));
        assert!(store.is_empty());
        let response = rx.try_recv().expect("resolved").expect("ok");
        assert_eq!(response.data, json!({"a": 1}));

        assert!(!store.resolve(&id, Ok(Response::ok(json!(null)))));
    }

    #[test]
    fn test_capacity_limit() {
        let store = PendingRequestStore::new(2);
        let _a = store.add(RequestId::new(), None).expect("capacity");
        let _b = store.add(RequestId::new(), None).expect("capacity");
        assert!(store.add(RequestId::new(), None).is_none());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_hook_runs_before_waiter() {
        let store = PendingRequestStore::new(10);
        let id = RequestId::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);

        let mut rx = store
            .add(
                id.clone(),
                Some(Box::new(move |_: &Response| flag.store(true, Ordering::SeqCst))),
            )
            .expect("capacity");

        store.resolve(&id, Ok(Response::ok(json!({}))));
        assert!(ran.load(Ordering::SeqCst));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_clear_with_error_rejects_everything() {
        let store = PendingRequestStore::new(10);
        let mut rx1 = store.add(RequestId::new(), None).expect("capacity");
        let mut rx2 = store.add(RequestId::new(), None).expect("capacity");

        store.clear_with_error("socket dropped");

        assert!(store.is_empty());
        for rx in [&mut rx1, &mut rx2] {
            let result = rx.try_recv().expect("rejected");
            assert!(matches!(result, Err(TransportError::ConnectionClosed { .. })));
        }
    }
}
