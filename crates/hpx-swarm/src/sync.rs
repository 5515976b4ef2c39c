//! Subscription synchronizer.
//!
//! The backend pushes partial updates. This module keeps the full state of
//! every subscription, merges each update into it in place, and hands the
//! caller a snapshot of the merged result, so callers never see diffs.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::protocol::{Request, SubscriptionId};

/// Receives the full state of a subscription after every update.
pub type UpdateCallback = Arc<dyn Fn(&Value) + Send + Sync>;

const PRICE: &str = "price";
const PRICE_CHANGE: &str = "price_change";

/// Merge `diff` into `target` in place.
///
/// Per key: `null` deletes, a scalar (or array) overwrites, an object
/// replaces a non-object value and recurses into an object value. When
/// `target` carried a numeric `price` before the merge, a sibling
/// `price_change` of `1`, `-1` or `null` records the direction of the move.
pub fn apply_diff(target: &mut Map<String, Value>, diff: &Map<String, Value>) {
    let price_before = target.get(PRICE).and_then(Value::as_f64);

    for (key, value) in diff {
        match value {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(nested) => match target.get_mut(key) {
                Some(Value::Object(existing)) => apply_diff(existing, nested),
                _ => {
                    target.insert(key.clone(), value.clone());
                }
            },
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }

    if let Some(before) = price_before {
        let after = target.get(PRICE).and_then(Value::as_f64);
        target.insert(PRICE_CHANGE.to_string(), price_change(before, after));
    }
}

fn price_change(before: f64, after: Option<f64>) -> Value {
    match after {
        Some(after) if after > before => Value::from(1),
        Some(after) if after < before => Value::from(-1),
        _ => Value::Null,
    }
}

/// Apply an update to a subscription's full state.
pub fn apply_update(state: &mut Value, diff: &Value) {
    if let Value::Object(diff) = diff
        && let Value::Object(target) = &mut *state
    {
        apply_diff(target, diff);
        return;
    }
    *state = diff.clone();
}

struct SubscriptionEntry {
    request: Request,
    callback: UpdateCallback,
    state: Value,
}

/// A subscription to reissue after the session or transport changed.
pub struct Replay {
    pub previous_id: SubscriptionId,
    pub request: Request,
    pub callback: UpdateCallback,
}

/// Registry of live subscriptions keyed by backend subid.
pub struct SubscriptionRegistry {
    entries: scc::HashMap<SubscriptionId, SubscriptionEntry>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            entries: scc::HashMap::new(),
        }
    }

    /// Store a subscription with the full state from its subscribe response.
    ///
    /// A subid maps to at most one callback; registering it again replaces
    /// the previous entry.
    pub fn register(
        &self,
        subid: SubscriptionId,
        request: Request,
        callback: UpdateCallback,
        state: Value,
    ) {
        let entry = SubscriptionEntry {
            request,
            callback,
            state,
        };
        if let Err((subid, entry)) = self.entries.insert(subid, entry) {
            warn!(subid = %subid, "Replacing existing subscription entry");
            self.entries.remove(&subid);
            let _ = self.entries.insert(subid, entry);
        }
    }

    pub fn remove(&self, subid: &SubscriptionId) -> bool {
        self.entries.remove(subid).is_some()
    }

    pub fn contains(&self, subid: &SubscriptionId) -> bool {
        self.entries.contains(subid)
    }

    /// Current full state of a subscription.
    pub fn state(&self, subid: &SubscriptionId) -> Option<Value> {
        self.entries.read(subid, |_, entry| entry.state.clone())
    }

    pub fn ids(&self) -> Vec<SubscriptionId> {
        let mut ids = Vec::new();
        self.entries.retain(|id, _| {
            ids.push(id.clone());
            true
        });
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Merge a push frame and notify the affected callbacks.
    ///
    /// Each subid is applied independently. Callbacks run after the merge,
    /// outside of the registry, with a snapshot of the full state. Returns
    /// the subids nobody is subscribed to.
    pub fn apply_push(&self, updates: &Map<String, Value>) -> Vec<SubscriptionId> {
        let mut deliveries = Vec::with_capacity(updates.len());
        let mut orphans = Vec::new();

        for (key, diff) in updates {
            let subid = SubscriptionId::new(key.as_str());
            let merged = self.entries.update(&subid, |_, entry| {
                apply_update(&mut entry.state, diff);
                (Arc::clone(&entry.callback), entry.state.clone())
            });
            match merged {
                Some(delivery) => deliveries.push(delivery),
                None => {
                    debug!(subid = %subid, "Update for unknown subscription");
                    orphans.push(subid);
                }
            }
        }

        for (callback, snapshot) in deliveries {
            callback(&snapshot);
        }
        orphans
    }

    /// Empty the registry, returning every subscription for reissue.
    ///
    /// Stored state is dropped; the next subscribe response brings complete
    /// state again.
    pub fn drain_for_replay(&self) -> Vec<Replay> {
        let mut drained = Vec::new();
        self.entries.retain(|id, entry| {
            drained.push(Replay {
                previous_id: id.clone(),
                request: entry.request.clone(),
                callback: Arc::clone(&entry.callback),
            });
            false
        });
        drained
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn merged(base: Value, diff: Value) -> Value {
        let mut target = object(base);
        apply_diff(&mut target, &object(diff));
        Value::Object(target)
    }

    #[test]
    fn test_diff_merge() {
        assert_eq!(
            merged(json!({"a": 1, "b": {"c": 2}}), json!({"a": null, "b": {"c": 3, "d": 4}})),
            json!({"b": {"c": 3, "d": 4}})
        );
    }

    #[test]
    fn test_object_replaces_scalar() {
        assert_eq!(
            merged(json!({"a": 1}), json!({"a": {"x": true}})),
            json!({"a": {"x": true}})
        );
    }

    #[test]
    fn test_price_change() {
        assert_eq!(
            merged(json!({"price": 100}), json!({"price": 105})),
            json!({"price": 105, "price_change": 1})
        );
        assert_eq!(
            merged(json!({"price": 100}), json!({"price": 95})),
            json!({"price": 95, "price_change": -1})
        );
        assert_eq!(
            merged(json!({"price": 100}), json!({"price": 100})),
            json!({"price": 100, "price_change": null})
        );
        assert_eq!(
            merged(json!({"price": 100}), json!({"price": "suspended"})),
            json!({"price": "suspended", "price_change": null})
        );
    }

    #[test]
    fn test_nested_price_change() {
        assert_eq!(
            merged(
                json!({"event": {"1": {"price": 2.5, "name": "home"}}}),
                json!({"event": {"1": {"price": 2.1}}})
            ),
            json!({"event": {"1": {"price": 2.1, "name": "home", "price_change": -1}}})
        );
    }

    #[test]
    fn test_push_delivers_full_state() {
        let registry = SubscriptionRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        registry.register(
            SubscriptionId::from(42),
            Request::new("get"),
            Arc::new(move |state: &Value| sink.lock().push(state.clone())),
            json!({"price": 100, "name": "x"}),
        );

        let orphans = registry.apply_push(&object(json!({"42": {"price": 105}, "7": {"a": 1}})));

        assert_eq!(orphans, vec![SubscriptionId::from(7)]);
        assert_eq!(
            seen.lock().as_slice(),
            &[json!({"price": 105, "name": "x", "price_change": 1})]
        );
    }

    #[test]
    fn test_drain_for_replay() {
        let registry = SubscriptionRegistry::new();
        let callback: UpdateCallback = Arc::new(|_: &Value| {});
        registry.register(SubscriptionId::from(1), Request::new("get"), Arc::clone(&callback), json!({}));
        registry.register(SubscriptionId::from(2), Request::new("get"), callback, json!({}));

        let mut drained: Vec<_> = registry
            .drain_for_replay()
            .into_iter()
            .map(|replay| replay.previous_id)
            .collect();
        drained.sort();

        assert_eq!(drained, vec![SubscriptionId::from(1), SubscriptionId::from(2)]);
        assert!(registry.is_empty());
    }
}
