//! Weighted endpoint pool.
//!
//! Endpoints are never removed. A socket endpoint that keeps failing before
//! it ever connected is quarantined (marked ignored) and disappears from
//! selection.

use parking_lot::Mutex;
use rand::RngExt;
use tracing::warn;

use crate::{
    config::EndpointConfig,
    error::{TransportError, TransportResult},
};

/// Mutable selection state for one configured endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub weight: u32,
    pub ignored: bool,
    pub consecutive_failures: u32,
    pub ever_connected: bool,
}

impl From<&EndpointConfig> for Endpoint {
    fn from(config: &EndpointConfig) -> Self {
        Self {
            url: config.url.clone(),
            weight: config.weight.max(1),
            ignored: false,
            consecutive_failures: 0,
            ever_connected: false,
        }
    }
}

/// A selected endpoint: its pool index plus URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selected {
    pub index: usize,
    pub url: String,
}

/// Weighted pool of endpoints.
#[derive(Debug)]
pub struct EndpointPool {
    endpoints: Mutex<Vec<Endpoint>>,
}

impl EndpointPool {
    pub fn new(configs: &[EndpointConfig]) -> Self {
        Self {
            endpoints: Mutex::new(configs.iter().map(Endpoint::from).collect()),
        }
    }

    /// Draw an endpoint with probability proportional to its weight.
    ///
    /// Each non-ignored endpoint appears `weight` times in a virtual list and
    /// one entry is picked uniformly.
    pub fn select(&self) -> TransportResult<Selected> {
        let endpoints = self.endpoints.lock();
        let total: u64 = endpoints
            .iter()
            .filter(|e| !e.ignored)
            .map(|e| u64::from(e.weight))
            .sum();
        if total == 0 {
            return Err(TransportError::NoEndpoint);
        }

        let mut slot = rand::rng().random_range(0..total);
        for (index, endpoint) in endpoints.iter().enumerate() {
            if endpoint.ignored {
                continue;
            }
            let weight = u64::from(endpoint.weight);
            if slot < weight {
                return Ok(Selected {
                    index,
                    url: endpoint.url.clone(),
                });
            }
            slot -= weight;
        }
        Err(TransportError::NoEndpoint)
    }

    /// Record a successful connection.
    pub fn record_success(&self, index: usize) {
        if let Some(endpoint) = self.endpoints.lock().get_mut(index) {
            endpoint.consecutive_failures = 0;
            endpoint.ever_connected = true;
        }
    }

    /// Record a failed or dropped connection.
    ///
    /// Returns `true` when this failure quarantined the endpoint.
    pub fn record_failure(&self, index: usize) -> bool {
        let mut endpoints = self.endpoints.lock();
        let Some(endpoint) = endpoints.get_mut(index) else {
            return false;
        };

        let previous = endpoint.consecutive_failures;
        endpoint.consecutive_failures = previous.saturating_add(1);
        if previous > 0 && !endpoint.ever_connected && !endpoint.ignored {
            endpoint.ignored = true;
            warn!(
                url = %endpoint.url,
                failures = endpoint.consecutive_failures,
                "Quarantining endpoint that never connected"
            );
            return true;
        }
        false
    }

    /// Snapshot of every endpoint.
    pub fn snapshot(&self) -> Vec<Endpoint> {
        self.endpoints.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.endpoints.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(weights: &[u32]) -> EndpointPool {
        let configs: Vec<EndpointConfig> = weights
            .iter()
            .enumerate()
            .map(|(i, w)| EndpointConfig::weighted(format!("wss://e{i}.example.com"), *w))
            .collect();
        EndpointPool::new(&configs)
    }

    #[test]
    fn test_weighted_selection_ratio() {
        let pool = pool(&[10, 1]);
        let mut counts = [0u32; 2];
        for _ in 0..22_000 {
            let selected = pool.select().expect("endpoint available");
            counts[selected.index] += 1;
        }
        let ratio = f64::from(counts[0]) / f64::from(counts[1]);
        assert!((7.0..14.0).contains(&ratio), "ratio was {ratio}");
    }

    #[test]
    fn test_ignored_endpoint_never_selected() {
        let pool = pool(&[1, 5]);
        pool.record_failure(1);
        assert!(pool.record_failure(1));

        for _ in 0..1000 {
            assert_eq!(pool.select().expect("endpoint available").index, 0);
        }
    }

    #[test]
    fn test_empty_pool_has_no_endpoint() {
        let pool = pool(&[]);
        assert!(matches!(pool.select(), Err(TransportError::NoEndpoint)));

        let pool = pool_with_all_ignored();
        assert!(matches!(pool.select(), Err(TransportError::NoEndpoint)));
    }

    fn pool_with_all_ignored() -> EndpointPool {
        let pool = pool(&[3]);
        pool.record_failure(0);
        pool.record_failure(0);
        pool
    }

    #[test]
    fn test_quarantine_after_second_failure() {
        let pool = pool(&[1]);
        assert!(!pool.record_failure(0));
        assert!(!pool.snapshot()[0].ignored);
        assert!(pool.record_failure(0));
        assert!(pool.snapshot()[0].ignored);
    }

    #[test]
    fn test_connected_endpoint_never_quarantined() {
        let pool = pool(&[1]);
        pool.record_failure(0);
        pool.record_success(0);
        for _ in 0..10 {
            assert!(!pool.record_failure(0));
        }
        let endpoint = &pool.snapshot()[0];
        assert!(!endpoint.ignored);
        assert!(endpoint.ever_connected);
        assert_eq!(endpoint.consecutive_failures, 10);
    }
}
