//! Load balancing across registered service endpoints.
//!
//! Features:
//!   - Endpoint registration (explicit add/remove only)
//!   - Five selection strategies, healthy endpoints only
//!   - Consistent-hash ring with virtual nodes
//!   - Passive health bookkeeping (connections, outcomes, response time)
//!
//! Health is never probed actively; it changes only through
//! [`LoadBalancer::set_endpoint_health`] and the counters fed by
//! [`LoadBalancer::record_result`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::types::{EndpointConfig, EndpointId, Error, Result};

/// Virtual nodes per endpoint on the consistent-hash ring.
pub const VIRTUAL_NODES: usize = 100;

/// Weight of the newest sample in the rolling response time.
const RESPONSE_TIME_ALPHA: f64 = 0.2;

// =============================================================================
// Strategy
// =============================================================================

/// Endpoint selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    #[default]
    LeastConnections,
    WeightedRoundRobin,
    ConsistentHashing,
    HealthBased,
}

// =============================================================================
// Endpoint
// =============================================================================

/// A backend the balancer can route to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceEndpoint {
    pub id: EndpointId,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub max_connections: u32,
    pub current_connections: u32,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
    /// Rolling response time in seconds.
    pub response_time: f64,
    pub error_count: u64,
    pub success_count: u64,
}

impl ServiceEndpoint {
    pub fn new(id: EndpointId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            weight: 1,
            max_connections: 100,
            current_connections: 0,
            healthy: true,
            last_health_check: None,
            response_time: 0.0,
            error_count: 0,
            success_count: 0,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Build from a configuration descriptor.
    pub fn from_config(config: &EndpointConfig) -> Result<Self> {
        let id = EndpointId::from_string(config.id.clone()).map_err(Error::validation)?;
        Ok(Self::new(id, config.host.clone(), config.port)
            .with_weight(config.weight)
            .with_max_connections(config.max_connections))
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Lower is better; unhealthy endpoints score infinity.
    pub fn load_score(&self) -> f64 {
        if !self.healthy {
            return f64::INFINITY;
        }
        let connection_ratio =
            f64::from(self.current_connections) / f64::from(self.max_connections.max(1));
        let total = (self.success_count + self.error_count).max(1);
        let error_ratio = self.error_count as f64 / total as f64;

        connection_ratio * 0.6 + error_ratio * 0.3 + self.response_time * 0.1
    }
}

// =============================================================================
// Balancer
// =============================================================================

#[derive(Debug, Default)]
struct BalancerState {
    endpoints: Vec<ServiceEndpoint>,
    current_index: usize,
    ring: BTreeMap<u64, EndpointId>,
}

impl BalancerState {
    fn rebuild_ring(&mut self) {
        self.ring.clear();
        for endpoint in &self.endpoints {
            for i in 0..VIRTUAL_NODES {
                let key = ring_hash(&format!("{}:{}", endpoint.id, i));
                self.ring.insert(key, endpoint.id.clone());
            }
        }
    }

    fn endpoint_mut(&mut self, id: &EndpointId) -> Result<&mut ServiceEndpoint> {
        self.endpoints
            .iter_mut()
            .find(|ep| &ep.id == id)
            .ok_or_else(|| Error::not_found(format!("unknown endpoint: {}", id)))
    }

    /// Cyclic pick over `healthy` (indices into `endpoints`). The cursor is
    /// never reset, only masked into the current length.
    fn round_robin(&mut self, healthy: &[usize]) -> usize {
        let selected = healthy[self.current_index % healthy.len()];
        self.current_index = self.current_index.wrapping_add(1);
        selected
    }

    /// Round robin over `healthy` with each endpoint repeated `weight` times,
    /// walked by cumulative weight instead of materializing the sequence.
    fn weighted_round_robin(&mut self, healthy: &[usize]) -> usize {
        let cursor = self.current_index as u64;
        self.current_index = self.current_index.wrapping_add(1);

        let endpoints = &self.endpoints;
        let weight = |i: usize| u64::from(endpoints[i].weight.max(1));
        let total: u64 = healthy.iter().map(|&i| weight(i)).sum();
        let mut slot = cursor % total;

        for &i in healthy {
            let w = weight(i);
            if slot < w {
                return i;
            }
            slot -= w;
        }
        healthy[healthy.len() - 1]
    }

    /// First ring entry at or after the key's hash whose endpoint is healthy,
    /// wrapping around to the smallest key.
    fn consistent_hashing(&self, key: &str) -> Option<ServiceEndpoint> {
        let hash = ring_hash(key);
        self.ring
            .range(hash..)
            .chain(self.ring.range(..hash))
            .filter_map(|(_, id)| self.endpoints.iter().find(|ep| &ep.id == id))
            .find(|ep| ep.healthy)
            .cloned()
    }
}

/// First 8 bytes of SHA-256, big endian.
fn ring_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Aggregate balancer statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerStats {
    pub strategy: LoadBalancingStrategy,
    pub total_endpoints: usize,
    pub healthy_endpoints: usize,
    pub total_connections: u64,
    pub total_capacity: u64,
}

/// Strategy-driven endpoint selector.
#[derive(Debug)]
pub struct LoadBalancer {
    strategy: LoadBalancingStrategy,
    state: Mutex<BalancerState>,
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            strategy,
            state: Mutex::new(BalancerState::default()),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register an endpoint. Duplicate ids and zero weights are rejected.
    pub async fn add_endpoint(&self, endpoint: ServiceEndpoint) -> Result<()> {
        if endpoint.weight == 0 {
            return Err(Error::validation(format!(
                "endpoint {} weight must be at least 1",
                endpoint.id
            )));
        }

        let mut state = self.state.lock().await;
        if state.endpoints.iter().any(|ep| ep.id == endpoint.id) {
            return Err(Error::validation(format!(
                "endpoint {} already registered",
                endpoint.id
            )));
        }

        tracing::info!(endpoint_id = %endpoint.id, url = %endpoint.url(), "endpoint_added");
        state.endpoints.push(endpoint);
        state.rebuild_ring();
        Ok(())
    }

    /// Remove an endpoint. Returns false if it was not registered.
    pub async fn remove_endpoint(&self, id: &EndpointId) -> bool {
        let mut state = self.state.lock().await;
        let before = state.endpoints.len();
        state.endpoints.retain(|ep| &ep.id != id);
        if state.endpoints.len() == before {
            return false;
        }

        state.rebuild_ring();
        tracing::info!(endpoint_id = %id, "endpoint_removed");
        true
    }

    // =========================================================================
    // Selection
    // =========================================================================

    /// Pick an endpoint for a request. `key` is only used by consistent hashing;
    /// without one a random key is used.
    pub async fn get_endpoint(&self, key: Option<&str>) -> Option<ServiceEndpoint> {
        let mut state = self.state.lock().await;

        if !state.endpoints.iter().any(|ep| ep.healthy) {
            tracing::warn!(total = state.endpoints.len(), "no_healthy_endpoints");
            return None;
        }

        if self.strategy == LoadBalancingStrategy::ConsistentHashing {
            return match key {
                Some(key) => state.consistent_hashing(key),
                None => state.consistent_hashing(&uuid::Uuid::new_v4().to_string()),
            };
        }

        let healthy: Vec<usize> = state
            .endpoints
            .iter()
            .enumerate()
            .filter(|(_, ep)| ep.healthy)
            .map(|(i, _)| i)
            .collect();

        let selected = match self.strategy {
            LoadBalancingStrategy::RoundRobin => state.round_robin(&healthy),
            LoadBalancingStrategy::WeightedRoundRobin => state.weighted_round_robin(&healthy),
            LoadBalancingStrategy::LeastConnections => healthy
                .iter()
                .copied()
                .min_by_key(|&i| state.endpoints[i].current_connections)
                .unwrap_or(healthy[0]),
            LoadBalancingStrategy::HealthBased => healthy
                .iter()
                .copied()
                .min_by(|&a, &b| {
                    state.endpoints[a]
                        .load_score()
                        .total_cmp(&state.endpoints[b].load_score())
                })
                .unwrap_or(healthy[0]),
            LoadBalancingStrategy::ConsistentHashing => healthy[0],
        };
        Some(state.endpoints[selected].clone())
    }

    // =========================================================================
    // Passive health
    // =========================================================================

    /// Mark an endpoint healthy or unhealthy.
    pub async fn set_endpoint_health(&self, id: &EndpointId, healthy: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let endpoint = state.endpoint_mut(id)?;
        if endpoint.healthy != healthy {
            tracing::info!(endpoint_id = %id, healthy, "endpoint_health_changed");
        }
        endpoint.healthy = healthy;
        endpoint.last_health_check = Some(Utc::now());
        Ok(())
    }

    /// Record the outcome of a request routed to `id`.
    pub async fn record_result(
        &self,
        id: &EndpointId,
        success: bool,
        latency: Duration,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let endpoint = state.endpoint_mut(id)?;
        if success {
            endpoint.success_count += 1;
        } else {
            endpoint.error_count += 1;
        }

        let sample = latency.as_secs_f64();
        endpoint.response_time = if endpoint.success_count + endpoint.error_count == 1 {
            sample
        } else {
            RESPONSE_TIME_ALPHA * sample + (1.0 - RESPONSE_TIME_ALPHA) * endpoint.response_time
        };
        Ok(())
    }

    /// Count an in-flight request against `id`.
    pub async fn acquire_connection(&self, id: &EndpointId) -> Result<()> {
        let mut state = self.state.lock().await;
        let endpoint = state.endpoint_mut(id)?;
        endpoint.current_connections = endpoint.current_connections.saturating_add(1);
        Ok(())
    }

    /// Release an in-flight request. Never goes below zero.
    pub async fn release_connection(&self, id: &EndpointId) -> Result<()> {
        let mut state = self.state.lock().await;
        let endpoint = state.endpoint_mut(id)?;
        endpoint.current_connections = endpoint.current_connections.saturating_sub(1);
        Ok(())
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub async fn endpoints(&self) -> Vec<ServiceEndpoint> {
        self.state.lock().await.endpoints.clone()
    }

    pub async fn get(&self, id: &EndpointId) -> Option<ServiceEndpoint> {
        self.state
            .lock()
            .await
            .endpoints
            .iter()
            .find(|ep| &ep.id == id)
            .cloned()
    }

    pub async fn stats(&self) -> LoadBalancerStats {
        let state = self.state.lock().await;
        LoadBalancerStats {
            strategy: self.strategy,
            total_endpoints: state.endpoints.len(),
            healthy_endpoints: state.endpoints.iter().filter(|ep| ep.healthy).count(),
            total_connections: state
                .endpoints
                .iter()
                .map(|ep| u64::from(ep.current_connections))
                .sum(),
            total_capacity: state
                .endpoints
                .iter()
                .map(|ep| u64::from(ep.max_connections))
                .sum(),
        }
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(LoadBalancingStrategy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn id(s: &str) -> EndpointId {
        EndpointId::from_string(s.to_string()).unwrap()
    }

    fn endpoint(s: &str) -> ServiceEndpoint {
        ServiceEndpoint::new(id(s), "127.0.0.1", 8000)
    }

    async fn balancer(strategy: LoadBalancingStrategy, ids: &[&str]) -> LoadBalancer {
        let lb = LoadBalancer::new(strategy);
        for s in ids {
            lb.add_endpoint(endpoint(s)).await.unwrap();
        }
        lb
    }

    async fn pick(lb: &LoadBalancer, key: Option<&str>) -> String {
        lb.get_endpoint(key).await.unwrap().id.to_string()
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let lb = balancer(LoadBalancingStrategy::RoundRobin, &["A", "B", "C"]).await;
        let mut picks = Vec::new();
        for _ in 0..5 {
            picks.push(pick(&lb, None).await);
        }
        assert_eq!(picks, vec!["A", "B", "C", "A", "B"]);
    }

    #[tokio::test]
    async fn test_round_robin_index_survives_endpoint_changes() {
        let lb = balancer(LoadBalancingStrategy::RoundRobin, &["A", "B", "C"]).await;
        assert_eq!(pick(&lb, None).await, "A");
        assert_eq!(pick(&lb, None).await, "B");

        assert!(lb.remove_endpoint(&id("C")).await);
        // index 2 masked into length 2
        assert_eq!(pick(&lb, None).await, "A");
        assert_eq!(pick(&lb, None).await, "B");
    }

    #[tokio::test]
    async fn test_round_robin_skips_unhealthy() {
        let lb = balancer(LoadBalancingStrategy::RoundRobin, &["A", "B", "C"]).await;
        lb.set_endpoint_health(&id("B"), false).await.unwrap();
        let picks = vec![pick(&lb, None).await, pick(&lb, None).await, pick(&lb, None).await];
        assert!(!picks.contains(&"B".to_string()));
    }

    #[tokio::test]
    async fn test_least_connections() {
        let lb = balancer(LoadBalancingStrategy::LeastConnections, &["A", "B", "C"]).await;
        lb.acquire_connection(&id("A")).await.unwrap();
        lb.acquire_connection(&id("A")).await.unwrap();
        lb.acquire_connection(&id("C")).await.unwrap();
        assert_eq!(pick(&lb, None).await, "B");

        lb.acquire_connection(&id("B")).await.unwrap();
        lb.acquire_connection(&id("B")).await.unwrap();
        assert_eq!(pick(&lb, None).await, "C");

        lb.release_connection(&id("A")).await.unwrap();
        lb.release_connection(&id("A")).await.unwrap();
        lb.release_connection(&id("A")).await.unwrap();
        assert_eq!(lb.get(&id("A")).await.unwrap().current_connections, 0);
        assert_eq!(pick(&lb, None).await, "A");
    }

    #[tokio::test]
    async fn test_weighted_round_robin_expands_by_weight() {
        let lb = LoadBalancer::new(LoadBalancingStrategy::WeightedRoundRobin);
        lb.add_endpoint(endpoint("A").with_weight(2)).await.unwrap();
        lb.add_endpoint(endpoint("B")).await.unwrap();

        let mut picks = Vec::new();
        for _ in 0..6 {
            picks.push(pick(&lb, None).await);
        }
        assert_eq!(picks, vec!["A", "A", "B", "A", "A", "B"]);
    }

    #[tokio::test]
    async fn test_weighted_round_robin_handles_huge_weights() {
        let lb = LoadBalancer::new(LoadBalancingStrategy::WeightedRoundRobin);
        lb.add_endpoint(endpoint("A").with_weight(u32::MAX)).await.unwrap();
        lb.add_endpoint(endpoint("B").with_weight(500_000_000)).await.unwrap();

        for _ in 0..1_000 {
            assert_eq!(pick(&lb, None).await, "A");
        }
    }

    #[tokio::test]
    async fn test_weighted_round_robin_skips_unhealthy() {
        let lb = LoadBalancer::new(LoadBalancingStrategy::WeightedRoundRobin);
        lb.add_endpoint(endpoint("A").with_weight(3)).await.unwrap();
        lb.add_endpoint(endpoint("B").with_weight(2)).await.unwrap();
        lb.set_endpoint_health(&id("A"), false).await.unwrap();

        for _ in 0..5 {
            assert_eq!(pick(&lb, None).await, "B");
        }
    }

    #[tokio::test]
    async fn test_consistent_hashing_is_stable() {
        let lb = balancer(LoadBalancingStrategy::ConsistentHashing, &["A", "B", "C"]).await;
        let first = pick(&lb, Some("user-42")).await;
        for _ in 0..20 {
            assert_eq!(pick(&lb, Some("user-42")).await, first);
        }
    }

    #[tokio::test]
    async fn test_consistent_hashing_addition_only_moves_keys_to_new_node() {
        let lb = balancer(LoadBalancingStrategy::ConsistentHashing, &["A", "B", "C"]).await;
        let keys: Vec<String> = (0..200).map(|i| format!("chat-{}", i)).collect();

        let mut before = Vec::new();
        for key in &keys {
            before.push(pick(&lb, Some(key)).await);
        }

        lb.add_endpoint(endpoint("D")).await.unwrap();
        let mut moved = 0;
        for (key, old) in keys.iter().zip(&before) {
            let new = pick(&lb, Some(key)).await;
            if &new != old {
                assert_eq!(new, "D", "key {} moved to an existing node", key);
                moved += 1;
            }
        }
        assert!(moved > 0 && moved < keys.len());
    }

    #[tokio::test]
    async fn test_consistent_hashing_routes_around_unhealthy() {
        let lb = balancer(LoadBalancingStrategy::ConsistentHashing, &["A", "B"]).await;
        let owner = pick(&lb, Some("session-7")).await;
        lb.set_endpoint_health(&id(&owner), false).await.unwrap();

        let fallback = pick(&lb, Some("session-7")).await;
        assert_ne!(fallback, owner);

        lb.set_endpoint_health(&id(&owner), true).await.unwrap();
        assert_eq!(pick(&lb, Some("session-7")).await, owner);
    }

    #[tokio::test]
    async fn test_health_based_prefers_lowest_score() {
        let lb = balancer(LoadBalancingStrategy::HealthBased, &["A", "B", "C"]).await;
        lb.record_result(&id("A"), false, Duration::from_millis(900)).await.unwrap();
        lb.record_result(&id("B"), true, Duration::from_millis(100)).await.unwrap();
        lb.record_result(&id("C"), true, Duration::from_millis(50)).await.unwrap();
        lb.set_endpoint_health(&id("C"), false).await.unwrap();

        assert_eq!(pick(&lb, None).await, "B");
    }

    #[tokio::test]
    async fn test_no_healthy_endpoints_returns_none() {
        let lb = balancer(LoadBalancingStrategy::LeastConnections, &["A"]).await;
        lb.set_endpoint_health(&id("A"), false).await.unwrap();
        assert!(lb.get_endpoint(None).await.is_none());

        let empty = LoadBalancer::new(LoadBalancingStrategy::RoundRobin);
        assert!(empty.get_endpoint(None).await.is_none());
    }

    #[tokio::test]
    async fn test_add_rejects_duplicates_and_zero_weight() {
        let lb = balancer(LoadBalancingStrategy::RoundRobin, &["A"]).await;
        assert!(matches!(
            lb.add_endpoint(endpoint("A")).await,
            Err(Error::Validation(_))
        ));
        assert!(lb.add_endpoint(endpoint("Z").with_weight(0)).await.is_err());
        assert!(!lb.remove_endpoint(&id("missing")).await);
    }

    #[test]
    fn test_load_score() {
        let mut ep = endpoint("A").with_max_connections(10);
        ep.current_connections = 5;
        ep.success_count = 3;
        ep.error_count = 1;
        ep.response_time = 0.5;
        let expected = 0.5 * 0.6 + 0.25 * 0.3 + 0.5 * 0.1;
        assert!((ep.load_score() - expected).abs() < 1e-9);

        ep.healthy = false;
        assert!(ep.load_score().is_infinite());
    }

    #[tokio::test]
    async fn test_rolling_response_time() {
        let lb = balancer(LoadBalancingStrategy::HealthBased, &["A"]).await;
        lb.record_result(&id("A"), true, Duration::from_secs(1)).await.unwrap();
        lb.record_result(&id("A"), true, Duration::from_secs(2)).await.unwrap();

        let ep = lb.get(&id("A")).await.unwrap();
        assert!((ep.response_time - 1.2).abs() < 1e-9);
        assert_eq!(ep.success_count, 2);

        let stats = lb.stats().await;
        assert_eq!(stats.total_endpoints, 1);
        assert_eq!(stats.healthy_endpoints, 1);
    }
}
