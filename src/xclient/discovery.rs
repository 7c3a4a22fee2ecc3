use std::future::Future;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use log::*;
use rand::seq::SliceRandom;
use rand::Rng;

use super::hash::ConsistentHash;
use crate::error::*;
use crate::registry::X_GORPC_SERVERS;

/// Policy used to pick one endpoint for an outgoing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    Random,
    RoundRobin,
    WeightedRoundRobin,
    ConsistentHash,
}

/// Yields candidate server addresses (`"proto@addr"`) for outgoing calls.
pub trait Discovery: Send + Sync + 'static {
    /// Re-fetch from the authority, if there is one.
    fn refresh(&self) -> impl Future<Output = Result<(), RpcError>> + Send;

    /// Replace the server list atomically.
    fn update(&self, servers: Vec<String>) -> Result<(), RpcError>;

    /// Select one server.
    fn get(&self, mode: SelectMode) -> impl Future<Output = Result<String, RpcError>> + Send;

    /// Snapshot copy of the current list.
    fn get_all(&self) -> impl Future<Output = Result<Vec<String>, RpcError>> + Send;
}

struct DiscoveryState {
    servers: Vec<String>,
    /// round-robin cursor, randomized at construction so a fleet of clients
    /// does not start synchronized
    index: usize,
    effective_weights: Vec<i64>,
    current_weights: Vec<i64>,
    max_weight: i64,
    ring: ConsistentHash,
}

/// Discovery over a fixed list kept up to date by the caller.
///
/// All selection state sits under one lock; weighted selection mutates
/// per-entry state, so `get` write-locks for the whole pick.
pub struct MultiServerDiscovery {
    state: RwLock<DiscoveryState>,
}

const DEFAULT_MAX_WEIGHT: i64 = 10;

impl MultiServerDiscovery {
    /// Equal weights; ring replicas at their default.
    pub fn new(servers: Vec<String>) -> Self {
        let weights = vec![1; servers.len()];
        Self::with_weights(servers, weights, DEFAULT_MAX_WEIGHT, 0)
    }

    pub fn with_weights(
        servers: Vec<String>, weights: Vec<i64>, max_weight: i64, replicas: usize,
    ) -> Self {
        let mut effective_weights = weights;
        effective_weights.resize(servers.len(), 1);
        let ring = ConsistentHash::new(replicas, &servers);
        Self {
            state: RwLock::new(DiscoveryState {
                index: rand::thread_rng().gen_range(0..i32::MAX as usize),
                current_weights: vec![0; servers.len()],
                effective_weights,
                max_weight,
                ring,
                servers,
            }),
        }
    }

    /// Set a server's effective weight. Negative weights are rejected.
    pub fn update_weight(&self, weight: i64, name: &str) -> Result<(), RpcError> {
        if weight < 0 {
            return Err(RpcError::Rpc(ERR_DISCOVERY_INVALID_WEIGHT));
        }
        let mut state = self.state.write().unwrap();
        match state.servers.iter().position(|s| s == name) {
            None => Err(RpcError::Rpc(ERR_DISCOVERY_UNKNOWN_SERVER)),
            Some(i) => {
                state.effective_weights[i] = weight;
                state.current_weights[i] = 0;
                Ok(())
            }
        }
    }

    /// Nudge a server's current weight up after a successful call.
    pub fn mark_success(&self, name: &str) -> Result<(), RpcError> {
        let mut state = self.state.write().unwrap();
        let max_weight = state.max_weight;
        match state.servers.iter().position(|s| s == name) {
            None => Err(RpcError::Rpc(ERR_DISCOVERY_UNKNOWN_SERVER)),
            Some(i) => {
                state.current_weights[i] = max_weight.min(state.current_weights[i] + 1);
                Ok(())
            }
        }
    }

    /// Nudge a server's current weight down after a failed call, floor 0.
    pub fn mark_failure(&self, name: &str) -> Result<(), RpcError> {
        let mut state = self.state.write().unwrap();
        match state.servers.iter().position(|s| s == name) {
            None => Err(RpcError::Rpc(ERR_DISCOVERY_UNKNOWN_SERVER)),
            Some(i) => {
                state.current_weights[i] = 0i64.max(state.current_weights[i] - 1);
                Ok(())
            }
        }
    }

    /// Smooth weighted round-robin: add each effective weight to its current
    /// weight, pick the max, subtract the weight total from the winner.
    fn next(state: &mut DiscoveryState) -> Result<String, RpcError> {
        let mut total = 0i64;
        let mut selected: Option<usize> = None;
        for i in 0..state.servers.len() {
            total += state.effective_weights[i];
            state.current_weights[i] += state.effective_weights[i];
            match selected {
                None => selected = Some(i),
                Some(s) if state.current_weights[i] > state.current_weights[s] => {
                    selected = Some(i)
                }
                _ => {}
            }
        }
        match selected {
            None => Err(RPC_ERR_DISCOVERY_EMPTY),
            Some(s) => {
                state.current_weights[s] -= total;
                Ok(state.servers[s].clone())
            }
        }
    }
}

impl Discovery for MultiServerDiscovery {
    async fn refresh(&self) -> Result<(), RpcError> {
        Ok(())
    }

    fn update(&self, servers: Vec<String>) -> Result<(), RpcError> {
        let mut state = self.state.write().unwrap();
        state.effective_weights = vec![1; servers.len()];
        state.current_weights = vec![0; servers.len()];
        state.ring = ConsistentHash::new(0, &servers);
        state.servers = servers;
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String, RpcError> {
        let mut state = self.state.write().unwrap();
        let n = state.servers.len();
        if n == 0 {
            return Err(RPC_ERR_DISCOVERY_EMPTY);
        }
        match mode {
            SelectMode::Random => {
                Ok(state.servers.choose(&mut rand::thread_rng()).cloned().unwrap())
            }
            SelectMode::RoundRobin => {
                let i = state.index % n;
                state.index = state.index.wrapping_add(1);
                Ok(state.servers[i].clone())
            }
            SelectMode::WeightedRoundRobin => Self::next(&mut state),
            SelectMode::ConsistentHash => {
                let key = rand::thread_rng().gen::<u32>().to_string();
                state.ring.get(&key).map(|s| s.to_string())
            }
        }
    }

    async fn get_all(&self) -> Result<Vec<String>, RpcError> {
        let state = self.state.read().unwrap();
        Ok(state.servers.clone())
    }
}

const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Discovery backed by a remote registry, see [crate::registry].
///
/// `refresh` fetches the registry's live-server header, at most once per
/// `update_interval` unless the list was never fetched.
pub struct GoRegistryDiscovery {
    registry: String,
    inner: MultiServerDiscovery,
    http: reqwest::Client,
    update_interval: Duration,
    last_update: Mutex<Option<Instant>>,
}

impl GoRegistryDiscovery {
    /// `registry` is the full url of the registry endpoint.
    pub fn new(registry: &str, update_interval: Duration) -> Self {
        let update_interval =
            if update_interval.is_zero() { DEFAULT_UPDATE_INTERVAL } else { update_interval };
        Self {
            registry: registry.to_string(),
            inner: MultiServerDiscovery::new(Vec::new()),
            http: reqwest::Client::new(),
            update_interval,
            last_update: Mutex::new(None),
        }
    }

    async fn fetch(&self) -> Result<(), RpcError> {
        debug!("discovery: refresh from registry {}", self.registry);
        let resp = match self.http.get(&self.registry).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("discovery: registry refresh error: {:?}", e);
                return Err(RPC_ERR_CLOSED);
            }
        };
        let servers: Vec<String> = resp
            .headers()
            .get(X_GORPC_SERVERS)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.trim().to_string())
            .collect();
        self.inner.update(servers)?;
        *self.last_update.lock().unwrap() = Some(Instant::now());
        Ok(())
    }

    fn is_fresh(&self) -> bool {
        match *self.last_update.lock().unwrap() {
            None => false,
            Some(at) => at.elapsed() < self.update_interval,
        }
    }
}

impl Discovery for GoRegistryDiscovery {
    async fn refresh(&self) -> Result<(), RpcError> {
        if self.is_fresh() {
            return Ok(());
        }
        self.fetch().await
    }

    fn update(&self, servers: Vec<String>) -> Result<(), RpcError> {
        self.inner.update(servers)?;
        *self.last_update.lock().unwrap() = Some(Instant::now());
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String, RpcError> {
        self.refresh().await?;
        self.inner.get(mode).await
    }

    async fn get_all(&self) -> Result<Vec<String>, RpcError> {
        self.refresh().await?;
        self.inner.get_all().await
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use std::collections::HashMap;

    fn servers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_empty_discovery() {
        let d = MultiServerDiscovery::new(Vec::new());
        assert_eq!(d.get(SelectMode::Random).await.unwrap_err(), RPC_ERR_DISCOVERY_EMPTY);
    }

    #[tokio::test]
    async fn test_round_robin_covers_all() {
        let d = MultiServerDiscovery::new(servers(&["tcp@a", "tcp@b", "tcp@c"]));
        let mut seen: HashMap<String, usize> = HashMap::new();
        for _ in 0..9 {
            *seen.entry(d.get(SelectMode::RoundRobin).await.unwrap()).or_default() += 1;
        }
        assert_eq!(seen.len(), 3);
        for count in seen.values() {
            assert_eq!(*count, 3);
        }
    }

    #[tokio::test]
    async fn test_weighted_distribution() {
        let d = MultiServerDiscovery::with_weights(
            servers(&["tcp@a", "tcp@b", "tcp@c"]),
            vec![5, 1, 1],
            10,
            0,
        );
        let mut seen: HashMap<String, usize> = HashMap::new();
        let mut picks = Vec::new();
        for _ in 0..7 {
            let s = d.get(SelectMode::WeightedRoundRobin).await.unwrap();
            picks.push(s.clone());
            *seen.entry(s).or_default() += 1;
        }
        assert_eq!(seen["tcp@a"], 5);
        assert_eq!(seen["tcp@b"], 1);
        assert_eq!(seen["tcp@c"], 1);
        // smooth: the heavy server is not selected five times in a row
        assert!(picks[..5].iter().any(|s| s != "tcp@a"));
    }

    #[tokio::test]
    async fn test_weight_feedback() {
        let d = MultiServerDiscovery::new(servers(&["tcp@a", "tcp@b"]));
        assert!(d.update_weight(-1, "tcp@a").is_err());
        assert!(d.mark_success("tcp@nope").is_err());
        d.mark_success("tcp@a").unwrap();
        d.mark_failure("tcp@a").unwrap();
        d.mark_failure("tcp@a").unwrap(); // floors at zero
        d.update_weight(3, "tcp@b").unwrap();
    }

    #[tokio::test]
    async fn test_update_replaces() {
        let d = MultiServerDiscovery::new(servers(&["tcp@a"]));
        d.update(servers(&["tcp@x", "tcp@y"])).unwrap();
        assert_eq!(d.get_all().await.unwrap(), servers(&["tcp@x", "tcp@y"]));
        let s = d.get(SelectMode::ConsistentHash).await.unwrap();
        assert!(s == "tcp@x" || s == "tcp@y");
    }
}
