//! Health-aware backend selection.
//!
//! Backends accrue a health score from observed interactions: +0.1 per
//! success (capped at 1.0), −0.2 per failure (floored at 0).  A backend is
//! healthy while its score stays above 0.3; unhealthy backends are skipped
//! by every strategy.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use rand::seq::SliceRandom;
use tracing::{debug, info};

/// Selection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadBalancingStrategy {
    RoundRobin,
    Random,
    LeastConnections,
    WeightedRandom,
    HealthBased,
}

/// One backend agent and its observed state.
#[derive(Debug, Clone)]
pub struct BackendAgent {
    pub agent_id: String,
    pub address: String,
    pub weight: f64,
    pub active_connections: u32,
    /// Seconds, from the last observed interaction.
    pub last_response_time: f64,
    pub health_score: f64,
    pub is_healthy: bool,
}

struct BalancerState {
    backends: HashMap<String, BackendAgent>,
    /// Insertion order, so round-robin is deterministic.
    order: Vec<String>,
    rr_index: usize,
}

/// Distributes work across backend agents.
pub struct LoadBalancer {
    strategy: LoadBalancingStrategy,
    state: Mutex<BalancerState>,
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        LoadBalancer {
            strategy,
            state: Mutex::new(BalancerState {
                backends: HashMap::new(),
                order: Vec::new(),
                rr_index: 0,
            }),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    // -----------------------------------------------------------------------
    // Backend management
    // -----------------------------------------------------------------------

    pub fn add_backend(&self, agent_id: &str, address: &str, weight: f64) {
        let mut state = self.state.lock().expect("balancer state poisoned");
        if !state.backends.contains_key(agent_id) {
            state.order.push(agent_id.to_owned());
        }
        state.backends.insert(
            agent_id.to_owned(),
            BackendAgent {
                agent_id: agent_id.to_owned(),
                address: address.to_owned(),
                weight,
                active_connections: 0,
                last_response_time: 0.0,
                health_score: 1.0,
                is_healthy: true,
            },
        );
        info!(agent_id, address, weight, "backend added");
    }

    pub fn remove_backend(&self, agent_id: &str) -> bool {
        let mut state = self.state.lock().expect("balancer state poisoned");
        state.order.retain(|id| id != agent_id);
        let removed = state.backends.remove(agent_id).is_some();
        if removed {
            info!(agent_id, "backend removed");
        }
        removed
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Pick a backend per the configured strategy, skipping unhealthy
    /// backends and anything in `exclude`.  Returns `None` when nothing
    /// qualifies.
    pub fn select_backend(&self, exclude: &[&str]) -> Option<BackendAgent> {
        let mut state = self.state.lock().expect("balancer state poisoned");
        let state = &mut *state;
        let available: Vec<&BackendAgent> = state
            .order
            .iter()
            .filter_map(|id| state.backends.get(id))
            .filter(|b| b.is_healthy && !exclude.contains(&b.agent_id.as_str()))
            .collect();
        if available.is_empty() {
            return None;
        }

        let chosen = match self.strategy {
            LoadBalancingStrategy::RoundRobin => {
                let backend = available[state.rr_index % available.len()];
                state.rr_index = (state.rr_index + 1) % available.len();
                backend.clone()
            }
            LoadBalancingStrategy::Random => (*available
                .choose(&mut rand::thread_rng())
                .expect("non-empty"))
            .clone(),
            LoadBalancingStrategy::LeastConnections => available
                .iter()
                .min_by_key(|b| b.active_connections)
                .copied()
                .expect("non-empty")
                .clone(),
            LoadBalancingStrategy::WeightedRandom => {
                weighted_pick(&available, |b| b.weight).clone()
            }
            LoadBalancingStrategy::HealthBased => {
                weighted_pick(&available, |b| b.health_score).clone()
            }
        };
        debug!(agent_id = %chosen.agent_id, "backend selected");
        Some(chosen)
    }

    // -----------------------------------------------------------------------
    // Observations
    // -----------------------------------------------------------------------

    /// Fold one observed interaction into the backend's health.
    pub fn update_backend_stats(&self, agent_id: &str, response_time: Duration, success: bool) {
        let mut state = self.state.lock().expect("balancer state poisoned");
        let Some(backend) = state.backends.get_mut(agent_id) else {
            return;
        };
        backend.last_response_time = response_time.as_secs_f64();
        backend.health_score = if success {
            (backend.health_score + 0.1).min(1.0)
        } else {
            (backend.health_score - 0.2).max(0.0)
        };
        backend.is_healthy = backend.health_score > 0.3;
    }

    pub fn increment_connections(&self, agent_id: &str) {
        let mut state = self.state.lock().expect("balancer state poisoned");
        if let Some(backend) = state.backends.get_mut(agent_id) {
            backend.active_connections += 1;
        }
    }

    pub fn decrement_connections(&self, agent_id: &str) {
        let mut state = self.state.lock().expect("balancer state poisoned");
        if let Some(backend) = state.backends.get_mut(agent_id) {
            backend.active_connections = backend.active_connections.saturating_sub(1);
        }
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    pub fn get_backend_stats(&self) -> HashMap<String, BackendAgent> {
        self.state
            .lock()
            .expect("balancer state poisoned")
            .backends
            .clone()
    }

    pub fn get_healthy_backends(&self) -> Vec<String> {
        let state = self.state.lock().expect("balancer state poisoned");
        state
            .order
            .iter()
            .filter(|id| state.backends.get(*id).is_some_and(|b| b.is_healthy))
            .cloned()
            .collect()
    }
}

/// Weighted pick over a non-empty slice; zero total weight degrades to the
/// first entry.
fn weighted_pick<'a>(
    backends: &[&'a BackendAgent],
    weight_of: impl Fn(&BackendAgent) -> f64,
) -> &'a BackendAgent {
    let total: f64 = backends.iter().map(|b| weight_of(b)).sum();
    if total <= 0.0 {
        return backends[0];
    }
    let mut remaining = rand::thread_rng().gen_range(0.0..total);
    for backend in backends {
        remaining -= weight_of(backend);
        if remaining <= 0.0 {
            return backend;
        }
    }
    backends[backends.len() - 1]
}
