//! Recording proxy controller used by tests

use crate::{InstanceStats, ProxyConfig, ProxyController, ProxyError};
use injector_proto::{RuntimeLayout, ServiceInjection};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// A call observed by [`FakeProxyController`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyCall {
    Add(String),
    Remove(String),
}

#[derive(Debug, Default)]
struct State {
    running: HashMap<String, InstanceStats>,
    calls: Vec<ProxyCall>,
    failing: HashSet<String>,
}

/// Tracks instances in memory instead of starting processes
///
/// A start failure can be configured per network. A failing start still
/// writes the config and log files, the way a real launch would leave them
/// behind.
#[derive(Debug)]
pub struct FakeProxyController {
    layout: RuntimeLayout,
    upstream_host: String,
    state: Mutex<State>,
}

impl FakeProxyController {
    pub fn new(layout: RuntimeLayout, upstream_host: &str) -> Self {
        Self {
            layout,
            upstream_host: upstream_host.to_string(),
            state: Mutex::new(State::default()),
        }
    }

    /// Make every start for a network fail
    pub fn fail_start(&self, network_id: &str) {
        self.lock().failing.insert(network_id.to_string());
    }

    pub fn recover(&self, network_id: &str) {
        self.lock().failing.remove(network_id);
    }

    /// Simulate the process dying behind the controller's back
    pub fn crash(&self, network_id: &str) {
        self.lock().running.remove(network_id);
    }

    pub fn running(&self) -> Vec<String> {
        let mut running: Vec<String> = self.lock().running.keys().cloned().collect();
        running.sort();
        running
    }

    pub fn calls(&self) -> Vec<ProxyCall> {
        self.lock().calls.clone()
    }

    /// Set the counters reported for a running instance
    pub fn set_stats(&self, stats: InstanceStats) {
        let mut state = self.lock();
        if let Some(slot) = state.running.get_mut(&stats.network_id) {
            *slot = stats;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait::async_trait]
impl ProxyController for FakeProxyController {
    fn is_running(&self, network_id: &str) -> bool {
        self.lock().running.contains_key(network_id)
    }

    async fn add_instance(&self, injection: &ServiceInjection) -> Result<(), ProxyError> {
        let network_id = injection.network_id.clone();
        let mut state = self.lock();
        state.calls.push(ProxyCall::Add(network_id.clone()));

        if state.running.contains_key(&network_id) {
            return Ok(());
        }

        if state.failing.contains(&network_id) {
            drop(state);
            let config = ProxyConfig {
                network_id: &network_id,
                upstream_host: &self.upstream_host,
                ports: &injection.ports,
                protocol: injection.protocol,
                layout: &self.layout,
                user: None,
                group: None,
            }
            .render()?;
            std::fs::create_dir_all(self.layout.root())?;
            std::fs::write(self.layout.config_path(&network_id), config)?;
            std::fs::write(
                self.layout.log_path(&network_id),
                format!("[ALERT] cannot bind socket for network {}\n", network_id),
            )?;
            return Err(ProxyError::Exited {
                network_id,
                code: Some(1),
            });
        }

        state.running.insert(
            network_id.clone(),
            InstanceStats {
                network_id,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn remove_instance(&self, network_id: &str) -> Result<(), ProxyError> {
        let mut state = self.lock();
        state.calls.push(ProxyCall::Remove(network_id.to_string()));
        state
            .running
            .remove(network_id)
            .map(|_| ())
            .ok_or_else(|| ProxyError::NotRunning(network_id.to_string()))
    }

    async fn collect_stats(&self) -> Vec<InstanceStats> {
        let mut stats: Vec<InstanceStats> = self.lock().running.values().cloned().collect();
        stats.sort_by(|a, b| a.network_id.cmp(&b.network_id));
        stats
    }
}
