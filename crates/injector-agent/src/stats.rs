//! Latest proxy counters, shared for the lifetime of the agent

use chrono::{DateTime, Utc};
use injector_haproxy::InstanceStats;
use std::collections::HashMap;
use std::sync::RwLock;

/// Holds the most recent stats snapshot of every proxy instance
///
/// Created once at startup and handed to whoever needs it.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    snapshots: RwLock<HashMap<String, InstanceStats>>,
    collected_at: RwLock<Option<DateTime<Utc>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot with a fresh collection
    ///
    /// Networks missing from `stats` are dropped, since their instance is gone
    /// or could not be queried.
    pub fn record(&self, stats: Vec<InstanceStats>) {
        let fresh: HashMap<String, InstanceStats> = stats
            .into_iter()
            .map(|snapshot| (snapshot.network_id.clone(), snapshot))
            .collect();

        if let Ok(mut snapshots) = self.snapshots.write() {
            *snapshots = fresh;
        }
        if let Ok(mut collected_at) = self.collected_at.write() {
            *collected_at = Some(Utc::now());
        }
    }

    pub fn get(&self, network_id: &str) -> Option<InstanceStats> {
        self.snapshots
            .read()
            .ok()
            .and_then(|snapshots| snapshots.get(network_id).cloned())
    }

    pub fn networks(&self) -> Vec<String> {
        let mut networks: Vec<String> = self
            .snapshots
            .read()
            .map(|snapshots| snapshots.keys().cloned().collect())
            .unwrap_or_default();
        networks.sort();
        networks
    }

    /// Sum of the counters across all instances
    pub fn totals(&self) -> InstanceStats {
        let mut totals = InstanceStats::default();
        if let Ok(snapshots) = self.snapshots.read() {
            for snapshot in snapshots.values() {
                totals.current_sessions += snapshot.current_sessions;
                totals.total_sessions += snapshot.total_sessions;
                totals.bytes_in += snapshot.bytes_in;
                totals.bytes_out += snapshot.bytes_out;
            }
        }
        totals
    }

    pub fn collected_at(&self) -> Option<DateTime<Utc>> {
        self.collected_at.read().ok().and_then(|at| *at)
    }
}
