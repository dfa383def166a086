/// Per-node query counters shared by every session.
///
/// One exclusive lock guards the whole map, including creation of a counter
/// the first time a node name is seen. Counters are process-local and reset
/// on restart.
use fnv::FnvHashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Default)]
pub struct StatsRegistry {
    counters: Mutex<FnvHashMap<String, u64>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one relayed query against a node. Called synchronously before
    /// the query is forwarded.
    pub fn increment(&self, node_name: &str) {
        let mut counters = self.counters.lock().expect("stats lock poisoned");
        *counters.entry(node_name.to_string()).or_insert(0) += 1;
    }

    /// Current counter for a node; zero for nodes never routed to.
    pub fn count(&self, node_name: &str) -> u64 {
        let counters = self.counters.lock().expect("stats lock poisoned");
        counters.get(node_name).copied().unwrap_or(0)
    }

    /// Copy of all counters, sorted by node name for stable reporting.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let counters = self.counters.lock().expect("stats lock poisoned");
        let mut entries: Vec<_> = counters
            .iter()
            .map(|(name, count)| (name.clone(), *count))
            .collect();
        drop(counters);
        entries.sort();
        entries
    }

    /// Log a per-node query count summary at a fixed interval.
    pub async fn run_reporter(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        // the first tick fires immediately and would log an empty summary
        ticker.tick().await;

        loop {
            ticker.tick().await;
            for (node, count) in self.snapshot() {
                info!(node = %node, queries = count, "query count");
            }
        }
    }
}
