use crate::correlator::Correlator;
use crate::heartbeat::DebounceStore;
use crate::models::NodeStatus;
use crate::reconcile::{LastRun, ReconcileEngine};
use crate::store::Table;
use serde::Serialize;
use std::time::Instant;
use tracing::warn;

#[derive(Debug, Serialize)]
pub struct MasterHealth {
    pub uptime_seconds: u64,
    pub nodes_known: u32,
    pub nodes_online: u32,
    pub last_reconcile: Option<LastRun>,
    pub correlator_unreachable: u64,
    pub memory_usage_mb: f32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self { start_time: Instant::now() }
    }

    pub fn get_health(
        &self,
        nodes: &dyn Table<NodeStatus>,
        debounce: &DebounceStore,
        engine: &ReconcileEngine,
        correlator: &Correlator,
    ) -> MasterHealth {
        let nodes_known = match nodes.list() {
            Ok(rows) => rows.len() as u32,
            Err(e) => {
                warn!("[health] cannot count nodes: {e}");
                0
            }
        };

        MasterHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            nodes_known,
            nodes_online: debounce.online_count() as u32,
            last_reconcile: engine.last_run(),
            correlator_unreachable: correlator.unreachable_count(),
            memory_usage_mb: get_memory_usage_mb(),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb) = line.split_whitespace().nth(1).and_then(|kb| kb.parse::<u64>().ok()) {
                        return (kb as f32) / 1024.0; // KB -> MB
                    }
                }
            }
        }
    }

    // RSS inconnu hors Linux
    0.0
}
