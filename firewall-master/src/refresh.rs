/**
 * RAFRAÎCHISSEMENT DES NŒUDS - Commande "refresh_heartbeat" en lot
 *
 * RÔLE : Demande à chaque agent de réécrire son heartbeat, puis relance une
 * unique passe du moniteur pour que les statuts reflètent les réponses.
 *
 * FONCTIONNEMENT :
 * - Pool de workers borné (sémaphore), une tâche par agent
 * - Échéance globale : les tâches encore en vol sont détachées et comptées en échec
 * - Succès = statut "200", tout le reste (erreur, silence, timeout) = échec
 * - `failed` garde l'ordre des agents en entrée
 */

use crate::config::RefreshConf;
use crate::correlator::SharedCorrelator;
use crate::heartbeat::{PassReport, SharedHeartbeatMonitor};
use crate::protocol::{channel, CommandEnvelope, ComponentType, OperationType};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshOutcome {
    pub requested: usize,
    pub failed: Vec<String>,
}

impl RefreshOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct NodeRefresher {
    correlator: SharedCorrelator,
    monitor: SharedHeartbeatMonitor,
    workers: usize,
    deadline: Duration,
}

pub type SharedNodeRefresher = Arc<NodeRefresher>;

impl NodeRefresher {
    pub fn new(correlator: SharedCorrelator, monitor: SharedHeartbeatMonitor, conf: &RefreshConf) -> Self {
        Self { correlator, monitor, workers: conf.workers.max(1), deadline: conf.deadline() }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Rafraîchit un lot d'agents ; une seule passe heartbeat à la fin
    pub async fn refresh(&self, agent_ids: &[String]) -> RefreshOutcome {
        let mut outcome = RefreshOutcome { requested: agent_ids.len(), failed: Vec::new() };
        if agent_ids.is_empty() {
            return outcome;
        }

        let succeeded = self.dispatch(agent_ids).await;
        outcome.failed = agent_ids.iter().filter(|id| !succeeded.contains(*id)).cloned().collect();

        match self.monitor.check_now().await {
            Ok(PassReport { went_online, went_offline, .. }) => {
                debug!("[refresh] heartbeat pass: {} online, {} offline", went_online.len(), went_offline.len())
            }
            Err(e) => error!("[refresh] heartbeat pass after refresh failed: {e}"),
        }
        info!("[refresh] {} nodes requested, {} failed", outcome.requested, outcome.failed.len());
        outcome
    }

    /// Lance les commandes ; renvoie les agents ayant répondu 200 avant l'échéance
    async fn dispatch(&self, agent_ids: &[String]) -> HashSet<String> {
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = FuturesUnordered::new();
        for agent_id in agent_ids {
            let agent_id = agent_id.clone();
            let correlator = self.correlator.clone();
            let permits = permits.clone();
            tasks.push(tokio::spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (agent_id, false);
                };
                let ok = refresh_one(&correlator, &agent_id).await;
                (agent_id, ok)
            }));
        }

        let deadline = Instant::now() + self.deadline;
        let mut succeeded = HashSet::new();
        loop {
            match tokio::time::timeout_at(deadline, tasks.next()).await {
                Ok(Some(Ok((agent_id, true)))) => {
                    succeeded.insert(agent_id);
                }
                Ok(Some(Ok((_, false)))) => {}
                Ok(Some(Err(e))) => error!("[refresh] worker panicked: {e}"),
                Ok(None) => break,
                Err(_) => {
                    // les JoinHandle abandonnés détachent les tâches restantes
                    warn!("[refresh] deadline of {:?} reached with {} nodes pending", self.deadline, tasks.len());
                    break;
                }
            }
        }
        succeeded
    }
}

async fn refresh_one(correlator: &SharedCorrelator, agent_id: &str) -> bool {
    let command = CommandEnvelope::new(agent_id, ComponentType::Firewall, OperationType::Options)
        .param("action", "refresh_heartbeat");
    match correlator.send(agent_id, channel::HEARTBEAT, &command).await {
        Ok(response) if response.is_ok() => true,
        Ok(response) => {
            warn!("[refresh] {agent_id} answered {}: {}", response.status, response.message);
            false
        }
        Err(e) => {
            warn!("[refresh] {agent_id}: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeartbeatConf;
    use crate::correlator::{Correlator, RetryPolicy};
    use crate::heartbeat::{DebounceStore, HeartbeatMonitor};
    use crate::models::NodeStatus;
    use crate::protocol::ResponseEnvelope;
    use crate::store::JsonTable;
    use crate::test_support::{CountingTable, Script, ScriptedTransport};
    use crate::transport::memory::MemoryBroker;
    use crate::transport::HashRegistry;

    struct Fixture {
        transport: Arc<ScriptedTransport>,
        broker: MemoryBroker,
        monitor: SharedHeartbeatMonitor,
        refresher: NodeRefresher,
    }

    fn fixture(deadline: Duration) -> Fixture {
        let transport = Arc::new(ScriptedTransport::new());
        let policy = RetryPolicy { max_attempts: 4, delay: Duration::from_secs(2) };
        let correlator = Arc::new(Correlator::new(transport.clone(), policy));
        let broker = MemoryBroker::new();
        let nodes: Arc<CountingTable<NodeStatus>> = Arc::new(CountingTable::new());
        let monitor = Arc::new(HeartbeatMonitor::new(
            Arc::new(broker.clone()),
            nodes,
            DebounceStore::new(),
            HeartbeatConf::default(),
        ));
        let refresher = NodeRefresher::new(correlator, monitor.clone(), &RefreshConf::default())
            .with_deadline(deadline);
        Fixture { transport, broker, monitor, refresher }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_node_is_reported_failed() {
        let f = fixture(Duration::from_secs(30));
        f.transport.reply_ok("n1", "");
        f.transport.script("n2", Script::Silent);

        let outcome = f.refresher.refresh(&ids(&["n1", "n2"])).await;
        assert_eq!(outcome.requested, 2);
        assert_eq!(outcome.failed, ids(&["n2"]));
        assert!(!outcome.is_success());

        let appended = f.transport.appended.lock();
        assert!(appended.iter().all(|(stream, fields)| stream.ends_with(":heartbeat")
            && fields["agent_component_type"] == "FIREWALL"
            && fields["data_op_type"] == "OPTIONS"
            && fields["request_params"].contains("refresh_heartbeat")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_status_counts_as_failure_and_order_is_kept() {
        let f = fixture(Duration::from_secs(30));
        f.transport.script("a", Script::Reply { response: ResponseEnvelope::error("500", "boom"), after_reads: 0 });
        f.transport.reply_ok("b", "");
        f.transport.script("c", Script::Broken);

        let outcome = f.refresher.refresh(&ids(&["c", "b", "a"])).await;
        assert_eq!(outcome.failed, ids(&["c", "a"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_detaches_slow_nodes() {
        let f = fixture(Duration::from_secs(3));
        f.transport.reply_ok("fast", "");
        // répond seulement à la 3e lecture, soit après 4s
        f.transport.script("slow", Script::Reply { response: ResponseEnvelope::ok(""), after_reads: 2 });

        let started = Instant::now();
        let outcome = f.refresher.refresh(&ids(&["fast", "slow"])).await;
        assert_eq!(outcome.failed, ids(&["slow"]));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_runs_one_heartbeat_pass() {
        let f = fixture(Duration::from_secs(30));
        f.transport.reply_ok("n1", "");
        let now = f.broker.server_time().await.unwrap();
        let record = serde_json::json!({ "heartbeatTimestamp": now, "isFirstHeartbeat": true, "hostName": "web-1" });
        f.broker.put("firewall:heartbeats", "n1", &record.to_string()).await.unwrap();

        f.refresher.refresh(&ids(&["n1"])).await;
        assert_eq!(f.monitor.debounce().get("n1").observed_online, Some(true));
        assert_eq!(f.monitor.completed_passes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_batch_runs_exactly_one_heartbeat_pass() {
        let f = fixture(Duration::from_secs(30));
        f.transport.reply_ok("n1", "");
        f.transport.script("n2", Script::Silent);
        f.transport.script("n3", Script::Reply { response: ResponseEnvelope::error("500", "boom"), after_reads: 0 });

        let outcome = f.refresher.refresh(&ids(&["n1", "n2", "n3"])).await;

        assert_eq!(outcome.failed, ids(&["n2", "n3"]));
        assert_eq!(f.monitor.completed_passes(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch_returns_immediately() {
        let f = fixture(Duration::from_secs(30));
        let outcome = f.refresher.refresh(&[]).await;
        assert_eq!(outcome, RefreshOutcome::default());
        assert!(f.transport.appended.lock().is_empty());
        assert_eq!(f.monitor.completed_passes(), 0);
    }

    #[test]
    fn test_workers_floor_is_one() {
        let transport = Arc::new(ScriptedTransport::new());
        let correlator = Arc::new(Correlator::new(transport, RetryPolicy::default()));
        let monitor = Arc::new(HeartbeatMonitor::new(
            Arc::new(MemoryBroker::new()),
            Arc::new(JsonTable::in_memory()),
            DebounceStore::new(),
            HeartbeatConf::default(),
        ));
        let conf = RefreshConf { workers: 0, ..RefreshConf::default() };
        assert_eq!(NodeRefresher::new(correlator, monitor, &conf).workers, 1);
    }
}
