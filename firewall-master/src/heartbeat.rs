/**
 * MONITEUR DE HEARTBEATS - Machine à états online/offline avec debounce
 *
 * RÔLE :
 * Décide si chaque agent est actif à partir du registre `firewall:heartbeats`
 * que les agents réécrivent à chaque cycle, sans faire osciller le statut
 * sur une simple gigue réseau.
 *
 * FONCTIONNEMENT (par agent, à chaque passe) :
 * - Enregistrement illisible => agent ignoré pour cette passe
 * - frais = (heure serveur - heure du rapport) ∈ [0, 30s] ; futur => pas frais
 * - Premier rapport : nœud persisté, actif forcé, compteur remis à 0, flag effacé
 * - Frais : compteur remis à 0 ; passage actif persisté si l'état observé n'était pas online
 * - Pas frais : compteur +1 ; à exactement 3 (et si pas déjà offline) => inactif persisté
 *
 * Écritures en base uniquement sur les fronts de transition.
 * Les passes ne se chevauchent jamais (verrou de passe), "check now" compris.
 */

use crate::config::HeartbeatConf;
use crate::error::{MasterResult, StoreError};
use crate::models::{HeartbeatRecord, NodeStatus};
use crate::state::{new_state, Shared};
use crate::store::Table;
use crate::transport::HashRegistry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// État de debounce d'un agent, local au process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebounceState {
    pub consecutive_misses: u32,
    /// Dernier état observé : Some(true) online, Some(false) offline, None inconnu
    pub observed_online: Option<bool>,
}

/// Map de debounce partagée : lue par l'API, écrite par le moniteur seul
#[derive(Clone)]
pub struct DebounceStore {
    states: Shared<HashMap<String, DebounceState>>,
}

impl DebounceStore {
    pub fn new() -> Self {
        Self { states: new_state(HashMap::new()) }
    }

    pub fn get(&self, agent_id: &str) -> DebounceState {
        self.states.read().get(agent_id).copied().unwrap_or_default()
    }

    pub fn set(&self, agent_id: &str, state: DebounceState) {
        self.states.write().insert(agent_id.to_string(), state);
    }

    pub fn snapshot(&self) -> HashMap<String, DebounceState> {
        self.states.read().clone()
    }

    pub fn online_count(&self) -> usize {
        self.states.read().values().filter(|s| s.observed_online == Some(true)).count()
    }
}

impl Default for DebounceStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Bilan d'une passe
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub checked: usize,
    pub skipped: Vec<String>,
    pub registered: Vec<String>,
    pub went_online: Vec<String>,
    pub went_offline: Vec<String>,
}

pub struct HeartbeatMonitor {
    registry: Arc<dyn HashRegistry>,
    nodes: Arc<dyn Table<NodeStatus>>,
    debounce: DebounceStore,
    conf: HeartbeatConf,
    pass_lock: tokio::sync::Mutex<()>,
    passes: AtomicU64,
}

pub type SharedHeartbeatMonitor = Arc<HeartbeatMonitor>;

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<dyn HashRegistry>,
        nodes: Arc<dyn Table<NodeStatus>>,
        debounce: DebounceStore,
        conf: HeartbeatConf,
    ) -> Self {
        Self { registry, nodes, debounce, conf, pass_lock: tokio::sync::Mutex::new(()), passes: AtomicU64::new(0) }
    }

    pub fn debounce(&self) -> &DebounceStore {
        &self.debounce
    }

    /// Passes menées à terme depuis le démarrage
    pub fn completed_passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// "Check now" : relance une passe complète immédiatement
    pub async fn check_now(&self) -> MasterResult<PassReport> {
        self.run_pass().await
    }

    pub async fn run_pass(&self) -> MasterResult<PassReport> {
        let _pass = self.pass_lock.lock().await;
        let now = self.registry.server_time().await?;
        let entries = self.registry.entries(&self.conf.registry_key).await?;

        let mut report = PassReport::default();
        let mut agents: Vec<_> = entries.into_iter().collect();
        agents.sort();
        for (agent_id, raw) in agents {
            report.checked += 1;
            let record: HeartbeatRecord = match serde_json::from_str(&raw) {
                Ok(record) => record,
                Err(e) => {
                    warn!("[heartbeat] {agent_id}: unreadable heartbeat record, skipped: {e}");
                    report.skipped.push(agent_id);
                    continue;
                }
            };
            if let Err(e) = self.evaluate(&agent_id, record, now, &mut report).await {
                error!("[heartbeat] {agent_id}: evaluation failed: {e}");
                report.skipped.push(agent_id);
            }
        }

        debug!(
            "[heartbeat] pass done: {} checked, {} online edges, {} offline edges",
            report.checked,
            report.went_online.len(),
            report.went_offline.len()
        );
        self.passes.fetch_add(1, Ordering::Relaxed);
        Ok(report)
    }

    async fn evaluate(
        &self,
        agent_id: &str,
        mut record: HeartbeatRecord,
        now: i64,
        report: &mut PassReport,
    ) -> MasterResult<()> {
        let mut state = self.debounce.get(agent_id);

        if record.is_first_heartbeat {
            self.nodes.upsert_by_key(vec![NodeStatus::from_first_report(agent_id, &record)])?;
            state = DebounceState { consecutive_misses: 0, observed_online: Some(true) };
            self.debounce.set(agent_id, state);

            record.is_first_heartbeat = false;
            let cleared = serde_json::to_string(&record)?;
            self.registry.put(&self.conf.registry_key, agent_id, &cleared).await?;
            info!("[heartbeat] {agent_id}: first report, node registered as active");
            report.registered.push(agent_id.to_string());
            return Ok(());
        }

        let age = now - record.heartbeat_timestamp;
        let fresh = (0..=self.conf.fresh_window_secs).contains(&age);

        if fresh {
            state.consecutive_misses = 0;
            if state.observed_online != Some(true) {
                self.persist_activity(agent_id, &record, true)?;
                state.observed_online = Some(true);
                info!("[heartbeat] {agent_id}: back online");
                report.went_online.push(agent_id.to_string());
            }
        } else {
            state.consecutive_misses = state.consecutive_misses.saturating_add(1);
            debug!("[heartbeat] {agent_id}: stale report ({age}s old), miss #{}", state.consecutive_misses);
            if state.consecutive_misses == self.conf.offline_after_misses
                && state.observed_online != Some(false)
            {
                self.persist_activity(agent_id, &record, false)?;
                state.observed_online = Some(false);
                warn!("[heartbeat] {agent_id}: offline after {} missed cycles", state.consecutive_misses);
                report.went_offline.push(agent_id.to_string());
            }
        }
        self.debounce.set(agent_id, state);
        Ok(())
    }

    fn persist_activity(&self, agent_id: &str, record: &HeartbeatRecord, active: bool) -> Result<(), StoreError> {
        let mut node = self
            .nodes
            .find(&agent_id.to_string())?
            .unwrap_or_else(|| NodeStatus::from_first_report(agent_id, record));
        node.is_active = active;
        if active {
            node.last_heartbeat_at = Some(record.heartbeat_timestamp);
        }
        self.nodes.upsert_by_key(vec![node])?;
        Ok(())
    }
}
