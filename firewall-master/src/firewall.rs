/**
 * SERVICE PARE-FEU - Statut, cycle de vie et ping des pare-feux agents
 *
 * Canal `firewallStatusInfo`, composant FIREWALL. Le statut persisté n'est
 * modifié qu'après une réponse "200" de l'agent.
 */

use crate::correlator::SharedCorrelator;
use crate::error::{MasterError, MasterResult};
use crate::models::{FirewallOperation, FirewallState, FirewallStatusInfo, PingStatus, PingToggle};
use crate::protocol::{channel, CommandEnvelope, ComponentType, OperationType};
use crate::rules::{require_ok, RuleOpOutcome};
use crate::store::{Store, Table};
use std::sync::Arc;
use tracing::{debug, info};

pub struct FirewallService {
    correlator: SharedCorrelator,
    store: Store,
}

pub type SharedFirewallService = Arc<FirewallService>;

impl FirewallService {
    pub fn new(correlator: SharedCorrelator, store: Store) -> Self {
        Self { correlator, store }
    }

    /// Interroge l'agent, persiste par (agent, type) et renvoie la première entrée
    pub async fn status(&self, agent_id: &str) -> MasterResult<Option<FirewallStatusInfo>> {
        let command = CommandEnvelope::new(agent_id, ComponentType::Firewall, OperationType::Query)
            .primary_keys(&["agentId", "firewallType"]);
        let response = self.correlator.send(agent_id, channel::FIREWALL_STATUS, &command).await?;
        let response = require_ok(agent_id, response)?;

        let mut infos: Vec<FirewallStatusInfo> = response.data_list()?;
        if infos.is_empty() {
            return Ok(None);
        }
        for info in &mut infos {
            info.id = None;
            if info.agent_id.is_empty() {
                info.agent_id = agent_id.to_string();
            }
        }
        let stored = self.store.firewall.upsert_by_key(infos)?;
        debug!("[firewall] {agent_id}: {} status entries stored", stored.len());
        Ok(stored.into_iter().next())
    }

    pub async fn operate(&self, agent_id: &str, operation: FirewallOperation) -> RuleOpOutcome {
        let state = match operation {
            FirewallOperation::Start | FirewallOperation::Restart => FirewallState::Active,
            FirewallOperation::Stop => FirewallState::Inactive,
        };
        self.run_update(agent_id, &operation.to_string(), |info| info.status = state).await
    }

    pub async fn set_ping(&self, agent_id: &str, toggle: PingToggle) -> RuleOpOutcome {
        // le statut stocké décrit le blocage du ping, pas le ping lui-même
        let blocking = match toggle {
            PingToggle::Enable => PingStatus::StatusDisable,
            PingToggle::Disable => PingStatus::StatusEnable,
        };
        self.run_update(agent_id, toggle.operation(), |info| info.ping_disabled = blocking).await
    }

    async fn run_update<F>(&self, agent_id: &str, operation: &str, apply: F) -> RuleOpOutcome
    where
        F: Fn(&mut FirewallStatusInfo),
    {
        if agent_id.trim().is_empty() {
            return RuleOpOutcome::failed("agentId is required");
        }
        let command = CommandEnvelope::new(agent_id, ComponentType::Firewall, OperationType::Update)
            .param("operation", operation);
        let sent = self.correlator.send(agent_id, channel::FIREWALL_STATUS, &command).await;
        if let Err(e) = sent.map_err(MasterError::from).and_then(|response| require_ok(agent_id, response)) {
            return RuleOpOutcome::failed(e.to_string());
        }

        let updated: Vec<FirewallStatusInfo> = match self
            .store
            .firewall
            .list_where(&|f: &FirewallStatusInfo| f.agent_id == agent_id)
        {
            Ok(rows) => rows
                .into_iter()
                .map(|mut info| {
                    apply(&mut info);
                    info
                })
                .collect(),
            Err(e) => return RuleOpOutcome::failed(e.to_string()),
        };
        if updated.is_empty() {
            debug!("[firewall] {agent_id}: {operation} applied, no stored status to update");
            return RuleOpOutcome::ok();
        }
        match self.store.firewall.upsert_by_key(updated) {
            Ok(_) => {
                info!("[firewall] {agent_id}: {operation} applied");
                RuleOpOutcome::ok()
            }
            Err(e) => RuleOpOutcome::failed(format!("agent applied {operation} but it could not be stored: {e}")),
        }
    }
}
