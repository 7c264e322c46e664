/**
 * SERVICE DE RÈGLES DE PORTS - CRUD synchronisé avec les agents
 *
 * RÔLE :
 * Chaque mutation est d'abord envoyée à l'agent (composant FIREWALL, canal
 * `portRule`) ; la base n'est modifiée que si l'agent répond "200".
 * Toute mutation réussie publie "jeu de règles modifié" pour la réconciliation.
 */

use crate::correlator::SharedCorrelator;
use crate::error::{MasterError, MasterResult};
use crate::events::{RuleEvents, RuleSetChanged};
use crate::models::{FirewallRule, PortRule, RuleUsageLink};
use crate::ports::PortSpec;
use crate::protocol::{channel, CommandEnvelope, ComponentType, OperationType, ResponseEnvelope};
use crate::store::{Entity, Store, Table};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

const RULE_KEYS: [&str; 9] = ["family", "port", "protocol", "sourceRule", "policy", "agentId", "permanent", "type", "zone"];

/// Résultat d'une opération pilotée par l'API
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleOpOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RuleOpOutcome {
    pub fn ok() -> Self {
        Self { success: true, reason: None }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self { success: false, reason: Some(reason.into()) }
    }
}

pub struct RuleService {
    correlator: SharedCorrelator,
    store: Store,
    events: RuleEvents,
}

pub type SharedRuleService = Arc<RuleService>;

impl RuleService {
    pub fn new(correlator: SharedCorrelator, store: Store, events: RuleEvents) -> Self {
        Self { correlator, store, events }
    }

    /// Règles connues de l'agent ; à défaut, lues sur l'agent puis persistées
    pub async fn fetch_rules(&self, agent_id: &str) -> MasterResult<Vec<PortRule>> {
        let stored = self.rules_of(agent_id)?;
        if !stored.is_empty() {
            return Ok(stored);
        }

        let command = CommandEnvelope::new(agent_id, ComponentType::Firewall, OperationType::Query)
            .param("zoneName", "public")
            .primary_keys(&RULE_KEYS);
        let response = self.correlator.send(agent_id, channel::PORT_RULE, &command).await?;
        let response = require_ok(agent_id, response)?;

        let rules: Vec<PortRule> = response
            .data_list::<FirewallRule>()?
            .into_iter()
            .filter_map(FirewallRule::into_port_rule)
            .map(|mut rule| {
                rule.id = None;
                rule.using = false;
                rule.base.agent_id = agent_id.to_string();
                rule
            })
            .collect();
        if rules.is_empty() {
            info!("[rules] {agent_id} reported no port rule");
            return Ok(Vec::new());
        }

        let stored = self.store.rules.upsert_by_key(rules)?;
        info!("[rules] {} port rules imported from {agent_id}", stored.len());
        self.emit(agent_id, &stored);
        Ok(stored)
    }

    pub async fn add_rule(&self, mut rule: PortRule) -> RuleOpOutcome {
        if let Err(reason) = validate(&rule) {
            return RuleOpOutcome::failed(reason);
        }
        rule.id = None;
        rule.using = false;
        let agent_id = rule.agent_id().to_string();

        let command = match CommandEnvelope::new(&agent_id, ComponentType::Firewall, OperationType::Insert)
            .param("zoneName", rule.base.zone.clone())
            .param("policy", rule.policy.to_string())
            .primary_keys(&RULE_KEYS)
            .with_data(&[FirewallRule::Port(rule.clone())])
        {
            Ok(command) => command,
            Err(e) => return RuleOpOutcome::failed(e.to_string()),
        };
        if let Err(e) = self.send_mutation(&agent_id, &command).await {
            return RuleOpOutcome::failed(e.to_string());
        }

        match self.store.rules.upsert_by_key(vec![rule]) {
            Ok(stored) => {
                info!("[rules] rule {} added on {agent_id}", describe(&stored[0]));
                self.emit(&agent_id, &stored);
                RuleOpOutcome::ok()
            }
            Err(e) => RuleOpOutcome::failed(format!("agent applied the rule but it could not be stored: {e}")),
        }
    }

    /// Remplace la règle `rule_id` ; l'id et l'agent de l'ancienne règle sont conservés
    pub async fn update_rule(&self, rule_id: u64, mut rule: PortRule) -> RuleOpOutcome {
        let old = match self.store.rules.get(rule_id) {
            Ok(Some(old)) => old,
            Ok(None) => return RuleOpOutcome::failed(format!("rule {rule_id} not found")),
            Err(e) => return RuleOpOutcome::failed(e.to_string()),
        };
        rule.id = old.id;
        rule.base.agent_id = old.base.agent_id.clone();
        rule.using = old.using;
        if let Err(reason) = validate(&rule) {
            return RuleOpOutcome::failed(reason);
        }
        // la nouvelle clé naturelle ne doit pas désigner une autre règle
        match self.store.rules.find(&rule.natural_key()) {
            Ok(Some(other)) if other.id != old.id => {
                return RuleOpOutcome::failed(format!("duplicate rule: same as rule {:?}", other.id));
            }
            Ok(_) => {}
            Err(e) => return RuleOpOutcome::failed(e.to_string()),
        }
        let agent_id = old.agent_id().to_string();

        let command = CommandEnvelope::new(&agent_id, ComponentType::Firewall, OperationType::Update)
            .param("zoneName", rule.base.zone.clone())
            .primary_keys(&RULE_KEYS)
            .with_data(&[FirewallRule::Port(rule.clone())])
            .and_then(|c| c.with_old(&FirewallRule::Port(old.clone())));
        let command = match command {
            Ok(command) => command,
            Err(e) => return RuleOpOutcome::failed(e.to_string()),
        };
        if let Err(e) = self.send_mutation(&agent_id, &command).await {
            return RuleOpOutcome::failed(e.to_string());
        }

        match self.store.rules.upsert_by_key(vec![rule]) {
            Ok(stored) => {
                info!("[rules] rule {rule_id} on {agent_id}: {} -> {}", describe(&old), describe(&stored[0]));
                self.emit(&agent_id, &stored);
                RuleOpOutcome::ok()
            }
            Err(e) => RuleOpOutcome::failed(format!("agent applied the update but it could not be stored: {e}")),
        }
    }

    /// Supprime sur l'agent puis en base les règles demandées et leurs liens
    pub async fn delete_rules(&self, agent_id: &str, rule_ids: &[u64]) -> RuleOpOutcome {
        if rule_ids.is_empty() {
            return RuleOpOutcome::failed("no rule id given");
        }
        let wanted: HashSet<u64> = rule_ids.iter().copied().collect();
        let rules = match self.rules_of(agent_id) {
            Ok(rules) => rules
                .into_iter()
                .filter(|r| r.id.is_some_and(|id| wanted.contains(&id)))
                .collect::<Vec<_>>(),
            Err(e) => return RuleOpOutcome::failed(e.to_string()),
        };
        if rules.is_empty() {
            return RuleOpOutcome::failed(format!("no matching rule on {agent_id}"));
        }

        let data: Vec<FirewallRule> = rules.iter().cloned().map(FirewallRule::Port).collect();
        let command = match CommandEnvelope::new(agent_id, ComponentType::Firewall, OperationType::Delete)
            .primary_keys(&RULE_KEYS)
            .with_data(&data)
        {
            Ok(command) => command,
            Err(e) => return RuleOpOutcome::failed(e.to_string()),
        };
        if let Err(e) = self.send_mutation(agent_id, &command).await {
            return RuleOpOutcome::failed(e.to_string());
        }

        let ids: HashSet<u64> = rules.iter().filter_map(|r| r.id).collect();
        let deleted = self
            .store
            .links
            .delete_where(&|l: &RuleUsageLink| ids.contains(&l.rule_id))
            .and_then(|_| self.store.rules.delete_where(&|r: &PortRule| r.id.is_some_and(|id| ids.contains(&id))));
        match deleted {
            Ok(count) => {
                info!("[rules] {count} rules deleted on {agent_id}");
                self.events.publish(RuleSetChanged {
                    agent_id: agent_id.to_string(),
                    rule_ids: ids.into_iter().collect(),
                });
                RuleOpOutcome::ok()
            }
            Err(e) => RuleOpOutcome::failed(format!("agent deleted the rules but the store did not: {e}")),
        }
    }

    fn rules_of(&self, agent_id: &str) -> MasterResult<Vec<PortRule>> {
        Ok(self.store.rules.list_where(&|r: &PortRule| r.agent_id() == agent_id)?)
    }

    async fn send_mutation(&self, agent_id: &str, command: &CommandEnvelope) -> MasterResult<ResponseEnvelope> {
        let response = self.correlator.send(agent_id, channel::PORT_RULE, command).await?;
        let response = require_ok(agent_id, response)?;
        Ok(response)
    }

    fn emit(&self, agent_id: &str, rules: &[PortRule]) {
        self.events.publish(RuleSetChanged {
            agent_id: agent_id.to_string(),
            rule_ids: rules.iter().filter_map(|r| r.id).collect(),
        });
    }
}

pub(crate) fn require_ok(agent_id: &str, response: ResponseEnvelope) -> MasterResult<ResponseEnvelope> {
    if response.is_ok() {
        return Ok(response);
    }
    warn!("[agent] {agent_id} answered {}: {}", response.status, response.message);
    Err(MasterError::AgentRejected {
        agent_id: agent_id.to_string(),
        status: response.status,
        message: response.message,
    })
}

fn validate(rule: &PortRule) -> Result<(), String> {
    if rule.agent_id().trim().is_empty() {
        return Err("agentId is required".into());
    }
    if rule.protocol.trim().is_empty() {
        return Err("protocol is required".into());
    }
    PortSpec::parse(&rule.port).map_err(|e| format!("invalid port {:?}: {e}", rule.port))?;
    Ok(())
}

fn describe(rule: &PortRule) -> String {
    format!("{}/{}", rule.port, rule.protocol)
}
