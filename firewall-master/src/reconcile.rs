/**
 * MOTEUR DE RÉCONCILIATION - Règles déclaratives <-> usage réel des ports
 *
 * RÔLE :
 * Rapproche les règles de ports (ports uniques, listes, plages) des faits
 * d'usage rapportés par chaque agent, et maintient le flag `using` des règles.
 *
 * FONCTIONNEMENT (passe complète) :
 * 1. Expansion des règles en triplets (agent, protocole, port) dédoublonnés
 * 2. Collecte du dernier rapport de chaque agent dans `firewall:portInfo`
 * 3. Détection de changement par clés de contenu : identique => aucune écriture
 * 4. Purge des faits persistés absents du nouveau snapshot (agent+protocole+port)
 * 5. Upsert du snapshot par clé naturelle
 * 6. Reliaison règle <-> fait appliquée en différentiel, recalcul des flags `using`
 * 7. Bascule du snapshot précédent seulement si 4 à 6 ont réussi
 *
 * PASSE CIBLÉE : sur "jeu de règles modifié", interroge les agents concernés
 * (composant PORT) pour les ports des règles touchées, puis relie ces règles seules.
 */

use crate::config::ReconcileConf;
use crate::correlator::SharedCorrelator;
use crate::error::{MasterError, MasterResult, StoreError};
use crate::events::{RuleEvents, RuleSetChanged};
use crate::models::{FactKey, PortRule, PortUsageFact, PortUsageReport, RuleUsageLink};
use crate::ports::{expand_rules, protocol_matches, ExpandedPort, PortSpec};
use crate::protocol::{channel, CommandEnvelope, ComponentType, OperationType};
use crate::state::{new_state, Shared};
use crate::store::{Store, Table};
use crate::transport::HashRegistry;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Snapshot d'usage retenu entre deux passes (clés de contenu)
#[derive(Debug, Clone, Default)]
struct UsageSnapshot {
    content_keys: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkDiff {
    pub added: usize,
    pub removed: usize,
    pub rules_flagged: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Snapshot identique au précédent : aucune écriture
    Unchanged,
    Applied {
        facts: usize,
        pruned: usize,
        /// Faits couverts par aucune règle
        uncovered: usize,
        skipped_agents: Vec<String>,
        links: LinkDiff,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetedOutcome {
    pub rules: usize,
    pub refreshed_agents: Vec<String>,
    pub failed_agents: Vec<String>,
    pub links: LinkDiff,
}

impl TargetedOutcome {
    pub fn is_success(&self) -> bool {
        self.failed_agents.is_empty()
    }
}

/// Dernier résultat de passe complète, exposé par la santé système
#[derive(Debug, Clone, Serialize)]
pub struct LastRun {
    pub at: i64,
    pub ok: bool,
    pub detail: String,
}

pub struct ReconcileEngine {
    registry: Arc<dyn HashRegistry>,
    correlator: SharedCorrelator,
    store: Store,
    conf: ReconcileConf,
    previous: Shared<Arc<UsageSnapshot>>,
    last_run: Shared<Option<LastRun>>,
    pass_lock: tokio::sync::Mutex<()>,
}

pub type SharedReconcileEngine = Arc<ReconcileEngine>;

impl ReconcileEngine {
    pub fn new(
        registry: Arc<dyn HashRegistry>,
        correlator: SharedCorrelator,
        store: Store,
        conf: ReconcileConf,
    ) -> Self {
        Self {
            registry,
            correlator,
            store,
            conf,
            previous: new_state(Arc::new(UsageSnapshot::default())),
            last_run: new_state(None),
            pass_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn last_run(&self) -> Option<LastRun> {
        self.last_run.read().clone()
    }

    /// Passe complète ; le résultat (succès ou échec) est retenu pour la santé système
    pub async fn reconcile(&self) -> MasterResult<ReconcileOutcome> {
        let _pass = self.pass_lock.lock().await;
        let result = self.reconcile_pass().await;
        let last = match &result {
            Ok(outcome) => LastRun { at: now(), ok: true, detail: format!("{outcome:?}") },
            Err(e) => {
                error!("[reconcile] pass failed, previous snapshot kept: {e}");
                LastRun { at: now(), ok: false, detail: e.to_string() }
            }
        };
        *self.last_run.write() = Some(last);
        result
    }

    async fn reconcile_pass(&self) -> MasterResult<ReconcileOutcome> {
        // 1. expansion des règles déclarées
        let rules = self.store.rules.list()?;
        let (declared, invalid) = expand_rules(&rules);
        for (rule, e) in &invalid {
            warn!("[reconcile] rule {:?} on {}: unusable port spec {:?}: {e}", rule.id, rule.agent_id(), rule.port);
        }

        // 2. collecte du snapshot rapporté par les agents
        let (facts, skipped_agents) = self.collect_snapshot().await?;

        // 3. détection de changement
        let content_keys: BTreeSet<String> = facts.iter().map(PortUsageFact::content_key).collect();
        if content_keys == self.previous.read().content_keys {
            debug!("[reconcile] usage snapshot unchanged ({} facts), nothing to do", facts.len());
            return Ok(ReconcileOutcome::Unchanged);
        }

        // 4. purge des faits disparus (les agents ignorés gardent leurs faits)
        let reported: HashSet<FactKey> = facts.iter().map(PortUsageFact::fact_key).collect();
        let skipped: HashSet<&str> = skipped_agents.iter().map(String::as_str).collect();
        let stale_ids: HashSet<u64> = self
            .store
            .usage
            .list()?
            .into_iter()
            .filter(|f| !skipped.contains(f.agent_id.as_str()) && !reported.contains(&f.fact_key()))
            .filter_map(|f| f.id)
            .collect();
        let pruned = if stale_ids.is_empty() {
            0
        } else {
            self.store.links.delete_where(&|l: &RuleUsageLink| stale_ids.contains(&l.fact_id))?;
            self.store.usage.delete_where(&|f: &PortUsageFact| f.id.is_some_and(|id| stale_ids.contains(&id)))?
        };

        // 5. upsert par clé naturelle
        let fact_count = facts.len();
        if !facts.is_empty() {
            self.store.usage.upsert_by_key(facts)?;
        }

        // 6. reliaison complète
        let stored_facts = self.store.usage.list()?;
        let uncovered = stored_facts
            .iter()
            .filter(|f| {
                !declared.contains(&ExpandedPort {
                    agent_id: f.agent_id.clone(),
                    protocol: f.protocol.to_ascii_lowercase(),
                    port: f.port_number,
                })
            })
            .count();
        let links = self.relink(&rules, &stored_facts, None)?;

        // 7. bascule du snapshot
        *self.previous.write() = Arc::new(UsageSnapshot { content_keys });

        info!(
            "[reconcile] {fact_count} facts, {pruned} pruned, links +{} -{}, {} rule flags changed",
            links.added, links.removed, links.rules_flagged
        );
        Ok(ReconcileOutcome::Applied { facts: fact_count, pruned, uncovered, skipped_agents, links })
    }

    /// Lit `firewall:portInfo` ; renvoie les faits et les agents au rapport illisible
    async fn collect_snapshot(&self) -> MasterResult<(Vec<PortUsageFact>, Vec<String>)> {
        let entries = self.registry.entries(&self.conf.registry_key).await?;
        let mut by_key: BTreeMap<FactKey, PortUsageFact> = BTreeMap::new();
        let mut skipped = Vec::new();
        for (agent_id, raw) in entries {
            let report: PortUsageReport = match serde_json::from_str(&raw) {
                Ok(report) => report,
                Err(e) => {
                    warn!("[reconcile] {agent_id}: unreadable port usage report, skipped: {e}");
                    skipped.push(agent_id);
                    continue;
                }
            };
            for mut fact in report.report_port_infos {
                fact.id = None;
                if fact.agent_id.is_empty() {
                    fact.agent_id = agent_id.clone();
                }
                by_key.insert(fact.fact_key(), fact);
            }
        }
        skipped.sort();
        Ok((by_key.into_values().collect(), skipped))
    }

    /// Recalcule les liens des règles données (toutes si `scope` est None) en différentiel
    fn relink(
        &self,
        rules: &[PortRule],
        facts: &[PortUsageFact],
        scope: Option<&HashSet<u64>>,
    ) -> Result<LinkDiff, StoreError> {
        let mut facts_by_agent: HashMap<&str, Vec<&PortUsageFact>> = HashMap::new();
        for fact in facts {
            facts_by_agent.entry(fact.agent_id.as_str()).or_default().push(fact);
        }

        let mut desired: HashSet<(u64, u64)> = HashSet::new();
        for rule in rules {
            let Some(rule_id) = rule.id else { continue };
            let Ok(spec) = PortSpec::parse(&rule.port) else { continue };
            for fact in facts_by_agent.get(rule.agent_id()).into_iter().flatten() {
                let Some(fact_id) = fact.id else { continue };
                if protocol_matches(&rule.protocol, &fact.protocol) && spec.contains(fact.port_number) {
                    desired.insert((rule_id, fact_id));
                }
            }
        }

        let in_scope = |rule_id: u64| scope.is_none_or(|ids| ids.contains(&rule_id));
        let existing: HashSet<(u64, u64)> = self
            .store
            .links
            .list()?
            .into_iter()
            .filter(|l| in_scope(l.rule_id))
            .map(|l| (l.rule_id, l.fact_id))
            .collect();

        let removed: HashSet<(u64, u64)> = existing.difference(&desired).copied().collect();
        let added: Vec<RuleUsageLink> = desired
            .difference(&existing)
            .map(|&(rule_id, fact_id)| RuleUsageLink { id: None, rule_id, fact_id })
            .collect();

        if !removed.is_empty() {
            self.store
                .links
                .delete_where(&|l: &RuleUsageLink| removed.contains(&(l.rule_id, l.fact_id)))?;
        }
        let added_count = added.len();
        if !added.is_empty() {
            self.store.links.upsert_by_key(added)?;
        }

        // flag `using` = au moins un lien
        let linked_rules: HashSet<u64> = desired.iter().map(|&(rule_id, _)| rule_id).collect();
        let flagged: Vec<PortRule> = rules
            .iter()
            .filter(|r| r.id.is_some_and(in_scope))
            .filter(|r| r.using != r.id.is_some_and(|id| linked_rules.contains(&id)))
            .map(|r| PortRule { using: !r.using, ..r.clone() })
            .collect();
        let rules_flagged = flagged.len();
        if !flagged.is_empty() {
            self.store.rules.upsert_by_key(flagged)?;
        }

        Ok(LinkDiff { added: added_count, removed: removed.len(), rules_flagged })
    }

    /// Passe ciblée : usage frais des agents concernés, reliaison des seules règles données
    pub async fn reconcile_for_rules(&self, rules: &[PortRule]) -> MasterResult<TargetedOutcome> {
        let _pass = self.pass_lock.lock().await;
        let mut outcome = TargetedOutcome { rules: rules.len(), ..Default::default() };
        if rules.is_empty() {
            return Ok(outcome);
        }

        let mut by_agent: BTreeMap<&str, Vec<&PortRule>> = BTreeMap::new();
        for rule in rules {
            by_agent.entry(rule.agent_id()).or_default().push(rule);
        }

        for (agent_id, agent_rules) in &by_agent {
            match self.query_agent_usage(agent_id, agent_rules).await {
                Ok(facts) => {
                    if !facts.is_empty() {
                        self.store.usage.upsert_by_key(facts)?;
                    }
                    outcome.refreshed_agents.push(agent_id.to_string());
                }
                Err(e) => {
                    warn!("[reconcile] {agent_id}: fresh usage unavailable, linking against stored facts: {e}");
                    outcome.failed_agents.push(agent_id.to_string());
                }
            }
        }

        let agents: HashSet<&str> = by_agent.keys().copied().collect();
        let facts: Vec<PortUsageFact> = self
            .store
            .usage
            .list()?
            .into_iter()
            .filter(|f| agents.contains(f.agent_id.as_str()))
            .collect();
        let scope: HashSet<u64> = rules.iter().filter_map(|r| r.id).collect();
        outcome.links = self.relink(rules, &facts, Some(&scope))?;
        info!(
            "[reconcile] targeted pass on {} rules: links +{} -{}, {} agents failed",
            outcome.rules,
            outcome.links.added,
            outcome.links.removed,
            outcome.failed_agents.len()
        );
        Ok(outcome)
    }

    /// Demande à un agent l'usage des ports couverts par ses règles (composant PORT)
    async fn query_agent_usage(&self, agent_id: &str, rules: &[&PortRule]) -> MasterResult<Vec<PortUsageFact>> {
        let (expanded, _) = expand_rules(rules.iter().copied());
        let ports: BTreeSet<String> = expanded.iter().map(|e| e.port.to_string()).collect();
        let ports: Vec<String> = ports.into_iter().collect();

        let command = CommandEnvelope::new(agent_id, ComponentType::Port, OperationType::Query)
            .param("portType", "RANGE_PORT_COMMA")
            .param("port", serde_json::to_string(&ports)?)
            .primary_keys(&["agentId", "protocol", "portNumber"]);
        let response = self.correlator.send(agent_id, channel::PORT_INFO, &command).await?;
        if !response.is_ok() {
            return Err(MasterError::AgentRejected {
                agent_id: agent_id.to_string(),
                status: response.status,
                message: response.message,
            });
        }
        let mut facts: Vec<PortUsageFact> = response.data_list()?;
        for fact in &mut facts {
            fact.id = None;
            if fact.agent_id.is_empty() {
                fact.agent_id = agent_id.to_string();
            }
        }
        Ok(facts)
    }

    /// Écoute "jeu de règles modifié" et déclenche une passe ciblée par événement
    pub fn spawn_rule_listener(
        engine: SharedReconcileEngine,
        events: &RuleEvents,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let mut rx = events.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(RuleSetChanged { agent_id, rule_ids }) => {
                        let wanted: HashSet<u64> = rule_ids.into_iter().collect();
                        let rules = match engine.store.rules.list() {
                            Ok(rules) => rules
                                .into_iter()
                                .filter(|r| r.id.is_some_and(|id| wanted.contains(&id)))
                                .collect::<Vec<_>>(),
                            Err(e) => {
                                error!("[reconcile] cannot load changed rules for {agent_id}: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = engine.reconcile_for_rules(&rules).await {
                            error!("[reconcile] targeted pass for {agent_id} failed: {e}");
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("[reconcile] {missed} rule events missed, running a full pass");
                        if let Err(e) = engine.reconcile().await {
                            error!("[reconcile] catch-up pass failed: {e}");
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("[reconcile] rule listener stopped");
        })
    }
}

fn now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
