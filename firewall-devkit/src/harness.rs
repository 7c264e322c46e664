/*!
Test Harness pour le firewall master

Assemble un master complet sur broker en mémoire (store, corrélateur rapide,
moniteur, moteur de réconciliation, services) et fournit les agents simulés.
*/

use crate::agent_sim::SimulatedAgent;
use crate::fixtures;
use anyhow::Result;
use firewall_master::config::{HeartbeatConf, ReconcileConf, RefreshConf};
use firewall_master::correlator::{Correlator, RetryPolicy, SharedCorrelator};
use firewall_master::events::RuleEvents;
use firewall_master::firewall::FirewallService;
use firewall_master::heartbeat::{DebounceStore, HeartbeatMonitor};
use firewall_master::models::PortUsageFact;
use firewall_master::protocol::channel;
use firewall_master::reconcile::ReconcileEngine;
use firewall_master::refresh::NodeRefresher;
use firewall_master::rules::RuleService;
use firewall_master::store::Store;
use firewall_master::transport::memory::MemoryBroker;
use firewall_master::transport::HashRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Master complet câblé sur un broker en mémoire
pub struct TestHarness {
    pub broker: MemoryBroker,
    pub store: Store,
    pub correlator: SharedCorrelator,
    pub events: RuleEvents,
    pub monitor: Arc<HeartbeatMonitor>,
    pub engine: Arc<ReconcileEngine>,
    pub refresher: NodeRefresher,
    pub rules: RuleService,
    pub firewall: FirewallService,
    heartbeat: HeartbeatConf,
    reconcile: ReconcileConf,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl TestHarness {
    /// Harness en mémoire ; retries courts pour des tests rapides
    pub fn new() -> Self {
        Self::with_store(Store::in_memory())
    }

    pub fn with_store(store: Store) -> Self {
        tracing_subscriber::fmt().with_test_writer().try_init().ok(); // Init logging pour tests

        let broker = MemoryBroker::new();
        let policy = RetryPolicy { max_attempts: 4, delay: Duration::from_millis(50) };
        let correlator = Arc::new(
            Correlator::new(Arc::new(broker.clone()), policy).with_call_timeout(Duration::from_secs(2)),
        );
        let events = RuleEvents::default();
        let heartbeat = HeartbeatConf::default();
        let reconcile = ReconcileConf::default();

        let monitor = Arc::new(HeartbeatMonitor::new(
            Arc::new(broker.clone()),
            store.nodes.clone(),
            DebounceStore::new(),
            heartbeat.clone(),
        ));
        let engine = Arc::new(ReconcileEngine::new(
            Arc::new(broker.clone()),
            correlator.clone(),
            store.clone(),
            reconcile.clone(),
        ));
        let refresh = RefreshConf { workers: 4, deadline_secs: 5 };
        let refresher = NodeRefresher::new(correlator.clone(), monitor.clone(), &refresh);
        let rules = RuleService::new(correlator.clone(), store.clone(), events.clone());
        let firewall = FirewallService::new(correlator.clone(), store.clone());

        Self {
            broker,
            store,
            correlator,
            events,
            monitor,
            engine,
            refresher,
            rules,
            firewall,
            heartbeat,
            reconcile,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Démarre un agent simulé qui sert tous les canaux du master
    pub async fn agent(&mut self, agent_id: &str) -> Result<SimulatedAgent> {
        let agent = SimulatedAgent::new(agent_id, self.broker.clone(), &self.heartbeat.registry_key);
        let channels = [channel::PORT_RULE, channel::PORT_INFO, channel::FIREWALL_STATUS, channel::HEARTBEAT];
        let handles = agent.spawn(&channels, self.cancel.clone()).await?;
        self.tasks.extend(handles);
        Ok(agent)
    }

    /// Branche l'écoute "jeu de règles modifié" du moteur
    pub fn start_rule_listener(&mut self) {
        let handle = ReconcileEngine::spawn_rule_listener(self.engine.clone(), &self.events, self.cancel.clone());
        self.tasks.push(handle);
    }

    /// Écrit un heartbeat daté de `age_secs` secondes avant l'heure serveur
    pub async fn write_heartbeat(&self, agent_id: &str, age_secs: i64, first: bool) -> Result<()> {
        let now = self.broker.server_time().await?;
        let record = fixtures::heartbeat_record(now - age_secs, first);
        self.broker.put(&self.heartbeat.registry_key, agent_id, &record.to_string()).await?;
        Ok(())
    }

    /// Publie le rapport d'usage courant d'un agent
    pub async fn publish_port_usage(&self, agent_id: &str, facts: &[PortUsageFact]) -> Result<()> {
        let now = self.broker.server_time().await?;
        let report = fixtures::port_usage_report(now, facts);
        self.broker.put(&self.reconcile.registry_key, agent_id, &report.to_string()).await?;
        Ok(())
    }

    /// Arrête agents simulés et tâches de fond
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            task.await.ok();
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
