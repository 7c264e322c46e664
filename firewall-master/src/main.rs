/**
 * FIREWALL MASTER - Point d'entrée principal du serveur
 *
 * RÔLE : Orchestration de tous les modules : config, store, transport, moniteur
 * de heartbeats, réconciliation, services agents, HTTP.
 *
 * ARCHITECTURE : Streams corrélés vers les agents + passes périodiques + API REST.
 *
 * LIMITE : le seul transport livré est le `MemoryBroker` en process. Ce binaire
 * ne joint donc aucun agent réel ; brancher une flotte demande une
 * implémentation de `StreamTransport` + `HashRegistry` sur un serveur de streams.
 */

use anyhow::Context;
use firewall_master::config::load_config;
use firewall_master::correlator::Correlator;
use firewall_master::events::RuleEvents;
use firewall_master::firewall::FirewallService;
use firewall_master::health::HealthTracker;
use firewall_master::heartbeat::{DebounceStore, HeartbeatMonitor};
use firewall_master::http::{self, AppState};
use firewall_master::reconcile::ReconcileEngine;
use firewall_master::refresh::NodeRefresher;
use firewall_master::rules::RuleService;
use firewall_master::scheduler::Scheduler;
use firewall_master::store::Store;
use firewall_master::transport::memory::MemoryBroker;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("firewall_master=info")))
        .init();

    let cfg = load_config().await;

    // tables persistées
    let store = Store::open(&cfg.data_dir)
        .with_context(|| format!("failed to open data dir {}", cfg.data_dir.display()))?;

    // broker en process : streams agents + registres heartbeats/ports (aucun agent externe)
    let broker = MemoryBroker::new();
    let transport = Arc::new(broker.clone());
    let registry = Arc::new(broker);

    let correlator = Arc::new(Correlator::from_config(transport, &cfg.correlator));
    let events = RuleEvents::default();

    let monitor = Arc::new(HeartbeatMonitor::new(
        registry.clone(),
        store.nodes.clone(),
        DebounceStore::new(),
        cfg.heartbeat.clone(),
    ));
    let engine = Arc::new(ReconcileEngine::new(
        registry,
        correlator.clone(),
        store.clone(),
        cfg.reconcile.clone(),
    ));
    let refresher = Arc::new(NodeRefresher::new(correlator.clone(), monitor.clone(), &cfg.refresh));
    let rules = Arc::new(RuleService::new(correlator.clone(), store.clone(), events.clone()));
    let firewall = Arc::new(FirewallService::new(correlator.clone(), store.clone()));

    // passes périodiques + écoute des changements de règles
    let cancel = CancellationToken::new();
    let listener_task = ReconcileEngine::spawn_rule_listener(engine.clone(), &events, cancel.clone());
    let scheduler = Scheduler::start(
        monitor.clone(),
        engine.clone(),
        cfg.heartbeat.interval(),
        cfg.reconcile.interval(),
        cancel.clone(),
    );

    // fabrique l'état unique pour Axum
    let app_state = AppState {
        store,
        monitor,
        engine,
        refresher,
        rules,
        firewall,
        correlator,
        health_tracker: HealthTracker::new(),
    };
    let app = http::build_router(app_state);

    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("cannot bind {}", cfg.http.bind))?;
    info!("[master] listening on http://{}", cfg.http.bind);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    info!("[master] shutting down");
    scheduler.shutdown().await;
    listener_task.await.ok();
    Ok(())
}
