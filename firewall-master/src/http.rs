/**
 * API REST FIREWALL MASTER - Serveur HTTP du master
 *
 * RÔLE :
 * Expose l'état de la flotte (nœuds, règles, statut pare-feu) et les actions
 * pilotées par un opérateur (refresh, CRUD de règles, start/stop, ping).
 *
 * FONCTIONNEMENT :
 * - Serveur Axum avec middleware auth API key
 * - Routes : /health, /system/health, /nodes, /reconcile, /port-rule(s), /firewall
 * - Les opérations agents renvoient `{ success, reason }`
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur toutes routes sauf /health
 * - Clé attendue dans FIREWALL_API_KEY ; absente => tout est refusé
 */

use crate::correlator::SharedCorrelator;
use crate::firewall::SharedFirewallService;
use crate::health::{HealthTracker, MasterHealth};
use crate::heartbeat::SharedHeartbeatMonitor;
use crate::models::{FirewallOperation, FirewallStatusInfo, NodeStatus, PingToggle, PortRule};
use crate::reconcile::{ReconcileOutcome, SharedReconcileEngine};
use crate::refresh::{RefreshOutcome, SharedNodeRefresher};
use crate::rules::{RuleOpOutcome, SharedRuleService};
use crate::store::{Store, Table};
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{error, warn};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeView {
    #[serde(flatten)]
    node: NodeStatus,
    last_seen: Option<String>, // format RFC3339 pour l'API
    consecutive_misses: u32,
}

fn to_view(node: NodeStatus, misses: u32) -> NodeView {
    let last_seen = node
        .last_heartbeat_at
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
        .and_then(|at| at.format(&Rfc3339).ok());
    NodeView { node, last_seen, consecutive_misses: misses }
}

/// Vrai si la requête peut passer : /health libre, sinon clé exacte exigée
fn api_key_allows(path: &str, provided: Option<&str>, expected: &str) -> bool {
    if path == "/health" {
        return true;
    }
    if expected.is_empty() {
        return false;
    }
    provided == Some(expected)
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    let expected = std::env::var("FIREWALL_API_KEY").unwrap_or_default();
    let provided = req.headers().get("x-api-key").and_then(|v| v.to_str().ok());
    if !api_key_allows(req.uri().path(), provided, &expected) {
        if expected.is_empty() {
            warn!("SECURITY: FIREWALL_API_KEY not set - API access denied");
        }
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub monitor: SharedHeartbeatMonitor,
    pub engine: SharedReconcileEngine,
    pub refresher: SharedNodeRefresher,
    pub rules: SharedRuleService,
    pub firewall: SharedFirewallService,
    pub correlator: SharedCorrelator,
    pub health_tracker: HealthTracker,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    #[serde(default)]
    node_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteRulesRequest {
    node_id: String,
    #[serde(default)]
    rule_ids: Vec<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationRequest {
    node_id: String,
    operation: FirewallOperation,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PingRequest {
    node_id: String,
    ping_status: PingToggle,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl ToString) -> ApiError {
    (status, Json(serde_json::json!({ "success": false, "reason": message.to_string() })))
}

fn op_response(outcome: RuleOpOutcome) -> (StatusCode, Json<RuleOpOutcome>) {
    let code = if outcome.success { StatusCode::OK } else { StatusCode::BAD_GATEWAY };
    (code, Json(outcome))
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/nodes", get(get_nodes))
        .route("/nodes/{id}", get(get_node))
        .route("/nodes/refresh", post(refresh_nodes))
        .route("/reconcile", post(run_reconcile))
        .route("/port-rules/{agent_id}", get(get_port_rules))
        .route("/port-rule", post(add_port_rule))
        .route("/port-rule/{id}", put(update_port_rule))
        .route("/port-rules/delete", post(delete_port_rules))
        .route("/firewall/status/{agent_id}", get(get_firewall_status))
        .route("/firewall/operation", post(operate_firewall))
        .route("/firewall/operation/ping", post(operate_ping))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

// GET /system/health (état du master)
async fn get_system_health(State(app): State<AppState>) -> Json<MasterHealth> {
    Json(app.health_tracker.get_health(
        app.store.nodes.as_ref(),
        app.monitor.debounce(),
        &app.engine,
        &app.correlator,
    ))
}

// GET /nodes (liste)
async fn get_nodes(State(app): State<AppState>) -> Result<Json<Vec<NodeView>>, ApiError> {
    let nodes = app.store.nodes.list().map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?;
    let debounce = app.monitor.debounce();
    let views = nodes
        .into_iter()
        .map(|n| {
            let misses = debounce.get(&n.agent_id).consecutive_misses;
            to_view(n, misses)
        })
        .collect();
    Ok(Json(views))
}

// GET /nodes/{id} (détail, par agent id)
async fn get_node(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<NodeView>, ApiError> {
    let node = app
        .store
        .nodes
        .find(&id)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("node {id} not found")))?;
    let misses = app.monitor.debounce().get(&id).consecutive_misses;
    Ok(Json(to_view(node, misses)))
}

// POST /nodes/refresh
async fn refresh_nodes(State(app): State<AppState>, Json(body): Json<RefreshRequest>) -> Json<RefreshOutcome> {
    Json(app.refresher.refresh(&body.node_ids).await)
}

// POST /reconcile (passe complète immédiate)
async fn run_reconcile(State(app): State<AppState>) -> Result<Json<ReconcileOutcome>, ApiError> {
    app.engine
        .reconcile()
        .await
        .map(Json)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
}

// GET /port-rules/{agent_id}
async fn get_port_rules(
    State(app): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<Vec<PortRule>>, ApiError> {
    app.rules.fetch_rules(&agent_id).await.map(Json).map_err(|e| {
        error!("[http] cannot fetch rules of {agent_id}: {e}");
        api_error(StatusCode::BAD_GATEWAY, e)
    })
}

// POST /port-rule
async fn add_port_rule(State(app): State<AppState>, Json(rule): Json<PortRule>) -> (StatusCode, Json<RuleOpOutcome>) {
    op_response(app.rules.add_rule(rule).await)
}

// PUT /port-rule/{id}
async fn update_port_rule(
    State(app): State<AppState>,
    Path(id): Path<u64>,
    Json(rule): Json<PortRule>,
) -> (StatusCode, Json<RuleOpOutcome>) {
    op_response(app.rules.update_rule(id, rule).await)
}

// POST /port-rules/delete
async fn delete_port_rules(
    State(app): State<AppState>,
    Json(body): Json<DeleteRulesRequest>,
) -> (StatusCode, Json<RuleOpOutcome>) {
    op_response(app.rules.delete_rules(&body.node_id, &body.rule_ids).await)
}

// GET /firewall/status/{agent_id}
async fn get_firewall_status(
    State(app): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<FirewallStatusInfo>, ApiError> {
    match app.firewall.status(&agent_id).await {
        Ok(Some(info)) => Ok(Json(info)),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, format!("{agent_id} reported no firewall"))),
        Err(e) => Err(api_error(StatusCode::BAD_GATEWAY, e)),
    }
}

// POST /firewall/operation
async fn operate_firewall(
    State(app): State<AppState>,
    Json(body): Json<OperationRequest>,
) -> (StatusCode, Json<RuleOpOutcome>) {
    op_response(app.firewall.operate(&body.node_id, body.operation).await)
}

// POST /firewall/operation/ping
async fn operate_ping(State(app): State<AppState>, Json(body): Json<PingRequest>) -> (StatusCode, Json<RuleOpOutcome>) {
    op_response(app.firewall.set_ping(&body.node_id, body.ping_status).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeartbeatConf, ReconcileConf, RefreshConf};
    use crate::correlator::{Correlator, RetryPolicy};
    use crate::events::RuleEvents;
    use crate::firewall::FirewallService;
    use crate::heartbeat::{DebounceState, DebounceStore, HeartbeatMonitor};
    use crate::models::HeartbeatRecord;
    use crate::reconcile::ReconcileEngine;
    use crate::refresh::NodeRefresher;
    use crate::rules::RuleService;
    use crate::test_support::ScriptedTransport;
    use crate::transport::memory::MemoryBroker;
    use std::sync::Arc;

    fn app() -> (Arc<ScriptedTransport>, AppState) {
        let transport = Arc::new(ScriptedTransport::new());
        let broker = MemoryBroker::new();
        let store = Store::in_memory();
        let correlator = Arc::new(Correlator::new(transport.clone(), RetryPolicy::default()));
        let monitor = Arc::new(HeartbeatMonitor::new(
            Arc::new(broker.clone()),
            store.nodes.clone(),
            DebounceStore::new(),
            HeartbeatConf::default(),
        ));
        let engine = Arc::new(ReconcileEngine::new(
            Arc::new(broker),
            correlator.clone(),
            store.clone(),
            ReconcileConf::default(),
        ));
        let state = AppState {
            store: store.clone(),
            monitor: monitor.clone(),
            engine,
            refresher: Arc::new(NodeRefresher::new(correlator.clone(), monitor, &RefreshConf::default())),
            rules: Arc::new(RuleService::new(correlator.clone(), store.clone(), RuleEvents::default())),
            firewall: Arc::new(FirewallService::new(correlator.clone(), store)),
            correlator,
            health_tracker: HealthTracker::new(),
        };
        (transport, state)
    }

    #[test]
    fn test_api_key_rules() {
        assert!(api_key_allows("/health", None, ""));
        assert!(!api_key_allows("/nodes", Some("k"), ""));
        assert!(!api_key_allows("/nodes", None, "secret"));
        assert!(!api_key_allows("/nodes", Some("wrong"), "secret"));
        assert!(api_key_allows("/nodes", Some("secret"), "secret"));
        assert!(!api_key_allows("/healthz", None, "secret"));
    }

    #[tokio::test]
    async fn test_node_views_carry_misses_and_rfc3339() {
        let (_, app) = app();
        let hb: HeartbeatRecord =
            serde_json::from_str(r#"{"heartbeatTimestamp":1700000000,"hostName":"web-1"}"#).unwrap();
        let mut node = NodeStatus::from_first_report("n1", &hb);
        node.last_heartbeat_at = Some(1_700_000_000);
        app.store.nodes.upsert_by_key(vec![node]).unwrap();
        app.monitor.debounce().set("n1", DebounceState { consecutive_misses: 2, observed_online: Some(true) });

        let Json(views) = get_nodes(State(app.clone())).await.unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].consecutive_misses, 2);
        assert_eq!(views[0].last_seen.as_deref(), Some("2023-11-14T22:13:20Z"));

        let missing = get_node(State(app), Path("nope".into())).await;
        assert_eq!(missing.err().unwrap().0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_refresh_with_no_nodes_is_success() {
        let (transport, app) = app();
        let Json(outcome) = refresh_nodes(State(app), Json(RefreshRequest { node_ids: vec![] })).await;
        assert!(outcome.is_success());
        assert!(transport.appended.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_rule_operation_maps_to_bad_gateway() {
        let (_, app) = app();
        let body = DeleteRulesRequest { node_id: "n1".into(), rule_ids: vec![1] };
        let (code, Json(outcome)) = delete_port_rules(State(app), Json(body)).await;
        assert_eq!(code, StatusCode::BAD_GATEWAY);
        assert!(!outcome.success);
    }

    #[test]
    fn test_request_bodies_use_camel_case() {
        let ping: PingRequest = serde_json::from_str(r#"{"nodeId":"n1","pingStatus":"Disable"}"#).unwrap();
        assert_eq!(ping.ping_status, PingToggle::Disable);
        let op: OperationRequest = serde_json::from_str(r#"{"nodeId":"n1","operation":"restart"}"#).unwrap();
        assert_eq!(op.operation, FirewallOperation::Restart);
        assert!(serde_json::from_str::<OperationRequest>(r#"{"nodeId":"n1","operation":"reboot"}"#).is_err());
    }
}
