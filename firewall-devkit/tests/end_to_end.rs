use firewall_devkit::fixtures::{agent_rule_list, port_rule, usage_fact};
use firewall_devkit::{Reaction, TestHarness};
use firewall_master::models::{PortRule, PortUsageFact, RuleUsageLink};
use firewall_master::protocol::{channel, OperationType};
use firewall_master::reconcile::ReconcileOutcome;
use firewall_master::store::{Store, Table};
use std::time::Duration;

fn rule_on(h: &TestHarness, agent: &str, port: &str) -> PortRule {
    h.store
        .rules
        .list()
        .unwrap()
        .into_iter()
        .find(|r| r.agent_id() == agent && r.port == port)
        .unwrap()
}

async fn wait_for_links(h: &TestHarness, expected: usize) -> Vec<RuleUsageLink> {
    for _ in 0..100 {
        let links = h.store.links.list().unwrap();
        if links.len() == expected {
            return links;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    h.store.links.list().unwrap()
}

#[tokio::test]
async fn test_refresh_reports_only_the_silent_node() {
    let mut h = TestHarness::new();
    let n1 = h.agent("n1").await.unwrap();
    let n2 = h.agent("n2").await.unwrap();
    n2.react(channel::HEARTBEAT, Reaction::Silent);

    let outcome = h.refresher.refresh(&["n1".to_string(), "n2".to_string()]).await;

    assert_eq!(outcome.requested, 2);
    assert_eq!(outcome.failed, vec!["n2".to_string()]);
    assert_eq!(h.monitor.completed_passes(), 1);
    let sent = n1.received_on(channel::HEARTBEAT);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].command.data_op_type, OperationType::Options);
    // une seule publication, les retries ne font que relire la réponse
    assert_eq!(n2.received_on(channel::HEARTBEAT).len(), 1);
    // le heartbeat réécrit par n1 est vu par la passe de fin de refresh
    let node = h.store.nodes.find(&"n1".to_string()).unwrap().unwrap();
    assert!(node.is_active);
    h.shutdown().await;
}

#[tokio::test]
async fn test_periodic_reconcile_links_and_prunes_usage() {
    let h = TestHarness::new();
    h.store.rules.upsert_by_key(vec![port_rule("n1", "8000-8002", "tcp")]).unwrap();

    let facts = vec![usage_fact("n1", "tcp", 8000, "api"), usage_fact("n1", "tcp", 8005, "metrics")];
    h.publish_port_usage("n1", &facts).await.unwrap();
    let outcome = h.engine.reconcile().await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Applied { facts: 2, uncovered: 1, .. }));
    assert!(rule_on(&h, "n1", "8000-8002").using);
    assert_eq!(h.store.links.list().unwrap().len(), 1);

    // même snapshot : rien à faire
    assert_eq!(h.engine.reconcile().await.unwrap(), ReconcileOutcome::Unchanged);

    h.publish_port_usage("n1", &facts[..1]).await.unwrap();
    let outcome = h.engine.reconcile().await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Applied { pruned: 1, .. }));
    let stored: Vec<PortUsageFact> = h.store.usage.list().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].port_number, 8000);

    h.publish_port_usage("n1", &[]).await.unwrap();
    h.engine.reconcile().await.unwrap();
    assert!(!rule_on(&h, "n1", "8000-8002").using);
    assert!(h.store.links.list().unwrap().is_empty());
    assert!(h.engine.last_run().unwrap().ok);
    h.shutdown().await;
}

#[tokio::test]
async fn test_added_rule_is_linked_by_the_rule_listener() {
    let mut h = TestHarness::new();
    h.start_rule_listener();
    let n1 = h.agent("n1").await.unwrap();
    let report = serde_json::to_string(&[usage_fact("n1", "tcp", 443, "nginx")]).unwrap();
    n1.react(channel::PORT_INFO, Reaction::Reply(report));

    let outcome = h.rules.add_rule(port_rule("n1", "80,443", "tcp")).await;
    assert!(outcome.success, "{:?}", outcome.reason);

    let links = wait_for_links(&h, 1).await;
    assert_eq!(links.len(), 1);
    let rule = rule_on(&h, "n1", "80,443");
    assert_eq!(Some(links[0].rule_id), rule.id);
    assert!(rule.using);

    let inserts = n1.received_on(channel::PORT_RULE);
    assert_eq!(inserts.len(), 1);
    assert_eq!(inserts[0].command.data_op_type, OperationType::Insert);
    let queries = n1.received_on(channel::PORT_INFO);
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].command.request_params.get("portType").map(String::as_str), Some("RANGE_PORT_COMMA"));
    h.shutdown().await;
}

#[tokio::test]
async fn test_rejected_rule_is_not_stored() {
    let mut h = TestHarness::new();
    let n1 = h.agent("n1").await.unwrap();
    n1.react(channel::PORT_RULE, Reaction::Fail { status: "500".into(), message: "zone locked".into() });

    let outcome = h.rules.add_rule(port_rule("n1", "22", "tcp")).await;

    assert!(!outcome.success);
    assert!(outcome.reason.unwrap_or_default().contains("zone locked"));
    assert!(h.store.rules.list().unwrap().is_empty());
    h.shutdown().await;
}

#[tokio::test]
async fn test_fetch_rules_imports_agent_rules() {
    let mut h = TestHarness::new();
    let n1 = h.agent("n1").await.unwrap();
    let rules = vec![port_rule("n1", "22", "tcp"), port_rule("n1", "53", "udp")];
    n1.react(channel::PORT_RULE, Reaction::Reply(agent_rule_list(&rules)));

    let stored = h.rules.fetch_rules("n1").await.unwrap();

    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|r| r.id.is_some()));
    // second appel servi par la base, sans requête agent
    assert_eq!(h.rules.fetch_rules("n1").await.unwrap().len(), 2);
    assert_eq!(n1.received_on(channel::PORT_RULE).len(), 1);
    h.shutdown().await;
}

#[tokio::test]
async fn test_node_goes_offline_after_three_missed_passes() {
    let h = TestHarness::new();
    h.broker.set_server_time(Some(1_700_000_000));
    h.write_heartbeat("n1", 0, true).await.unwrap();
    h.monitor.check_now().await.unwrap();
    assert!(h.store.nodes.find(&"n1".to_string()).unwrap().unwrap().is_active);

    h.broker.set_server_time(Some(1_700_000_100));
    for _ in 0..2 {
        let pass = h.monitor.check_now().await.unwrap();
        assert!(pass.went_offline.is_empty());
    }
    let pass = h.monitor.check_now().await.unwrap();
    assert_eq!(pass.went_offline, vec!["n1".to_string()]);
    assert!(!h.store.nodes.find(&"n1".to_string()).unwrap().unwrap().is_active);

    h.write_heartbeat("n1", 1, false).await.unwrap();
    let pass = h.monitor.check_now().await.unwrap();
    assert_eq!(pass.went_online, vec!["n1".to_string()]);
    h.shutdown().await;
}

#[tokio::test]
async fn test_links_survive_a_store_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let h = TestHarness::with_store(Store::open(dir.path()).unwrap());
        h.store.rules.upsert_by_key(vec![port_rule("n1", "22", "tcp")]).unwrap();
        h.publish_port_usage("n1", &[usage_fact("n1", "tcp", 22, "sshd")]).await.unwrap();
        h.engine.reconcile().await.unwrap();
        h.shutdown().await;
    }

    let store = Store::open(dir.path()).unwrap();
    assert_eq!(store.links.list().unwrap().len(), 1);
    assert!(store.rules.list().unwrap()[0].using);
}
