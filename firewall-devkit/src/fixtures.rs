/*!
Builders de données conformes au format des agents

Enregistrements heartbeat, rapports d'usage de ports, règles et faits,
tels qu'un agent les écrit dans les registres ou les renvoie en réponse.
*/

use firewall_master::models::{PortRule, PortUsageFact, RuleBase};
use serde_json::{json, Value};

/// Enregistrement heartbeat (champs camelCase, horodatage en secondes)
pub fn heartbeat_record(ts: i64, first: bool) -> Value {
    json!({
        "heartbeatTimestamp": ts,
        "isFirstHeartbeat": first,
        "isActive": true,
        "hostName": "sim-host",
        "osName": "Linux",
        "ip": "10.0.0.10",
        "cpuUsage": "3.5%",
        "memoryUsage": 41.0,
        "diskUsage": 12,
        "clientVersion": "sim-1.0"
    })
}

/// Rapport d'usage publié dans `firewall:portInfo`
pub fn port_usage_report(ts: i64, facts: &[PortUsageFact]) -> Value {
    json!({ "ts": ts.to_string(), "reportPortInfos": facts })
}

pub fn usage_fact(agent_id: &str, protocol: &str, port: u16, process: &str) -> PortUsageFact {
    PortUsageFact {
        id: None,
        agent_id: agent_id.to_string(),
        protocol: protocol.to_string(),
        port_number: port,
        process_name: Some(process.to_string()),
        process_id: Some(4000 + i64::from(port)),
        command_line: Some(format!("/usr/sbin/{process}")),
        listen_address: Some("0.0.0.0".into()),
    }
}

pub fn port_rule(agent_id: &str, port: &str, protocol: &str) -> PortRule {
    PortRule {
        id: None,
        base: RuleBase { agent_id: agent_id.to_string(), zone: "public".into(), permanent: true },
        family: "ipv4".into(),
        port: port.to_string(),
        protocol: protocol.to_string(),
        policy: true,
        source_rule: None,
        using: false,
        descriptor: None,
    }
}

/// Liste de règles au format agent (`type` discriminant), pour répondre à une QUERY
pub fn agent_rule_list(rules: &[PortRule]) -> String {
    let tagged: Vec<Value> = rules
        .iter()
        .map(|rule| {
            let mut value = serde_json::to_value(rule).unwrap_or(Value::Null);
            if let Value::Object(map) = &mut value {
                map.insert("type".into(), Value::String("PORT".into()));
            }
            value
        })
        .collect();
    Value::Array(tagged).to_string()
}
