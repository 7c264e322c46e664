/**
 * MODÈLES - Données persistées et rapportées par les agents
 *
 * RÔLE : Heartbeats (registre éphémère), statut des nœuds, règles de ports,
 * faits d'usage de ports, liens règle <-> fait, statut pare-feu.
 *
 * FORMAT : JSON camelCase, comme les agents l'écrivent dans les registres et
 * le renvoient dans les payloads `data` des réponses.
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Désérialisation tolérante : les agents écrivent indifféremment nombres ou chaînes
pub(crate) mod lenient {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrText {
        Int(i64),
        Float(f64),
        Text(String),
        Bool(bool),
    }

    pub fn i64_value<'de, D: Deserializer<'de>>(de: D) -> Result<i64, D::Error> {
        match NumOrText::deserialize(de)? {
            NumOrText::Int(v) => Ok(v),
            NumOrText::Float(v) => Ok(v as i64),
            NumOrText::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
            NumOrText::Bool(_) => Err(serde::de::Error::custom("expected a number")),
        }
    }

    pub fn opt_i64<'de, D: Deserializer<'de>>(de: D) -> Result<Option<i64>, D::Error> {
        Ok(match Option::<NumOrText>::deserialize(de)? {
            Some(NumOrText::Int(v)) => Some(v),
            Some(NumOrText::Float(v)) => Some(v as i64),
            Some(NumOrText::Text(s)) => s.trim().parse().ok(),
            _ => None,
        })
    }

    pub fn opt_f64<'de, D: Deserializer<'de>>(de: D) -> Result<Option<f64>, D::Error> {
        Ok(match Option::<NumOrText>::deserialize(de)? {
            Some(NumOrText::Int(v)) => Some(v as f64),
            Some(NumOrText::Float(v)) => Some(v),
            Some(NumOrText::Text(s)) => s.trim().trim_end_matches('%').parse().ok(),
            _ => None,
        })
    }

    pub fn bool_value<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
        Ok(match Option::<NumOrText>::deserialize(de)? {
            Some(NumOrText::Bool(b)) => b,
            Some(NumOrText::Text(s)) => s.trim().eq_ignore_ascii_case("true"),
            Some(NumOrText::Int(v)) => v != 0,
            _ => false,
        })
    }
}

// ---------------------------------------------------------------------------
// Heartbeats & nœuds
// ---------------------------------------------------------------------------

/// Enregistrement courant d'un agent dans le registre de heartbeats (écrasé à chaque cycle)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRecord {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(deserialize_with = "lenient::i64_value")]
    pub heartbeat_timestamp: i64, // epoch secondes
    #[serde(default, deserialize_with = "lenient::bool_value")]
    pub is_first_heartbeat: bool,
    #[serde(default, deserialize_with = "lenient::bool_value")]
    pub is_active: bool,
    #[serde(default)]
    pub os_name: Option<String>,
    #[serde(default)]
    pub host_name: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub cpu_usage: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub memory_usage: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub disk_usage: Option<f64>,
    #[serde(default)]
    pub client_version: Option<String>,
}

/// Statut persisté d'un nœud, modifié uniquement sur les fronts de transition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    #[serde(default)]
    pub id: Option<u64>,
    pub agent_id: String,
    pub is_active: bool,
    #[serde(default)]
    pub last_heartbeat_at: Option<i64>,
    #[serde(default)]
    pub host_name: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub os_name: Option<String>,
    #[serde(default)]
    pub cpu_usage: Option<f64>,
    #[serde(default)]
    pub memory_usage: Option<f64>,
    #[serde(default)]
    pub disk_usage: Option<f64>,
    #[serde(default)]
    pub client_version: Option<String>,
}

impl NodeStatus {
    /// Nœud nouvellement connu, construit depuis son premier heartbeat
    pub fn from_first_report(agent_id: &str, hb: &HeartbeatRecord) -> Self {
        Self {
            id: None,
            agent_id: agent_id.to_string(),
            is_active: true,
            last_heartbeat_at: Some(hb.heartbeat_timestamp),
            host_name: hb.host_name.clone(),
            ip: hb.ip.clone(),
            os_name: hb.os_name.clone(),
            cpu_usage: hb.cpu_usage,
            memory_usage: hb.memory_usage,
            disk_usage: hb.disk_usage,
            client_version: hb.client_version.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Règles de pare-feu
// ---------------------------------------------------------------------------

/// Champs communs à toutes les formes de règles
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuleBase {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default = "default_zone")]
    pub zone: String,
    #[serde(default)]
    pub permanent: bool,
}

fn default_zone() -> String {
    "public".into()
}

/// Règle par source (IP ou CIDR)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceRule {
    #[serde(flatten)]
    pub base: RuleBase,
    pub source: String,
}

/// Règle de port déclarative : port unique, liste "22,80" ou plage "1000-2000"
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortRule {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(flatten)]
    pub base: RuleBase,
    #[serde(default = "default_family")]
    pub family: String, // ipv4 | ipv6
    pub port: String,
    pub protocol: String, // tcp | udp | "tcp/udp"
    #[serde(default = "default_policy")]
    pub policy: bool, // true = accept, false = drop
    #[serde(default)]
    pub source_rule: Option<SourceRule>,
    /// Dérivé : au moins un fait d'usage lié
    #[serde(default)]
    pub using: bool,
    #[serde(default)]
    pub descriptor: Option<String>,
}

fn default_family() -> String {
    "ipv4".into()
}

fn default_policy() -> bool {
    true
}

impl PortRule {
    pub fn agent_id(&self) -> &str {
        &self.base.agent_id
    }

    pub fn source(&self) -> Option<&str> {
        self.source_rule.as_ref().map(|s| s.source.as_str())
    }
}

/// Forme de règle telle qu'échangée avec les agents, discriminée par `type`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FirewallRule {
    Port(PortRule),
    Source(SourceRule),
    /// Service, forward, masquerade, rich rule... non gérés par le master
    #[serde(other)]
    Other,
}

impl FirewallRule {
    pub fn into_port_rule(self) -> Option<PortRule> {
        match self {
            FirewallRule::Port(rule) => Some(rule),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Usage des ports
// ---------------------------------------------------------------------------

/// Port réellement en écoute sur un agent (toujours un seul port)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortUsageFact {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub agent_id: String,
    pub protocol: String,
    pub port_number: u16,
    #[serde(default)]
    pub process_name: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub process_id: Option<i64>,
    #[serde(default)]
    pub command_line: Option<String>,
    #[serde(default)]
    pub listen_address: Option<String>,
}

/// Clé naturelle d'un fait : (agent, protocole, port)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FactKey {
    pub agent_id: String,
    pub protocol: String,
    pub port: u16,
}

impl PortUsageFact {
    pub fn fact_key(&self) -> FactKey {
        FactKey {
            agent_id: self.agent_id.clone(),
            protocol: self.protocol.to_ascii_lowercase(),
            port: self.port_number,
        }
    }

    /// Clé de contenu servant à la détection de changement entre deux snapshots
    pub fn content_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.agent_id,
            self.protocol.to_ascii_lowercase(),
            self.port_number,
            self.process_name.as_deref().unwrap_or(""),
            self.process_id.map(|p| p.to_string()).unwrap_or_default(),
            self.command_line.as_deref().unwrap_or(""),
            self.listen_address.as_deref().unwrap_or(""),
        )
    }
}

/// Rapport d'usage publié par un agent dans le registre `firewall:portInfo`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortUsageReport {
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub ts: Option<i64>,
    #[serde(default)]
    pub report_port_infos: Vec<PortUsageFact>,
}

/// Association règle <-> fait, recalculée à chaque passe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RuleUsageLink {
    #[serde(default)]
    pub id: Option<u64>,
    pub rule_id: u64,
    pub fact_id: u64,
}

// ---------------------------------------------------------------------------
// Statut du pare-feu
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FirewallType {
    #[serde(alias = "ufw")]
    Ufw,
    #[serde(alias = "firewalld")]
    Firewalld,
    #[serde(alias = "none")]
    None,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FirewallState {
    Active,
    Inactive,
    NotInstalled,
    Unknown,
}

impl FirewallState {
    /// Décodage tolérant : "active"/"enabled", "inactive"/"disabled", "not installed"
    pub fn from_text(text: &str) -> Self {
        match text.trim().to_ascii_lowercase().replace('_', " ").as_str() {
            "active" | "enabled" => FirewallState::Active,
            "inactive" | "disabled" => FirewallState::Inactive,
            "not installed" => FirewallState::NotInstalled,
            _ => FirewallState::Unknown,
        }
    }
}

impl<'de> Deserialize<'de> for FirewallState {
    fn deserialize<D: serde::Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let text = Option::<String>::deserialize(de)?;
        Ok(text.map(|t| FirewallState::from_text(&t)).unwrap_or(FirewallState::Unknown))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PingStatus {
    #[default]
    StatusNone,
    StatusEnable,
    StatusDisable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FirewallStatusInfo {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub agent_id: String,
    pub firewall_type: FirewallType,
    pub status: FirewallState,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub ping_disabled: PingStatus,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub timestamp: Option<i64>,
}

/// Opérations de cycle de vie du pare-feu d'un agent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FirewallOperation {
    Start,
    Stop,
    Restart,
}

impl fmt::Display for FirewallOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FirewallOperation::Start => "start",
            FirewallOperation::Stop => "stop",
            FirewallOperation::Restart => "restart",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PingToggle {
    Enable,
    Disable,
}

impl PingToggle {
    /// Commande agent : autoriser le ping = débloquer
    pub fn operation(self) -> &'static str {
        match self {
            PingToggle::Enable => "unblockping",
            PingToggle::Disable => "blockping",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_accepts_string_numbers() {
        let raw = r#"{"heartbeatTimestamp":"1700000000","isFirstHeartbeat":"true",
            "cpuUsage":"12.5","memoryUsage":40,"hostName":"web-1"}"#;
        let hb: HeartbeatRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(hb.heartbeat_timestamp, 1_700_000_000);
        assert!(hb.is_first_heartbeat);
        assert_eq!(hb.cpu_usage, Some(12.5));
        assert_eq!(hb.memory_usage, Some(40.0));
        assert_eq!(hb.host_name.as_deref(), Some("web-1"));
    }

    #[test]
    fn test_heartbeat_without_timestamp_is_rejected() {
        assert!(serde_json::from_str::<HeartbeatRecord>(r#"{"hostName":"x"}"#).is_err());
        assert!(serde_json::from_str::<HeartbeatRecord>(r#"{"heartbeatTimestamp":"soon"}"#).is_err());
    }

    #[test]
    fn test_firewall_rule_tagged_by_type() {
        let raw = r#"{"type":"PORT","agentId":"n1","zone":"public","permanent":true,
            "port":"8000-8002","protocol":"tcp","policy":true}"#;
        let rule: FirewallRule = serde_json::from_str(raw).unwrap();
        let port_rule = rule.into_port_rule().unwrap();
        assert_eq!(port_rule.agent_id(), "n1");
        assert_eq!(port_rule.family, "ipv4");
        assert!(!port_rule.using);

        let other: FirewallRule = serde_json::from_str(r#"{"type":"MASQUERADE"}"#).unwrap();
        assert_eq!(other, FirewallRule::Other);
    }

    #[test]
    fn test_fact_keys() {
        let fact = PortUsageFact {
            id: None,
            agent_id: "n1".into(),
            protocol: "TCP".into(),
            port_number: 22,
            process_name: Some("sshd".into()),
            process_id: Some(811),
            command_line: None,
            listen_address: Some("0.0.0.0".into()),
        };
        assert_eq!(fact.fact_key().protocol, "tcp");
        assert_eq!(fact.content_key(), "n1|tcp|22|sshd|811||0.0.0.0");
    }

    #[test]
    fn test_firewall_state_text_decoding() {
        assert_eq!(FirewallState::from_text("Enabled"), FirewallState::Active);
        assert_eq!(FirewallState::from_text("disabled "), FirewallState::Inactive);
        assert_eq!(FirewallState::from_text("NOT_INSTALLED"), FirewallState::NotInstalled);
        assert_eq!(FirewallState::from_text("??"), FirewallState::Unknown);
        assert_eq!(PingToggle::Disable.operation(), "blockping");
    }
}
