/**
 * PROTOCOLE AGENTS - Enveloppes de commande/réponse et nommage des streams
 *
 * RÔLE :
 * Format d'échange entre le master et les agents sur les streams `pub:` / `sub:`.
 *
 * FONCTIONNEMENT :
 * - Une commande = une entrée de stream, map plate de champs texte (clés snake_case),
 *   les champs complexes (request_params, primary_key_columns, data, old) encodés en JSON
 * - La même enveloppe se sérialise aussi en objet JSON unique
 * - La réponse est lue à l'id de transport de la commande : {status, message, data}
 * - Tags inconnus (composant, opération) décodés en `Unknown`, insensible à la casse
 */

use crate::transport::Fields;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;

/// Composant ciblé sur l'agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ComponentType {
    Firewall,
    Port,
    Unknown,
}

/// Opération demandée à l'agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    Query,
    Insert,
    Update,
    Delete,
    Options,
    Unknown,
}

impl ComponentType {
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_uppercase().as_str() {
            "FIREWALL" => ComponentType::Firewall,
            "PORT" => ComponentType::Port,
            _ => ComponentType::Unknown,
        }
    }

    pub fn as_tag(self) -> &'static str {
        match self {
            ComponentType::Firewall => "FIREWALL",
            ComponentType::Port => "PORT",
            ComponentType::Unknown => "UNKNOWN",
        }
    }
}

impl OperationType {
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_uppercase().as_str() {
            "QUERY" => OperationType::Query,
            "INSERT" => OperationType::Insert,
            "UPDATE" => OperationType::Update,
            "DELETE" => OperationType::Delete,
            "OPTIONS" => OperationType::Options,
            _ => OperationType::Unknown,
        }
    }

    pub fn as_tag(self) -> &'static str {
        match self {
            OperationType::Query => "QUERY",
            OperationType::Insert => "INSERT",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
            OperationType::Options => "OPTIONS",
            OperationType::Unknown => "UNKNOWN",
        }
    }
}

impl<'de> Deserialize<'de> for ComponentType {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let tag = Option::<String>::deserialize(de)?;
        Ok(tag.map(|t| ComponentType::from_tag(&t)).unwrap_or(ComponentType::Unknown))
    }
}

impl<'de> Deserialize<'de> for OperationType {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let tag = Option::<String>::deserialize(de)?;
        Ok(tag.map(|t| OperationType::from_tag(&t)).unwrap_or(OperationType::Unknown))
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Champs encodés en JSON quand l'enveloppe est aplatie en entrée de stream
const JSON_FIELDS: [&str; 4] = ["request_params", "primary_key_columns", "data", "old"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandEnvelope {
    pub agent_id: String,
    pub agent_component_type: ComponentType,
    pub data_op_type: OperationType,
    #[serde(default)]
    pub request_params: BTreeMap<String, String>,
    pub ts: i64,
    #[serde(default)]
    pub primary_key_columns: Vec<String>,
    #[serde(default)]
    pub data: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl CommandEnvelope {
    pub fn new(agent_id: &str, component: ComponentType, op: OperationType) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            agent_component_type: component,
            data_op_type: op,
            request_params: BTreeMap::new(),
            ts: OffsetDateTime::now_utc().unix_timestamp(),
            primary_key_columns: Vec::new(),
            data: Vec::new(),
            old: None,
            correlation_id: None,
        }
    }

    pub fn param(mut self, key: &str, value: impl Into<String>) -> Self {
        self.request_params.insert(key.to_string(), value.into());
        self
    }

    pub fn primary_keys(mut self, columns: &[&str]) -> Self {
        self.primary_key_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_data<T: Serialize>(mut self, records: &[T]) -> Result<Self, serde_json::Error> {
        self.data = records.iter().map(serde_json::to_value).collect::<Result<_, _>>()?;
        Ok(self)
    }

    pub fn with_old<T: Serialize>(mut self, old: &T) -> Result<Self, serde_json::Error> {
        self.old = Some(serde_json::to_value(old)?);
        Ok(self)
    }

    /// Aplatit l'enveloppe en map de champs texte pour une entrée de stream
    pub fn to_fields(&self) -> Result<Fields, serde_json::Error> {
        let Value::Object(map) = serde_json::to_value(self)? else {
            return Ok(Fields::new());
        };
        let mut fields = Fields::new();
        for (key, value) in map {
            let text = match value {
                Value::String(s) if !JSON_FIELDS.contains(&key.as_str()) => s,
                other => other.to_string(),
            };
            fields.insert(key, text);
        }
        Ok(fields)
    }

    /// Reconstruit une enveloppe depuis une entrée de stream
    pub fn from_fields(fields: &Fields) -> Result<Self, serde_json::Error> {
        let mut map = serde_json::Map::new();
        for (key, text) in fields {
            let value = if JSON_FIELDS.contains(&key.as_str()) || key == "ts" {
                serde_json::from_str(text)?
            } else {
                Value::String(text.clone())
            };
            map.insert(key.clone(), value);
        }
        serde_json::from_value(Value::Object(map))
    }
}

/// Réponse d'un agent ; `data` est un scalaire ou une liste encodé(e) en texte
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseEnvelope {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

pub const STATUS_OK: &str = "200";

impl ResponseEnvelope {
    pub fn ok(data: impl Into<String>) -> Self {
        Self {
            status: STATUS_OK.into(),
            message: "success".into(),
            data: data.into(),
            correlation_id: None,
            timestamp: Some(OffsetDateTime::now_utc().unix_timestamp()),
        }
    }

    pub fn error(status: &str, message: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            message: message.into(),
            data: String::new(),
            correlation_id: None,
            timestamp: Some(OffsetDateTime::now_utc().unix_timestamp()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Décode `data` comme liste d'enregistrements ; un payload vide donne une liste vide
    pub fn data_list<T: DeserializeOwned>(&self) -> Result<Vec<T>, serde_json::Error> {
        if self.data.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&self.data)
    }

    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("status".into(), self.status.clone());
        fields.insert("message".into(), self.message.clone());
        fields.insert("data".into(), self.data.clone());
        if let Some(cid) = &self.correlation_id {
            fields.insert("correlation_id".into(), cid.clone());
        }
        if let Some(ts) = self.timestamp {
            fields.insert("timestamp".into(), ts.to_string());
        }
        fields
    }

    pub fn from_fields(fields: &Fields) -> Option<Self> {
        Some(Self {
            status: fields.get("status")?.clone(),
            message: fields.get("message").cloned().unwrap_or_default(),
            data: fields.get("data").cloned().unwrap_or_default(),
            correlation_id: fields.get("correlation_id").cloned(),
            timestamp: fields.get("timestamp").and_then(|t| t.parse().ok()),
        })
    }
}

// Nommage des streams par agent et par canal

pub fn inbound_stream(agent_id: &str, channel: &str) -> String {
    if channel.is_empty() {
        format!("pub:{agent_id}")
    } else {
        format!("pub:{agent_id}:{channel}")
    }
}

pub fn outbound_stream(agent_id: &str, channel: &str) -> String {
    if channel.is_empty() {
        format!("sub:{agent_id}")
    } else {
        format!("sub:{agent_id}:{channel}")
    }
}

pub fn consumer_group(agent_id: &str) -> String {
    format!("firewall_pub:{agent_id}_group")
}

pub fn consumer_name(group: &str) -> String {
    format!("{group}_consumer")
}

/// Canaux utilisés par les services du master
pub mod channel {
    pub const PORT_RULE: &str = "portRule";
    pub const PORT_INFO: &str = "portInfo";
    pub const FIREWALL_STATUS: &str = "firewallStatusInfo";
    pub const HEARTBEAT: &str = "heartbeat";
}
