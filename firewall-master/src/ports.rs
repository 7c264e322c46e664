//! Spécifications de ports des règles : parsing, expansion, correspondance.
//!
//! Le port d'une règle est du texte saisi par un humain : `"80"`, `"1000-2000"`
//! ou `"22,80,8000-8010"`. Protocoles : `tcp`, `udp` ou `tcp/udp`.

use crate::error::PortSpecError;
use crate::models::PortRule;
use std::collections::BTreeSet;
use std::fmt;

/// Élément d'une spec : port unique ou plage inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortItem {
    Single(u16),
    Range(u16, u16),
}

impl PortItem {
    fn parse(text: &str) -> Result<Self, PortSpecError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PortSpecError::Empty);
        }
        match text.split_once('-') {
            Some((start, end)) => {
                let start = parse_port(start)?;
                let end = parse_port(end)?;
                if start > end {
                    return Err(PortSpecError::InvertedRange(text.to_string()));
                }
                Ok(PortItem::Range(start, end))
            }
            None => Ok(PortItem::Single(parse_port(text)?)),
        }
    }

    fn ports(&self) -> std::ops::RangeInclusive<u16> {
        match *self {
            PortItem::Single(p) => p..=p,
            PortItem::Range(start, end) => start..=end,
        }
    }
}

fn parse_port(text: &str) -> Result<u16, PortSpecError> {
    text.trim()
        .parse::<u16>()
        .map_err(|_| PortSpecError::InvalidNumber(text.trim().to_string()))
}

/// Forme du champ port d'une règle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSpec {
    Single(u16),
    Range(u16, u16),
    /// Liste à virgules, chaque entrée pouvant être une sous-plage ; `text` garde la saisie
    List { items: Vec<PortItem>, text: String },
}

impl PortSpec {
    pub fn parse(text: &str) -> Result<Self, PortSpecError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PortSpecError::Empty);
        }
        if text.contains(',') {
            let items = text
                .split(',')
                .filter(|part| !part.trim().is_empty())
                .map(PortItem::parse)
                .collect::<Result<Vec<_>, _>>()?;
            if items.is_empty() {
                return Err(PortSpecError::Empty);
            }
            return Ok(PortSpec::List { items, text: text.to_string() });
        }
        Ok(match PortItem::parse(text)? {
            PortItem::Single(p) => PortSpec::Single(p),
            PortItem::Range(start, end) => PortSpec::Range(start, end),
        })
    }

    /// Unique : égalité. Plage : inclusion numérique. Liste : sous-chaîne du texte saisi
    /// (`"8080,443"` couvre 80, `"22,8000-8010"` ne couvre pas 8005).
    pub fn contains(&self, port: u16) -> bool {
        match self {
            PortSpec::Single(p) => *p == port,
            PortSpec::Range(start, end) => (*start..=*end).contains(&port),
            PortSpec::List { text, .. } => text.contains(&port.to_string()),
        }
    }

    /// Tous les ports concrets, triés, sans doublon
    pub fn ports(&self) -> BTreeSet<u16> {
        match self {
            PortSpec::Single(p) => BTreeSet::from([*p]),
            PortSpec::Range(start, end) => (*start..=*end).collect(),
            PortSpec::List { items, .. } => items.iter().flat_map(PortItem::ports).collect(),
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Single(p) => write!(f, "{p}"),
            PortSpec::Range(start, end) => write!(f, "{start}-{end}"),
            PortSpec::List { items, .. } => {
                let parts: Vec<String> = items
                    .iter()
                    .map(|item| match item {
                        PortItem::Single(p) => p.to_string(),
                        PortItem::Range(start, end) => format!("{start}-{end}"),
                    })
                    .collect();
                f.write_str(&parts.join(","))
            }
        }
    }
}

/// Protocoles d'une règle ; tout ce qui contient `/` vaut tcp et udp
pub fn rule_protocols(protocol: &str) -> Vec<String> {
    let protocol = protocol.trim().to_ascii_lowercase();
    if protocol.contains('/') {
        vec!["tcp".into(), "udp".into()]
    } else {
        vec![protocol]
    }
}

/// Inclusion insensible à la casse : `"tcp/udp"` couvre `tcp` et `udp`
pub fn protocol_matches(rule_protocol: &str, fact_protocol: &str) -> bool {
    let fact = fact_protocol.trim().to_ascii_lowercase();
    !fact.is_empty() && rule_protocol.to_ascii_lowercase().contains(&fact)
}

/// Triplet concret (agent, protocole, port) issu d'une règle
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExpandedPort {
    pub agent_id: String,
    pub protocol: String,
    pub port: u16,
}

/// Expanse les règles en triplets concrets, dédoublonnés par (agent, port, protocole).
///
/// Résultat trié : idempotent et indépendant de l'ordre des règles.
/// Les règles au port illisible sont renvoyées à part.
pub fn expand_rules<'a, I>(rules: I) -> (BTreeSet<ExpandedPort>, Vec<(&'a PortRule, PortSpecError)>)
where
    I: IntoIterator<Item = &'a PortRule>,
{
    let mut expanded = BTreeSet::new();
    let mut invalid = Vec::new();
    for rule in rules {
        let spec = match PortSpec::parse(&rule.port) {
            Ok(spec) => spec,
            Err(e) => {
                invalid.push((rule, e));
                continue;
            }
        };
        let protocols = rule_protocols(&rule.protocol);
        for port in spec.ports() {
            for protocol in &protocols {
                expanded.insert(ExpandedPort {
                    agent_id: rule.agent_id().to_string(),
                    protocol: protocol.clone(),
                    port,
                });
            }
        }
    }
    (expanded, invalid)
}
