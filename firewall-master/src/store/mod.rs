/**
 * STORE - Persistance relationnelle minimale du master
 *
 * RÔLE :
 * Tables des nœuds, règles, faits d'usage, liens règle <-> fait, statuts pare-feu.
 *
 * FONCTIONNEMENT :
 * - `Entity` = id numérique attribué par la table + clé naturelle métier
 * - `Table<T>` = interface commune (get, find, list, upsert par clé naturelle,
 *   suppression par prédicat, vidage) que chaque backend implémente
 * - `JsonTable<T>` = cache mémoire + réécriture d'un fichier JSON à chaque mutation
 * - Pas de transactions : une écriture partielle reste en place si une suivante échoue
 */

pub mod json;

pub use json::JsonTable;

use crate::error::StoreError;
use crate::models::{FirewallStatusInfo, FirewallType, NodeStatus, PortRule, PortUsageFact, RuleUsageLink};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::hash::Hash;
use std::path::Path;
use std::sync::Arc;

pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Key: Eq + Hash + Clone + Debug + Send + Sync;

    fn id(&self) -> Option<u64>;
    fn set_id(&mut self, id: u64);
    fn natural_key(&self) -> Self::Key;
}

pub type Predicate<'a, T> = &'a (dyn Fn(&T) -> bool + Send + Sync);

/// Interface que toutes les tables doivent implémenter
pub trait Table<T: Entity>: Send + Sync {
    fn get(&self, id: u64) -> Result<Option<T>, StoreError>;

    fn find(&self, key: &T::Key) -> Result<Option<T>, StoreError>;

    fn list(&self) -> Result<Vec<T>, StoreError>;

    /// Insère ou met à jour par clé naturelle ; renvoie les lignes avec leur id
    fn upsert_by_key(&self, rows: Vec<T>) -> Result<Vec<T>, StoreError>;

    /// Supprime les lignes qui vérifient le prédicat ; renvoie le nombre supprimé
    fn delete_where(&self, pred: Predicate<'_, T>) -> Result<usize, StoreError>;

    fn delete_all(&self) -> Result<usize, StoreError> {
        self.delete_where(&|_| true)
    }

    fn list_where(&self, pred: Predicate<'_, T>) -> Result<Vec<T>, StoreError> {
        Ok(self.list()?.into_iter().filter(|row| pred(row)).collect())
    }
}

impl Entity for NodeStatus {
    type Key = String;

    fn id(&self) -> Option<u64> {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = Some(id);
    }
    fn natural_key(&self) -> String {
        self.agent_id.clone()
    }
}

/// (agent, permanent, zone, family, port, protocol, source, policy)
pub type RuleKey = (String, bool, String, String, String, String, Option<String>, bool);

impl Entity for PortRule {
    type Key = RuleKey;

    fn id(&self) -> Option<u64> {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = Some(id);
    }
    fn natural_key(&self) -> RuleKey {
        (
            self.base.agent_id.clone(),
            self.base.permanent,
            self.base.zone.clone(),
            self.family.clone(),
            self.port.clone(),
            self.protocol.to_ascii_lowercase(),
            self.source().map(str::to_string),
            self.policy,
        )
    }
}

impl Entity for PortUsageFact {
    type Key = crate::models::FactKey;

    fn id(&self) -> Option<u64> {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = Some(id);
    }
    fn natural_key(&self) -> Self::Key {
        self.fact_key()
    }
}

impl Entity for RuleUsageLink {
    type Key = (u64, u64);

    fn id(&self) -> Option<u64> {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = Some(id);
    }
    fn natural_key(&self) -> (u64, u64) {
        (self.rule_id, self.fact_id)
    }
}

impl Entity for FirewallStatusInfo {
    type Key = (String, FirewallType);

    fn id(&self) -> Option<u64> {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = Some(id);
    }
    fn natural_key(&self) -> Self::Key {
        (self.agent_id.clone(), self.firewall_type)
    }
}

/// Ensemble des tables du master
#[derive(Clone)]
pub struct Store {
    pub nodes: Arc<dyn Table<NodeStatus>>,
    pub rules: Arc<dyn Table<PortRule>>,
    pub usage: Arc<dyn Table<PortUsageFact>>,
    pub links: Arc<dyn Table<RuleUsageLink>>,
    pub firewall: Arc<dyn Table<FirewallStatusInfo>>,
}

impl Store {
    /// Tables persistées dans `data_dir` (un fichier JSON par table)
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, StoreError> {
        let dir = data_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            nodes: Arc::new(JsonTable::open(dir.join("nodes.json"))?),
            rules: Arc::new(JsonTable::open(dir.join("port_rules.json"))?),
            usage: Arc::new(JsonTable::open(dir.join("port_usage.json"))?),
            links: Arc::new(JsonTable::open(dir.join("rule_usage_links.json"))?),
            firewall: Arc::new(JsonTable::open(dir.join("firewall_status.json"))?),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            nodes: Arc::new(JsonTable::in_memory()),
            rules: Arc::new(JsonTable::in_memory()),
            usage: Arc::new(JsonTable::in_memory()),
            links: Arc::new(JsonTable::in_memory()),
            firewall: Arc::new(JsonTable::in_memory()),
        }
    }
}
