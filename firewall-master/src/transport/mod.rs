/**
 * TRANSPORT - Contrat des logs indexés (streams) et du registre clé/valeur
 *
 * RÔLE :
 * Le master ne parle jamais directement aux agents. Tout passe par :
 * - des streams append-only avec consumer groups (commandes / réponses)
 * - des hash de registre écrits par les agents (heartbeats, usage des ports)
 *
 * FONCTIONNEMENT :
 * - `StreamTransport` : append / range_read / group_create / group_read / ack / trim
 * - `HashRegistry` : lecture complète d'un hash, écriture d'un champ, horloge serveur
 * - `memory::MemoryBroker` implémente les deux en mémoire (dev, tests, démo)
 */

pub mod memory;

use crate::error::TransportError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Entrée de stream : map plate de champs texte
pub type Fields = BTreeMap<String, String>;

/// Identifiant d'entrée de stream "<millisecondes>-<séquence>"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    /// Offset de début de stream, "0-0"
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ms, seq) = s.split_once('-').unwrap_or((s, "0"));
        let ms = ms.parse().map_err(|_| TransportError::InvalidId(s.to_string()))?;
        let seq = seq.parse().map_err(|_| TransportError::InvalidId(s.to_string()))?;
        Ok(StreamId { ms, seq })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub id: StreamId,
    pub fields: Fields,
}

/// Position de départ d'un consumer group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    /// Depuis une position donnée (ex: `StreamId::ZERO`)
    At(StreamId),
    /// Uniquement les nouvelles entrées
    Latest,
}

#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Ajoute une entrée et renvoie l'id attribué par le transport
    async fn append(&self, key: &str, fields: Fields) -> Result<StreamId, TransportError>;

    /// Lecture par intervalle d'ids (bornes incluses) ; renvoie la première entrée trouvée
    async fn range_read(
        &self,
        key: &str,
        start: StreamId,
        end: StreamId,
    ) -> Result<Option<StreamRecord>, TransportError>;

    /// Crée un consumer group ; `BusyGroup` s'il existe déjà
    async fn group_create(
        &self,
        key: &str,
        group: &str,
        start: GroupStart,
        create_if_missing: bool,
    ) -> Result<(), TransportError>;

    /// Lit les entrées jamais livrées au groupe, en bloquant au plus `block`
    async fn group_read(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamRecord>, TransportError>;

    /// Acquitte une entrée ; renvoie le nombre d'entrées effectivement acquittées
    async fn ack(&self, key: &str, group: &str, id: StreamId) -> Result<u64, TransportError>;

    /// Tronque le stream à environ `approx_max_len` entrées ; renvoie le nombre supprimé
    async fn trim(&self, key: &str, approx_max_len: usize) -> Result<u64, TransportError>;
}

#[async_trait]
pub trait HashRegistry: Send + Sync {
    /// Tous les champs d'un hash (vide si le hash n'existe pas)
    async fn entries(&self, hash: &str) -> Result<HashMap<String, String>, TransportError>;

    async fn put(&self, hash: &str, field: &str, value: &str) -> Result<(), TransportError>;

    /// Horloge du serveur de registre, epoch secondes
    async fn server_time(&self) -> Result<i64, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_parse_and_order() {
        let id: StreamId = "1700000000000-3".parse().unwrap();
        assert_eq!(id, StreamId::new(1_700_000_000_000, 3));
        assert_eq!(id.to_string(), "1700000000000-3");
        assert_eq!("42".parse::<StreamId>().unwrap(), StreamId::new(42, 0));
        assert!("abc-1".parse::<StreamId>().is_err());
        assert!(StreamId::ZERO < StreamId::new(0, 1));
        assert!(StreamId::new(1, 9) < StreamId::new(2, 0));
    }
}
