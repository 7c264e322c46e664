/**
 * ERREURS MASTER - Hiérarchie d'erreurs typées par couche
 *
 * RÔLE : Une enum thiserror par couche (transport, store, corrélation, ports),
 * agrégées dans MasterError pour les services et l'API.
 */

use thiserror::Error;

/// Erreurs du transport à logs indexés (streams + registre clé/valeur)
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("consumer group already exists: {0}")]
    BusyGroup(String),
    #[error("no such stream: {0}")]
    NoSuchKey(String),
    #[error("invalid stream id: {0}")]
    InvalidId(String),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Erreurs de persistence relationnelle
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store rejected write: {0}")]
    Rejected(String),
}

/// Erreurs du corrélateur commande/réponse
#[derive(Debug, Error)]
pub enum CorrelatorError {
    #[error("agent {agent_id} unreachable after {attempts} attempts")]
    Unreachable { agent_id: String, attempts: u32 },
    #[error("agent {agent_id} call timed out")]
    Timeout { agent_id: String },
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Spécification de port invalide dans une règle ("80", "1000-2000", "22,80,8000-8010")
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortSpecError {
    #[error("empty port spec")]
    Empty,
    #[error("invalid port number: {0}")]
    InvalidNumber(String),
    #[error("inverted port range: {0}")]
    InvertedRange(String),
}

/// Erreur agrégée des services du master
#[derive(Debug, Error)]
pub enum MasterError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Correlator(#[from] CorrelatorError),
    #[error(transparent)]
    PortSpec(#[from] PortSpecError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("agent {agent_id} answered {status}: {message}")]
    AgentRejected { agent_id: String, status: String, message: String },
    #[error("not found: {0}")]
    NotFound(String),
}

pub type MasterResult<T> = Result<T, MasterError>;
