/**
 * CORRÉLATEUR COMMANDE/RÉPONSE - Appels "synchrones" vers un agent sur streams
 *
 * RÔLE :
 * Seul composant qui parle au transport de streams. Transforme un stream
 * asynchrone persistant en appel requête/réponse borné dans le temps.
 *
 * FONCTIONNEMENT :
 * - Publie la commande sur `pub:{agent}:{canal}` ; le transport attribue un id
 * - Tronque le stream entrant à ~1000 entrées
 * - Attend la réponse sur `sub:{agent}:{canal}` par lecture à l'id exact de la commande
 * - Réessaie (4 tentatives, 2s d'écart par défaut) tant que la réponse est absente
 * - Acquitte la réponse dans le groupe `firewall_pub:{agent}_group`
 * - Épuisement des tentatives => `Unreachable`, jamais un succès vide
 * - Chaque appel est enveloppé dans son propre timeout
 */

use crate::config::CorrelatorConf;
use crate::error::{CorrelatorError, TransportError};
use crate::protocol::{consumer_group, inbound_stream, outbound_stream, CommandEnvelope, ResponseEnvelope};
use crate::transport::{GroupStart, StreamId, StreamTransport};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Politique de retry injectable : nombre de tentatives et délai fixe entre elles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 4, delay: Duration::from_secs(2) }
    }
}

/// Résultat typé d'une tentative de lecture de réponse
#[derive(Debug)]
pub enum Attempt {
    Reply(ResponseEnvelope),
    /// Rien à l'id attendu (ou réponse d'une autre corrélation) : on réessaie
    Empty,
    Failed(TransportError),
}

pub struct Correlator {
    transport: Arc<dyn StreamTransport>,
    policy: RetryPolicy,
    call_timeout: Duration,
    stream_max_len: usize,
    ready_groups: Mutex<HashSet<(String, String)>>,
    unreachable_count: AtomicU64,
}

pub type SharedCorrelator = Arc<Correlator>;

impl Correlator {
    pub fn new(transport: Arc<dyn StreamTransport>, policy: RetryPolicy) -> Self {
        // le timeout par appel couvre toutes les tentatives plus une marge
        let call_timeout = policy.delay * policy.max_attempts.max(1) + Duration::from_secs(4);
        Self {
            transport,
            policy,
            call_timeout,
            stream_max_len: 1000,
            ready_groups: Mutex::new(HashSet::new()),
            unreachable_count: AtomicU64::new(0),
        }
    }

    pub fn from_config(transport: Arc<dyn StreamTransport>, conf: &CorrelatorConf) -> Self {
        let policy = RetryPolicy { max_attempts: conf.max_attempts.max(1), delay: conf.retry_delay() };
        Self::new(transport, policy)
            .with_call_timeout(conf.call_timeout())
            .with_stream_max_len(conf.stream_max_len)
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_stream_max_len(mut self, max_len: usize) -> Self {
        self.stream_max_len = max_len;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Nombre d'appels terminés en `Unreachable` ou `Timeout` depuis le démarrage
    pub fn unreachable_count(&self) -> u64 {
        self.unreachable_count.load(Ordering::Relaxed)
    }

    /// Envoie une commande à un agent et attend sa réponse corrélée
    pub async fn send(
        &self,
        agent_id: &str,
        channel: &str,
        command: &CommandEnvelope,
    ) -> Result<ResponseEnvelope, CorrelatorError> {
        match tokio::time::timeout(self.call_timeout, self.send_with_retry(agent_id, channel, command)).await {
            Ok(result) => result,
            Err(_) => {
                self.unreachable_count.fetch_add(1, Ordering::Relaxed);
                warn!("[correlator] {agent_id}/{channel}: call timed out after {:?}", self.call_timeout);
                Err(CorrelatorError::Timeout { agent_id: agent_id.to_string() })
            }
        }
    }

    async fn send_with_retry(
        &self,
        agent_id: &str,
        channel: &str,
        command: &CommandEnvelope,
    ) -> Result<ResponseEnvelope, CorrelatorError> {
        let inbound = inbound_stream(agent_id, channel);
        let outbound = outbound_stream(agent_id, channel);
        let group = consumer_group(agent_id);
        self.ensure_group(&outbound, &group).await?;

        let mut command = command.clone();
        let correlation_id = command
            .correlation_id
            .get_or_insert_with(|| Uuid::new_v4().to_string())
            .clone();

        let id = self.transport.append(&inbound, command.to_fields()?).await?;
        debug!(
            "[correlator] {} {}/{} published to {inbound} as {id}",
            agent_id, command.agent_component_type, command.data_op_type
        );
        if let Err(e) = self.transport.trim(&inbound, self.stream_max_len).await {
            warn!("[correlator] failed to trim {inbound}: {e}");
        }

        let attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.read_reply(&outbound, id, &correlation_id).await {
                Attempt::Reply(response) => {
                    if let Err(e) = self.transport.ack(&outbound, &group, id).await {
                        warn!("[correlator] failed to ack {outbound} {id}: {e}");
                    }
                    // les réponses consommées ne sont plus relues
                    if let Err(e) = self.transport.trim(&outbound, self.stream_max_len).await {
                        warn!("[correlator] failed to trim {outbound}: {e}");
                    }
                    debug!("[correlator] {agent_id}: reply {} on attempt {attempt}", response.status);
                    return Ok(response);
                }
                Attempt::Empty => {
                    debug!("[correlator] {agent_id}: no reply yet at {id} (attempt {attempt}/{attempts})");
                }
                Attempt::Failed(e) => {
                    warn!("[correlator] {agent_id}: read failed (attempt {attempt}/{attempts}): {e}");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.policy.delay).await;
            }
        }

        self.unreachable_count.fetch_add(1, Ordering::Relaxed);
        warn!("[correlator] {agent_id}/{channel}: unreachable after {attempts} attempts");
        Err(CorrelatorError::Unreachable { agent_id: agent_id.to_string(), attempts })
    }

    async fn read_reply(&self, outbound: &str, id: StreamId, correlation_id: &str) -> Attempt {
        let record = match self.transport.range_read(outbound, id, id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Attempt::Empty,
            Err(e) => return Attempt::Failed(e),
        };
        let Some(response) = ResponseEnvelope::from_fields(&record.fields) else {
            warn!("[correlator] malformed reply at {outbound} {id}: no status");
            return Attempt::Empty;
        };
        match &response.correlation_id {
            Some(cid) if cid != correlation_id => {
                warn!("[correlator] reply at {outbound} {id} belongs to {cid}, expected {correlation_id}");
                Attempt::Empty
            }
            _ => Attempt::Reply(response),
        }
    }

    /// Création idempotente du consumer group, stream créé au besoin
    pub async fn ensure_group(&self, key: &str, group: &str) -> Result<(), TransportError> {
        let marker = (key.to_string(), group.to_string());
        if self.ready_groups.lock().contains(&marker) {
            return Ok(());
        }
        let created = match self.transport.group_create(key, group, GroupStart::At(StreamId::ZERO), true).await {
            Ok(()) => true,
            Err(TransportError::BusyGroup(_)) => false,
            Err(TransportError::InvalidId(reason)) => {
                warn!("[correlator] start offset rejected for {key} ({reason}), using latest");
                match self.transport.group_create(key, group, GroupStart::Latest, true).await {
                    Ok(()) => true,
                    Err(TransportError::BusyGroup(_)) => false,
                    Err(e) => return Err(e),
                }
            }
            Err(e) => return Err(e),
        };
        if created {
            info!("[correlator] consumer group {group} created on {key}");
        }
        self.ready_groups.lock().insert(marker);
        Ok(())
    }
}
