/*!
Agent simulé pour développement sans flotte réelle

Lit ses streams `pub:{agent}:{canal}` via un consumer group, répond sur
`sub:{agent}:{canal}` au même id que la commande (comme un vrai agent),
et enregistre toutes les commandes reçues pour les assertions de tests.
*/

use firewall_master::protocol::{inbound_stream, outbound_stream, CommandEnvelope, OperationType, ResponseEnvelope};
use firewall_master::transport::memory::MemoryBroker;
use firewall_master::transport::{GroupStart, HashRegistry, StreamId, StreamTransport};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Comportement de l'agent sur un canal
#[derive(Debug, Clone)]
pub enum Reaction {
    /// Répond "200" avec ce payload
    Reply(String),
    /// Ne répond jamais (agent figé ou injoignable)
    Silent,
    /// Répond avec un statut d'erreur
    Fail { status: String, message: String },
}

#[derive(Debug, Clone)]
pub struct ReceivedCommand {
    pub channel: String,
    pub id: StreamId,
    pub command: CommandEnvelope,
}

/// Agent simulé branché sur le broker en mémoire
#[derive(Clone)]
pub struct SimulatedAgent {
    pub agent_id: String,
    broker: MemoryBroker,
    reactions: Arc<Mutex<HashMap<String, Reaction>>>,
    received: Arc<Mutex<Vec<ReceivedCommand>>>,
    heartbeat_key: String,
}

const AGENT_GROUP: &str = "agent_sim_group";

impl SimulatedAgent {
    pub fn new(agent_id: &str, broker: MemoryBroker, heartbeat_key: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            broker,
            reactions: Arc::new(Mutex::new(HashMap::new())),
            received: Arc::new(Mutex::new(Vec::new())),
            heartbeat_key: heartbeat_key.to_string(),
        }
    }

    /// Configure la réaction sur un canal (sans réaction : "200" à payload vide)
    pub fn react(&self, channel: &str, reaction: Reaction) -> &Self {
        self.reactions.lock().insert(channel.to_string(), reaction);
        self
    }

    pub fn received(&self) -> Vec<ReceivedCommand> {
        self.received.lock().clone()
    }

    pub fn received_on(&self, channel: &str) -> Vec<ReceivedCommand> {
        self.received.lock().iter().filter(|c| c.channel == channel).cloned().collect()
    }

    /// Réécrit l'enregistrement heartbeat de l'agent avec l'heure serveur
    pub async fn write_heartbeat(&self, first: bool) -> anyhow::Result<()> {
        let now = self.broker.server_time().await?;
        let record = crate::fixtures::heartbeat_record(now, first);
        self.broker.put(&self.heartbeat_key, &self.agent_id, &record.to_string()).await?;
        Ok(())
    }

    /// Démarre une boucle de lecture par canal ; s'arrête avec `cancel`
    pub async fn spawn(&self, channels: &[&str], cancel: CancellationToken) -> anyhow::Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();
        for channel in channels {
            let key = inbound_stream(&self.agent_id, channel);
            // un groupe existant (agent relancé) est accepté tel quel
            if let Err(e) = self.broker.group_create(&key, AGENT_GROUP, GroupStart::At(StreamId::ZERO), true).await {
                tracing::debug!("[agent-sim] {}: group on {key}: {e}", self.agent_id);
            }
            let agent = self.clone();
            let channel = channel.to_string();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                agent.serve(channel, key, cancel).await;
            }));
        }
        tracing::info!("[agent-sim] {} serving {} channels", self.agent_id, channels.len());
        Ok(handles)
    }

    async fn serve(&self, channel: String, key: String, cancel: CancellationToken) {
        let consumer = format!("{}_sim", self.agent_id);
        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = self.broker.group_read(&key, AGENT_GROUP, &consumer, 16, Duration::from_millis(100)) => batch,
            };
            let records = match batch {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!("[agent-sim] {}: read {key} failed: {e}", self.agent_id);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            for record in records {
                match CommandEnvelope::from_fields(&record.fields) {
                    Ok(command) => self.answer(&channel, record.id, command).await,
                    Err(e) => tracing::warn!("[agent-sim] {}: undecodable command {}: {e}", self.agent_id, record.id),
                }
                self.broker.ack(&key, AGENT_GROUP, record.id).await.ok();
            }
        }
    }

    async fn answer(&self, channel: &str, id: StreamId, command: CommandEnvelope) {
        let is_refresh = command.data_op_type == OperationType::Options
            && command.request_params.get("action").map(String::as_str) == Some("refresh_heartbeat");
        let correlation_id = command.correlation_id.clone();
        self.received.lock().push(ReceivedCommand { channel: channel.to_string(), id, command });

        let reaction = self.reactions.lock().get(channel).cloned().unwrap_or(Reaction::Reply(String::new()));
        let mut response = match reaction {
            Reaction::Silent => return,
            Reaction::Reply(data) => ResponseEnvelope::ok(data),
            Reaction::Fail { status, message } => ResponseEnvelope::error(&status, message),
        };
        if is_refresh && response.is_ok() {
            if let Err(e) = self.write_heartbeat(false).await {
                tracing::warn!("[agent-sim] {}: heartbeat rewrite failed: {e}", self.agent_id);
            }
        }
        response.correlation_id = correlation_id;

        let reply_key = outbound_stream(&self.agent_id, channel);
        if let Err(e) = self.broker.append_with_id(&reply_key, id, response.to_fields()) {
            tracing::warn!("[agent-sim] {}: reply on {reply_key} rejected: {e}", self.agent_id);
        }
    }
}
