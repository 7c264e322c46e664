//! Signal interne "jeu de règles modifié" : publié par le service de règles,
//! consommé par le moteur de réconciliation.

use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSetChanged {
    pub agent_id: String,
    /// Règles créées, modifiées ou supprimées par l'opération
    pub rule_ids: Vec<u64>,
}

#[derive(Clone)]
pub struct RuleEvents {
    sender: broadcast::Sender<RuleSetChanged>,
}

impl RuleEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuleSetChanged> {
        self.sender.subscribe()
    }

    /// Sans abonné l'événement est perdu, la passe périodique rattrape
    pub fn publish(&self, event: RuleSetChanged) {
        if self.sender.send(event).is_err() {
            debug!("[events] rule set changed with no subscriber");
        }
    }
}

impl Default for RuleEvents {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let events = RuleEvents::default();
        let mut rx = events.subscribe();
        events.publish(RuleSetChanged { agent_id: "n1".into(), rule_ids: vec![3] });
        let got = rx.recv().await.unwrap();
        assert_eq!(got.agent_id, "n1");
        assert_eq!(got.rule_ids, vec![3]);
    }

    #[test]
    fn test_publish_without_subscriber_is_fine() {
        RuleEvents::default().publish(RuleSetChanged { agent_id: "n1".into(), rule_ids: vec![] });
    }
}
