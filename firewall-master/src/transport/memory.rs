/*!
Broker en mémoire : streams + consumer groups + hash de registre

Permet de faire tourner le master et ses tests sans serveur de streams externe.
Visible du seul process courant : des agents distants ne peuvent pas s'y connecter.
Reproduit la sémantique utile au master : ids monotones, groupes avec offset de
départ, entrées en attente d'ack, troncature, horloge serveur surchargeable.
*/

use super::{Fields, GroupStart, HashRegistry, StreamId, StreamRecord, StreamTransport};
use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: StreamId,
    pending: BTreeSet<StreamId>,
}

#[derive(Debug, Default)]
struct MemStream {
    entries: BTreeMap<StreamId, Fields>,
    last_id: StreamId,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct BrokerInner {
    streams: HashMap<String, MemStream>,
    hashes: HashMap<String, HashMap<String, String>>,
    clock_override: Option<i64>,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerInner>>,
    appended: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ajout avec id explicite (un agent qui répond à l'id de la commande)
    pub fn append_with_id(&self, key: &str, id: StreamId, fields: Fields) -> Result<StreamId, TransportError> {
        {
            let mut inner = self.inner.lock();
            let stream = inner.streams.entry(key.to_string()).or_default();
            if id <= stream.last_id && !stream.entries.is_empty() {
                return Err(TransportError::InvalidId(format!(
                    "{id} is not greater than last id {}",
                    stream.last_id
                )));
            }
            stream.entries.insert(id, fields);
            stream.last_id = stream.last_id.max(id);
        }
        self.appended.notify_waiters();
        Ok(id)
    }

    /// Fige l'horloge serveur (tests) ; `None` revient à l'horloge système
    pub fn set_server_time(&self, epoch_secs: Option<i64>) {
        self.inner.lock().clock_override = epoch_secs;
    }

    pub fn stream_len(&self, key: &str) -> usize {
        self.inner.lock().streams.get(key).map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn records(&self, key: &str) -> Vec<StreamRecord> {
        let inner = self.inner.lock();
        inner
            .streams
            .get(key)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(id, fields)| StreamRecord { id: *id, fields: fields.clone() })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn pending_count(&self, key: &str, group: &str) -> usize {
        let inner = self.inner.lock();
        inner
            .streams
            .get(key)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    pub fn has_group(&self, key: &str, group: &str) -> bool {
        let inner = self.inner.lock();
        inner.streams.get(key).map(|s| s.groups.contains_key(group)).unwrap_or(false)
    }

    pub fn hash_value(&self, hash: &str, field: &str) -> Option<String> {
        self.inner.lock().hashes.get(hash).and_then(|h| h.get(field).cloned())
    }

    fn next_id(last: StreamId) -> StreamId {
        let now_ms = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64;
        if now_ms > last.ms {
            StreamId::new(now_ms, 0)
        } else {
            StreamId::new(last.ms, last.seq + 1)
        }
    }

    fn take_undelivered(&self, key: &str, group: &str, count: usize) -> Result<Vec<StreamRecord>, TransportError> {
        let mut inner = self.inner.lock();
        let stream = inner
            .streams
            .get_mut(key)
            .ok_or_else(|| TransportError::NoSuchKey(key.to_string()))?;
        let MemStream { entries, groups, .. } = stream;
        let state = groups
            .get_mut(group)
            .ok_or_else(|| TransportError::NoSuchKey(format!("{key} (group {group})")))?;

        let batch: Vec<StreamRecord> = entries
            .range((std::ops::Bound::Excluded(state.last_delivered), std::ops::Bound::Unbounded))
            .take(count.max(1))
            .map(|(id, fields)| StreamRecord { id: *id, fields: fields.clone() })
            .collect();
        for record in &batch {
            state.pending.insert(record.id);
            state.last_delivered = record.id;
        }
        Ok(batch)
    }
}

#[async_trait]
impl StreamTransport for MemoryBroker {
    async fn append(&self, key: &str, fields: Fields) -> Result<StreamId, TransportError> {
        let id = {
            let mut inner = self.inner.lock();
            let stream = inner.streams.entry(key.to_string()).or_default();
            let id = Self::next_id(stream.last_id);
            stream.entries.insert(id, fields);
            stream.last_id = id;
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn range_read(
        &self,
        key: &str,
        start: StreamId,
        end: StreamId,
    ) -> Result<Option<StreamRecord>, TransportError> {
        let inner = self.inner.lock();
        Ok(inner.streams.get(key).and_then(|s| {
            s.entries
                .range(start..=end)
                .next()
                .map(|(id, fields)| StreamRecord { id: *id, fields: fields.clone() })
        }))
    }

    async fn group_create(
        &self,
        key: &str,
        group: &str,
        start: GroupStart,
        create_if_missing: bool,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if !inner.streams.contains_key(key) {
            if !create_if_missing {
                return Err(TransportError::NoSuchKey(key.to_string()));
            }
            inner.streams.insert(key.to_string(), MemStream::default());
        }
        let Some(stream) = inner.streams.get_mut(key) else {
            return Err(TransportError::NoSuchKey(key.to_string()));
        };
        if stream.groups.contains_key(group) {
            return Err(TransportError::BusyGroup(group.to_string()));
        }
        let last_delivered = match start {
            GroupStart::At(id) => id,
            GroupStart::Latest => stream.last_id,
        };
        stream.groups.insert(
            group.to_string(),
            GroupState { last_delivered, pending: BTreeSet::new() },
        );
        Ok(())
    }

    async fn group_read(
        &self,
        key: &str,
        group: &str,
        _consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamRecord>, TransportError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            // Créé avant la vérification pour ne rater aucun append concurrent
            let appended = self.appended.notified();
            let batch = self.take_undelivered(key, group, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, key: &str, group: &str, id: StreamId) -> Result<u64, TransportError> {
        let mut inner = self.inner.lock();
        let removed = inner
            .streams
            .get_mut(key)
            .and_then(|s| s.groups.get_mut(group))
            .map(|g| g.pending.remove(&id))
            .unwrap_or(false);
        Ok(u64::from(removed))
    }

    async fn trim(&self, key: &str, approx_max_len: usize) -> Result<u64, TransportError> {
        let mut inner = self.inner.lock();
        let Some(stream) = inner.streams.get_mut(key) else {
            return Ok(0);
        };
        let mut removed = 0;
        while stream.entries.len() > approx_max_len {
            if stream.entries.pop_first().is_none() {
                break;
            }
            removed += 1;
        }
        Ok(removed)
    }
}

#[async_trait]
impl HashRegistry for MemoryBroker {
    async fn entries(&self, hash: &str) -> Result<HashMap<String, String>, TransportError> {
        Ok(self.inner.lock().hashes.get(hash).cloned().unwrap_or_default())
    }

    async fn put(&self, hash: &str, field: &str, value: &str) -> Result<(), TransportError> {
        self.inner
            .lock()
            .hashes
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn server_time(&self) -> Result<i64, TransportError> {
        let frozen = self.inner.lock().clock_override;
        Ok(frozen.unwrap_or_else(|| OffsetDateTime::now_utc().unix_timestamp()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn test_append_ids_are_monotonic() {
        let broker = MemoryBroker::new();
        let a = broker.append("s", fields(&[("n", "1")])).await.unwrap();
        let b = broker.append("s", fields(&[("n", "2")])).await.unwrap();
        assert!(b > a);
        let found = broker.range_read("s", b, b).await.unwrap().unwrap();
        assert_eq!(found.fields["n"], "2");
        assert!(broker.range_read("other", a, a).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_group_create_is_busy_the_second_time() {
        let broker = MemoryBroker::new();
        assert!(matches!(
            broker.group_create("s", "g", GroupStart::At(StreamId::ZERO), false).await,
            Err(TransportError::NoSuchKey(_))
        ));
        broker.group_create("s", "g", GroupStart::At(StreamId::ZERO), true).await.unwrap();
        assert!(matches!(
            broker.group_create("s", "g", GroupStart::At(StreamId::ZERO), true).await,
            Err(TransportError::BusyGroup(_))
        ));
    }

    #[tokio::test]
    async fn test_group_read_and_ack() {
        let broker = MemoryBroker::new();
        broker.group_create("s", "g", GroupStart::At(StreamId::ZERO), true).await.unwrap();
        let id = broker.append("s", fields(&[("k", "v")])).await.unwrap();

        let batch = broker.group_read("s", "g", "c", 10, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(broker.pending_count("s", "g"), 1);
        // déjà livrée : plus rien à lire
        assert!(broker.group_read("s", "g", "c", 10, Duration::ZERO).await.unwrap().is_empty());

        assert_eq!(broker.ack("s", "g", id).await.unwrap(), 1);
        assert_eq!(broker.ack("s", "g", id).await.unwrap(), 0);
        assert_eq!(broker.pending_count("s", "g"), 0);
    }

    #[tokio::test]
    async fn test_group_read_blocks_until_append() {
        let broker = MemoryBroker::new();
        broker.group_create("s", "g", GroupStart::Latest, true).await.unwrap();
        let writer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("s", fields(&[("late", "yes")])).await.unwrap();
        });
        let batch = broker.group_read("s", "g", "c", 1, Duration::from_secs(2)).await.unwrap();
        assert_eq!(batch[0].fields["late"], "yes");
    }

    #[tokio::test]
    async fn test_trim_keeps_newest() {
        let broker = MemoryBroker::new();
        for i in 0..5 {
            broker.append("s", fields(&[("i", &i.to_string())])).await.unwrap();
        }
        assert_eq!(broker.trim("s", 3).await.unwrap(), 2);
        let records = broker.records("s");
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].fields["i"], "2");
    }

    #[tokio::test]
    async fn test_explicit_id_must_grow() {
        let broker = MemoryBroker::new();
        broker.append_with_id("s", StreamId::new(10, 0), Fields::new()).unwrap();
        assert!(broker.append_with_id("s", StreamId::new(5, 0), Fields::new()).is_err());
        broker.append_with_id("s", StreamId::new(10, 1), Fields::new()).unwrap();
    }

    #[tokio::test]
    async fn test_hash_registry_and_clock() {
        let broker = MemoryBroker::new();
        assert!(broker.entries("h").await.unwrap().is_empty());
        broker.put("h", "n1", "{}").await.unwrap();
        assert_eq!(broker.entries("h").await.unwrap().len(), 1);
        broker.set_server_time(Some(1234));
        assert_eq!(broker.server_time().await.unwrap(), 1234);
    }
}
