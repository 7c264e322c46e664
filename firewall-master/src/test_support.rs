//! Fixtures partagées des tests unitaires : transport scripté dont chaque agent
//! répond (ou se tait) selon son script.

use crate::error::{StoreError, TransportError};
use crate::models::{PortRule, PortUsageFact, RuleBase};
use crate::protocol::ResponseEnvelope;
use crate::store::{Entity, JsonTable, Predicate, Table};
use crate::transport::{Fields, GroupStart, StreamId, StreamRecord, StreamTransport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Script {
    /// Répond cette enveloppe après `after_reads` lectures
    Reply { response: ResponseEnvelope, after_reads: u32 },
    /// N'écrit jamais sur son stream de sortie
    Silent,
    /// Toute lecture échoue
    Broken,
}

#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, Script>>,
    next_id: Mutex<u64>,
    pub appended: Mutex<Vec<(String, Fields)>>,
    range_reads: Mutex<HashMap<String, u32>>,
    groups: Mutex<HashSet<(String, String)>>,
    pub group_create_calls: Mutex<u32>,
    pub acked: Mutex<Vec<(String, String, StreamId)>>,
    pub trims: Mutex<Vec<(String, usize)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, agent_id: &str, script: Script) {
        self.scripts.lock().insert(agent_id.to_string(), script);
    }

    pub fn reply_ok(&self, agent_id: &str, data: &str) {
        self.script(agent_id, Script::Reply { response: ResponseEnvelope::ok(data), after_reads: 0 });
    }

    pub fn range_reads(&self, key: &str) -> u32 {
        self.range_reads.lock().get(key).copied().unwrap_or(0)
    }

    pub fn total_range_reads(&self) -> u32 {
        self.range_reads.lock().values().sum()
    }

    fn agent_of(key: &str) -> String {
        key.split(':').nth(1).unwrap_or_default().to_string()
    }
}

#[async_trait]
impl StreamTransport for ScriptedTransport {
    async fn append(&self, key: &str, fields: Fields) -> Result<StreamId, TransportError> {
        let mut next = self.next_id.lock();
        *next += 1;
        self.appended.lock().push((key.to_string(), fields));
        Ok(StreamId::new(*next, 0))
    }

    async fn range_read(
        &self,
        key: &str,
        start: StreamId,
        _end: StreamId,
    ) -> Result<Option<StreamRecord>, TransportError> {
        let reads = {
            let mut counts = self.range_reads.lock();
            let count = counts.entry(key.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let script = self.scripts.lock().get(&Self::agent_of(key)).cloned();
        match script {
            Some(Script::Reply { response, after_reads }) if reads > after_reads => {
                Ok(Some(StreamRecord { id: start, fields: response.to_fields() }))
            }
            Some(Script::Broken) => Err(TransportError::Unavailable("scripted failure".into())),
            _ => Ok(None),
        }
    }

    async fn group_create(
        &self,
        key: &str,
        group: &str,
        _start: GroupStart,
        _create_if_missing: bool,
    ) -> Result<(), TransportError> {
        *self.group_create_calls.lock() += 1;
        if self.groups.lock().insert((key.to_string(), group.to_string())) {
            Ok(())
        } else {
            Err(TransportError::BusyGroup(group.to_string()))
        }
    }

    async fn group_read(
        &self,
        _key: &str,
        _group: &str,
        _consumer: &str,
        _count: usize,
        _block: Duration,
    ) -> Result<Vec<StreamRecord>, TransportError> {
        Ok(Vec::new())
    }

    async fn ack(&self, key: &str, group: &str, id: StreamId) -> Result<u64, TransportError> {
        self.acked.lock().push((key.to_string(), group.to_string(), id));
        Ok(1)
    }

    async fn trim(&self, key: &str, approx_max_len: usize) -> Result<u64, TransportError> {
        self.trims.lock().push((key.to_string(), approx_max_len));
        Ok(0)
    }
}

pub fn port_rule(agent: &str, port: &str, protocol: &str) -> PortRule {
    PortRule {
        id: None,
        base: RuleBase { agent_id: agent.into(), zone: "public".into(), permanent: true },
        family: "ipv4".into(),
        port: port.into(),
        protocol: protocol.into(),
        policy: true,
        source_rule: None,
        using: false,
        descriptor: None,
    }
}

pub fn usage_fact(agent: &str, protocol: &str, port: u16, process: &str) -> PortUsageFact {
    PortUsageFact {
        id: None,
        agent_id: agent.into(),
        protocol: protocol.into(),
        port_number: port,
        process_name: Some(process.into()),
        process_id: Some(1000 + i64::from(port)),
        command_line: Some(format!("/usr/bin/{process}")),
        listen_address: Some("0.0.0.0".into()),
    }
}

/// Table en mémoire qui compte les écritures, avec panne d'écriture activable
pub struct CountingTable<T: Entity> {
    inner: JsonTable<T>,
    pub writes: AtomicU32,
    pub fail_writes: AtomicBool,
}

impl<T: Entity> CountingTable<T> {
    pub fn new() -> Self {
        Self { inner: JsonTable::in_memory(), writes: AtomicU32::new(0), fail_writes: AtomicBool::new(false) }
    }

    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    fn count_write(&self) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("scripted write failure".into()));
        }
        Ok(())
    }
}

impl<T: Entity> Table<T> for CountingTable<T> {
    fn get(&self, id: u64) -> Result<Option<T>, StoreError> {
        self.inner.get(id)
    }

    fn find(&self, key: &T::Key) -> Result<Option<T>, StoreError> {
        self.inner.find(key)
    }

    fn list(&self) -> Result<Vec<T>, StoreError> {
        self.inner.list()
    }

    fn upsert_by_key(&self, rows: Vec<T>) -> Result<Vec<T>, StoreError> {
        self.count_write()?;
        self.inner.upsert_by_key(rows)
    }

    fn delete_where(&self, pred: Predicate<'_, T>) -> Result<usize, StoreError> {
        self.count_write()?;
        self.inner.delete_where(pred)
    }
}
