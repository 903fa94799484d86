//! In-process transport
//!
//! Topics live in memory and are shared by every connection that names the
//! same group. Consumers block on a condition variable until the log grows.
//! Also carries the fault injection used by tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};

use super::batch::{BatchingProducer, PartitionLog, Record};
use super::{
    materialize, Consumer, ConsumerOptions, DataBroker, DataSelector, EventId, Producer,
    ProducerOptions, PullFuture, ReceivedEvent, StartPosition, Topic, TopicPolicy, Transport,
};
use crate::error::{Result, TelemetryError};

/// Groups reachable through `connect` with protocol `memory`
static GROUPS: Lazy<DashMap<String, MemoryTransport>> = Lazy::new(DashMap::new);

#[derive(Default)]
struct Faults {
    failing_pushes: AtomicUsize,
    failing_create: Mutex<Option<String>>,
}

#[derive(Default)]
struct MemoryLog {
    records: Mutex<Vec<Record>>,
    grown: Condvar,
    closed: AtomicBool,
}

impl MemoryLog {
    fn push_all(&self, records: &[Record]) -> Vec<EventId> {
        let mut log = self.records.lock();
        let first = log.len() as EventId;
        log.extend_from_slice(records);
        self.grown.notify_all();
        (first..first + records.len() as EventId).collect()
    }

    /// Block until the log holds something at `cursor`, then take up to `max`
    fn fetch(&self, cursor: usize, max: usize) -> Option<Vec<Record>> {
        let mut log = self.records.lock();
        while log.len() <= cursor {
            if self.closed.load(AtomicOrdering::SeqCst) {
                return None;
            }
            self.grown.wait(&mut log);
        }
        let end = (cursor + max).min(log.len());
        Some(log[cursor..end].to_vec())
    }

    fn close(&self) {
        self.closed.store(true, AtomicOrdering::SeqCst);
        let _guard = self.records.lock();
        self.grown.notify_all();
    }
}

struct FaultyLog {
    log: Arc<MemoryLog>,
    faults: Arc<Faults>,
}

impl PartitionLog for FaultyLog {
    fn append(&self, records: &[Record]) -> Result<Vec<EventId>> {
        let injected = self
            .faults
            .failing_pushes
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TelemetryError::transport("injected push failure"));
        }
        Ok(self.log.push_all(records))
    }
}

struct MemoryTopic {
    name: String,
    policy: TopicPolicy,
    log: Arc<MemoryLog>,
    faults: Arc<Faults>,
}

impl Topic for MemoryTopic {
    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> &TopicPolicy {
        &self.policy
    }

    fn producer(&self, options: ProducerOptions) -> Result<Box<dyn Producer>> {
        let log = Arc::new(FaultyLog {
            log: Arc::clone(&self.log),
            faults: Arc::clone(&self.faults),
        });
        Ok(Box::new(BatchingProducer::new(
            &self.name,
            self.policy,
            options,
            log,
        )))
    }

    fn consumer(
        &self,
        options: ConsumerOptions,
        selector: Box<dyn DataSelector>,
        broker: Box<dyn DataBroker>,
    ) -> Result<Box<dyn Consumer>> {
        let cursor = match options.start {
            StartPosition::Beginning => 0,
            StartPosition::End => self.log.records.lock().len(),
        };
        Ok(Box::new(MemoryConsumer {
            options,
            log: Arc::clone(&self.log),
            cursor,
            prefetched: VecDeque::new(),
            selector,
            broker,
        }))
    }
}

struct MemoryConsumer {
    options: ConsumerOptions,
    log: Arc<MemoryLog>,
    /// Index of the next record to fetch from the log
    cursor: usize,
    prefetched: VecDeque<(EventId, Record)>,
    selector: Box<dyn DataSelector>,
    broker: Box<dyn DataBroker>,
}

impl MemoryConsumer {
    fn next(&mut self) -> Result<ReceivedEvent> {
        if self.prefetched.is_empty() {
            let batch = self
                .log
                .fetch(self.cursor, self.options.batch_size)
                .ok_or_else(|| TelemetryError::ConsumerClosed {
                    name: self.options.name.clone(),
                })?;
            for record in batch {
                self.prefetched.push_back((self.cursor as EventId, record));
                self.cursor += 1;
            }
        }

        let (id, record) = self
            .prefetched
            .pop_front()
            .ok_or_else(|| TelemetryError::transport("empty fetch"))?;
        let data = materialize(
            self.selector.as_ref(),
            self.broker.as_ref(),
            &record.metadata,
            &record.data,
        );
        Ok(ReceivedEvent {
            id,
            partition: record.partition,
            metadata: record.metadata,
            data,
        })
    }
}

impl Consumer for MemoryConsumer {
    fn name(&self) -> &str {
        &self.options.name
    }

    fn pull(&mut self) -> PullFuture<'_> {
        PullFuture::new(move || self.next())
    }
}

/// In-memory service; clones share the same topics
#[derive(Clone, Default)]
pub struct MemoryTransport {
    topics: Arc<DashMap<String, Arc<MemoryTopic>>>,
    faults: Arc<Faults>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The transport registered under `group`, created on first use
    pub fn shared(group: &str) -> Self {
        GROUPS.entry(group.to_string()).or_default().clone()
    }

    /// Drop the registry entry for `group`, returning whether one existed
    ///
    /// Registered groups otherwise live for the whole process. Handles already
    /// obtained keep working; the next `shared(group)` starts empty.
    pub fn forget(group: &str) -> bool {
        GROUPS.remove(group).is_some()
    }

    /// Make the next `n` appends fail with a transport error
    pub fn fail_next_pushes(&self, n: usize) {
        self.faults.failing_pushes.store(n, AtomicOrdering::SeqCst);
    }

    /// Make the next `create_topic` fail with a transport error
    pub fn fail_next_create(&self, reason: impl Into<String>) {
        *self.faults.failing_create.lock() = Some(reason.into());
    }

    /// Append raw bytes, bypassing the topic policy
    pub fn inject_raw(&self, topic: &str, metadata: &[u8], data: &[u8]) -> Result<EventId> {
        let topic = self.topic(topic)?;
        let ids = topic.log.push_all(&[Record {
            partition: 0,
            metadata: metadata.to_vec(),
            data: data.to_vec(),
        }]);
        Ok(ids[0])
    }

    /// Snapshot of everything appended to a topic so far
    pub fn records(&self, topic: &str) -> Result<Vec<ReceivedEvent>> {
        let topic = self.topic(topic)?;
        let log = topic.log.records.lock();
        Ok(log
            .iter()
            .enumerate()
            .map(|(i, r)| ReceivedEvent {
                id: i as EventId,
                partition: r.partition,
                metadata: r.metadata.clone(),
                data: r.data.clone(),
            })
            .collect())
    }

    /// Wake blocked consumers; their pulls fail once the log is drained
    pub fn shutdown(&self) {
        for topic in self.topics.iter() {
            topic.log.close();
        }
    }

    fn topic(&self, name: &str) -> Result<Arc<MemoryTopic>> {
        self.topics
            .get(name)
            .map(|t| Arc::clone(&t))
            .ok_or_else(|| TelemetryError::TopicNotFound {
                name: name.to_string(),
            })
    }
}

impl Transport for MemoryTransport {
    fn protocol(&self) -> &str {
        "memory"
    }

    fn create_topic(&self, name: &str, policy: &TopicPolicy) -> Result<()> {
        if let Some(reason) = self.faults.failing_create.lock().take() {
            return Err(TelemetryError::transport(reason));
        }

        match self.topics.entry(name.to_string()) {
            Entry::Occupied(_) => Err(TelemetryError::TopicAlreadyExists {
                name: name.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(MemoryTopic {
                    name: name.to_string(),
                    policy: *policy,
                    log: Arc::new(MemoryLog::default()),
                    faults: Arc::clone(&self.faults),
                }));
                Ok(())
            }
        }
    }

    fn open_topic(&self, name: &str) -> Result<Arc<dyn Topic>> {
        Ok(self.topic(name)?)
    }
}
