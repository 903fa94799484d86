//! Batching producer shared by the in-tree backends
//!
//! Pushes are admitted against the topic policy, buffered until the batch
//! limit is reached, then appended to the partition log as one contiguous
//! block. Each push gets its own acknowledgment channel.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use super::{EventId, Ordering, Producer, ProducerOptions, PushFuture, TopicPolicy};
use crate::error::{Result, TelemetryError};

/// One stored `(metadata, data)` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Record {
    pub partition: u32,
    pub metadata: Vec<u8>,
    pub data: Vec<u8>,
}

/// Storage behind a topic
pub(crate) trait PartitionLog: Send + Sync {
    /// Append all records in order, contiguously; returns one id per record
    fn append(&self, records: &[Record]) -> Result<Vec<EventId>>;
}

struct Pending {
    record: Record,
    ack: oneshot::Sender<Result<EventId>>,
}

struct Inner {
    name: String,
    topic: String,
    policy: TopicPolicy,
    ordering: Ordering,
    limit: usize,
    log: Arc<dyn PartitionLog>,
    pending: Mutex<Vec<Pending>>,
}

impl Inner {
    fn flush(&self) -> Result<()> {
        match self.ordering {
            // Holding the buffer lock across the append keeps batches from
            // one producer in submission order.
            Ordering::Strict => {
                let mut pending = self.pending.lock();
                let batch = std::mem::take(&mut *pending);
                self.append(batch)
            }
            Ordering::Loose => {
                let batch = std::mem::take(&mut *self.pending.lock());
                self.append(batch)
            }
        }
    }

    fn append(&self, batch: Vec<Pending>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let (records, acks): (Vec<Record>, Vec<_>) =
            batch.into_iter().map(|p| (p.record, p.ack)).unzip();

        debug!(producer = %self.name, topic = %self.topic, count = records.len(), "appending batch");
        match self.log.append(&records) {
            Ok(ids) => {
                for (ack, id) in acks.into_iter().zip(ids) {
                    let _ = ack.send(Ok(id));
                }
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                for ack in acks {
                    let _ = ack.send(Err(TelemetryError::transport(reason.clone())));
                }
                Err(e)
            }
        }
    }
}

pub(crate) struct BatchingProducer {
    inner: Arc<Inner>,
}

impl BatchingProducer {
    pub fn new(
        topic: &str,
        policy: TopicPolicy,
        options: ProducerOptions,
        log: Arc<dyn PartitionLog>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: options.name,
                topic: topic.to_string(),
                policy,
                ordering: options.ordering,
                limit: options.batch.limit(),
                log,
                pending: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl Producer for BatchingProducer {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn push(&self, metadata: Vec<u8>, data: Vec<u8>) -> PushFuture {
        let partition = match self.inner.policy.admit(&metadata) {
            Ok(p) => p,
            Err(reason) => {
                return PushFuture::ready(Err(TelemetryError::Rejected {
                    topic: self.inner.topic.clone(),
                    reason,
                }))
            }
        };

        let (tx, rx) = oneshot::channel();
        let full = {
            let mut pending = self.inner.pending.lock();
            pending.push(Pending {
                record: Record {
                    partition,
                    metadata,
                    data,
                },
                ack: tx,
            });
            pending.len() >= self.inner.limit
        };

        if full {
            // The ack channel carries the failure to the caller
            let _ = self.inner.flush();
            return PushFuture::pending(rx, None);
        }

        let inner = Arc::clone(&self.inner);
        PushFuture::pending(
            rx,
            Some(Box::new(move || {
                let _ = inner.flush();
            })),
        )
    }

    fn flush(&self) -> Result<()> {
        self.inner.flush()
    }
}

impl Drop for BatchingProducer {
    fn drop(&mut self) {
        if let Err(e) = self.inner.flush() {
            debug!(producer = %self.inner.name, error = %e, "flush on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BatchSize;

    #[derive(Default)]
    struct VecLog {
        records: Mutex<Vec<Record>>,
        appends: Mutex<usize>,
        fail: bool,
    }

    impl PartitionLog for VecLog {
        fn append(&self, records: &[Record]) -> Result<Vec<EventId>> {
            if self.fail {
                return Err(TelemetryError::transport("disk full"));
            }
            *self.appends.lock() += 1;
            let mut log = self.records.lock();
            let first = log.len() as u64;
            log.extend_from_slice(records);
            Ok((first..first + records.len() as u64).collect())
        }
    }

    fn meta() -> Vec<u8> {
        br#"{"category":"log_event"}"#.to_vec()
    }

    fn producer(log: Arc<VecLog>, batch: BatchSize) -> BatchingProducer {
        BatchingProducer::new(
            "Dask",
            TopicPolicy::default(),
            ProducerOptions::strict("p").with_batch(batch),
            log,
        )
    }

    #[test]
    fn adaptive_appends_each_push() {
        let log = Arc::new(VecLog::default());
        let p = producer(Arc::clone(&log), BatchSize::Adaptive);

        assert_eq!(p.push(meta(), b"a".to_vec()).wait().unwrap(), 0);
        assert_eq!(p.push(meta(), b"b".to_vec()).wait().unwrap(), 1);
        assert_eq!(*log.appends.lock(), 2);
    }

    #[test]
    fn fixed_batch_appends_once_full() {
        let log = Arc::new(VecLog::default());
        let p = producer(Arc::clone(&log), BatchSize::Fixed(3));

        let f1 = p.push(meta(), b"1".to_vec());
        let f2 = p.push(meta(), b"2".to_vec());
        assert!(log.records.lock().is_empty());

        let f3 = p.push(meta(), b"3".to_vec());
        assert_eq!(*log.appends.lock(), 1);
        assert_eq!(
            [f1.wait().unwrap(), f2.wait().unwrap(), f3.wait().unwrap()],
            [0, 1, 2]
        );
    }

    #[test]
    fn waiting_on_buffered_push_flushes_batch() {
        let log = Arc::new(VecLog::default());
        let p = producer(Arc::clone(&log), BatchSize::Fixed(10));

        let first = p.push(meta(), b"1".to_vec());
        let second = p.push(meta(), b"2".to_vec());
        assert_eq!(second.wait().unwrap(), 1);
        assert_eq!(first.wait().unwrap(), 0);
        assert_eq!(*log.appends.lock(), 1);
    }

    #[test]
    fn rejected_push_never_reaches_log() {
        let log = Arc::new(VecLog::default());
        let p = producer(Arc::clone(&log), BatchSize::Adaptive);

        let err = p.push(b"{}".to_vec(), b"x".to_vec()).wait().unwrap_err();
        assert!(matches!(err, TelemetryError::Rejected { .. }));
        assert!(log.records.lock().is_empty());
    }

    #[test]
    fn append_failure_reaches_every_waiter() {
        let log = Arc::new(VecLog {
            fail: true,
            ..Default::default()
        });
        let p = producer(log, BatchSize::Fixed(2));

        let f1 = p.push(meta(), b"1".to_vec());
        let f2 = p.push(meta(), b"2".to_vec());
        assert!(f1.wait().is_err());
        assert!(f2.wait().is_err());
    }

    #[test]
    fn drop_flushes_leftovers() {
        let log = Arc::new(VecLog::default());
        let p = producer(Arc::clone(&log), BatchSize::Fixed(5));
        let _pending = p.push(meta(), b"1".to_vec());
        drop(p);
        assert_eq!(log.records.lock().len(), 1);
    }

    #[test]
    fn submission_order_is_log_order() {
        let log = Arc::new(VecLog::default());
        let p = producer(Arc::clone(&log), BatchSize::Fixed(4));
        for i in 0..10u8 {
            let _ = p.push(meta(), vec![i]);
        }
        p.flush().unwrap();

        let data: Vec<u8> = log.records.lock().iter().map(|r| r.data[0]).collect();
        assert_eq!(data, (0..10).collect::<Vec<u8>>());
    }
}
