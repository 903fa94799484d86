//! # Transport Abstraction Layer
//!
//! Traits for the ordered pub/sub log the pipeline publishes into, plus two
//! in-tree backends.
//!
//! ## Overview
//!
//! - [`Transport`] - a connected service: create and open topics
//! - [`Topic`] - a named ordered log with a [`TopicPolicy`]
//! - [`Producer`] - pushes `(metadata, data)` pairs, returns a [`PushFuture`]
//! - [`Consumer`] - pulls one event at a time through a [`PullFuture`]
//!
//! ## Backends
//!
//! | Protocol | Backend | Scope |
//! |----------|---------|-------|
//! | `memory` | [`MemoryTransport`] | one process, shared per group |
//! | `local` | [`LocalTransport`] | one host, shared directory |
//!
//! Use [`connect`] to pick a backend from a [`TransportConfig`]:
//!
//! ```rust
//! use taskpulse::config::TransportConfig;
//! use taskpulse::transport::{connect, TopicPolicy};
//!
//! let config = TransportConfig::memory("doc-group");
//! let service = connect(&config).unwrap();
//! service.create_topic("Dask", &TopicPolicy::default()).unwrap();
//! assert!(service.create_topic("Dask", &TopicPolicy::default()).is_err());
//! ```

mod batch;
mod local;
mod memory;
mod policy;

pub use local::{GroupDescriptor, LocalTransport};
pub use memory::MemoryTransport;
pub use policy::{Partitioning, Serialization, TopicPolicy, Validation};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::config::TransportConfig;
use crate::error::{Result, TelemetryError};

/// Position of an acknowledged event in its partition
pub type EventId = u64;

// ============================================================================
// SERVICE / TOPIC / PRODUCER / CONSUMER
// ============================================================================

/// A connected pub/sub service
pub trait Transport: Send + Sync {
    /// Protocol identifier this service was connected with
    fn protocol(&self) -> &str;

    /// Create a topic; fails with `TopicAlreadyExists` if it is already there
    fn create_topic(&self, name: &str, policy: &TopicPolicy) -> Result<()>;

    /// Open an existing topic
    fn open_topic(&self, name: &str) -> Result<Arc<dyn Topic>>;
}

/// A named ordered log
pub trait Topic: Send + Sync {
    fn name(&self) -> &str;

    fn policy(&self) -> &TopicPolicy;

    fn producer(&self, options: ProducerOptions) -> Result<Box<dyn Producer>>;

    fn consumer(
        &self,
        options: ConsumerOptions,
        selector: Box<dyn DataSelector>,
        broker: Box<dyn DataBroker>,
    ) -> Result<Box<dyn Consumer>>;
}

pub trait Producer: Send + Sync {
    fn name(&self) -> &str;

    /// Submit one event; the returned future resolves once the log holds it
    fn push(&self, metadata: Vec<u8>, data: Vec<u8>) -> PushFuture;

    /// Append everything still buffered
    fn flush(&self) -> Result<()>;
}

pub trait Consumer: Send {
    fn name(&self) -> &str;

    /// Request the next event; nothing is read until the future is waited on
    fn pull(&mut self) -> PullFuture<'_>;
}

// ============================================================================
// OPTIONS
// ============================================================================

/// How many pushes a producer buffers before appending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchSize {
    /// Append as soon as a push arrives
    #[default]
    Adaptive,
    /// Append once this many pushes are pending (or on flush / wait)
    Fixed(usize),
}

impl BatchSize {
    pub(crate) fn limit(self) -> usize {
        match self {
            BatchSize::Adaptive => 1,
            BatchSize::Fixed(n) => n.max(1),
        }
    }
}

/// Relation between submission order and log order for one producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ordering {
    /// Log order equals submission order
    #[default]
    Strict,
    /// Concurrent flushes may interleave
    Loose,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerOptions {
    pub name: String,
    pub batch: BatchSize,
    pub ordering: Ordering,
}

impl ProducerOptions {
    /// Adaptive batching, strict ordering
    pub fn strict(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batch: BatchSize::Adaptive,
            ordering: Ordering::Strict,
        }
    }

    pub fn with_batch(mut self, batch: BatchSize) -> Self {
        self.batch = batch;
        self
    }
}

/// Where a new consumer's cursor starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartPosition {
    /// Replay everything the topic holds
    #[default]
    Beginning,
    /// Skip what the topic holds when the consumer is created
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    pub name: String,
    /// Events fetched from the log per round trip
    pub batch_size: usize,
    pub start: StartPosition,
}

impl ConsumerOptions {
    pub fn new(name: impl Into<String>, batch_size: usize) -> Self {
        Self {
            name: name.into(),
            batch_size: batch_size.max(1),
            start: StartPosition::Beginning,
        }
    }

    pub fn starting_at(mut self, start: StartPosition) -> Self {
        self.start = start;
        self
    }
}

// ============================================================================
// PAYLOAD MATERIALIZATION
// ============================================================================

/// A byte range inside a stored payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDescriptor {
    pub offset: usize,
    pub size: usize,
}

/// Decides which part of a payload the consumer wants (None = skip data)
pub trait DataSelector: Send {
    fn select(&self, metadata: &[u8], descriptor: DataDescriptor) -> Option<DataDescriptor>;
}

/// Allocates the buffer the selected bytes are copied into
pub trait DataBroker: Send {
    fn allocate(&self, metadata: &[u8], descriptor: DataDescriptor) -> Vec<u8>;
}

/// Selects the full payload unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct WholePayload;

impl DataSelector for WholePayload {
    fn select(&self, _metadata: &[u8], descriptor: DataDescriptor) -> Option<DataDescriptor> {
        Some(descriptor)
    }
}

/// Allocates a zeroed `Vec` of the selected size
#[derive(Debug, Clone, Copy, Default)]
pub struct VecBroker;

impl DataBroker for VecBroker {
    fn allocate(&self, _metadata: &[u8], descriptor: DataDescriptor) -> Vec<u8> {
        vec![0; descriptor.size]
    }
}

/// Copy the selected bytes of a stored payload into a broker buffer
pub(crate) fn materialize(
    selector: &dyn DataSelector,
    broker: &dyn DataBroker,
    metadata: &[u8],
    stored: &[u8],
) -> Vec<u8> {
    let whole = DataDescriptor {
        offset: 0,
        size: stored.len(),
    };
    let Some(selected) = selector.select(metadata, whole) else {
        return Vec::new();
    };

    let start = selected.offset.min(stored.len());
    let end = start.saturating_add(selected.size).min(stored.len());
    let range = DataDescriptor {
        offset: start,
        size: end - start,
    };

    let mut buffer = broker.allocate(metadata, range);
    buffer.resize(range.size, 0);
    buffer.copy_from_slice(&stored[start..end]);
    buffer
}

// ============================================================================
// FUTURES
// ============================================================================

type FlushHook = Box<dyn FnOnce() + Send>;

/// Acknowledgment of one push
///
/// `wait()` blocks the calling thread; async callers can `.await` it instead.
/// Either way a push still sitting in a producer batch is flushed first.
/// `wait()` must not be called from inside an async task.
pub struct PushFuture {
    rx: oneshot::Receiver<Result<EventId>>,
    flush: Option<FlushHook>,
}

impl PushFuture {
    pub(crate) fn pending(rx: oneshot::Receiver<Result<EventId>>, flush: Option<FlushHook>) -> Self {
        Self { rx, flush }
    }

    /// A future that is already resolved
    pub(crate) fn ready(result: Result<EventId>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx, flush: None }
    }

    pub fn wait(mut self) -> Result<EventId> {
        match self.rx.try_recv() {
            Ok(result) => return result,
            Err(oneshot::error::TryRecvError::Closed) => return Err(ack_dropped()),
            Err(oneshot::error::TryRecvError::Empty) => {}
        }
        if let Some(flush) = self.flush.take() {
            flush();
        }
        self.rx.blocking_recv().unwrap_or_else(|_| Err(ack_dropped()))
    }
}

impl Future for PushFuture {
    type Output = Result<EventId>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(flush) = self.flush.take() {
            flush();
        }
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(ack_dropped())))
    }
}

impl std::fmt::Debug for PushFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushFuture")
            .field("batched", &self.flush.is_some())
            .finish()
    }
}

fn ack_dropped() -> TelemetryError {
    TelemetryError::transport("producer dropped before acknowledging push")
}

/// One event as handed to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedEvent {
    pub id: EventId,
    pub partition: u32,
    pub metadata: Vec<u8>,
    pub data: Vec<u8>,
}

/// A pending pull; blocks in `wait()` until an event is available
pub struct PullFuture<'a> {
    fetch: Box<dyn FnOnce() -> Result<ReceivedEvent> + Send + 'a>,
}

impl<'a> PullFuture<'a> {
    pub(crate) fn new(fetch: impl FnOnce() -> Result<ReceivedEvent> + Send + 'a) -> Self {
        Self {
            fetch: Box::new(fetch),
        }
    }

    pub fn wait(self) -> Result<ReceivedEvent> {
        (self.fetch)()
    }
}

// ============================================================================
// CONNECT
// ============================================================================

/// Default sleep between polls of a local partition file
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Connect to the service described by `config`
pub fn connect(config: &TransportConfig) -> Result<Arc<dyn Transport>> {
    match config.protocol.as_str() {
        "memory" => Ok(Arc::new(MemoryTransport::shared(
            &config.group_file.display().to_string(),
        ))),
        "local" => {
            let group = GroupDescriptor::load(&config.group_file)?;
            let transport = LocalTransport::open(&group, config.poll_interval())?;
            Ok(Arc::new(transport))
        }
        other => Err(TelemetryError::UnsupportedProtocol {
            protocol: other.to_string(),
        }),
    }
}
