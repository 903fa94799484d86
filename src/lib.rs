//! taskpulse - task-scheduler telemetry pipeline
//!
//! Scheduler and worker hooks publish lifecycle events onto a shared ordered
//! topic; a consumer demultiplexes the stream into per-category tables and
//! exports them as CSV.

pub mod codec;
pub mod config;
pub mod consumer;
pub mod emitter;
pub mod error;
pub mod event;
pub mod init;
pub mod logging;
pub mod router;
pub mod sim;
pub mod store;
pub mod topic;
pub mod transport;
pub mod watermark;

pub use config::{TelemetryConfig, TransportConfig};
pub use consumer::{ConsumeReport, EventConsumer};
pub use emitter::{SchedulerEmitter, SchedulerHost, WorkerEmitter, WorkerHost};
pub use error::{FixSuggestion, TelemetryError};
pub use event::{Category, Event, EventKind};
pub use logging::LogContext;
pub use router::{Route, Table};
pub use store::AccumulatorStore;
pub use watermark::Watermark;
