//! Event consumer
//!
//! Pulls events off the topic one at a time, decodes them, routes each into
//! its accumulator table and stops on the first terminal category. Tables are
//! exported once when the loop ends, including when it ends on a transport
//! failure.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::codec;
use crate::config::TransportConfig;
use crate::error::Result;
use crate::logging::LogContext;
use crate::router::{route, Table};
use crate::store::AccumulatorStore;
use crate::topic::open_or_create;
use crate::transport::{
    self, Consumer, ConsumerOptions, StartPosition, Topic, TopicPolicy, Transport, VecBroker,
    WholePayload,
};

pub const CONSUMER_NAME: &str = "taskpulse-consumer";

/// Outcome of one consume run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsumeReport {
    pub decoded: usize,
    pub dropped: usize,
    pub rows: BTreeMap<Table, usize>,
    pub files: Vec<PathBuf>,
}

/// Decode + route, independent of where the bytes came from
#[derive(Debug)]
pub struct Demultiplexer {
    store: AccumulatorStore,
    decoded: usize,
    dropped: usize,
    stopped: bool,
    log: LogContext,
}

impl Demultiplexer {
    pub fn new(log: LogContext) -> Self {
        Self {
            store: AccumulatorStore::new(),
            decoded: 0,
            dropped: 0,
            stopped: false,
            log,
        }
    }

    /// Handle one raw event; returns true once a terminal category was seen
    pub fn handle(&mut self, metadata: &[u8], data: &[u8]) -> bool {
        let _entered = self.log.span().enter();

        let event = match codec::decode(metadata, data) {
            Ok(event) => event,
            Err(e) => {
                self.dropped += 1;
                warn!(error = %e, "dropping undecodable event");
                return self.stopped;
            }
        };
        self.decoded += 1;

        let route = route(event.category());
        if let Err(e) = self.store.append(&event) {
            self.dropped += 1;
            warn!(category = %event.category(), error = %e, "dropping unrecordable event");
        } else {
            debug!(category = %event.category(), table = %route.table, "event recorded");
        }

        if route.stops {
            info!(category = %event.category(), "terminal event received");
            self.stopped = true;
        }
        self.stopped
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn store(&self) -> &AccumulatorStore {
        &self.store
    }

    pub fn decoded(&self) -> usize {
        self.decoded
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Export the tables and summarize the run
    pub fn finish(&self, output_dir: &Path) -> Result<ConsumeReport> {
        let files = self.store.export(output_dir)?;
        {
            let _entered = self.log.span().enter();
            for path in &files {
                info!(path = %path.display(), "table exported");
            }
        }
        Ok(ConsumeReport {
            decoded: self.decoded,
            dropped: self.dropped,
            rows: self.store.counts(),
            files,
        })
    }
}

/// Consumer bound to one topic
pub struct EventConsumer {
    consumer: Box<dyn Consumer>,
    // Kept alive for as long as the consumer pulls
    _topic: Arc<dyn Topic>,
    _service: Arc<dyn Transport>,
    demux: Demultiplexer,
    log: LogContext,
}

impl EventConsumer {
    /// Connect and replay the topic from its first event
    pub fn connect(config: &TransportConfig, topic: &str, log: LogContext) -> Result<Self> {
        Self::connect_at(config, topic, StartPosition::Beginning, log)
    }

    /// Connect with an explicit start; `StartPosition::End` skips earlier sessions
    /// left in a reused deployment
    pub fn connect_at(
        config: &TransportConfig,
        topic: &str,
        start: StartPosition,
        log: LogContext,
    ) -> Result<Self> {
        let service = transport::connect(config)?;
        Self::with_service_at(service, topic, start, log)
    }

    /// Attach to an already connected service
    pub fn with_service(service: Arc<dyn Transport>, topic: &str, log: LogContext) -> Result<Self> {
        Self::with_service_at(service, topic, StartPosition::Beginning, log)
    }

    pub fn with_service_at(
        service: Arc<dyn Transport>,
        topic: &str,
        start: StartPosition,
        log: LogContext,
    ) -> Result<Self> {
        let topic = open_or_create(service.as_ref(), topic, &TopicPolicy::default(), &log)?;
        let consumer = topic.consumer(
            ConsumerOptions::new(CONSUMER_NAME, 1).starting_at(start),
            Box::new(WholePayload),
            Box::new(VecBroker),
        )?;
        log.in_scope(|| {
            info!(consumer = CONSUMER_NAME, topic = topic.name(), start = ?start, "consumer ready")
        });

        Ok(Self {
            consumer,
            _topic: topic,
            _service: service,
            demux: Demultiplexer::new(log.child("demux")),
            log,
        })
    }

    /// Consume until a terminal event, then export into `output_dir`
    pub fn run(mut self, output_dir: &Path) -> Result<ConsumeReport> {
        while !self.demux.is_stopped() {
            match self.consumer.pull().wait() {
                Ok(event) => {
                    self.demux.handle(&event.metadata, &event.data);
                }
                Err(e) => {
                    self.log.in_scope(|| error!(error = %e, "pull failed, exporting what was collected"));
                    if let Err(export) = self.demux.finish(output_dir) {
                        self.log.in_scope(|| error!(error = %export, "export after pull failure failed"));
                    }
                    return Err(e);
                }
            }
        }

        let report = self.demux.finish(output_dir)?;
        self.log.in_scope(|| {
            info!(
                decoded = report.decoded,
                dropped = report.dropped,
                files = report.files.len(),
                "consumer finished"
            )
        });
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ClientMembership, Event, EventKind, LogEntry};
    use crate::transport::MemoryTransport;
    use serde_json::json;
    use tempfile::TempDir;

    fn raw(kind: EventKind) -> (Vec<u8>, Vec<u8>) {
        let encoded = codec::encode(&Event::at(1.0, kind)).unwrap();
        (encoded.metadata, encoded.data)
    }

    #[test]
    fn bad_metadata_is_dropped_and_loop_continues() {
        let mut demux = Demultiplexer::new(LogContext::new("test"));
        assert!(!demux.handle(b"not json", b"{}"));

        let (m, d) = raw(EventKind::LogEvent(LogEntry {
            topic: "t".into(),
            message: json!("hi"),
        }));
        assert!(!demux.handle(&m, &d));

        assert_eq!(demux.dropped(), 1);
        assert_eq!(demux.decoded(), 1);
        assert_eq!(demux.store().len(Table::LogEvent), 1);
    }

    #[test]
    fn remove_client_is_recorded_then_stops() {
        let mut demux = Demultiplexer::new(LogContext::new("test"));
        let (m, d) = raw(EventKind::RemoveClient(ClientMembership { client: "c".into() }));
        assert!(demux.handle(&m, &d));
        assert_eq!(demux.store().len(Table::Client), 1);
    }

    #[test]
    fn run_stops_at_first_terminal_event() {
        let service = MemoryTransport::new();
        let consumer =
            EventConsumer::with_service(Arc::new(service.clone()), "Dask", LogContext::new("t"))
                .unwrap();

        for client in ["a", "b"] {
            let (m, d) = raw(EventKind::AddClient(ClientMembership { client: client.into() }));
            service.inject_raw("Dask", &m, &d).unwrap();
        }
        let (m, d) = raw(EventKind::RemoveClient(ClientMembership { client: "a".into() }));
        service.inject_raw("Dask", &m, &d).unwrap();
        let (m, d) = raw(EventKind::AddClient(ClientMembership { client: "late".into() }));
        service.inject_raw("Dask", &m, &d).unwrap();

        let dir = TempDir::new().unwrap();
        let report = consumer.run(dir.path()).unwrap();
        assert_eq!(report.decoded, 3);
        assert_eq!(report.rows.get(&Table::Client), Some(&3));
        assert_eq!(report.files, vec![dir.path().join("client.csv")]);
    }

    #[test]
    fn pull_failure_exports_then_errors() {
        let service = MemoryTransport::new();
        let consumer =
            EventConsumer::with_service(Arc::new(service.clone()), "Dask", LogContext::new("t"))
                .unwrap();
        let (m, d) = raw(EventKind::AddClient(ClientMembership { client: "a".into() }));
        service.inject_raw("Dask", &m, &d).unwrap();
        service.shutdown();

        let dir = TempDir::new().unwrap();
        assert!(consumer.run(dir.path()).is_err());
        assert!(dir.path().join("client.csv").exists());
    }
}
