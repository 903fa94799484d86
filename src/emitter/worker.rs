//! Worker hooks
//!
//! Besides its own transitions, a worker forwards the transfers its host has
//! logged since the previous transition. One watermark per direction tracks
//! how many records have been forwarded already.

use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::Publisher;
use crate::config::TransportConfig;
use crate::error::Result;
use crate::event::{
    Event, EventKind, TransferDirection, TransferRecord, WorkerTeardown, WorkerTransfer,
    WorkerTransition,
};
use crate::logging::LogContext;
use crate::transport::Transport;
use crate::watermark::Watermark;

/// What the emitter needs from the worker it is attached to
pub trait WorkerHost: Send + Sync {
    fn name(&self) -> String;

    /// Current length of the transfer log for `direction`
    fn transfer_log_len(&self, direction: TransferDirection) -> usize;

    /// Records `range` of the transfer log for `direction`
    fn transfer_records(&self, direction: TransferDirection, range: Range<usize>)
        -> Vec<TransferRecord>;
}

impl<T: WorkerHost + ?Sized> WorkerHost for Arc<T> {
    fn name(&self) -> String {
        (**self).name()
    }

    fn transfer_log_len(&self, direction: TransferDirection) -> usize {
        (**self).transfer_log_len(direction)
    }

    fn transfer_records(
        &self,
        direction: TransferDirection,
        range: Range<usize>,
    ) -> Vec<TransferRecord> {
        (**self).transfer_records(direction, range)
    }
}

#[derive(Debug, Default)]
struct Watermarks {
    incoming: Watermark,
    outgoing: Watermark,
}

impl Watermarks {
    fn get_mut(&mut self, direction: TransferDirection) -> &mut Watermark {
        match direction {
            TransferDirection::Incoming => &mut self.incoming,
            TransferDirection::Outgoing => &mut self.outgoing,
        }
    }
}

pub struct WorkerEmitter<H: WorkerHost> {
    host: H,
    name: String,
    publisher: Publisher,
    watermarks: Mutex<Watermarks>,
}

impl<H: WorkerHost> WorkerEmitter<H> {
    pub fn connect(host: H, config: &TransportConfig, topic: &str, log: LogContext) -> Result<Self> {
        let name = host.name();
        let publisher = Publisher::connect(config, topic, producer_name(&name), log)?;
        Ok(Self::attach(host, name, publisher))
    }

    pub fn with_service(
        host: H,
        service: Arc<dyn Transport>,
        topic: &str,
        log: LogContext,
    ) -> Result<Self> {
        let name = host.name();
        let publisher = Publisher::with_service(service, topic, producer_name(&name), log)?;
        Ok(Self::attach(host, name, publisher))
    }

    fn attach(host: H, name: String, publisher: Publisher) -> Self {
        publisher
            .log()
            .in_scope(|| info!(worker = %name, "worker emitter attached"));
        Self {
            host,
            name,
            publisher,
            watermarks: Mutex::new(Watermarks::default()),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn is_released(&self) -> bool {
        self.publisher.is_released()
    }

    /// Records already forwarded for `direction`
    pub fn forwarded(&self, direction: TransferDirection) -> usize {
        self.watermarks.lock().get_mut(direction).emitted()
    }

    /// Publish `teardown`, then release the transport handles
    pub fn on_teardown(&self) {
        self.publisher
            .publish(&Event::now(EventKind::Teardown(WorkerTeardown {
                worker: self.name.clone(),
            })));
        self.publisher.release();
    }

    pub fn on_transition(&self, key: &str, start: &str, finish: &str) {
        self.publisher
            .publish(&Event::now(EventKind::WorkerTransition(WorkerTransition {
                key: key.to_string(),
                start: start.to_string(),
                finish: finish.to_string(),
                called_from: self.name.clone(),
            })));
        if self.publisher.is_released() {
            return;
        }

        let mut watermarks = self.watermarks.lock();
        for direction in TransferDirection::BOTH {
            let len = self.host.transfer_log_len(direction);
            let Some(fresh) = watermarks.get_mut(direction).advance(len) else {
                continue;
            };
            let records = self.host.transfer_records(direction, fresh.clone());
            self.publisher.log().in_scope(|| {
                debug!(%direction, from = fresh.start, to = fresh.end, "forwarding transfers")
            });
            for record in records {
                self.publisher
                    .publish(&Event::now(EventKind::WorkerTransfer(WorkerTransfer {
                        direction,
                        called_from: self.name.clone(),
                        record,
                    })));
            }
        }
    }
}

fn producer_name(worker: &str) -> String {
    format!("taskpulse-worker-{}", worker)
}
