//! Host-side event emitters
//!
//! A scheduler or worker host calls hooks on its emitter; each hook publishes
//! exactly one event (the worker's transition hook also drains new transfer
//! records) and blocks until the transport acknowledges it. No failure leaves
//! a hook: publish errors become log records.
//!
//! ```text
//! host hook ──► snapshot payload ──► Publisher (mutex) ──► Producer::push ──► wait ack
//! ```

mod scheduler;
mod worker;

pub use scheduler::{SchedulerEmitter, SchedulerHost, StartStop, TaskNames, TransitionMetrics};
pub use worker::{WorkerEmitter, WorkerHost};

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::codec;
use crate::config::TransportConfig;
use crate::error::{Result, TelemetryError};
use crate::event::Event;
use crate::logging::LogContext;
use crate::topic::open_or_create;
use crate::transport::{self, EventId, Producer, ProducerOptions, Topic, TopicPolicy, Transport};

/// Transport handles owned by one emitter
struct Session {
    service: Arc<dyn Transport>,
    topic: Arc<dyn Topic>,
    producer: Box<dyn Producer>,
}

/// Serialized publishing over a releasable session
pub(crate) struct Publisher {
    session: Mutex<Option<Session>>,
    log: LogContext,
}

impl Publisher {
    pub(crate) fn connect(
        config: &TransportConfig,
        topic: &str,
        producer: String,
        log: LogContext,
    ) -> Result<Self> {
        let service = transport::connect(config)?;
        Self::with_service(service, topic, producer, log)
    }

    pub(crate) fn with_service(
        service: Arc<dyn Transport>,
        topic: &str,
        producer: String,
        log: LogContext,
    ) -> Result<Self> {
        let topic = open_or_create(service.as_ref(), topic, &TopicPolicy::default(), &log)?;
        let producer = topic.producer(ProducerOptions::strict(producer))?;
        log.in_scope(|| debug!(producer = producer.name(), "producer ready"));

        Ok(Self {
            session: Mutex::new(Some(Session {
                service,
                topic,
                producer,
            })),
            log,
        })
    }

    pub(crate) fn log(&self) -> &LogContext {
        &self.log
    }

    /// Publish and wait; failures are logged, never returned
    pub(crate) fn publish(&self, event: &Event) {
        if let Err(e) = self.try_publish(event) {
            let _entered = self.log.span().enter();
            error!(category = %event.category(), error = %e, "publish failed");
        }
    }

    fn try_publish(&self, event: &Event) -> Result<EventId> {
        let session = self.session.lock();
        let Some(session) = session.as_ref() else {
            let _entered = self.log.span().enter();
            warn!(category = %event.category(), "hook called after release, event not published");
            return Ok(0);
        };

        let encoded = codec::encode(event).map_err(|e| TelemetryError::Publish {
            category: event.category(),
            reason: e.to_string(),
        })?;
        let id = session
            .producer
            .push(encoded.metadata, encoded.data)
            .wait()
            .map_err(|e| TelemetryError::Publish {
                category: event.category(),
                reason: e.to_string(),
            })?;

        let _entered = self.log.span().enter();
        debug!(category = %event.category(), id, topic = session.topic.name(), "published");
        Ok(id)
    }

    pub(crate) fn is_released(&self) -> bool {
        self.session.lock().is_none()
    }

    /// Flush and drop producer, topic and service handles (once)
    pub(crate) fn release(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };
        let _entered = self.log.span().enter();

        if let Err(e) = session.producer.flush() {
            let failure = TelemetryError::ResourceTeardown {
                resource: format!("producer '{}'", session.producer.name()),
                reason: e.to_string(),
            };
            error!(error = %failure, "release failed");
        }
        let Session {
            service,
            topic,
            producer,
        } = session;
        debug!(
            producer = producer.name(),
            topic = topic.name(),
            protocol = service.protocol(),
            "session released"
        );
        drop(producer);
        drop(topic);
        drop(service);
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.release();
    }
}
