//! Scheduler hooks

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use super::Publisher;
use crate::config::TransportConfig;
use crate::error::Result;
use crate::event::{
    ClientMembership, Event, EventKind, GraphUpdate, LogEntry, SchedulerLifecycle,
    SchedulerTransition, WorkerMembership,
};
use crate::logging::LogContext;
use crate::transport::Transport;

pub const SCHEDULER_PRODUCER: &str = "taskpulse-scheduler";

/// Prefix and group a task key belongs to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskNames {
    pub prefix: Option<String>,
    pub group: Option<String>,
}

/// What the emitter needs from the scheduler it is attached to
pub trait SchedulerHost: Send + Sync {
    fn address(&self) -> String;

    /// Names for `key`, or defaults if the scheduler no longer tracks it
    fn task_names(&self, key: &str) -> TaskNames;
}

impl<T: SchedulerHost + ?Sized> SchedulerHost for Arc<T> {
    fn address(&self) -> String {
        (**self).address()
    }

    fn task_names(&self, key: &str) -> TaskNames {
        (**self).task_names(key)
    }
}

/// One compute interval reported with a transition
#[derive(Debug, Clone, PartialEq)]
pub struct StartStop {
    pub action: String,
    pub start: f64,
    pub stop: f64,
}

/// Optional details a scheduler passes along with a transition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionMetrics {
    pub startstops: Vec<StartStop>,
    pub thread: Option<u64>,
    pub nbytes: Option<u64>,
    pub worker: Option<String>,
}

pub struct SchedulerEmitter<H: SchedulerHost> {
    host: H,
    publisher: Publisher,
}

impl<H: SchedulerHost> SchedulerEmitter<H> {
    pub fn connect(host: H, config: &TransportConfig, topic: &str, log: LogContext) -> Result<Self> {
        let publisher = Publisher::connect(config, topic, SCHEDULER_PRODUCER.to_string(), log)?;
        Ok(Self::attach(host, publisher))
    }

    pub fn with_service(
        host: H,
        service: Arc<dyn Transport>,
        topic: &str,
        log: LogContext,
    ) -> Result<Self> {
        let publisher =
            Publisher::with_service(service, topic, SCHEDULER_PRODUCER.to_string(), log)?;
        Ok(Self::attach(host, publisher))
    }

    fn attach(host: H, publisher: Publisher) -> Self {
        publisher
            .log()
            .in_scope(|| info!(address = %host.address(), "scheduler emitter attached"));
        Self { host, publisher }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn is_released(&self) -> bool {
        self.publisher.is_released()
    }

    fn lifecycle(&self) -> SchedulerLifecycle {
        SchedulerLifecycle {
            address: self.host.address(),
        }
    }

    fn emit(&self, kind: EventKind) {
        self.publisher.publish(&Event::now(kind));
    }

    pub fn on_start(&self) {
        self.emit(EventKind::Start(self.lifecycle()));
    }

    pub fn on_before_close(&self) {
        self.emit(EventKind::BeforeClose(self.lifecycle()));
    }

    /// Publish `close`, then release the transport handles
    pub fn on_close(&self) {
        self.emit(EventKind::Close(self.lifecycle()));
        self.publisher.release();
    }

    pub fn on_restart(&self) {
        self.emit(EventKind::Restart(self.lifecycle()));
    }

    pub fn on_update_graph(&self, graph: GraphUpdate) {
        self.emit(EventKind::UpdateGraph(graph));
    }

    pub fn on_transition(
        &self,
        key: &str,
        start: &str,
        finish: &str,
        stimulus_id: &str,
        metrics: Option<&TransitionMetrics>,
    ) {
        let names = self.host.task_names(key);
        let metrics = metrics.cloned().unwrap_or_default();
        let interval = metrics.startstops.first();

        self.emit(EventKind::SchedulerTransition(SchedulerTransition {
            key: key.to_string(),
            start: start.to_string(),
            finish: finish.to_string(),
            stimulus_id: stimulus_id.to_string(),
            prefix: names.prefix,
            group: names.group,
            called_from: self.host.address(),
            worker: metrics.worker,
            thread: metrics.thread,
            begins: interval.map(|s| s.start),
            ends: interval.map(|s| s.stop),
            duration: interval.map(|s| s.stop - s.start),
            size: metrics.nbytes,
        }));
    }

    pub fn on_add_worker(&self, worker: &str) {
        self.emit(EventKind::AddWorker(WorkerMembership {
            worker: worker.to_string(),
            stimulus_id: String::new(),
        }));
    }

    pub fn on_remove_worker(&self, worker: &str, stimulus_id: &str) {
        self.emit(EventKind::RemoveWorker(WorkerMembership {
            worker: worker.to_string(),
            stimulus_id: stimulus_id.to_string(),
        }));
    }

    pub fn on_add_client(&self, client: &str) {
        self.emit(EventKind::AddClient(ClientMembership {
            client: client.to_string(),
        }));
    }

    pub fn on_remove_client(&self, client: &str) {
        self.emit(EventKind::RemoveClient(ClientMembership {
            client: client.to_string(),
        }));
    }

    pub fn on_log_event(&self, topic: &str, message: Value) {
        self.emit(EventKind::LogEvent(LogEntry {
            topic: topic.to_string(),
            message,
        }));
    }
}
