//! Simulated cluster
//!
//! Drives a scheduler emitter and a set of worker emitters through one graph
//! submission, the way a small array workload would: `tasks` chunks of
//! `add-i`, each feeding `mul-i` on the next worker, reduced by a single
//! `mean` task. Dependencies computed on another worker produce a transfer
//! on both ends. The run ends with `remove_client`, worker teardowns,
//! `before_close` and `close`.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tracing::info;

use crate::emitter::{
    SchedulerEmitter, SchedulerHost, StartStop, TaskNames, TransitionMetrics, WorkerEmitter,
    WorkerHost,
};
use crate::error::{Result, TelemetryError};
use crate::event::{self, GraphUpdate, TransferDirection, TransferRecord};
use crate::logging::LogContext;
use crate::transport::Transport;

const SCHEDULER_ADDRESS: &str = "tcp://127.0.0.1:8786";
/// Bytes per simulated chunk
const CHUNK_BYTES: u64 = 8_000_000;
const COMPUTE_SECS: f64 = 0.05;
const BANDWIDTH: f64 = 100_000_000.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationOptions {
    pub workers: usize,
    /// Number of chunks; the graph holds `2 * tasks + 1` keys
    pub tasks: usize,
    pub client: String,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            tasks: 4,
            client: "Client-sim".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulationReport {
    pub workers: usize,
    pub keys: usize,
    pub scheduler_transitions: usize,
    pub worker_transitions: usize,
    pub transfers: usize,
}

struct SimScheduler;

impl SchedulerHost for SimScheduler {
    fn address(&self) -> String {
        SCHEDULER_ADDRESS.to_string()
    }

    fn task_names(&self, key: &str) -> TaskNames {
        let prefix = key.split('-').next().unwrap_or(key).to_string();
        TaskNames {
            group: Some(prefix.clone()),
            prefix: Some(prefix),
        }
    }
}

struct SimWorker {
    name: String,
    incoming: Mutex<Vec<TransferRecord>>,
    outgoing: Mutex<Vec<TransferRecord>>,
}

impl SimWorker {
    fn new(index: usize) -> Self {
        Self {
            name: format!("tcp://127.0.0.1:{}", 40_000 + index),
            incoming: Mutex::new(Vec::new()),
            outgoing: Mutex::new(Vec::new()),
        }
    }

    fn log(&self, direction: TransferDirection) -> &Mutex<Vec<TransferRecord>> {
        match direction {
            TransferDirection::Incoming => &self.incoming,
            TransferDirection::Outgoing => &self.outgoing,
        }
    }
}

impl WorkerHost for SimWorker {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn transfer_log_len(&self, direction: TransferDirection) -> usize {
        self.log(direction).lock().len()
    }

    fn transfer_records(
        &self,
        direction: TransferDirection,
        range: Range<usize>,
    ) -> Vec<TransferRecord> {
        let log = self.log(direction).lock();
        let end = range.end.min(log.len());
        let start = range.start.min(end);
        log[start..end].to_vec()
    }
}

/// One node of the simulated graph
struct Task {
    key: String,
    worker: usize,
    deps: Vec<String>,
}

fn build_graph(options: &SimulationOptions) -> Vec<Task> {
    let w = options.workers;
    let mut tasks = Vec::with_capacity(2 * options.tasks + 1);
    for i in 0..options.tasks {
        tasks.push(Task {
            key: format!("add-{}", i),
            worker: i % w,
            deps: Vec::new(),
        });
        tasks.push(Task {
            key: format!("mul-{}", i),
            worker: (i + 1) % w,
            deps: vec![format!("add-{}", i)],
        });
    }
    tasks.push(Task {
        key: "mean-0".to_string(),
        worker: 0,
        deps: (0..options.tasks).map(|i| format!("mul-{}", i)).collect(),
    });
    tasks
}

fn graph_update(client: &str, tasks: &[Task]) -> GraphUpdate {
    let keys: BTreeSet<String> = tasks.iter().map(|t| t.key.clone()).collect();
    let dependencies: BTreeMap<String, BTreeSet<String>> = tasks
        .iter()
        .map(|t| (t.key.clone(), t.deps.iter().cloned().collect()))
        .collect();
    let priority = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.key.clone(), json!(i)))
        .collect();

    GraphUpdate {
        client: client.to_string(),
        keys,
        tasks: tasks.iter().map(|t| t.key.clone()).collect(),
        annotations: BTreeMap::new(),
        priority,
        dependencies,
    }
}

/// Run the workload against `service`, publishing to `topic`
pub fn run_simulation(
    service: Arc<dyn Transport>,
    topic: &str,
    options: &SimulationOptions,
    log: &LogContext,
) -> Result<SimulationReport> {
    if options.workers == 0 {
        return Err(TelemetryError::Config("simulation needs at least one worker".into()));
    }

    let scheduler =
        SchedulerEmitter::with_service(SimScheduler, Arc::clone(&service), topic, log.child("scheduler"))?;

    let mut hosts = Vec::with_capacity(options.workers);
    let mut workers = Vec::with_capacity(options.workers);
    for i in 0..options.workers {
        let host = Arc::new(SimWorker::new(i));
        workers.push(WorkerEmitter::with_service(
            Arc::clone(&host),
            Arc::clone(&service),
            topic,
            log.child("worker"),
        )?);
        hosts.push(host);
    }

    let mut report = SimulationReport {
        workers: options.workers,
        ..SimulationReport::default()
    };

    scheduler.on_start();
    for host in &hosts {
        scheduler.on_add_worker(&host.name);
    }
    scheduler.on_add_client(&options.client);

    let graph = build_graph(options);
    report.keys = graph.len();
    scheduler.on_update_graph(graph_update(&options.client, &graph));

    let mut placed: BTreeMap<&str, usize> = BTreeMap::new();
    let mut clock = event::now();

    for (n, task) in graph.iter().enumerate() {
        let stimulus = format!("compute-task-{}", n);
        let host = &hosts[task.worker];
        let worker = &workers[task.worker];

        scheduler.on_transition(&task.key, "released", "waiting", &stimulus, None);
        scheduler.on_transition(&task.key, "waiting", "processing", &stimulus, None);
        report.scheduler_transitions += 2;

        for dep in &task.deps {
            let Some(&owner) = placed.get(dep.as_str()) else {
                continue;
            };
            if owner == task.worker {
                continue;
            }
            let record = transfer(&hosts[owner].name, dep, clock);
            clock = record.stop;
            hosts[owner]
                .log(TransferDirection::Outgoing)
                .lock()
                .push(TransferRecord {
                    peer: host.name.clone(),
                    ..record.clone()
                });
            host.log(TransferDirection::Incoming).lock().push(record);
            report.transfers += 2;
        }

        worker.on_transition(&task.key, "waiting", "ready");
        worker.on_transition(&task.key, "ready", "executing");

        let start = clock;
        clock += COMPUTE_SECS;
        worker.on_transition(&task.key, "executing", "memory");
        report.worker_transitions += 3;

        let metrics = TransitionMetrics {
            startstops: vec![StartStop {
                action: "compute".to_string(),
                start,
                stop: clock,
            }],
            thread: Some(1_000 + task.worker as u64),
            nbytes: Some(CHUNK_BYTES),
            worker: Some(host.name.clone()),
        };
        scheduler.on_transition(&task.key, "processing", "memory", &stimulus, Some(&metrics));
        report.scheduler_transitions += 1;

        placed.insert(&task.key, task.worker);
    }

    // Outgoing records logged after a worker's last transition still need one
    for worker in &workers {
        worker.on_transition("mean-0", "memory", "memory");
        report.worker_transitions += 1;
    }

    scheduler.on_log_event(
        "simulation",
        json!({ "keys": report.keys, "workers": report.workers }),
    );
    scheduler.on_remove_client(&options.client);

    for (host, worker) in hosts.iter().zip(&workers) {
        worker.on_teardown();
        scheduler.on_remove_worker(&host.name, "worker-close");
    }
    scheduler.on_before_close();
    scheduler.on_close();

    log.in_scope(|| {
        info!(
            keys = report.keys,
            transfers = report.transfers,
            "simulation finished"
        )
    });
    Ok(report)
}

/// Transfer of one chunk starting at `at`; `peer` is the sender
fn transfer(peer: &str, key: &str, at: f64) -> TransferRecord {
    let duration = CHUNK_BYTES as f64 / BANDWIDTH;
    TransferRecord {
        peer: peer.to_string(),
        keys: BTreeMap::from([(key.to_string(), CHUNK_BYTES)]),
        start: at,
        stop: at + duration,
        middle: at + duration / 2.0,
        duration,
        total: CHUNK_BYTES,
        compressed: 0,
        bandwidth: BANDWIDTH,
    }
}
