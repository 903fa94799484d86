//! Event taxonomy
//!
//! - `Category`: the 14 lifecycle categories, stable snake_case wire names
//! - `EventKind`: one typed payload per category (closed set)
//! - `Event`: envelope with wall-clock time + kind

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wall-clock seconds since the Unix epoch
pub fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Event category; the wire name doubles as the hook name that emits it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    // ═══════════════════════════════════════════
    // SCHEDULER
    // ═══════════════════════════════════════════
    Start,
    BeforeClose,
    Close,
    UpdateGraph,
    Restart,
    SchedulerTransition,
    AddWorker,
    RemoveWorker,
    AddClient,
    RemoveClient,
    LogEvent,

    // ═══════════════════════════════════════════
    // WORKER
    // ═══════════════════════════════════════════
    Teardown,
    WorkerTransition,
    WorkerTransfer,
}

impl Category {
    pub const ALL: [Category; 14] = [
        Category::Start,
        Category::BeforeClose,
        Category::Close,
        Category::UpdateGraph,
        Category::Restart,
        Category::SchedulerTransition,
        Category::AddWorker,
        Category::RemoveWorker,
        Category::AddClient,
        Category::RemoveClient,
        Category::LogEvent,
        Category::Teardown,
        Category::WorkerTransition,
        Category::WorkerTransfer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Start => "start",
            Category::BeforeClose => "before_close",
            Category::Close => "close",
            Category::UpdateGraph => "update_graph",
            Category::Restart => "restart",
            Category::SchedulerTransition => "scheduler_transition",
            Category::AddWorker => "add_worker",
            Category::RemoveWorker => "remove_worker",
            Category::AddClient => "add_client",
            Category::RemoveClient => "remove_client",
            Category::LogEvent => "log_event",
            Category::Teardown => "teardown",
            Category::WorkerTransition => "worker_transition",
            Category::WorkerTransfer => "worker_transfer",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown category '{}'", s))
    }
}

// ═══════════════════════════════════════════════════════════════
// Payloads
// ═══════════════════════════════════════════════════════════════

/// start / before_close / close / restart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerLifecycle {
    pub address: String,
}

/// A graph submitted by a client
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GraphUpdate {
    pub client: String,
    pub keys: BTreeSet<String>,
    #[serde(default)]
    pub tasks: Vec<String>,
    /// annotation name → { key → value }
    #[serde(default)]
    pub annotations: BTreeMap<String, Value>,
    #[serde(default)]
    pub priority: BTreeMap<String, Value>,
    pub dependencies: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerTransition {
    pub key: String,
    pub start: String,
    pub finish: String,
    pub stimulus_id: String,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    /// Scheduler address
    pub called_from: String,
    #[serde(default)]
    pub worker: Option<String>,
    #[serde(default)]
    pub thread: Option<u64>,
    #[serde(default)]
    pub begins: Option<f64>,
    #[serde(default)]
    pub ends: Option<f64>,
    #[serde(default)]
    pub duration: Option<f64>,
    /// Output size in bytes
    #[serde(default)]
    pub size: Option<u64>,
}

/// add_worker / remove_worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMembership {
    pub worker: String,
    #[serde(default)]
    pub stimulus_id: String,
}

/// add_client / remove_client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMembership {
    pub client: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub topic: String,
    pub message: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTeardown {
    pub worker: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTransition {
    pub key: String,
    pub start: String,
    pub finish: String,
    /// Worker name
    pub called_from: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Incoming,
    Outgoing,
}

impl TransferDirection {
    pub const BOTH: [TransferDirection; 2] = [TransferDirection::Incoming, TransferDirection::Outgoing];
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::Incoming => f.write_str("incoming"),
            TransferDirection::Outgoing => f.write_str("outgoing"),
        }
    }
}

/// One entry of a worker's transfer log, as kept by the host
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Remote worker address
    #[serde(alias = "who")]
    pub peer: String,
    /// key → nbytes
    pub keys: BTreeMap<String, u64>,
    pub start: f64,
    pub stop: f64,
    #[serde(default)]
    pub middle: f64,
    pub duration: f64,
    /// Total bytes moved
    pub total: u64,
    #[serde(default)]
    pub compressed: u64,
    /// Bytes per second
    #[serde(default)]
    pub bandwidth: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTransfer {
    pub direction: TransferDirection,
    pub called_from: String,
    #[serde(flatten)]
    pub record: TransferRecord,
}

// ═══════════════════════════════════════════════════════════════
// Kind + envelope
// ═══════════════════════════════════════════════════════════════

/// One typed payload per category
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Start(SchedulerLifecycle),
    BeforeClose(SchedulerLifecycle),
    Close(SchedulerLifecycle),
    UpdateGraph(GraphUpdate),
    Restart(SchedulerLifecycle),
    SchedulerTransition(SchedulerTransition),
    AddWorker(WorkerMembership),
    RemoveWorker(WorkerMembership),
    AddClient(ClientMembership),
    RemoveClient(ClientMembership),
    LogEvent(LogEntry),
    Teardown(WorkerTeardown),
    WorkerTransition(WorkerTransition),
    WorkerTransfer(WorkerTransfer),
}

impl EventKind {
    pub fn category(&self) -> Category {
        match self {
            EventKind::Start(_) => Category::Start,
            EventKind::BeforeClose(_) => Category::BeforeClose,
            EventKind::Close(_) => Category::Close,
            EventKind::UpdateGraph(_) => Category::UpdateGraph,
            EventKind::Restart(_) => Category::Restart,
            EventKind::SchedulerTransition(_) => Category::SchedulerTransition,
            EventKind::AddWorker(_) => Category::AddWorker,
            EventKind::RemoveWorker(_) => Category::RemoveWorker,
            EventKind::AddClient(_) => Category::AddClient,
            EventKind::RemoveClient(_) => Category::RemoveClient,
            EventKind::LogEvent(_) => Category::LogEvent,
            EventKind::Teardown(_) => Category::Teardown,
            EventKind::WorkerTransition(_) => Category::WorkerTransition,
            EventKind::WorkerTransfer(_) => Category::WorkerTransfer,
        }
    }

    /// Payload fields as a JSON object (declaration order)
    pub fn fields(&self) -> Result<Value, serde_json::Error> {
        match self {
            EventKind::Start(p)
            | EventKind::BeforeClose(p)
            | EventKind::Close(p)
            | EventKind::Restart(p) => serde_json::to_value(p),
            EventKind::UpdateGraph(p) => serde_json::to_value(p),
            EventKind::SchedulerTransition(p) => serde_json::to_value(p),
            EventKind::AddWorker(p) | EventKind::RemoveWorker(p) => serde_json::to_value(p),
            EventKind::AddClient(p) | EventKind::RemoveClient(p) => serde_json::to_value(p),
            EventKind::LogEvent(p) => serde_json::to_value(p),
            EventKind::Teardown(p) => serde_json::to_value(p),
            EventKind::WorkerTransition(p) => serde_json::to_value(p),
            EventKind::WorkerTransfer(p) => serde_json::to_value(p),
        }
    }
}

/// Single event on the telemetry topic
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Seconds since the Unix epoch, taken when the hook fired
    pub time: f64,
    pub kind: EventKind,
}

impl Event {
    /// Stamp a payload with the current wall-clock time
    pub fn now(kind: EventKind) -> Self {
        Self { time: now(), kind }
    }

    pub fn at(time: f64, kind: EventKind) -> Self {
        Self { time, kind }
    }

    pub fn category(&self) -> Category {
        self.kind.category()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn category_names_round_trip_through_from_str() {
        for category in Category::ALL {
            assert_eq!(category.as_str().parse::<Category>(), Ok(category));
        }
        assert!("restrat".parse::<Category>().is_err());
    }

    #[test]
    fn category_serde_matches_as_str() {
        for category in Category::ALL {
            let json = serde_json::to_value(category).unwrap();
            assert_eq!(json, json!(category.as_str()));
        }
    }

    #[test]
    fn kind_reports_its_category() {
        let kind = EventKind::RemoveWorker(WorkerMembership {
            worker: "w1".into(),
            stimulus_id: "s1".into(),
        });
        assert_eq!(kind.category(), Category::RemoveWorker);
        assert_eq!(kind.category().to_string(), "remove_worker");
    }

    #[test]
    fn transfer_fields_flatten_the_record() {
        let kind = EventKind::WorkerTransfer(WorkerTransfer {
            direction: TransferDirection::Outgoing,
            called_from: "w1".into(),
            record: TransferRecord {
                peer: "tcp://10.0.0.2:4000".into(),
                keys: BTreeMap::from([("x".to_string(), 8)]),
                total: 8,
                ..Default::default()
            },
        });

        let fields = kind.fields().unwrap();
        assert_eq!(fields["direction"], "outgoing");
        assert_eq!(fields["peer"], "tcp://10.0.0.2:4000");
        assert_eq!(fields["keys"]["x"], 8);
    }

    #[test]
    fn transfer_record_accepts_host_field_name() {
        let record: TransferRecord = serde_json::from_value(json!({
            "who": "tcp://w2",
            "keys": {"y": 16},
            "start": 1.0,
            "stop": 2.0,
            "duration": 1.0,
            "total": 16
        }))
        .unwrap();
        assert_eq!(record.peer, "tcp://w2");
        assert_eq!(record.compressed, 0);
    }

    #[test]
    fn now_is_after_2020() {
        assert!(now() > 1_577_836_800.0);
    }
}
