//! Wire codec
//!
//! An event travels as two byte strings:
//! - metadata: `{"category": "<name>"}`
//! - data: `{"time": <secs>, ...payload fields}`
//!
//! The category in the metadata selects the payload type on decode, so a
//! payload that does not match its category is a decode failure.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TelemetryError};
use crate::event::{Category, Event, EventKind};

/// Metadata attached to every pushed event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub category: Category,
}

/// An encoded event, ready for `Producer::push`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub metadata: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Serialize)]
struct BodyRef<'a, T> {
    time: f64,
    #[serde(flatten)]
    fields: &'a T,
}

#[derive(Deserialize)]
struct Body<T> {
    time: f64,
    #[serde(flatten)]
    fields: T,
}

pub fn encode_metadata(category: Category) -> Vec<u8> {
    // A unit enum inside a one-field struct cannot fail to serialize
    serde_json::to_vec(&EventMetadata { category }).unwrap_or_default()
}

fn body<T: Serialize>(time: f64, fields: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&BodyRef { time, fields })?)
}

/// JSON has no encoding for NaN or infinities; serde_json would write `null`
/// and the payload would no longer decode
fn check_finite(event: &Event) -> Result<()> {
    let mut fields = vec![("time", event.time)];
    match &event.kind {
        EventKind::SchedulerTransition(p) => {
            for (field, value) in [("begins", p.begins), ("ends", p.ends), ("duration", p.duration)] {
                if let Some(value) = value {
                    fields.push((field, value));
                }
            }
        }
        EventKind::WorkerTransfer(p) => {
            let r = &p.record;
            fields.extend([
                ("start", r.start),
                ("stop", r.stop),
                ("middle", r.middle),
                ("duration", r.duration),
                ("bandwidth", r.bandwidth),
            ]);
        }
        _ => {}
    }

    match fields.into_iter().find(|(_, value)| !value.is_finite()) {
        Some((field, value)) => Err(TelemetryError::NonFinite {
            category: event.category(),
            field,
            value,
        }),
        None => Ok(()),
    }
}

/// Encode an event; non-finite floats are rejected rather than written as `null`
pub fn encode(event: &Event) -> Result<Encoded> {
    check_finite(event)?;
    let t = event.time;
    let data = match &event.kind {
        EventKind::Start(p)
        | EventKind::BeforeClose(p)
        | EventKind::Close(p)
        | EventKind::Restart(p) => body(t, p)?,
        EventKind::UpdateGraph(p) => body(t, p)?,
        EventKind::SchedulerTransition(p) => body(t, p)?,
        EventKind::AddWorker(p) | EventKind::RemoveWorker(p) => body(t, p)?,
        EventKind::AddClient(p) | EventKind::RemoveClient(p) => body(t, p)?,
        EventKind::LogEvent(p) => body(t, p)?,
        EventKind::Teardown(p) => body(t, p)?,
        EventKind::WorkerTransition(p) => body(t, p)?,
        EventKind::WorkerTransfer(p) => body(t, p)?,
    };

    Ok(Encoded {
        metadata: encode_metadata(event.category()),
        data,
    })
}

/// Read the category out of raw metadata
pub fn decode_metadata(metadata: &[u8]) -> Result<EventMetadata> {
    serde_json::from_slice(metadata)
        .map_err(|e| TelemetryError::decode(format!("metadata: {}", e)))
}

fn payload<T: DeserializeOwned>(category: Category, data: &[u8]) -> Result<(f64, T)> {
    let body: Body<T> = serde_json::from_slice(data)
        .map_err(|e| TelemetryError::decode(format!("{} payload: {}", category, e)))?;
    Ok((body.time, body.fields))
}

pub fn decode(metadata: &[u8], data: &[u8]) -> Result<Event> {
    let category = decode_metadata(metadata)?.category;

    let (time, kind) = match category {
        Category::Start => payload(category, data).map(|(t, p)| (t, EventKind::Start(p)))?,
        Category::BeforeClose => {
            payload(category, data).map(|(t, p)| (t, EventKind::BeforeClose(p)))?
        }
        Category::Close => payload(category, data).map(|(t, p)| (t, EventKind::Close(p)))?,
        Category::UpdateGraph => {
            payload(category, data).map(|(t, p)| (t, EventKind::UpdateGraph(p)))?
        }
        Category::Restart => payload(category, data).map(|(t, p)| (t, EventKind::Restart(p)))?,
        Category::SchedulerTransition => {
            payload(category, data).map(|(t, p)| (t, EventKind::SchedulerTransition(p)))?
        }
        Category::AddWorker => {
            payload(category, data).map(|(t, p)| (t, EventKind::AddWorker(p)))?
        }
        Category::RemoveWorker => {
            payload(category, data).map(|(t, p)| (t, EventKind::RemoveWorker(p)))?
        }
        Category::AddClient => {
            payload(category, data).map(|(t, p)| (t, EventKind::AddClient(p)))?
        }
        Category::RemoveClient => {
            payload(category, data).map(|(t, p)| (t, EventKind::RemoveClient(p)))?
        }
        Category::LogEvent => payload(category, data).map(|(t, p)| (t, EventKind::LogEvent(p)))?,
        Category::Teardown => payload(category, data).map(|(t, p)| (t, EventKind::Teardown(p)))?,
        Category::WorkerTransition => {
            payload(category, data).map(|(t, p)| (t, EventKind::WorkerTransition(p)))?
        }
        Category::WorkerTransfer => {
            payload(category, data).map(|(t, p)| (t, EventKind::WorkerTransfer(p)))?
        }
    };

    Ok(Event { time, kind })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};

    fn transition() -> Event {
        Event::at(
            1_700_000_000.25,
            EventKind::SchedulerTransition(SchedulerTransition {
                key: "inc-1".into(),
                start: "processing".into(),
                finish: "memory".into(),
                stimulus_id: "task-finished-1".into(),
                prefix: Some("inc".into()),
                group: Some("inc-abc".into()),
                called_from: "tcp://127.0.0.1:8786".into(),
                worker: Some("tcp://127.0.0.1:4001".into()),
                thread: Some(140_000),
                begins: Some(1.5),
                ends: Some(2.0),
                duration: Some(0.5),
                size: Some(28),
            }),
        )
    }

    #[test]
    fn metadata_names_category() {
        let encoded = encode(&transition()).unwrap();
        let meta: serde_json::Value = serde_json::from_slice(&encoded.metadata).unwrap();
        assert_eq!(meta, json!({"category": "scheduler_transition"}));
    }

    #[test]
    fn data_carries_time_and_flat_fields() {
        let encoded = encode(&transition()).unwrap();
        let data: serde_json::Value = serde_json::from_slice(&encoded.data).unwrap();
        assert_eq!(data["time"], 1_700_000_000.25);
        assert_eq!(data["key"], "inc-1");
        assert_eq!(data["size"], 28);
    }

    #[test]
    fn decode_restores_typed_payload() {
        let event = transition();
        let encoded = encode(&event).unwrap();
        assert_eq!(decode(&encoded.metadata, &encoded.data).unwrap(), event);
    }

    #[test]
    fn graph_update_defaults_missing_collections() {
        let data = json!({"time": 1.0, "client": "c1", "keys": ["x"], "dependencies": {}});
        let event = decode(
            &encode_metadata(Category::UpdateGraph),
            data.to_string().as_bytes(),
        )
        .unwrap();

        let EventKind::UpdateGraph(update) = event.kind else {
            panic!("expected update_graph");
        };
        assert_eq!(update.keys, BTreeSet::from(["x".to_string()]));
        assert!(update.tasks.is_empty());
        assert_eq!(update.dependencies, BTreeMap::new());
    }

    #[test]
    fn nested_transfer_record_decodes() {
        let event = Event::at(
            5.0,
            EventKind::WorkerTransfer(WorkerTransfer {
                direction: TransferDirection::Incoming,
                called_from: "w1".into(),
                record: TransferRecord {
                    peer: "tcp://w2".into(),
                    keys: BTreeMap::from([("y".to_string(), 16)]),
                    start: 1.0,
                    stop: 3.0,
                    middle: 2.0,
                    duration: 2.0,
                    total: 16,
                    compressed: 0,
                    bandwidth: 8.0,
                },
            }),
        );
        let encoded = encode(&event).unwrap();
        assert_eq!(decode(&encoded.metadata, &encoded.data).unwrap(), event);
    }

    #[test]
    fn infinite_bandwidth_is_rejected() {
        let event = Event::at(
            5.0,
            EventKind::WorkerTransfer(WorkerTransfer {
                direction: TransferDirection::Outgoing,
                called_from: "w1".into(),
                record: TransferRecord {
                    peer: "tcp://w2".into(),
                    duration: 0.0,
                    bandwidth: f64::INFINITY,
                    ..Default::default()
                },
            }),
        );
        let err = encode(&event).unwrap_err();
        assert!(matches!(
            err,
            TelemetryError::NonFinite { field: "bandwidth", .. }
        ));
        assert!(err.to_string().contains("worker_transfer"));
    }

    #[test]
    fn nan_transition_duration_is_rejected() {
        let mut event = transition();
        if let EventKind::SchedulerTransition(p) = &mut event.kind {
            p.duration = Some(f64::NAN);
        }
        let err = encode(&event).unwrap_err();
        assert!(matches!(err, TelemetryError::NonFinite { field: "duration", .. }));
    }

    #[test]
    fn absent_optional_metrics_still_encode() {
        let mut event = transition();
        if let EventKind::SchedulerTransition(p) = &mut event.kind {
            p.begins = None;
            p.ends = None;
            p.duration = None;
        }
        let encoded = encode(&event).unwrap();
        assert_eq!(decode(&encoded.metadata, &encoded.data).unwrap(), event);
    }

    #[test]
    fn unknown_category_is_decode_error() {
        let err = decode(br#"{"category":"restrat"}"#, br#"{"time":1.0}"#).unwrap_err();
        assert!(matches!(err, TelemetryError::Decode { .. }));
    }

    #[test]
    fn payload_mismatching_category_is_decode_error() {
        let err = decode(
            &encode_metadata(Category::AddWorker),
            br#"{"time": 1.0, "client": "c1"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("add_worker payload"));
    }

    #[test]
    fn garbage_bytes_are_decode_error() {
        let err = decode(&encode_metadata(Category::Close), b"{'time': 1.0}").unwrap_err();
        assert!(matches!(err, TelemetryError::Decode { .. }));
    }
}
