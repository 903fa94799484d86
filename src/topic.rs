//! Topic provisioning
//!
//! Emitters and the consumer all race to create the same well-known topic.
//! Exactly one creation succeeds; everyone else sees `TopicAlreadyExists` and
//! opens it. Any other creation failure is real and propagates.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

use crate::error::{Result, TelemetryError};
use crate::logging::LogContext;
use crate::transport::{Topic, TopicPolicy, Transport};

/// Topic the scheduler, workers and consumer meet on
pub const DEFAULT_TOPIC: &str = "Dask";

static TOPIC_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_.\-]{0,127}$").expect("topic name pattern is valid")
});

pub fn validate_name(name: &str) -> Result<()> {
    if TOPIC_NAME.is_match(name) && !name.contains("..") {
        Ok(())
    } else {
        Err(TelemetryError::InvalidTopicName {
            name: name.to_string(),
        })
    }
}

/// Create `name` if needed, then open it
pub fn open_or_create(
    service: &dyn Transport,
    name: &str,
    policy: &TopicPolicy,
    log: &LogContext,
) -> Result<Arc<dyn Topic>> {
    validate_name(name)?;

    let _entered = log.span().enter();
    match service.create_topic(name, policy) {
        Ok(()) => info!(topic = name, protocol = service.protocol(), "topic created"),
        Err(e) if e.is_already_exists() => info!(topic = name, "topic already exists"),
        Err(e) => return Err(e),
    }

    let topic = service.open_topic(name)?;
    info!(topic = name, "topic opened");
    Ok(topic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[test]
    fn accepts_well_known_names() {
        assert!(validate_name("Dask").is_ok());
        assert!(validate_name("dask.events-v2_b").is_ok());
    }

    #[test]
    fn rejects_paths_and_empty_names() {
        for bad in ["", "1abc", "a/b", "../x", "a..b", "with space"] {
            assert!(validate_name(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn second_open_or_create_succeeds() {
        let service = MemoryTransport::new();
        let log = LogContext::new("test");
        let policy = TopicPolicy::default();

        let a = open_or_create(&service, "Dask", &policy, &log).unwrap();
        let b = open_or_create(&service, "Dask", &policy, &log).unwrap();
        assert_eq!(a.name(), b.name());
    }

    #[test]
    fn other_creation_failures_propagate() {
        let service = MemoryTransport::new();
        service.fail_next_create("service unavailable");

        let err = open_or_create(&service, "Dask", &TopicPolicy::default(), &LogContext::new("t"))
            .err()
            .unwrap();
        assert!(matches!(err, TelemetryError::Transport(_)));
    }
}
