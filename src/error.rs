//! Error types with fix suggestions
//!
//! Every failure in the pipeline is one of these variants. Emitters never let
//! them escape a hook: they end up as log records. The consumer and the CLI
//! surface them to the caller.

use std::path::PathBuf;

use thiserror::Error;

use crate::event::Category;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

#[derive(Error, Debug)]
pub enum TelemetryError {
    // ─────────────────────────────────────────────────────────────
    // Topic provisioning
    // ─────────────────────────────────────────────────────────────
    #[error("Topic '{name}' already exists")]
    TopicAlreadyExists { name: String },

    #[error("Topic '{name}' does not exist")]
    TopicNotFound { name: String },

    #[error("Invalid topic name '{name}'")]
    InvalidTopicName { name: String },

    // ─────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────
    #[error("Unsupported transport protocol '{protocol}'")]
    UnsupportedProtocol { protocol: String },

    #[error("Cannot load group descriptor {path}: {details}")]
    GroupDescriptor { path: PathBuf, details: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Topic '{topic}' rejected event: {reason}")]
    Rejected { topic: String, reason: String },

    #[error("Consumer '{name}' is closed")]
    ConsumerClosed { name: String },

    // ─────────────────────────────────────────────────────────────
    // Pipeline
    // ─────────────────────────────────────────────────────────────
    #[error("Failed to publish '{category}' event: {reason}")]
    Publish { category: Category, reason: String },

    #[error("Failed to decode event: {reason}")]
    Decode { reason: String },

    #[error("'{category}' field '{field}' is not a finite number ({value})")]
    NonFinite {
        category: Category,
        field: &'static str,
        value: f64,
    },

    #[error("Failed to release {resource}: {reason}")]
    ResourceTeardown { resource: String, reason: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration and I/O
    // ─────────────────────────────────────────────────────────────
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl TelemetryError {
    pub fn decode(reason: impl Into<String>) -> Self {
        TelemetryError::Decode {
            reason: reason.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        TelemetryError::Transport(reason.into())
    }

    /// The one creation failure the provisioning layer tolerates
    pub fn is_already_exists(&self) -> bool {
        matches!(self, TelemetryError::TopicAlreadyExists { .. })
    }
}

impl FixSuggestion for TelemetryError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            TelemetryError::TopicAlreadyExists { .. } => None,
            TelemetryError::TopicNotFound { .. } => {
                Some("Start an emitter or consumer first; both create the topic on connect")
            }
            TelemetryError::InvalidTopicName { .. } => {
                Some("Topic names start with a letter and use only letters, digits, '_', '.', '-'")
            }
            TelemetryError::UnsupportedProtocol { .. } => {
                Some("Use --protocol local (shared directory) or --protocol memory (single process)")
            }
            TelemetryError::GroupDescriptor { .. } => {
                Some("Run `taskpulse init` to write a group descriptor, or pass --group-file")
            }
            TelemetryError::Transport(_) => Some("Check the transport root directory is writable"),
            TelemetryError::Rejected { .. } => {
                Some("Metadata must be a JSON object with a known \"category\"")
            }
            TelemetryError::ConsumerClosed { .. } => None,
            TelemetryError::Publish { .. } => None,
            TelemetryError::Decode { .. } => None,
            TelemetryError::NonFinite { .. } => {
                Some("Times, durations and bandwidths must be finite; check the host's clock and counters")
            }
            TelemetryError::ResourceTeardown { .. } => None,
            TelemetryError::Config(_) => Some("Check taskpulse.yaml against `taskpulse init` output"),
            TelemetryError::Io(_) => Some("Check file path and permissions"),
            TelemetryError::Json(_) => None,
            TelemetryError::Yaml(_) => Some("Check YAML syntax: indentation and quoting"),
            TelemetryError::Csv(_) => Some("Check the output directory is writable"),
        }
    }
}

pub type Result<T, E = TelemetryError> = std::result::Result<T, E>;
