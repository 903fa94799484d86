//! Process configuration
//!
//! Loaded from `taskpulse.yaml` when present; every field has a default and
//! CLI flags override file values. Relative paths in a config file resolve
//! against that file's directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TelemetryError};
use crate::topic::{validate_name, DEFAULT_TOPIC};

pub const DEFAULT_CONFIG_FILE: &str = "taskpulse.yaml";
pub const DEFAULT_GROUP_FILE: &str = "taskpulse.group.yaml";
pub const DEFAULT_PROTOCOL: &str = "local";
const DEFAULT_POLL_MS: u64 = 50;

/// Where and how to reach the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// `local` or `memory`
    pub protocol: String,
    /// Group descriptor; for `memory` only its path matters (it names the group)
    pub group_file: PathBuf,
    /// Consumer poll interval for the `local` backend
    pub poll_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            protocol: DEFAULT_PROTOCOL.to_string(),
            group_file: PathBuf::from(DEFAULT_GROUP_FILE),
            poll_interval_ms: DEFAULT_POLL_MS,
        }
    }
}

impl TransportConfig {
    /// In-process transport shared by everything naming `group`
    pub fn memory(group: &str) -> Self {
        Self {
            protocol: "memory".to_string(),
            group_file: PathBuf::from(group),
            ..Self::default()
        }
    }

    /// Directory-backed transport described by `group_file`
    pub fn local(group_file: impl Into<PathBuf>) -> Self {
        Self {
            protocol: "local".to_string(),
            group_file: group_file.into(),
            ..Self::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub transport: TransportConfig,
    pub topic: String,
    /// Where the consumer writes its tables
    pub output_dir: PathBuf,
    /// Log to this file instead of stderr
    pub log_file: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            transport: TransportConfig::default(),
            topic: DEFAULT_TOPIC.to_string(),
            output_dir: PathBuf::from("."),
            log_file: None,
        }
    }
}

impl TelemetryConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        let mut config: TelemetryConfig = serde_yaml::from_str(&yaml)?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.transport.group_file = resolve(base, &config.transport.group_file);
        config.output_dir = resolve(base, &config.output_dir);
        config.log_file = config.log_file.map(|p| resolve(base, &p));

        config.validate()?;
        Ok(config)
    }

    /// Explicit path must exist; otherwise `taskpulse.yaml` is used if present
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::load(Path::new(DEFAULT_CONFIG_FILE))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.transport.protocol.trim().is_empty() {
            return Err(TelemetryError::Config("transport.protocol is empty".into()));
        }
        if self.transport.poll_interval_ms == 0 {
            return Err(TelemetryError::Config(
                "transport.poll_interval_ms must be positive".into(),
            ));
        }
        validate_name(&self.topic)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_relative() && base != Path::new("") {
        base.join(path)
    } else {
        path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let config = TelemetryConfig::default();
        assert_eq!(config.transport.protocol, "local");
        assert_eq!(config.transport.group_file, PathBuf::from("taskpulse.group.yaml"));
        assert_eq!(config.topic, "Dask");
        assert_eq!(config.transport.poll_interval(), Duration::from_millis(50));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taskpulse.yaml");
        std::fs::write(&path, "topic: Numerics\n").unwrap();

        let config = TelemetryConfig::load(&path).unwrap();
        assert_eq!(config.topic, "Numerics");
        assert_eq!(config.transport.protocol, "local");
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taskpulse.yaml");
        std::fs::write(
            &path,
            "transport:\n  group_file: group.yaml\noutput_dir: out\nlog_file: /tmp/tp.log\n",
        )
        .unwrap();

        let config = TelemetryConfig::load(&path).unwrap();
        assert_eq!(config.transport.group_file, dir.path().join("group.yaml"));
        assert_eq!(config.output_dir, dir.path().join("out"));
        assert_eq!(config.log_file, Some(PathBuf::from("/tmp/tp.log")));
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let mut config = TelemetryConfig::default();
        config.transport.poll_interval_ms = 0;
        assert!(matches!(config.validate(), Err(TelemetryError::Config(_))));

        let mut config = TelemetryConfig::default();
        config.topic = "bad/topic".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn yaml_round_trip() {
        let config = TelemetryConfig {
            transport: TransportConfig::memory("g"),
            ..TelemetryConfig::default()
        };
        let parsed: TelemetryConfig = serde_yaml::from_str(&config.to_yaml().unwrap()).unwrap();
        assert_eq!(parsed, config);
    }
}
