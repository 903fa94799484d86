//! Deployment initialization
//!
//! Writes `taskpulse.yaml` and the group descriptor it points at.

use anyhow::Result;
use std::fs;
use std::path::Path;

use crate::config::{DEFAULT_CONFIG_FILE, DEFAULT_GROUP_FILE};

const DATA_DIR: &str = "taskpulse-data";

/// Initialize a deployment in `dir` (created if missing)
pub fn init_deployment(dir: &Path) -> Result<InitResult> {
    let config = dir.join(DEFAULT_CONFIG_FILE);
    if config.exists() {
        anyhow::bail!("{} already exists in {}", DEFAULT_CONFIG_FILE, dir.display());
    }

    fs::create_dir_all(dir.join(DATA_DIR))?;

    let group = group_name(dir);
    fs::write(&config, CONFIG_TEMPLATE)?;
    fs::write(
        dir.join(DEFAULT_GROUP_FILE),
        GROUP_TEMPLATE.replace("{{group}}", &group),
    )?;

    Ok(InitResult {
        deployment_dir: dir.display().to_string(),
        group,
        files_created: vec![
            DEFAULT_CONFIG_FILE.to_string(),
            DEFAULT_GROUP_FILE.to_string(),
            format!("{}/", DATA_DIR),
        ],
    })
}

fn group_name(dir: &Path) -> String {
    dir.canonicalize()
        .ok()
        .and_then(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
        .unwrap_or_else(|| "taskpulse".to_string())
}

/// Result of deployment initialization
pub struct InitResult {
    pub deployment_dir: String,
    pub group: String,
    pub files_created: Vec<String>,
}

const CONFIG_TEMPLATE: &str = r#"# taskpulse configuration
# Run the consumer with: taskpulse consume

transport:
  # local (shared directory) or memory (single process)
  protocol: local
  group_file: taskpulse.group.yaml
  poll_interval_ms: 50

topic: Dask
output_dir: .

# Log to a file instead of stderr
# log_file: taskpulse.log
"#;

const GROUP_TEMPLATE: &str = r#"# Processes sharing this file publish to and consume from the same topics
group: {{group}}
root: taskpulse-data
"#;
