//! Topic policies: validation, partition selection, metadata serialization
//!
//! Applied by every backend to every push before anything is appended.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::Category;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validation {
    AcceptAll,
    /// Metadata must be an object naming a known category
    #[default]
    Category,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Partitioning {
    /// Everything lands in partition 0
    #[default]
    Single,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Serialization {
    #[default]
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TopicPolicy {
    #[serde(default)]
    pub validation: Validation,
    #[serde(default)]
    pub partitioning: Partitioning,
    #[serde(default)]
    pub serialization: Serialization,
}

impl TopicPolicy {
    pub fn accept_all() -> Self {
        Self {
            validation: Validation::AcceptAll,
            ..Self::default()
        }
    }

    /// Check one push against the policy; returns the partition it goes to
    pub fn admit(&self, metadata: &[u8]) -> Result<u32, String> {
        let meta = self.serialization.parse(metadata)?;
        self.validation.check(&meta)?;
        Ok(self.partitioning.select(&meta))
    }
}

impl Serialization {
    fn parse(self, metadata: &[u8]) -> Result<Value, String> {
        match self {
            Serialization::Json => serde_json::from_slice(metadata)
                .map_err(|e| format!("metadata is not JSON: {}", e)),
        }
    }
}

impl Validation {
    fn check(self, metadata: &Value) -> Result<(), String> {
        match self {
            Validation::AcceptAll => Ok(()),
            Validation::Category => {
                let name = metadata
                    .get("category")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "metadata has no \"category\" string".to_string())?;
                name.parse::<Category>().map(|_| ())
            }
        }
    }
}

impl Partitioning {
    fn select(self, _metadata: &Value) -> u32 {
        match self {
            Partitioning::Single => 0,
        }
    }
}
