//! Queue Types
//!
//! Queue classes, their wire tokens, and the lifecycle states a queue
//! moves through.

use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

use super::QueueError;

/// Queue class. The ordinal is the index into every 5-slot stats array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueType {
    #[serde(rename = "slow")]
    Slow = 0,
    #[serde(rename = "medium")]
    Medium = 1,
    #[serde(rename = "fast")]
    Fast = 2,
    #[serde(rename = "cache")]
    Cache = 3,
    #[serde(rename = "Lead")]
    Lead = 4,
}

impl QueueType {
    /// Every queue type in stats order
    pub const ALL: [QueueType; 5] = [
        QueueType::Slow,
        QueueType::Medium,
        QueueType::Fast,
        QueueType::Cache,
        QueueType::Lead,
    ];

    /// Types a Lead can spawn as children
    pub const WORKERS: [QueueType; 4] = [
        QueueType::Slow,
        QueueType::Medium,
        QueueType::Fast,
        QueueType::Cache,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Configuration token. Case-sensitive; the Lead's is capitalized.
    pub fn as_str(self) -> &'static str {
        match self {
            QueueType::Slow => "slow",
            QueueType::Medium => "medium",
            QueueType::Fast => "fast",
            QueueType::Cache => "cache",
            QueueType::Lead => "Lead",
        }
    }

    /// Name used in the stats schema
    pub fn stats_name(self) -> &'static str {
        match self {
            QueueType::Lead => "lead",
            other => other.as_str(),
        }
    }

    /// Single-letter tag
    pub fn tag(self) -> char {
        match self {
            QueueType::Slow => 'S',
            QueueType::Medium => 'M',
            QueueType::Fast => 'F',
            QueueType::Cache => 'C',
            QueueType::Lead => 'L',
        }
    }

    /// Tags a freshly created queue of this type carries
    pub fn default_tags(self) -> String {
        match self {
            QueueType::Lead => "LSMFC".to_string(),
            other => other.tag().to_string(),
        }
    }

    pub fn is_worker(self) -> bool {
        self != QueueType::Lead
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueType {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueueType::ALL
            .into_iter()
            .find(|queue_type| queue_type.as_str() == s)
            .ok_or_else(|| QueueError::UnknownQueueType(s.to_string()))
    }
}

/// Route a type hint to a Worker class.
///
/// Missing, empty and unrecognized hints all route to `Medium`.
pub fn select_type(hint: Option<&str>) -> QueueType {
    match hint {
        Some("slow") => QueueType::Slow,
        Some("medium") => QueueType::Medium,
        Some("fast") => QueueType::Fast,
        Some("cache") => QueueType::Cache,
        _ => QueueType::Medium,
    }
}

/// Lifecycle of a queue. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[repr(u8)]
pub enum QueueState {
    Created = 0,
    Connecting = 1,
    Bootstrapped = 2,
    Running = 3,
    ShuttingDown = 4,
    Destroyed = 5,
}

impl QueueState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => QueueState::Created,
            1 => QueueState::Connecting,
            2 => QueueState::Bootstrapped,
            3 => QueueState::Running,
            4 => QueueState::ShuttingDown,
            _ => QueueState::Destroyed,
        }
    }
}
