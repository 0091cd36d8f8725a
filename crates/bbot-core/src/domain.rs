use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of the origin of an event (a user, a chat, a queue partition).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An inbound unit of work. Never mutated after the source produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub source_id: SourceId,
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl Event {
    pub fn new(
        source_id: impl Into<SourceId>,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            kind: kind.into(),
            payload,
            received_at: Utc::now(),
        }
    }
}

/// A persisted key/value unit owned by the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: String,
    pub value: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerStatus {
    Ok,
    Failed,
    Ignored,
}

/// Outcome of processing one event.
#[derive(Clone, Debug, PartialEq)]
pub struct HandlerResult {
    pub status: HandlerStatus,
    pub reply: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl HandlerResult {
    pub fn ok() -> Self {
        Self {
            status: HandlerStatus::Ok,
            reply: None,
            error: None,
        }
    }

    pub fn reply(data: impl Into<serde_json::Value>) -> Self {
        Self {
            status: HandlerStatus::Ok,
            reply: Some(data.into()),
            error: None,
        }
    }

    pub fn ignored() -> Self {
        Self {
            status: HandlerStatus::Ignored,
            reply: None,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: HandlerStatus::Failed,
            reply: None,
            error: Some(error.into()),
        }
    }
}
