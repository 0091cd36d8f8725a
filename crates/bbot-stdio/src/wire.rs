//! Line-delimited JSON wire format.
//!
//! Inbound: `{"source_id": "42", "kind": "ping", "payload": {...}}` per line
//! (`source_id` may also be an integer). Outbound:
//! `{"source_id": "42", "reply": ..., "sent_at": "..."}` per line.

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bbot_core::domain::{Event, SourceId};

#[derive(Debug, Deserialize)]
struct InboundLine {
    source_id: serde_json::Value,
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct OutboundLine<'a> {
    pub source_id: &'a SourceId,
    pub reply: &'a serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

pub fn parse_event(line: &str, received_at: DateTime<Utc>) -> anyhow::Result<Event> {
    let raw: InboundLine = serde_json::from_str(line).context("malformed event line")?;

    let source_id = match raw.source_id {
        serde_json::Value::String(s) => s.trim().to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        other => bail!("source_id must be a string or number, got {other}"),
    };
    if source_id.is_empty() {
        bail!("source_id must not be empty");
    }

    let kind = raw.kind.trim().to_string();
    if kind.is_empty() {
        bail!("kind must not be empty");
    }

    Ok(Event {
        source_id: SourceId(source_id),
        kind,
        payload: raw.payload,
        received_at,
    })
}

pub fn render_reply(
    source_id: &SourceId,
    reply: &serde_json::Value,
    sent_at: DateTime<Utc>,
) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(&OutboundLine {
        source_id,
        reply,
        sent_at,
    })?;
    line.push('\n');
    Ok(line)
}
