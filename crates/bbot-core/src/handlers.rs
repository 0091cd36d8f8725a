//! Built-in handlers: liveness counter, per-source quiz sessions and the
//! score leaderboard.
//!
//! Every record kind lives under its own fixed prefix (`count:`, `score:`,
//! `session:`) followed by the source id, so no source id can reach another
//! kind's key.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    answer,
    dispatch::{BotContext, Handler},
    domain::{Event, HandlerResult, SourceId},
    errors::Error,
    store::Store,
    Result,
};

pub const COUNT_PREFIX: &str = "count:";
pub const SCORE_PREFIX: &str = "score:";
pub const SESSION_PREFIX: &str = "session:";
const MAX_LEADERBOARD: u64 = 100;

pub fn count_key(source: &SourceId) -> String {
    format!("{COUNT_PREFIX}{source}")
}

pub fn score_key(source: &SourceId) -> String {
    format!("{SCORE_PREFIX}{source}")
}

pub fn session_key(source: &SourceId) -> String {
    format!("{SESSION_PREFIX}{source}")
}

/// All built-in handlers with the kinds they are registered under.
pub fn builtin() -> Vec<(&'static str, Arc<dyn Handler>)> {
    vec![
        ("ping", Arc::new(PingHandler) as Arc<dyn Handler>),
        ("ask", Arc::new(AskHandler) as Arc<dyn Handler>),
        ("answer", Arc::new(AnswerHandler) as Arc<dyn Handler>),
        ("hint", Arc::new(HintHandler) as Arc<dyn Handler>),
        ("top", Arc::new(TopHandler) as Arc<dyn Handler>),
        ("reset", Arc::new(ResetHandler) as Arc<dyn Handler>),
    ]
}

/// Counts pings per source under `count:<source>` and answers `"pong"`.
pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(&self, ctx: &BotContext, event: &Event) -> Result<HandlerResult> {
        let key = count_key(&event.source_id);
        let count = match ctx.store.get(&key).await {
            Ok(r) => r
                .value
                .as_u64()
                .ok_or_else(|| Error::Handler(format!("malformed counter {key}: {}", r.value)))?,
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e),
        };
        ctx.store.put(&key, json!(count + 1)).await?;
        Ok(HandlerResult::reply("pong"))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub name: String,
    pub score: u64,
}

/// The question a source is currently working on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub question: String,
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default)]
    pub solved: bool,
}

fn required_str(payload: &Value, field: &str) -> Result<String> {
    match payload.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        _ => Err(Error::Handler(format!(
            "payload.{field} must be a non-empty string"
        ))),
    }
}

fn optional_str(payload: &Value, field: &str) -> Result<Option<String>> {
    match payload.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(Some(s.trim().to_string())),
        Some(other) => Err(Error::Handler(format!(
            "payload.{field} must be a non-empty string, got {other}"
        ))),
    }
}

async fn load_session(store: &dyn Store, source: &SourceId) -> Result<Option<Session>> {
    let key = session_key(source);
    match store.get(&key).await {
        Ok(r) => serde_json::from_value(r.value)
            .map(Some)
            .map_err(|e| Error::Handler(format!("malformed session {key}: {e}"))),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Adds one point to `source`'s score and returns the new total. `name`
/// replaces the stored display name when given.
pub async fn award_point(
    store: &dyn Store,
    source: &SourceId,
    name: Option<String>,
) -> Result<u64> {
    let key = score_key(source);
    let mut entry = match store.get(&key).await {
        Ok(r) => serde_json::from_value::<ScoreEntry>(r.value)
            .map_err(|e| Error::Handler(format!("malformed score record {key}: {e}")))?,
        Err(e) if e.is_not_found() => ScoreEntry {
            name: source.to_string(),
            score: 0,
        },
        Err(e) => return Err(e),
    };

    if let Some(name) = name {
        entry.name = name;
    }
    entry.score += 1;
    store.put(&key, serde_json::to_value(&entry)?).await?;
    Ok(entry.score)
}

/// Opens a question for the sender, replacing any previous one.
///
/// Payload: `{question, answer, comment?}`.
pub struct AskHandler;

#[async_trait]
impl Handler for AskHandler {
    async fn handle(&self, ctx: &BotContext, event: &Event) -> Result<HandlerResult> {
        let session = Session {
            question: required_str(&event.payload, "question")?,
            answer: required_str(&event.payload, "answer")?,
            comment: optional_str(&event.payload, "comment")?,
            solved: false,
        };
        ctx.store
            .put(&session_key(&event.source_id), serde_json::to_value(&session)?)
            .await?;
        Ok(HandlerResult::reply(json!({ "question": session.question })))
    }
}

/// Checks the sender's answer against the open question and awards a point
/// on the first correct one.
///
/// Payload: `{text, name?}`. Wrong answers leave the question open.
pub struct AnswerHandler;

#[async_trait]
impl Handler for AnswerHandler {
    async fn handle(&self, ctx: &BotContext, event: &Event) -> Result<HandlerResult> {
        let text = required_str(&event.payload, "text")?;
        let name = optional_str(&event.payload, "name")?;

        let Some(mut session) = load_session(ctx.store.as_ref(), &event.source_id).await? else {
            return Ok(HandlerResult::reply(json!({ "result": "no_question" })));
        };
        if session.solved {
            return Ok(HandlerResult::reply(json!({ "result": "already_solved" })));
        }
        if !answer::is_correct(&text, &session.answer, session.comment.as_deref()) {
            tracing::debug!(source = %event.source_id, "wrong answer");
            return Ok(HandlerResult::reply(json!({ "result": "wrong" })));
        }

        session.solved = true;
        ctx.store
            .put(&session_key(&event.source_id), serde_json::to_value(&session)?)
            .await?;
        let score = award_point(ctx.store.as_ref(), &event.source_id, name).await?;

        Ok(HandlerResult::reply(json!({
            "result": "correct",
            "answer": session.answer,
            "comment": session.comment,
            "score": score,
        })))
    }
}

/// Describes the shape of the open question's answer.
pub struct HintHandler;

#[async_trait]
impl Handler for HintHandler {
    async fn handle(&self, ctx: &BotContext, event: &Event) -> Result<HandlerResult> {
        match load_session(ctx.store.as_ref(), &event.source_id).await? {
            Some(session) => Ok(HandlerResult::reply(
                json!({ "hint": answer::hint(&session.answer) }),
            )),
            None => Ok(HandlerResult::reply(json!({ "result": "no_question" }))),
        }
    }
}

/// Replies with the highest scores, best first.
///
/// `payload.limit` overrides the configured leaderboard size.
pub struct TopHandler;

#[async_trait]
impl Handler for TopHandler {
    async fn handle(&self, ctx: &BotContext, event: &Event) -> Result<HandlerResult> {
        let limit = match event.payload.get("limit") {
            None | Some(serde_json::Value::Null) => ctx.cfg.leaderboard_size,
            Some(v) => match v.as_u64() {
                Some(n) if (1..=MAX_LEADERBOARD).contains(&n) => n as usize,
                _ => {
                    return Err(Error::Handler(format!(
                        "payload.limit must be between 1 and {MAX_LEADERBOARD}"
                    )))
                }
            },
        };

        let entries = leaderboard(ctx.store.as_ref(), limit).await?;
        Ok(HandlerResult::reply(json!({ "top": entries })))
    }
}

/// Top `limit` score entries, ordered by score (desc) then name.
pub async fn leaderboard(store: &dyn Store, limit: usize) -> Result<Vec<ScoreEntry>> {
    let mut scan = store.scan(SCORE_PREFIX).await?;
    let mut entries = Vec::with_capacity(scan.remaining());
    while let Some(record) = scan.next_record().await {
        let record = record?;
        match serde_json::from_value::<ScoreEntry>(record.value) {
            Ok(entry) => entries.push(entry),
            Err(e) => tracing::warn!(key = %record.key, error = %e, "skipping malformed score record"),
        }
    }

    entries.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
    entries.truncate(limit);
    Ok(entries)
}

/// Forgets the sender's ping counter, score and open question.
pub struct ResetHandler;

#[async_trait]
impl Handler for ResetHandler {
    async fn handle(&self, ctx: &BotContext, event: &Event) -> Result<HandlerResult> {
        let mut removed = 0u32;
        for key in [
            count_key(&event.source_id),
            score_key(&event.source_id),
            session_key(&event.source_id),
        ] {
            match ctx.store.delete(&key).await {
                Ok(()) => removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(HandlerResult::reply(json!({ "removed": removed })))
    }
}
