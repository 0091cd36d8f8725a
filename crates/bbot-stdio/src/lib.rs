//! Stdio adapter.
//!
//! Implements the `bbot-core` EventSource port over line-delimited JSON:
//! events are read from an async reader (stdin) and replies are written to an
//! async writer (stdout).

use async_trait::async_trait;
use chrono::Utc;
use tokio::{
    io::{
        self, AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
        Stdin, Stdout,
    },
    sync::Mutex,
};

pub mod wire;

use bbot_core::{
    domain::{Event, SourceId},
    errors::Error,
    ports::EventSource,
    Result,
};

/// Longest accepted event line, newline included.
pub const MAX_LINE_BYTES: usize = 1 << 20;

pub struct StdioSource<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
}

impl StdioSource<BufReader<Stdin>, Stdout> {
    pub fn stdio() -> Self {
        Self::new(BufReader::new(io::stdin()), io::stdout())
    }
}

impl<R, W> StdioSource<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }

    pub fn into_writer(self) -> W {
        self.writer.into_inner()
    }

    fn map_err(e: std::io::Error) -> Error {
        Error::DeliveryFailed(format!("stdout write failed: {e}"))
    }
}

#[async_trait]
impl<R, W> EventSource for StdioSource<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn next_event(&self) -> Result<Option<Event>> {
        let mut reader = self.reader.lock().await;
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = (&mut *reader)
                .take(MAX_LINE_BYTES as u64)
                .read_until(b'\n', &mut buf)
                .await?;
            if n == 0 {
                return Ok(None);
            }
            if n == MAX_LINE_BYTES && buf.last() != Some(&b'\n') {
                discard_line(&mut *reader).await?;
                tracing::warn!(limit = MAX_LINE_BYTES, "skipping oversized event line");
                continue;
            }
            let Ok(line) = std::str::from_utf8(&buf) else {
                tracing::warn!("skipping event line that is not valid UTF-8");
                continue;
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match wire::parse_event(trimmed, Utc::now()) {
                Ok(event) => return Ok(Some(event)),
                Err(e) => tracing::warn!(error = %format!("{e:#}"), "skipping event line"),
            }
        }
    }

    async fn reply(&self, source_id: &SourceId, data: &serde_json::Value) -> Result<()> {
        let line = wire::render_reply(source_id, data, Utc::now())?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(Self::map_err)?;
        writer.flush().await.map_err(Self::map_err)
    }
}

/// Consume input up to and including the next newline (or EOF).
async fn discard_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<()> {
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Ok(());
        }
        let newline = chunk.iter().position(|&b| b == b'\n');
        let len = chunk.len();
        match newline {
            Some(i) => {
                reader.consume(i + 1);
                return Ok(());
            }
            None => reader.consume(len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io::Cursor, sync::Arc};

    use bbot_core::{
        bot::BotCore,
        config::Config,
        store::{MemoryStore, OpenedStore, Store},
    };
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    type TestSource = StdioSource<BufReader<Cursor<Vec<u8>>>, Vec<u8>>;

    fn source_bytes(input: Vec<u8>) -> TestSource {
        StdioSource::new(BufReader::new(Cursor::new(input)), Vec::new())
    }

    fn source(input: &str) -> TestSource {
        source_bytes(input.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn reads_events_and_skips_garbage() {
        let src = source(
            "{\"source_id\":\"A\",\"kind\":\"ping\"}\n\n garbage\n{\"source_id\":7,\"kind\":\"top\"}",
        );
        let first = src.next_event().await.unwrap().unwrap();
        assert_eq!(first.kind, "ping");
        let second = src.next_event().await.unwrap().unwrap();
        assert_eq!(second.source_id.as_str(), "7");
        assert!(src.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn skips_lines_that_are_not_utf8() {
        let mut input = b"\xff\xfe{\"source_id\":\"A\",\"kind\":\"bad\"}\n".to_vec();
        input.extend_from_slice(b"{\"source_id\":\"A\",\"kind\":\"ping\"}\n");
        let src = source_bytes(input);

        let event = src.next_event().await.unwrap().unwrap();
        assert_eq!(event.kind, "ping");
        assert!(src.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn skips_oversized_lines() {
        let mut input = format!("{{\"source_id\":\"A\",\"kind\":\"{}\"}}\n", "x".repeat(MAX_LINE_BYTES))
            .into_bytes();
        input.extend_from_slice(b"{\"source_id\":\"B\",\"kind\":\"ping\"}\n");
        let src = source_bytes(input);

        let event = src.next_event().await.unwrap().unwrap();
        assert_eq!(event.source_id.as_str(), "B");
        assert!(src.next_event().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writes_reply_lines() {
        let src = source("");
        src.reply(&SourceId::from("A"), &json!("pong")).await.unwrap();
        src.reply(&SourceId::from("B"), &json!({"score": 2}))
            .await
            .unwrap();

        let out = String::from_utf8(src.into_writer()).unwrap();
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["reply"], json!("pong"));
        assert_eq!(lines[1]["source_id"], json!("B"));
    }

    #[tokio::test]
    async fn drives_the_core_end_to_end() {
        let src = Arc::new(source(concat!(
            "{\"source_id\":\"A\",\"kind\":\"ping\"}\n",
            "{\"source_id\":\"A\",\"kind\":\"unknown\"}\n",
            "{\"source_id\":\"A\",\"kind\":\"ask\",\"payload\":{\"question\":\"Capital of France?\",\"answer\":\"Paris\"}}\n",
            "{\"source_id\":\"A\",\"kind\":\"answer\",\"payload\":{\"text\":\"paris\",\"name\":\"Ann\"}}\n",
        )));
        let store = Arc::new(MemoryStore::new());
        let cfg = Arc::new(Config::default());

        let core = BotCore::builder(cfg, src.clone())
            .store(OpenedStore(store.clone()))
            .builtin_handlers()
            .build();
        let report = core.run(CancellationToken::new()).await.unwrap();
        assert_eq!(report.received, 4);
        assert_eq!(report.ignored, 1);

        let src = Arc::try_unwrap(src).ok().expect("core released the source");
        let out = String::from_utf8(src.into_writer()).unwrap();
        let replies: Vec<serde_json::Value> = out
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["reply"].clone())
            .collect();
        assert_eq!(
            replies,
            vec![
                json!("pong"),
                json!({"question": "Capital of France?"}),
                json!({"result": "correct", "answer": "Paris", "comment": null, "score": 1}),
            ]
        );
        assert_eq!(store.get("count:A").await.unwrap().value, json!(1));
        assert_eq!(
            store.get("score:A").await.unwrap().value,
            json!({"name": "Ann", "score": 1})
        );
    }
}
