//! In-process event source backed by a channel.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex as StdMutex, PoisonError,
};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::{
    domain::{Event, SourceId},
    errors::Error,
    ports::EventSource,
    Result,
};

/// Event source fed through an `mpsc` channel; replies are kept in memory.
///
/// Dropping every sender closes the source.
pub struct ChannelSource {
    rx: Mutex<mpsc::Receiver<Event>>,
    replies: StdMutex<Vec<(SourceId, serde_json::Value)>>,
    fail_replies: AtomicBool,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> (mpsc::Sender<Event>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let source = Self {
            rx: Mutex::new(rx),
            replies: StdMutex::new(Vec::new()),
            fail_replies: AtomicBool::new(false),
        };
        (tx, source)
    }

    /// Replies delivered so far, in delivery order.
    pub fn replies(&self) -> Vec<(SourceId, serde_json::Value)> {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make subsequent `reply` calls fail with `DeliveryFailed`.
    pub fn set_fail_replies(&self, fail: bool) {
        self.fail_replies.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn next_event(&self) -> Result<Option<Event>> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn reply(&self, source_id: &SourceId, data: &serde_json::Value) -> Result<()> {
        if self.fail_replies.load(Ordering::SeqCst) {
            return Err(Error::DeliveryFailed(format!("reply to {source_id} rejected")));
        }
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((source_id.clone(), data.clone()));
        Ok(())
    }
}
