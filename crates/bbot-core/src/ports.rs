use async_trait::async_trait;

use crate::{
    domain::{Event, SourceId},
    Result,
};

/// Port for the origin of inbound events (a chat platform, a queue, stdin).
///
/// Implementations must keep the relative arrival order of events that share
/// a `source_id`. The stream is unbounded from the core's point of view:
/// `Ok(None)` only means the collaborator closed it.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Called once while the core is starting, before the first `next_event`.
    async fn subscribe(&self) -> Result<()> {
        Ok(())
    }

    async fn next_event(&self) -> Result<Option<Event>>;

    /// Send data back to the origin of an event.
    ///
    /// Failures are reported as `Error::DeliveryFailed`; the core never rolls
    /// back store writes because a reply was lost.
    async fn reply(&self, source_id: &SourceId, data: &serde_json::Value) -> Result<()>;
}
