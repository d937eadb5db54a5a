mod in_memory_queue;
mod redis_queue;

use std::time::Duration;
use tracing::{debug, instrument};

use crate::event::Event;

pub use in_memory_queue::InMemoryQueue;
pub use redis_queue::RedisQueue;

/// Name of the list ingestion pushes to and the worker pops from.
pub const EVENTS_QUEUE: &str = "events_queue";

/// Error type for queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("{0}")]
    Unavailable(String),

    #[error("no reply from broker within {0:?}")]
    Timeout(Duration),
}

/// A broker-side FIFO list of opaque payloads.
///
/// Payloads are pushed at one end and popped from the other. A pop hands a payload
/// to exactly one caller.
#[async_trait::async_trait]
pub trait EventQueue {
    /// Appends a payload. Returns once the broker has acknowledged it.
    async fn push(&self, queue: &str, payload: String) -> Result<(), QueueError>;

    /// Removes the oldest payload, waiting up to `timeout` for one to arrive.
    async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, QueueError>;

    async fn len(&self, queue: &str) -> Result<u64, QueueError>;
}

/// Serializes a validated event and appends it to `queue`.
///
/// Success means the event is durably queued, not persisted. There is no retry here.
#[instrument(skip_all, fields(site_id = %event.site_id))]
pub async fn enqueue(
    queue: &(dyn EventQueue + Send + Sync),
    name: &str,
    event: &Event,
) -> Result<(), QueueError> {
    let payload =
        serde_json::to_string(event).map_err(|error| QueueError::Unavailable(error.to_string()))?;
    queue.push(name, payload).await?;
    debug!("Event queued");
    Ok(())
}
