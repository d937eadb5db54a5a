use chrono::Utc;
use serde::Deserialize;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::{Config, TimestampFallback},
    event::{NewEvent, parse_timestamp},
    queue::{EventQueue, QueueError},
    storage::{Storage, StoreError},
};

/// Pause after a failure of the loop itself, e.g. the broker going away.
const LOOP_ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Error type for the worker process.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("store not reachable after {attempts} attempts: {last_error}")]
    ReadinessTimeout { attempts: u32, last_error: StoreError },

    #[error("schema setup failed: {0}")]
    Schema(StoreError),
}

/// A dequeued payload that is not a usable event.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MalformedMessage {
    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("{0} is missing or empty")]
    MissingField(&'static str),

    #[error("unparsable timestamp")]
    Timestamp,
}

/// Why a message was dropped.
#[derive(Debug, thiserror::Error, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DropReason {
    #[error(transparent)]
    Malformed(#[from] MalformedMessage),

    #[error(transparent)]
    Persist(#[from] StoreError),
}

/// Result of one pass through the loop.
#[derive(Debug)]
pub enum Outcome {
    /// The pop timed out with nothing to do.
    Idle,
    Persisted(i64),
    Dropped(DropReason),
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub queue: String,
    pub dead_letter_queue: Option<String>,
    pub pop_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub timestamp_fallback: TimestampFallback,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            queue: config.events_queue.clone(),
            dead_letter_queue: config.dead_letter_queue.clone(),
            pop_timeout: config.pop_timeout,
            max_retries: config.db_max_retries,
            retry_delay: config.db_retry_delay,
            timestamp_fallback: config.timestamp_fallback,
        }
    }
}

/// Queue payload as the worker reads it. Unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct QueuedEvent {
    site_id: Option<String>,
    event_type: Option<String>,
    path: Option<String>,
    user_id: Option<String>,
    timestamp: Option<serde_json::Value>,
}

/// Decodes a queue payload into a row, or says why it cannot be one.
pub fn decode_message(
    payload: &str,
    fallback: TimestampFallback,
) -> Result<NewEvent, MalformedMessage> {
    let queued: QueuedEvent =
        serde_json::from_str(payload).map_err(|error| MalformedMessage::Json(error.to_string()))?;
    let non_empty = |field: &'static str, value: Option<String>| {
        value
            .filter(|value| !value.is_empty())
            .ok_or(MalformedMessage::MissingField(field))
    };

    let site_id = non_empty("site_id", queued.site_id)?;
    let event_type = non_empty("event_type", queued.event_type)?;

    let parsed_ts = queued
        .timestamp
        .as_ref()
        .and_then(serde_json::Value::as_str)
        .and_then(parse_timestamp);
    let event_ts = match (parsed_ts, fallback) {
        (Some(ts), _) => ts,
        (None, TimestampFallback::WallClock) => {
            warn!("Unparsable timestamp {:?}, using current time", queued.timestamp);
            Utc::now()
        }
        (None, TimestampFallback::Reject) => return Err(MalformedMessage::Timestamp),
    };

    Ok(NewEvent {
        site_id,
        event_type,
        path: queued.path,
        user_id: queued.user_id,
        event_ts,
    })
}

/// Consumes the events queue and writes each event to the store, one at a time.
///
/// Delivery is at-most-once from pop to commit: a message that fails to decode or
/// persist is logged and dropped (or moved to the dead-letter list, if one is
/// configured). Nothing a single message does stops the loop.
pub struct Worker {
    queue: Arc<dyn EventQueue + Send + Sync>,
    store: Arc<dyn Storage + Send + Sync>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn EventQueue + Send + Sync>,
        store: Arc<dyn Storage + Send + Sync>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            store,
            settings,
        }
    }

    /// Probes the store up to `max_retries` times with a fixed delay between attempts.
    #[instrument(skip(self))]
    pub async fn wait_for_store(&self) -> Result<(), WorkerError> {
        let attempts = self.settings.max_retries.max(1);
        let mut attempt = 1;
        loop {
            match self.store.ping().await {
                Ok(()) => {
                    info!("Database connection successful");
                    return Ok(());
                }
                Err(last_error) if attempt >= attempts => {
                    error!("Failed to connect to database after {attempts} attempts");
                    return Err(WorkerError::ReadinessTimeout {
                        attempts,
                        last_error,
                    });
                }
                Err(error) => {
                    warn!(
                        "Database not ready ({error}), retrying in {:?} (attempt {attempt}/{attempts})",
                        self.settings.retry_delay
                    );
                }
            }
            tokio::time::sleep(self.settings.retry_delay).await;
            attempt += 1;
        }
    }

    /// Readiness, then schema. Must succeed before anything is popped.
    pub async fn start(&self) -> Result<(), WorkerError> {
        self.wait_for_store().await?;
        self.store
            .ensure_schema()
            .await
            .map_err(WorkerError::Schema)?;
        info!("Database tables created/verified");
        Ok(())
    }

    async fn pop(&self) -> Result<Option<String>, QueueError> {
        self.queue
            .pop(&self.settings.queue, self.settings.pop_timeout)
            .await
    }

    /// Pops at most one message and handles it to completion.
    #[cfg(test)]
    pub(crate) async fn process_next(&self) -> Result<Outcome, QueueError> {
        Ok(match self.pop().await? {
            Some(payload) => self.handle(payload).await,
            None => Outcome::Idle,
        })
    }

    async fn handle(&self, payload: String) -> Outcome {
        let result = match decode_message(&payload, self.settings.timestamp_fallback) {
            Ok(event) => self.store.insert(&event).await.map_err(DropReason::from),
            Err(malformed) => Err(DropReason::from(malformed)),
        };
        match result {
            Ok(id) => Outcome::Persisted(id),
            Err(reason) => {
                self.dead_letter(payload).await;
                Outcome::Dropped(reason)
            }
        }
    }

    async fn dead_letter(&self, payload: String) {
        let Some(dead_letter_queue) = &self.settings.dead_letter_queue else {
            return;
        };
        match self.queue.push(dead_letter_queue, payload).await {
            Ok(()) => debug!("Message moved to {dead_letter_queue}"),
            Err(error) => error!("Dead-letter push to {dead_letter_queue} failed, message lost: {error}"),
        }
    }

    /// Runs the loop until `shutdown` resolves.
    ///
    /// Shutdown is only checked between iterations. A pop in flight runs to its
    /// timeout and whatever it returns is handled, so stopping takes at most
    /// `pop_timeout` plus the handling of one message.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<(), WorkerError> {
        self.start().await?;
        info!("Consuming {}", self.settings.queue);

        let (mut persisted, mut dropped) = (0u64, 0u64);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = std::future::ready(()) => {}
            }
            let outcome = match self.pop().await {
                Ok(Some(payload)) => self.handle(payload).await,
                Ok(None) => Outcome::Idle,
                Err(error) => {
                    error!("Worker loop error: {error}");
                    tokio::time::sleep(LOOP_ERROR_PAUSE).await;
                    continue;
                }
            };
            match outcome {
                Outcome::Persisted(id) => {
                    debug!("Persisted event {id}");
                    persisted += 1;
                }
                Outcome::Dropped(reason) => {
                    warn!("Dropped message ({}): {reason}", reason.as_ref());
                    dropped += 1;
                }
                Outcome::Idle => {}
            }
        }

        info!("Worker stopped: {persisted} persisted, {dropped} dropped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        queue::{EVENTS_QUEUE, InMemoryQueue},
        storage::InMemoryStorage,
    };
    use chrono::TimeZone;

    const DLQ: &str = "events_dlq";

    fn settings() -> WorkerSettings {
        WorkerSettings {
            queue: EVENTS_QUEUE.to_string(),
            dead_letter_queue: None,
            pop_timeout: Duration::from_millis(20),
            max_retries: 3,
            retry_delay: Duration::from_millis(1),
            timestamp_fallback: TimestampFallback::WallClock,
        }
    }

    fn make_worker(settings: WorkerSettings) -> (Arc<InMemoryQueue>, Arc<InMemoryStorage>, Worker) {
        let queue = Arc::new(InMemoryQueue::new());
        let store = Arc::new(InMemoryStorage::new());
        let worker = Worker::new(queue.clone(), store.clone(), settings);
        (queue, store, worker)
    }

    fn payload(timestamp: &str) -> String {
        serde_json::json!({
            "site_id": "site-abc-123",
            "event_type": "page_view",
            "path": "/pricing",
            "user_id": null,
            "timestamp": timestamp,
        })
        .to_string()
    }

    #[test]
    fn test_decode_uses_parsed_timestamp() {
        let event = decode_message(&payload("2025-11-12T19:30:01Z"), TimestampFallback::Reject).unwrap();
        assert_eq!(event.event_ts, Utc.with_ymd_and_hms(2025, 11, 12, 19, 30, 1).unwrap());
        assert_eq!(event.path.as_deref(), Some("/pricing"));
        assert_eq!(event.user_id, None);
    }

    #[test]
    fn test_decode_rejects_bad_payloads() {
        let fallback = TimestampFallback::WallClock;
        assert!(matches!(
            decode_message("{not json", fallback),
            Err(MalformedMessage::Json(_))
        ));
        assert!(matches!(
            decode_message("[1, 2]", fallback),
            Err(MalformedMessage::Json(_))
        ));
        assert_eq!(
            decode_message(r#"{"event_type": "x", "timestamp": "2025-11-12"}"#, fallback),
            Err(MalformedMessage::MissingField("site_id"))
        );
        assert_eq!(
            decode_message(r#"{"site_id": "s", "event_type": "", "timestamp": "2025-11-12"}"#, fallback),
            Err(MalformedMessage::MissingField("event_type"))
        );
    }

    #[test]
    fn test_decode_timestamp_fallback() {
        let before = Utc::now();
        let event = decode_message(&payload("not a time"), TimestampFallback::WallClock).unwrap();
        assert!(event.event_ts >= before && event.event_ts <= Utc::now());

        assert_eq!(
            decode_message(&payload("not a time"), TimestampFallback::Reject),
            Err(MalformedMessage::Timestamp)
        );
        assert_eq!(
            decode_message(r#"{"site_id": "s", "event_type": "e", "timestamp": 17}"#, TimestampFallback::Reject),
            Err(MalformedMessage::Timestamp)
        );
    }

    #[tokio::test]
    async fn test_readiness_gives_up_after_bounded_attempts() {
        let (queue, store, worker) = make_worker(settings());
        store.set_available(false);
        queue.push(EVENTS_QUEUE, payload("2025-11-12T19:30:01Z")).await.unwrap();

        let result = worker.run(std::future::pending()).await;
        assert!(matches!(
            result,
            Err(WorkerError::ReadinessTimeout { attempts: 3, .. })
        ));
        assert_eq!(store.ping_count(), 3);
        // Nothing was consumed.
        assert_eq!(queue.len(EVENTS_QUEUE).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_delay_is_fixed() {
        let (_, store, worker) = make_worker(WorkerSettings {
            max_retries: 4,
            retry_delay: Duration::from_secs(2),
            ..settings()
        });
        store.set_available(false);
        let worker = Arc::new(worker);

        let started = tokio::time::Instant::now();
        let probing = {
            let worker = worker.clone();
            tokio::spawn(async move { worker.wait_for_store().await })
        };
        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert_eq!(store.ping_count(), 1);
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(store.ping_count(), 2);

        let result = probing.await.unwrap();
        assert!(matches!(
            result,
            Err(WorkerError::ReadinessTimeout { attempts: 4, .. })
        ));
        assert_eq!(store.ping_count(), 4);
        // Three gaps of the same length, no growth.
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test]
    async fn test_readiness_succeeds_once_store_is_up() {
        let (_, store, worker) = make_worker(settings());
        worker.wait_for_store().await.unwrap();
        assert_eq!(store.ping_count(), 1);
    }

    #[tokio::test]
    async fn test_idle_when_queue_empty() {
        let (_, _, worker) = make_worker(settings());
        assert!(matches!(worker.process_next().await.unwrap(), Outcome::Idle));
    }

    #[tokio::test]
    async fn test_well_formed_message_adds_one_row() {
        let (queue, store, worker) = make_worker(settings());
        queue.push(EVENTS_QUEUE, payload("2025-11-12T19:30:01Z")).await.unwrap();

        assert!(matches!(worker.process_next().await.unwrap(), Outcome::Persisted(1)));
        let rows = store.rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_ts, Utc.with_ymd_and_hms(2025, 11, 12, 19, 30, 1).unwrap());
        assert_eq!(queue.len(EVENTS_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped_and_loop_continues() {
        let (queue, store, worker) = make_worker(settings());
        queue.push(EVENTS_QUEUE, "{oops".to_string()).await.unwrap();
        queue.push(EVENTS_QUEUE, payload("2025-11-12T19:30:01Z")).await.unwrap();

        assert!(matches!(
            worker.process_next().await.unwrap(),
            Outcome::Dropped(DropReason::Malformed(MalformedMessage::Json(_)))
        ));
        assert!(matches!(worker.process_next().await.unwrap(), Outcome::Persisted(_)));
        assert_eq!(store.rows().await.len(), 1);
    }

    #[tokio::test]
    async fn test_persist_failure_loses_message() {
        let (queue, store, worker) = make_worker(settings());
        queue.push(EVENTS_QUEUE, payload("2025-11-12T19:30:01Z")).await.unwrap();
        store.set_available(false);

        assert!(matches!(
            worker.process_next().await.unwrap(),
            Outcome::Dropped(DropReason::Persist(_))
        ));
        store.set_available(true);
        // Not requeued and not retried.
        assert_eq!(queue.len(EVENTS_QUEUE).await.unwrap(), 0);
        assert!(matches!(worker.process_next().await.unwrap(), Outcome::Idle));
        assert!(store.rows().await.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_messages_go_to_dead_letter_queue() {
        let (queue, store, worker) = make_worker(WorkerSettings {
            dead_letter_queue: Some(DLQ.to_string()),
            ..settings()
        });
        queue.push(EVENTS_QUEUE, "{oops".to_string()).await.unwrap();
        queue.push(EVENTS_QUEUE, payload("2025-11-12T19:30:01Z")).await.unwrap();
        store.set_available(false);

        worker.process_next().await.unwrap();
        worker.process_next().await.unwrap();

        assert_eq!(queue.len(DLQ).await.unwrap(), 2);
        let first = queue.pop(DLQ, Duration::from_millis(1)).await.unwrap();
        assert_eq!(first.as_deref(), Some("{oops"));
    }

    #[tokio::test]
    async fn test_run_processes_until_shutdown() {
        let (queue, store, worker) = make_worker(settings());
        queue.push(EVENTS_QUEUE, payload("2025-11-12T19:30:01Z")).await.unwrap();
        queue.push(EVENTS_QUEUE, "garbage".to_string()).await.unwrap();
        queue.push(EVENTS_QUEUE, payload("2025-11-12T19:31:00Z")).await.unwrap();

        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let worker = Arc::new(worker);
        let running = {
            let worker = worker.clone();
            tokio::spawn(async move {
                worker
                    .run(async {
                        let _ = stopped.await;
                    })
                    .await
            })
        };

        for _ in 0..100 {
            if store.rows().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop.send(()).unwrap();
        running.await.unwrap().unwrap();

        assert_eq!(store.rows().await.len(), 2);
        assert_eq!(queue.len(EVENTS_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pop_in_flight_at_shutdown_is_handled() {
        let (queue, store, worker) = make_worker(WorkerSettings {
            pop_timeout: Duration::from_secs(5),
            ..settings()
        });
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let worker = Arc::new(worker);
        let running = {
            let worker = worker.clone();
            tokio::spawn(async move {
                worker
                    .run(async {
                        let _ = stopped.await;
                    })
                    .await
            })
        };
        // Let the worker get into its blocking pop.
        tokio::time::sleep(Duration::from_millis(50)).await;

        stop.send(()).unwrap();
        queue.push(EVENTS_QUEUE, payload("2025-11-12T19:30:01Z")).await.unwrap();
        running.await.unwrap().unwrap();

        assert_eq!(store.rows().await.len(), 1);
        assert_eq!(queue.len(EVENTS_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_no_pop_after_shutdown() {
        let (queue, store, worker) = make_worker(settings());
        queue.push(EVENTS_QUEUE, payload("2025-11-12T19:30:01Z")).await.unwrap();

        worker.run(std::future::ready(())).await.unwrap();

        assert!(store.rows().await.is_empty());
        assert_eq!(queue.len(EVENTS_QUEUE).await.unwrap(), 1);
    }
}
