mod in_memory_storage;
mod postgres_storage;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::NewEvent;

pub use in_memory_storage::InMemoryStorage;
pub use postgres_storage::PostgresStorage;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("query failed: {0}")]
    Query(String),
}

/// Half-open `[start, end)` range over `event_ts`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathViews {
    pub path: String,
    pub views: i64,
}

/// Aggregates over one site's events.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SiteStats {
    pub total_views: i64,
    pub unique_users: i64,
    pub top_paths: Vec<PathViews>,
}

/// Paths reported per site.
pub const TOP_PATHS_LIMIT: usize = 10;

/// Path bucket for events posted without one.
pub const DEFAULT_PATH: &str = "/";

/// Storage trait for persisted events.
#[async_trait::async_trait]
pub trait Storage {
    /// Trivial round trip used as a liveness probe.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Creates the events table and its indexes when missing.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Inserts one row in its own transaction and returns its id.
    ///
    /// On failure nothing is written. Inserting the same event twice yields two rows.
    async fn insert(&self, event: &NewEvent) -> Result<i64, StoreError>;

    /// Counts views, distinct non-null users and the most viewed paths of a site,
    /// optionally restricted to `window`.
    async fn site_stats(
        &self,
        site_id: &str,
        window: Option<TimeWindow>,
    ) -> Result<SiteStats, StoreError>;
}
