use ahash::{AHashMap, AHashSet};
use chrono::Utc;
use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::{
    event::{NewEvent, StoredEvent, Timestamp},
    storage::{
        DEFAULT_PATH, PathViews, SiteStats, Storage, StoreError, TOP_PATHS_LIMIT, TimeWindow,
    },
};

type EventId = i64;

/// Stores events in an indexed manner for efficient queries.
#[derive(Default)]
struct IndexedEvents {
    /// Stores events by their surrogate key.
    event_by_id: AHashMap<EventId, StoredEvent>,

    /// Stores events by site and timestamp. This allows for efficient range queries per site.
    events_by_site_by_timestamp: AHashMap<String, BTreeMap<Timestamp, Vec<EventId>>>,
}

pub struct InMemoryStorage {
    // A single lock keeps the indexes consistent with each other.
    events: RwLock<IndexedEvents>,
    next_id: AtomicI64,
    available: AtomicBool,
    pings: AtomicU32,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(IndexedEvents::default()),
            next_id: AtomicI64::new(1),
            available: AtomicBool::new(true),
            pings: AtomicU32::new(0),
        }
    }

    /// Simulates the database going away. Every operation fails while unavailable.
    #[cfg(test)]
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of liveness probes received so far.
    #[cfg(test)]
    pub fn ping_count(&self) -> u32 {
        self.pings.load(Ordering::SeqCst)
    }

    /// All rows in insertion order.
    #[cfg(test)]
    pub async fn rows(&self) -> Vec<StoredEvent> {
        let events_guard = self.events.read().await;
        let mut rows: Vec<_> = events_guard.event_by_id.values().cloned().collect();
        rows.sort_by_key(|row| row.id);
        rows
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
    }
}

#[async_trait::async_trait]
impl Storage for InMemoryStorage {
    async fn ping(&self) -> Result<(), StoreError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        self.check_available()
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    #[instrument(skip_all)]
    async fn insert(&self, event: &NewEvent) -> Result<i64, StoreError> {
        debug!("Storing event");
        self.check_available()?;

        let event_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let row = StoredEvent {
            id: event_id,
            site_id: event.site_id.clone(),
            event_type: event.event_type.clone(),
            path: event.path.clone(),
            user_id: event.user_id.clone(),
            event_ts: event.event_ts,
            ingested_at: Utc::now(),
        };

        let mut events_guard = self.events.write().await;
        events_guard
            .events_by_site_by_timestamp
            .entry(row.site_id.clone())
            .or_default()
            .entry(row.event_ts)
            .or_default()
            .push(event_id);
        events_guard.event_by_id.insert(event_id, row);
        Ok(event_id)
    }

    #[instrument(skip(self, window))]
    async fn site_stats(
        &self,
        site_id: &str,
        window: Option<TimeWindow>,
    ) -> Result<SiteStats, StoreError> {
        debug!("Aggregating events");
        self.check_available()?;
        let events_guard = self.events.read().await;

        let Some(events) = events_guard.events_by_site_by_timestamp.get(site_id) else {
            return Ok(SiteStats::default());
        };
        let range = match window {
            Some(window) => (Bound::Included(window.start), Bound::Excluded(window.end)),
            None => (Bound::Unbounded, Bound::Unbounded),
        };

        let mut stats = SiteStats::default();
        let mut users = AHashSet::new();
        let mut views_by_path: AHashMap<&str, i64> = AHashMap::new();
        // All ids in the index exist so a flat_map is appropriate.
        for row in events
            .range(range)
            .flat_map(|(_, event_ids)| event_ids.iter())
            .flat_map(|event_id| events_guard.event_by_id.get(event_id))
        {
            stats.total_views += 1;
            if let Some(user_id) = &row.user_id {
                users.insert(user_id.as_str());
            }
            *views_by_path
                .entry(row.path.as_deref().unwrap_or(DEFAULT_PATH))
                .or_default() += 1;
        }
        stats.unique_users = users.len() as i64;

        let mut top_paths: Vec<_> = views_by_path
            .into_iter()
            .map(|(path, views)| PathViews {
                path: path.to_string(),
                views,
            })
            .collect();
        top_paths.sort_by(|a, b| b.views.cmp(&a.views).then_with(|| a.path.cmp(&b.path)));
        top_paths.truncate(TOP_PATHS_LIMIT);
        stats.top_paths = top_paths;

        debug!("Found {} events", stats.total_views);
        Ok(stats)
    }
}
