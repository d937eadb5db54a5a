use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::{
    event::NewEvent,
    storage::{PathViews, SiteStats, Storage, StoreError, TOP_PATHS_LIMIT, TimeWindow},
};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id BIGSERIAL PRIMARY KEY,
        site_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        path TEXT,
        user_id TEXT,
        event_ts TIMESTAMPTZ NOT NULL,
        ingested_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_events_site_id ON events (site_id)",
    "CREATE INDEX IF NOT EXISTS ix_events_user_id ON events (user_id)",
];

const INSERT_EVENT: &str = r#"
    INSERT INTO events (site_id, event_type, path, user_id, event_ts)
    VALUES ($1, $2, $3, $4, $5)
    RETURNING id
"#;

// $2 and $3 are NULL when no window is requested.
const COUNT_VIEWS: &str = r#"
    SELECT COUNT(*) FROM events
    WHERE site_id = $1
      AND ($2::timestamptz IS NULL OR event_ts >= $2)
      AND ($3::timestamptz IS NULL OR event_ts < $3)
"#;

const COUNT_USERS: &str = r#"
    SELECT COUNT(DISTINCT user_id) FROM events
    WHERE site_id = $1
      AND ($2::timestamptz IS NULL OR event_ts >= $2)
      AND ($3::timestamptz IS NULL OR event_ts < $3)
      AND user_id IS NOT NULL
"#;

const TOP_PATHS: &str = r#"
    SELECT COALESCE(path, '/') AS path, COUNT(*) AS views FROM events
    WHERE site_id = $1
      AND ($2::timestamptz IS NULL OR event_ts >= $2)
      AND ($3::timestamptz IS NULL OR event_ts < $3)
    GROUP BY COALESCE(path, '/')
    ORDER BY views DESC, path ASC
    LIMIT $4
"#;

/// Postgres-backed storage. The pool connects lazily, so constructing it never
/// touches the network; reachability is established by [`Storage::ping`].
#[derive(Clone)]
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn connect_lazy(database_url: &str, acquire_timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(acquire_timeout)
            .connect_lazy(database_url)
            .map_err(|error| StoreError::Unavailable(error.to_string()))?;
        Ok(Self { pool })
    }
}

fn unavailable(error: sqlx::Error) -> StoreError {
    StoreError::Unavailable(error.to_string())
}

fn query_failed(error: sqlx::Error) -> StoreError {
    StoreError::Query(error.to_string())
}

#[async_trait::async_trait]
impl Storage for PostgresStorage {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(query_failed)?;
        }
        debug!("Events table verified");
        Ok(())
    }

    #[instrument(skip_all, fields(site_id = %event.site_id))]
    async fn insert(&self, event: &NewEvent) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let inserted = sqlx::query_scalar::<_, i64>(INSERT_EVENT)
            .bind(&event.site_id)
            .bind(&event.event_type)
            .bind(&event.path)
            .bind(&event.user_id)
            .bind(event.event_ts)
            .fetch_one(&mut *tx)
            .await;

        match inserted {
            Ok(id) => {
                tx.commit()
                    .await
                    .map_err(|error| StoreError::Write(error.to_string()))?;
                Ok(id)
            }
            Err(error) => {
                if let Err(rollback_error) = tx.rollback().await {
                    warn!("Rollback failed: {rollback_error}");
                }
                Err(StoreError::Write(error.to_string()))
            }
        }
    }

    #[instrument(skip(self, window))]
    async fn site_stats(
        &self,
        site_id: &str,
        window: Option<TimeWindow>,
    ) -> Result<SiteStats, StoreError> {
        let start = window.map(|window| window.start);
        let end = window.map(|window| window.end);

        let total_views = sqlx::query_scalar::<_, i64>(COUNT_VIEWS)
            .bind(site_id)
            .bind(start)
            .bind(end)
            .fetch_one(&self.pool)
            .await
            .map_err(query_failed)?;
        let unique_users = sqlx::query_scalar::<_, i64>(COUNT_USERS)
            .bind(site_id)
            .bind(start)
            .bind(end)
            .fetch_one(&self.pool)
            .await
            .map_err(query_failed)?;
        let top_paths = sqlx::query_as::<_, (String, i64)>(TOP_PATHS)
            .bind(site_id)
            .bind(start)
            .bind(end)
            .bind(TOP_PATHS_LIMIT as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed)?
            .into_iter()
            .map(|(path, views)| PathViews { path, views })
            .collect();

        Ok(SiteStats {
            total_views,
            unique_users,
            top_paths,
        })
    }
}
