use chrono::{Days, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::storage::{PathViews, Storage, StoreError, TimeWindow};

/// Error type for building a report.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("site_id is required")]
    MissingSiteId,

    #[error("date must be YYYY-MM-DD")]
    InvalidDate,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A checked stats request.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsQuery {
    pub site_id: String,
    pub date: Option<NaiveDate>,
}

/// Response body of `GET /stats`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsReport {
    pub site_id: String,
    pub date: Option<NaiveDate>,
    pub total_views: i64,
    pub unique_users: i64,
    pub top_paths: Vec<PathViews>,
}

impl StatsQuery {
    /// Checks raw query parameters. Empty values count as absent.
    pub fn parse(site_id: Option<&str>, date: Option<&str>) -> Result<Self, ReportError> {
        let site_id = match site_id {
            Some(site_id) if !site_id.is_empty() => site_id.to_string(),
            _ => return Err(ReportError::MissingSiteId),
        };
        let date = match date {
            Some(date) if !date.is_empty() => Some(
                NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| ReportError::InvalidDate)?,
            ),
            _ => None,
        };
        Ok(Self { site_id, date })
    }

    /// The UTC day `[date 00:00, date+1 00:00)`, if a date was given.
    pub fn window(&self) -> Result<Option<TimeWindow>, ReportError> {
        let Some(date) = self.date else {
            return Ok(None);
        };
        let next = date
            .checked_add_days(Days::new(1))
            .ok_or(ReportError::InvalidDate)?;
        Ok(Some(TimeWindow {
            start: date.and_time(NaiveTime::MIN).and_utc(),
            end: next.and_time(NaiveTime::MIN).and_utc(),
        }))
    }
}

/// Runs the aggregate queries for `query` and shapes the response.
#[instrument(skip(store))]
pub async fn site_report(
    store: &(dyn Storage + Send + Sync),
    query: StatsQuery,
) -> Result<StatsReport, ReportError> {
    let window = query.window()?;
    let stats = store.site_stats(&query.site_id, window).await?;
    Ok(StatsReport {
        site_id: query.site_id,
        date: query.date,
        total_views: stats.total_views,
        unique_users: stats.unique_users,
        top_paths: stats.top_paths,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_parse() {
        let query = StatsQuery::parse(Some("site"), Some("2025-11-12")).unwrap();
        assert_eq!(query.date, NaiveDate::from_ymd_opt(2025, 11, 12));

        let query = StatsQuery::parse(Some("site"), Some("")).unwrap();
        assert_eq!(query.date, None);

        assert!(matches!(
            StatsQuery::parse(None, None),
            Err(ReportError::MissingSiteId)
        ));
        assert!(matches!(
            StatsQuery::parse(Some(""), None),
            Err(ReportError::MissingSiteId)
        ));
        assert!(matches!(
            StatsQuery::parse(Some("site"), Some("12/11/2025")),
            Err(ReportError::InvalidDate)
        ));
        assert!(matches!(
            StatsQuery::parse(Some("site"), Some("2025-02-30")),
            Err(ReportError::InvalidDate)
        ));
    }

    #[test]
    fn test_window_spans_one_utc_day() {
        let query = StatsQuery::parse(Some("site"), Some("2025-12-31")).unwrap();
        let window = query.window().unwrap().unwrap();
        assert_eq!(window.start, Utc.with_ymd_and_hms(2025, 12, 31, 0, 0, 0).unwrap());
        assert_eq!(window.end, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());

        let query = StatsQuery::parse(Some("site"), None).unwrap();
        assert_eq!(query.window().unwrap(), None);
    }
}
