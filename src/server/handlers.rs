use axum::{
    Json,
    extract::{Query, State, rejection::JsonRejection},
    http::StatusCode,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;

use crate::{
    event::IncomingEvent,
    queue,
    report::{self, StatsQuery, StatsReport},
    server::{IngestState, ReportState, app_error::AppError},
};

#[derive(Deserialize, Debug)]
pub struct StatsParams {
    site_id: Option<String>,
    date: Option<String>,
}

/// Validates an event and appends it to the queue.
///
/// A 202 means the event is queued; it is persisted later, or not at all if the
/// worker cannot store it.
#[axum::debug_handler]
#[instrument(skip_all)]
pub async fn post_event(
    State(state): State<Arc<IngestState>>,
    body: Result<Json<IncomingEvent>, JsonRejection>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let Json(incoming) = body?;
    let event = incoming.validate()?;
    queue::enqueue(state.queue.as_ref(), &state.queue_name, &event).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "accepted" })),
    ))
}

/// Returns view counts for a site, optionally for one UTC day.
#[axum::debug_handler]
#[instrument(skip(state))]
pub async fn get_stats(
    State(state): State<Arc<ReportState>>,
    Query(params): Query<StatsParams>,
) -> Result<Json<StatsReport>, AppError> {
    let query = StatsQuery::parse(params.site_id.as_deref(), params.date.as_deref())?;
    let report = report::site_report(state.store.as_ref(), query).await?;
    Ok(Json(report))
}
