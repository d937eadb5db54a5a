mod app_error;
mod handlers;

use anyhow::{Context, Result};
use axum::{
    Router,
    response::IntoResponse,
    routing::{get, post},
};
use std::{future::Future, sync::Arc};
use tracing::info;

use crate::{
    queue::EventQueue,
    server::handlers::{get_stats, post_event},
    storage::Storage,
};

/// State of the ingestion routes.
pub struct IngestState {
    pub queue: Arc<dyn EventQueue + Send + Sync + 'static>,
    pub queue_name: String,
}

/// State of the reporting routes.
pub struct ReportState {
    pub store: Arc<dyn Storage + Send + Sync + 'static>,
}

/// Dummy handler to show the server is running.
async fn welcome() -> impl IntoResponse {
    "I'm completely operational, and all my circuits are functioning perfectly."
}

/// Builds the router with whichever halves of the API this process serves.
pub fn make_server(ingest: Option<IngestState>, report: Option<ReportState>) -> Router {
    let mut app = Router::new().route("/", get(welcome));
    if let Some(ingest) = ingest {
        app = app.merge(
            Router::new()
                .route("/event", post(post_event))
                .with_state(Arc::new(ingest)),
        );
    }
    if let Some(report) = report {
        app = app.merge(
            Router::new()
                .route("/stats", get(get_stats))
                .with_state(Arc::new(report)),
        );
    }
    app
}

/// Serves `app` on `port` until `shutdown` resolves.
pub async fn serve(
    app: Router,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .with_context(|| format!("Failed to bind to port {port}"))?;
    info!("Listening on http://localhost:{port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .with_context(|| "Failed to start server")
}
