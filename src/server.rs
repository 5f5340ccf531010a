//! HTTP boundary of the refresh endpoint.
//!
//! # Routes
//!
//! * `GET /api/track/{id}/refresh`
//!   - `200 {"url": "...", "stale": true}` with `stale` omitted when false
//!   - `404 {"error": "Track not found"}` for unknown tracks
//!   - `500 {"error": "Failed to refresh stream"}` for anything else
//! * `GET /health` answers `200 ok`
//!
//! Refresh answers are never cacheable: they exist because URLs expire.

use std::{future::Future, sync::Arc};

use axum::{
    extract::{Path, State},
    http::{header::CACHE_CONTROL, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use tokio::net::TcpListener;

use crate::{
    error::{ErrorKind, Result},
    protocol::refresh::{self, ErrorBody},
    refresh::Refresh,
    track::TrackId,
};

#[derive(Clone)]
struct AppState {
    refresher: Arc<dyn Refresh>,
}

/// Builds the router around `refresher`.
pub fn router(refresher: Arc<dyn Refresh>) -> Router {
    Router::new()
        .route("/api/track/:id/refresh", get(refresh_track))
        .route("/health", get(health))
        .with_state(AppState { refresher })
}

/// Serves the refresh endpoint on `listener` until `shutdown` completes.
///
/// # Errors
///
/// Returns an error if serving fails.
pub async fn serve<F>(listener: TcpListener, refresher: Arc<dyn Refresh>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("refresh endpoint listening on http://{addr}/");
    }

    axum::serve(listener, router(refresher))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("refresh endpoint stopped");
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}

fn no_store(status: StatusCode, body: impl IntoResponse) -> Response {
    (status, [(CACHE_CONTROL, "no-store")], body).into_response()
}

fn failure(status: StatusCode, message: &str) -> Response {
    no_store(
        status,
        Json(ErrorBody {
            error: message.to_owned(),
        }),
    )
}

async fn refresh_track(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    // Identifiers that cannot be parsed cannot name a track either.
    let Ok(id) = id.parse::<TrackId>() else {
        return failure(StatusCode::NOT_FOUND, "Track not found");
    };

    match state.refresher.refresh(&id).await {
        Ok(refreshed) => no_store(StatusCode::OK, Json(refresh::Response::from(refreshed))),
        Err(e) if e.kind == ErrorKind::NotFound => {
            debug!("refresh of unknown track {id}");
            failure(StatusCode::NOT_FOUND, "Track not found")
        }
        Err(e) => {
            error!("failed to refresh {id}: {e}");
            failure(StatusCode::INTERNAL_SERVER_ERROR, "Failed to refresh stream")
        }
    }
}
