//! HTTP surface: one allocation route plus operational extras.

use crate::allocator::Allocator;
use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use common::LeaseInfo;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, services::ServeDir};
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub allocator: Arc<Allocator>,
}

/// Build the router. `static_dir`, when given, is served at `/` as the
/// landing page.
pub fn app(state: AppState, static_dir: Option<&Path>) -> Router {
    let mut router = Router::new()
        .route("/create", get(request_box))
        .route("/list", get(list_leases))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state);

    if let Some(dir) = static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }
    router
}

async fn health() -> &'static str {
    "OK"
}

/// The one externally meaningful operation. Identity is the source IP of
/// the connection, port stripped, so reconnects from the same host land on
/// the same box.
async fn request_box(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<String, (StatusCode, String)> {
    let identity = addr.ip().to_string();

    let handle = state.allocator.get_or_create(&identity).await.map_err(|e| {
        error!(identity, error = %e, "allocation failed");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    if handle.newly_created {
        Ok(format!(
            "A new challenge box has been created : available for {} seconds on port {}\n",
            handle.remaining_seconds, handle.host_port
        ))
    } else {
        Ok(format!(
            "Picking an existing challenge box on port {}\n",
            handle.host_port
        ))
    }
}

async fn list_leases(
    State(state): State<AppState>,
) -> Result<Json<Vec<LeaseInfo>>, (StatusCode, String)> {
    let leases = state
        .allocator
        .store()
        .scan_all()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let now = Utc::now();
    let infos = leases
        .into_iter()
        .map(|l| LeaseInfo {
            age_seconds: (now - l.created_at).num_seconds().max(0) as u64,
            remaining_seconds: l.remaining_seconds(now),
            identity: l.identity,
            container_id: l.container_id,
            allocated_at: l.created_at,
        })
        .collect();
    Ok(Json(infos))
}
