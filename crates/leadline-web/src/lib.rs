//! JSON surface over a live dashboard session.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use leadline_core::{CallStatus, RecordId};
use leadline_ledger::LedgerError;
use leadline_sync::{DashboardSession, DisplayQuery, StatusUpdateError};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "leadline-web";

#[derive(Clone)]
pub struct AppState {
    pub session: Arc<DashboardSession>,
}

impl AppState {
    pub fn new(session: Arc<DashboardSession>) -> Self {
        Self { session }
    }
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: CallStatus,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/dashboard", get(dashboard_handler))
        .route("/api/triggers", get(triggers_handler))
        .route("/api/display", put(display_handler))
        .route("/api/records/{id}/status", post(status_handler))
        .route("/api/refresh", post(refresh_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("LEADLINE_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let session = Arc::new(leadline_sync::start_session_from_env().await?);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving dashboard api");

    axum::serve(listener, app(AppState::new(Arc::clone(&session))))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "could not listen for ctrl-c");
            }
        })
        .await?;
    session.shutdown().await;
    Ok(())
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn dashboard_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.session.latest() {
        Some(bundle) => Json(bundle.as_ref()).into_response(),
        None => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "no refresh cycle has completed yet",
        ),
    }
}

async fn triggers_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.session.trigger_stats()).into_response()
}

async fn display_handler(
    State(state): State<Arc<AppState>>,
    Json(query): Json<DisplayQuery>,
) -> Response {
    state.session.set_display_query(query).await;
    StatusCode::ACCEPTED.into_response()
}

async fn status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<RecordId>,
    Json(body): Json<StatusBody>,
) -> Response {
    match state.session.update_status(id, body.status).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(StatusUpdateError::NoOperator) => {
            error_response(StatusCode::FORBIDDEN, "no operator is signed in")
        }
        Err(StatusUpdateError::Ledger(err)) => {
            warn!(record_id = id, error = %err, "status update failed");
            let status = match err {
                LedgerError::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            };
            error_response(status, &err.to_string())
        }
    }
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    if state.session.request_refresh() {
        StatusCode::ACCEPTED.into_response()
    } else {
        error_response(StatusCode::SERVICE_UNAVAILABLE, "refresh loop has stopped")
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
