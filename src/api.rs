//! HTTP surface for the gateway and operators.
//!
//! | Endpoint | Method | Caller |
//! |----------|--------|--------|
//! | `/labs` | POST | tenant (`x-owner-id`) |
//! | `/labs/{id}` | GET | tenant |
//! | `/labs/{id}/end` | POST | tenant |
//! | `/operator/drift` | GET | operator |
//! | `/operator/labs/{id}` | GET | operator |
//! | `/operator/labs/{id}/force-stop` | POST | operator |
//!
//! Tenants only ever get an error code back. Messages, paths and captured
//! output stay in the log and on the operator routes.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::LabError;
use crate::lab::{Lab, LabManager, LabView};
use crate::reconcile::{DriftReport, Reconciler};
use crate::runtime::TeardownReport;

pub const OWNER_HEADER: &str = "x-owner-id";

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<LabManager>,
    pub reconciler: Arc<Reconciler>,
}

#[derive(Debug, Deserialize)]
pub struct CreateLabReq {
    pub recipe_ref: String,
}

pub struct ApiError(LabError);

impl From<LabError> for ApiError {
    fn from(err: LabError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LabError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            LabError::NotFound => StatusCode::NOT_FOUND,
            LabError::ActiveLabExists(_) | LabError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            LabError::ResourceUnavailable(_) | LabError::QuotaExceeded { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            LabError::BootFailure(_) | LabError::AgentFailure(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(kind = self.0.kind(), error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.kind() }))).into_response()
    }
}

fn owner(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| LabError::InvalidInput(format!("missing {OWNER_HEADER} header")).into())
}

fn lab_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| LabError::InvalidInput("malformed lab id".into()).into())
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/labs", post(create_lab))
        .route("/labs/{id}", get(get_lab))
        .route("/labs/{id}/end", post(end_lab))
        .route("/operator/drift", get(drift))
        .route("/operator/labs/{id}", get(inspect_lab))
        .route("/operator/labs/{id}/force-stop", post(force_stop))
        .with_state(state)
}

async fn create_lab(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateLabReq>,
) -> Result<(StatusCode, Json<LabView>), ApiError> {
    let owner = owner(&headers)?;
    let lab = state.manager.create_lab(&owner, &req.recipe_ref).await?;
    Ok((StatusCode::ACCEPTED, Json(LabView::from(&lab))))
}

async fn get_lab(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<LabView>, ApiError> {
    let owner = owner(&headers)?;
    let lab = state.manager.get_lab(&lab_id(&id)?, &owner)?;
    Ok(Json(LabView::from(&lab)))
}

async fn end_lab(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<LabView>), ApiError> {
    let owner = owner(&headers)?;
    let lab = state.manager.end_lab(&lab_id(&id)?, &owner).await?;
    Ok((StatusCode::ACCEPTED, Json(LabView::from(&lab))))
}

async fn drift(State(state): State<AppState>) -> Result<Json<DriftReport>, ApiError> {
    Ok(Json(state.reconciler.detect_drift().await?))
}

async fn inspect_lab(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Lab>, ApiError> {
    let lab = state
        .manager
        .store()
        .get(&lab_id(&id)?)?
        .ok_or(LabError::NotFound)?;
    Ok(Json(lab))
}

async fn force_stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TeardownReport>, ApiError> {
    Ok(Json(state.manager.force_stop(&lab_id(&id)?).await?))
}

/// Serve until `shutdown` flips.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "api listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}
