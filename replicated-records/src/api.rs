//! HTTP/JSON surface over [`NodeService`].
//!
//! Each route is a thin adapter: decode the request, call one service
//! operation, encode the result. Errors become `{ "error": kind, "message": .. }`
//! with a status code chosen by [`Error::kind`].

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::error::Error;
use crate::node::NodeService;
use crate::record::{FieldMap, Record};
use crate::transport::SYNC_PATH;

type ApiResult<T> = Result<T, Error>;

pub fn router(service: Arc<NodeService>) -> Router {
    Router::new()
        .route("/whoami", get(who_am_i))
        .route("/records", get(list_records).post(create_record))
        .route(
            "/records/:id",
            get(get_record).put(update_record).delete(delete_record),
        )
        .route("/records/:id/undo", post(undo))
        .route("/records/:id/redo", post(redo))
        .route("/records/:id/history", get(history))
        .route(SYNC_PATH, post(sync_data))
        .route("/run-replication", post(run_replication))
        .route("/replication-status", get(replication_status))
        .route("/simulate-failure", post(simulate_failure))
        .route("/restore-primary", post(restore_primary))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(service)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::NothingToUndo { .. } | Error::NothingToRedo { .. } => StatusCode::CONFLICT,
            Error::NotPrimary { .. } => StatusCode::FORBIDDEN,
            Error::NoBackupAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::UnknownNode { .. } | Error::MalformedInput { .. } => StatusCode::BAD_REQUEST,
            Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }

        let mut body = json!({ "error": self.kind(), "message": self.to_string() });
        if let Error::NotPrimary { primary, .. } = &self {
            body["primary"] = json!(primary);
        }
        (status, Json(body)).into_response()
    }
}

fn decode<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| Error::malformed(rejection.body_text()))
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    #[serde(default)]
    include_deleted: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RestoreRequest {
    node: Option<String>,
}

async fn who_am_i(State(node): State<Arc<NodeService>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(node.who_am_i().await?))
}

async fn list_records(
    State(node): State<Arc<NodeService>>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let data = node.list_records(params.include_deleted).await;
    Json(json!({ "source": node.node_id(), "data": data }))
}

async fn create_record(
    State(node): State<Arc<NodeService>>,
    payload: Result<Json<FieldMap>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let record = node.create_record(decode(payload)?).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "ok",
            "id": record.id,
            "written_to": node.node_id(),
            "record": record,
        })),
    ))
}

async fn get_record(
    State(node): State<Arc<NodeService>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Record>> {
    Ok(Json(node.get_record(&id).await?))
}

async fn update_record(
    State(node): State<Arc<NodeService>>,
    Path(id): Path<String>,
    payload: Result<Json<FieldMap>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let record = node.update_record(&id, decode(payload)?).await?;
    Ok(Json(json!({ "status": "updated", "id": id, "record": record })))
}

async fn delete_record(
    State(node): State<Arc<NodeService>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    node.delete_record(&id).await?;
    Ok(Json(json!({ "status": "deleted", "id": id })))
}

async fn undo(
    State(node): State<Arc<NodeService>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let record = node.undo(&id).await?;
    Ok(Json(json!({ "status": "undone", "id": id, "record": record })))
}

async fn redo(
    State(node): State<Arc<NodeService>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let record = node.redo(&id).await?;
    Ok(Json(json!({ "status": "redone", "id": id, "record": record })))
}

async fn history(
    State(node): State<Arc<NodeService>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let history = node.history(&id).await;
    Json(json!({ "id": id, "history": history }))
}

async fn sync_data(
    State(node): State<Arc<NodeService>>,
    payload: Result<Json<Vec<Record>>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let count = node.ingest_replication_payload(decode(payload)?).await?;
    Ok(Json(json!({
        "status": "synced",
        "node": node.node_id(),
        "count": count,
    })))
}

async fn run_replication(State(node): State<Arc<NodeService>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(node.run_replication().await?))
}

async fn replication_status(
    State(node): State<Arc<NodeService>>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(node.replication_status().await?))
}

async fn simulate_failure(State(node): State<Arc<NodeService>>) -> ApiResult<impl IntoResponse> {
    let failover = node.simulate_failure().await?;
    Ok(Json(json!({
        "message": format!(
            "Primary switched from {} -> {}",
            failover.previous, failover.primary
        ),
        "primary": failover.primary,
    })))
}

/// The body is optional; only an empty one falls back to the configured primary.
async fn restore_primary(
    State(node): State<Arc<NodeService>>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let request: RestoreRequest = if body.iter().all(u8::is_ascii_whitespace) {
        RestoreRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|err| Error::malformed(err.to_string()))?
    };
    let state = node.restore_primary(request.node.as_deref()).await?;
    Ok(Json(json!({
        "message": format!("Primary restored to {}", state.primary),
        "primary": state.primary,
    })))
}
