use axum::{
	Json, Router,
	extract::{Path, State, rejection::JsonRejection},
	http::{StatusCode, header},
	response::{IntoResponse, Response},
	routing::{get, post},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::AppState;
use sieve_service::{
	Checkpoint, CheckpointDecision, CheckpointParams, Error, ReviewExport, RunSummary,
	StartRunRequest,
};

pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/health", get(health))
		.route("/v1/runs", post(create_run))
		.route("/v1/runs/{run_id}", get(get_run))
		.route("/v1/runs/{run_id}/checkpoint", get(get_checkpoint).post(resolve_checkpoint))
		.route("/v1/runs/{run_id}/resume", post(resume))
		.route("/v1/runs/{run_id}/cancel", post(cancel))
		.route("/v1/runs/{run_id}/export", get(export))
		.route("/v1/runs/{run_id}/report", get(report))
		.with_state(state)
}

/// Body of `POST /v1/runs/{run_id}/checkpoint`.
#[derive(Debug, Deserialize)]
pub struct CheckpointBody {
	pub decision: CheckpointDecision,
	#[serde(flatten)]
	pub params: CheckpointParams,
}

async fn health() -> StatusCode {
	StatusCode::OK
}

async fn create_run(
	State(state): State<AppState>,
	payload: Result<Json<StartRunRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RunSummary>), ApiError> {
	let Json(payload) = payload?;
	let summary = state.service.start_run(payload).await?;

	Ok((StatusCode::CREATED, Json(summary)))
}

async fn get_run(
	State(state): State<AppState>,
	Path(run_id): Path<Uuid>,
) -> Result<Json<RunSummary>, ApiError> {
	Ok(Json(state.service.get_run(run_id).await?))
}

async fn get_checkpoint(
	State(state): State<AppState>,
	Path(run_id): Path<Uuid>,
) -> Result<Json<Checkpoint>, ApiError> {
	let checkpoint = state.service.get_pending_checkpoint(run_id).await?.ok_or_else(|| {
		json_error(StatusCode::NOT_FOUND, "NOT_FOUND", format!("Run {run_id} has no pending checkpoint."))
	})?;

	Ok(Json(checkpoint))
}

async fn resolve_checkpoint(
	State(state): State<AppState>,
	Path(run_id): Path<Uuid>,
	payload: Result<Json<CheckpointBody>, JsonRejection>,
) -> Result<Json<RunSummary>, ApiError> {
	let Json(body) = payload?;
	let summary = state.service.resolve_checkpoint(run_id, body.decision, body.params).await?;

	Ok(Json(summary))
}

async fn resume(
	State(state): State<AppState>,
	Path(run_id): Path<Uuid>,
) -> Result<Json<RunSummary>, ApiError> {
	Ok(Json(state.service.resume(run_id).await?))
}

async fn cancel(
	State(state): State<AppState>,
	Path(run_id): Path<Uuid>,
) -> Result<Json<RunSummary>, ApiError> {
	Ok(Json(state.service.cancel(run_id).await?))
}

async fn export(
	State(state): State<AppState>,
	Path(run_id): Path<Uuid>,
) -> Result<Json<ReviewExport>, ApiError> {
	Ok(Json(state.service.export(run_id).await?))
}

async fn report(State(state): State<AppState>, Path(run_id): Path<Uuid>) -> Result<Response, ApiError> {
	let markdown = state.service.export(run_id).await?.to_markdown();

	Ok(([(header::CONTENT_TYPE, "text/markdown; charset=utf-8")], markdown).into_response())
}

#[derive(Debug, Serialize)]
struct ErrorBody {
	error_code: String,
	message: String,
}

#[derive(Debug)]
pub struct ApiError {
	status: StatusCode,
	error_code: String,
	message: String,
}
impl ApiError {
	fn new(status: StatusCode, error_code: impl Into<String>, message: impl Into<String>) -> Self {
		Self { status, error_code: error_code.into(), message: message.into() }
	}
}
impl From<Error> for ApiError {
	fn from(err: Error) -> Self {
		let status = match &err {
			Error::NotFound { .. } => StatusCode::NOT_FOUND,
			Error::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
			Error::Configuration { .. } => StatusCode::UNPROCESSABLE_ENTITY,
			Error::Conflict { .. } => StatusCode::CONFLICT,
			Error::CorpusUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
			Error::Provider { .. }
			| Error::MalformedResult { .. }
			| Error::Storage { .. }
			| Error::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
		};

		if status.is_server_error() {
			tracing::error!(error = %err, error_code = err.code(), "Request failed.");
		}

		json_error(status, err.code(), err.to_string())
	}
}
impl From<JsonRejection> for ApiError {
	fn from(rejection: JsonRejection) -> Self {
		json_error(StatusCode::BAD_REQUEST, "INVALID_REQUEST", rejection.body_text())
	}
}
impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let body = ErrorBody { error_code: self.error_code, message: self.message };

		(self.status, Json(body)).into_response()
	}
}

pub fn json_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
	ApiError::new(status, code, message)
}
