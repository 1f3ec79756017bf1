use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;

use ump_common::process::{rel, Link, ProcessDescriptor, ProcessList};
use ump_common::status::StatusInfo;

use crate::api::GatewayError;

use super::AppState;

pub async fn list(State(state): State<AppState>) -> Result<Json<ProcessList>, GatewayError> {
    let processes = state.processes.list_all().await;
    let links = vec![Link::json(format!("{}/processes", state.api_base), rel::SELF)];
    Ok(Json(ProcessList { processes, links }))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ProcessDescriptor>, GatewayError> {
    Ok(Json(state.processes.get(&id).await?))
}

/// Execute a process. The answer is 201 with the job's current snapshot
/// whenever a local job was created, even if forwarding upstream failed;
/// only pre-creation problems surface as HTTP errors.
pub async fn execute(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, HeaderMap, Json<StatusInfo>), GatewayError> {
    let job = state.jobs.create_and_forward(&id, body).await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::LOCATION,
        format!("{}/jobs/{}", state.api_base, job.id)
            .parse()
            .map_err(|_| GatewayError::Internal("unrepresentable location header".to_owned()))?,
    );

    Ok((StatusCode::CREATED, headers, Json(job.status_info)))
}
