use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ump_common::process::{rel, Link};
use ump_common::status::{JobStatus, StatusInfo};

use crate::api::GatewayError;
use crate::jobs::manager::JobResults;
use crate::jobs::JobFilter;

use super::AppState;

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
pub struct JobsQuery {
    status: Option<String>,
    #[serde(rename = "processID")]
    process_id: Option<String>,
    limit: Option<usize>,
    #[serde(default)]
    offset: usize,
}

#[derive(Debug, Serialize)]
pub struct JobList {
    pub jobs: Vec<StatusInfo>,
    pub links: Vec<Link>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<JobList>, GatewayError> {
    let status = query
        .status
        .as_deref()
        .map(|value| {
            value.parse::<JobStatus>().map_err(|_| {
                GatewayError::InvalidInput(format!("{value} is not a valid job status"))
            })
        })
        .transpose()?;

    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    let filter = JobFilter {
        status,
        process_id: query.process_id.clone(),
        limit: Some(limit),
        offset: query.offset,
    };
    let jobs = state.jobs.list_jobs(&filter).await?;

    let mut links = vec![Link::json(format!("{}/jobs", state.api_base), rel::SELF)];
    if jobs.len() == limit {
        links.push(Link::json(
            format!(
                "{}/jobs?limit={}&offset={}",
                state.api_base,
                limit,
                query.offset + limit
            ),
            rel::NEXT,
        ));
    }
    if query.offset > 0 {
        links.push(Link::json(
            format!(
                "{}/jobs?limit={}&offset={}",
                state.api_base,
                limit,
                query.offset.saturating_sub(limit)
            ),
            rel::PREV,
        ));
    }

    Ok(Json(JobList {
        jobs: jobs.into_iter().map(|job| job.status_info).collect(),
        links,
    }))
}

pub async fn get(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<StatusInfo>, GatewayError> {
    let job = state.jobs.get_job(job_id).await?;
    Ok(Json(job.status_info))
}

pub async fn dismiss(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<StatusInfo>, GatewayError> {
    let job = state.jobs.dismiss(job_id).await?;
    Ok(Json(job.status_info))
}

pub async fn results(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Response, GatewayError> {
    match state.jobs.results(job_id).await? {
        JobResults::Inline(outputs) => Ok(Json(outputs).into_response()),
        JobResults::Redirect(url) => {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::LOCATION,
                url.parse().map_err(|_| {
                    GatewayError::Internal("unrepresentable results location".to_owned())
                })?,
            );
            Ok((StatusCode::FOUND, headers).into_response())
        }
    }
}
