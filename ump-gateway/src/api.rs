//! Error taxonomy of the gateway and its mapping to OGC exception documents.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// OGC API exception document returned for every pre-creation failure.
#[derive(Debug, Serialize)]
pub struct ExceptionDocument {
    pub r#type: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("job {0} has not produced results")]
    ResultsNotReady(Uuid),
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error("the gateway is shutting down")]
    ShuttingDown,
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::ResultsNotReady(_) => StatusCode::CONFLICT,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn exception_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidInput(_) => {
                "http://www.opengis.net/def/exceptions/ogcapi-processes-1/1.0/invalid-parameter"
            }
            GatewayError::NotFound(_) => {
                "http://www.opengis.net/def/exceptions/ogcapi-processes-1/1.0/no-such-process"
            }
            GatewayError::ResultsNotReady(_) => {
                "http://www.opengis.net/def/exceptions/ogcapi-processes-1/1.0/result-not-ready"
            }
            GatewayError::Upstream(_) => "about:blank",
            GatewayError::ShuttingDown => "about:blank",
            GatewayError::Internal(_) => "about:blank",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let detail = match &self {
            // Internal details stay out of the response; the correlation id
            // lets operators find the logged cause.
            GatewayError::Internal(message) => {
                let correlation_id = Uuid::now_v7();
                tracing::error!(%correlation_id, message, "internal gateway error");
                Some(format!("internal error, correlation id {correlation_id}"))
            }
            other => Some(other.to_string()),
        };

        let body = ExceptionDocument {
            r#type: self.exception_type().to_owned(),
            title: status
                .canonical_reason()
                .unwrap_or("Gateway Error")
                .to_owned(),
            status: status.as_u16(),
            detail,
        };

        (status, Json(body)).into_response()
    }
}
