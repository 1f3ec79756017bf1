//! Turning an upstream execute or poll answer into a canonical snapshot.
//!
//! Upstreams disagree wildly about what an execution answer looks like:
//! some return a status document, some return the outputs directly, some
//! only hand back a `Location` header. Each shape is handled by one
//! strategy; strategies are tried in priority order and the first one that
//! applies wins. Derivation never reads the clock, so identical upstream
//! answers always derive identical snapshots.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use url::Url;

use ump_common::client::{HttpClient, Response};
use ump_common::status::{JobStatus, StatusInfo};

use crate::jobs::store::{job_links, Job};
use crate::providers::Provider;

const EXCERPT_LIMIT: usize = 512;

pub struct DeriveContext<'a> {
    pub response: &'a Response,
    pub provider: &'a Provider,
    pub job: &'a Job,
    pub client: &'a dyn HttpClient,
    pub api_base: &'a str,
}

/// What a derivation produced: the canonical snapshot plus whatever the
/// upstream taught us about where the job lives remotely.
#[derive(Debug)]
pub struct Derived {
    pub status_info: StatusInfo,
    pub remote_job_id: Option<String>,
    pub remote_status_url: Option<String>,
    pub outputs: Option<Value>,
}

#[async_trait]
pub trait DeriveStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn applies(&self, ctx: &DeriveContext) -> bool;
    async fn derive(&self, ctx: &DeriveContext<'_>) -> Derived;
}

/// Resolve a `Location` value against the provider base. Absolute URLs are
/// taken as-is even when they point at a different host; some providers run
/// their status endpoint elsewhere.
fn resolve_location(provider: &Provider, location: &str) -> String {
    if Url::parse(location).is_ok() {
        return location.to_owned();
    }
    provider
        .base_url
        .join(location)
        .map(|url| url.to_string())
        .unwrap_or_else(|_| location.to_owned())
}

/// Canonical snapshot skeleton for the context's job. Timestamps beyond
/// `created` are the job manager's business.
fn snapshot(ctx: &DeriveContext, status: JobStatus) -> StatusInfo {
    let mut info = StatusInfo::new(
        ctx.job.process_id.to_string(),
        ctx.job.id.to_string(),
        status,
        ctx.job.created,
    );
    info.links = job_links(ctx.api_base, ctx.job.id, status);
    info
}

fn body_has_status(body: &Value) -> bool {
    body.get("jobID").is_some() && body.get("status").is_some()
}

fn body_has_outputs(body: &Value) -> bool {
    body.get("outputs").is_some() && body.get("status").is_none()
}

/// Strategy 1: the body is a status document of its own.
struct DirectStatus;

impl DirectStatus {
    fn derive_from_body(ctx: &DeriveContext, body: &Value) -> Derived {
        let upstream_status = body.get("status").and_then(Value::as_str).unwrap_or("");
        let (status, unknown) = match upstream_status.parse::<JobStatus>() {
            Ok(status) => (status, None),
            Err(_) => (JobStatus::Failed, Some(upstream_status.to_owned())),
        };

        let mut info = snapshot(ctx, status);
        info.message = match unknown {
            Some(value) => Some(format!("upstream reported unknown status {value:?}")),
            None => body
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_owned),
        };
        info.progress = body
            .get("progress")
            .and_then(Value::as_u64)
            .map(|progress| progress.min(100) as u8);

        Derived {
            status_info: info,
            remote_job_id: body
                .get("jobID")
                .and_then(Value::as_str)
                .map(str::to_owned),
            remote_status_url: ctx
                .response
                .location()
                .map(|location| resolve_location(ctx.provider, &location)),
            outputs: None,
        }
    }
}

#[async_trait]
impl DeriveStrategy for DirectStatus {
    fn name(&self) -> &'static str {
        "direct-status"
    }

    fn applies(&self, ctx: &DeriveContext) -> bool {
        ctx.response
            .json()
            .map_or(false, |body| body_has_status(&body))
    }

    async fn derive(&self, ctx: &DeriveContext<'_>) -> Derived {
        let body = ctx.response.json().expect("applies() checked the body");
        Self::derive_from_body(ctx, &body)
    }
}

/// Strategy 2: the upstream executed synchronously and answered with the
/// outputs document. The snapshot is terminal-successful; the outputs are
/// carried next to it, never inside it.
struct ImmediateResults;

impl ImmediateResults {
    fn derive_from_body(ctx: &DeriveContext, body: &Value) -> Derived {
        let info = snapshot(ctx, JobStatus::Successful).with_progress(100);
        Derived {
            status_info: info,
            remote_job_id: None,
            remote_status_url: None,
            outputs: body.get("outputs").cloned(),
        }
    }
}

#[async_trait]
impl DeriveStrategy for ImmediateResults {
    fn name(&self) -> &'static str {
        "immediate-results"
    }

    fn applies(&self, ctx: &DeriveContext) -> bool {
        ctx.response
            .json()
            .map_or(false, |body| body_has_outputs(&body))
    }

    async fn derive(&self, ctx: &DeriveContext<'_>) -> Derived {
        let body = ctx.response.json().expect("applies() checked the body");
        Self::derive_from_body(ctx, &body)
    }
}

/// Strategy 3: no status in the body, but a `Location` header names where
/// to look. One follow-up GET, then the body strategies are tried on that
/// answer. The resolved URL is kept either way.
struct LocationFollowUp;

#[async_trait]
impl DeriveStrategy for LocationFollowUp {
    fn name(&self) -> &'static str {
        "location-follow-up"
    }

    fn applies(&self, ctx: &DeriveContext) -> bool {
        ctx.response.location().is_some()
    }

    async fn derive(&self, ctx: &DeriveContext<'_>) -> Derived {
        let location = ctx.response.location().expect("applies() checked the header");
        let status_url = resolve_location(ctx.provider, &location);

        let followed = ctx
            .client
            .get(&status_url, ctx.provider.timeout, &ctx.provider.headers())
            .await;

        let mut derived = match followed {
            Ok(response) if response.is_success() => {
                let body = response.json().unwrap_or(Value::Null);
                let sub_ctx = DeriveContext {
                    response: &response,
                    provider: ctx.provider,
                    job: ctx.job,
                    client: ctx.client,
                    api_base: ctx.api_base,
                };
                if body_has_status(&body) {
                    DirectStatus::derive_from_body(&sub_ctx, &body)
                } else if body_has_outputs(&body) {
                    ImmediateResults::derive_from_body(&sub_ctx, &body)
                } else {
                    FallbackFailure::derive_from_response(ctx, &response)
                }
            }
            Ok(response) => FallbackFailure::derive_from_response(ctx, &response),
            Err(error) => {
                let info = snapshot(ctx, JobStatus::Failed)
                    .with_message(format!("status endpoint unreachable: {error}"));
                Derived {
                    status_info: info,
                    remote_job_id: None,
                    remote_status_url: None,
                    outputs: None,
                }
            }
        };

        derived.remote_status_url = Some(status_url);
        derived
    }
}

/// Strategy 4: nothing matched; the answer becomes a terminal failure with
/// a diagnostic carrying the upstream status and a body excerpt.
struct FallbackFailure;

impl FallbackFailure {
    fn derive_from_response(ctx: &DeriveContext, response: &Response) -> Derived {
        let excerpt = response.excerpt(EXCERPT_LIMIT);
        let message = if excerpt.is_empty() {
            format!("upstream answered {} with an empty body", response.status)
        } else {
            format!("upstream answered {}: {}", response.status, excerpt)
        };
        let info = snapshot(ctx, JobStatus::Failed).with_message(message);
        Derived {
            status_info: info,
            remote_job_id: None,
            remote_status_url: None,
            outputs: None,
        }
    }
}

#[async_trait]
impl DeriveStrategy for FallbackFailure {
    fn name(&self) -> &'static str {
        "fallback-failure"
    }

    fn applies(&self, _ctx: &DeriveContext) -> bool {
        true
    }

    async fn derive(&self, ctx: &DeriveContext<'_>) -> Derived {
        Self::derive_from_response(ctx, ctx.response)
    }
}

/// The priority-ordered strategy table.
pub struct StatusDeriver {
    strategies: Vec<Box<dyn DeriveStrategy>>,
}

impl Default for StatusDeriver {
    fn default() -> Self {
        Self {
            strategies: vec![
                Box::new(DirectStatus),
                Box::new(ImmediateResults),
                Box::new(LocationFollowUp),
                Box::new(FallbackFailure),
            ],
        }
    }
}

impl StatusDeriver {
    /// Full derivation: some strategy always applies, the last one turning
    /// the answer into a terminal failure.
    pub async fn derive(&self, ctx: &DeriveContext<'_>) -> Derived {
        for strategy in &self.strategies {
            if strategy.applies(ctx) {
                debug!(strategy = strategy.name(), job = %ctx.job.id, "deriving status");
                return strategy.derive(ctx).await;
            }
        }
        unreachable!("the fallback strategy applies to every response");
    }

    /// Lenient derivation for the poll loop: only answers that actually
    /// carry a recognizable document produce a snapshot. Anything else is
    /// `None`, to be logged and retried at the next tick rather than
    /// failing the job.
    pub async fn derive_lenient(&self, ctx: &DeriveContext<'_>) -> Option<Derived> {
        for strategy in &self.strategies {
            if strategy.name() == "fallback-failure" {
                return None;
            }
            if strategy.applies(ctx) {
                return Some(strategy.derive(ctx).await);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderAuth;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use ump_common::client::MockHttpClient;
    use ump_common::process::ProcessId;

    fn provider() -> Provider {
        Provider {
            name: "ms1".to_owned(),
            base_url: Url::parse("http://ms1").unwrap(),
            auth: ProviderAuth::None,
            timeout: Duration::from_secs(5),
            processes: HashMap::new(),
        }
    }

    fn job() -> Job {
        Job::new(
            uuid::Uuid::now_v7(),
            ProcessId::new("ms1", "square").unwrap(),
            json!({"inputs": {"n": 4}}),
            "http://gateway:5000",
            Utc::now(),
        )
    }

    fn ctx<'a>(
        response: &'a Response,
        provider: &'a Provider,
        job: &'a Job,
        client: &'a MockHttpClient,
    ) -> DeriveContext<'a> {
        DeriveContext {
            response,
            provider,
            job,
            client,
            api_base: "http://gateway:5000",
        }
    }

    #[tokio::test]
    async fn direct_status_extracts_remote_identity() {
        let provider = provider();
        let job = job();
        let client = MockHttpClient::new();
        let response = Response::of_json(
            201,
            &json!({"jobID": "r-99", "status": "running", "type": "process", "progress": 0}),
        )
        .with_header("location", "http://ms1/jobs/r-99");

        let derived = StatusDeriver::default()
            .derive(&ctx(&response, &provider, &job, &client))
            .await;

        assert_eq!(derived.status_info.status, JobStatus::Running);
        assert_eq!(derived.status_info.progress, Some(0));
        // The snapshot speaks in local ids; the upstream id is kept aside.
        assert_eq!(derived.status_info.job_id, job.id.to_string());
        assert_eq!(derived.remote_job_id.as_deref(), Some("r-99"));
        assert_eq!(
            derived.remote_status_url.as_deref(),
            Some("http://ms1/jobs/r-99")
        );
    }

    #[tokio::test]
    async fn unknown_upstream_status_fails_with_diagnostic() {
        let provider = provider();
        let job = job();
        let client = MockHttpClient::new();
        let response = Response::of_json(200, &json!({"jobID": "r-1", "status": "paused"}));

        let derived = StatusDeriver::default()
            .derive(&ctx(&response, &provider, &job, &client))
            .await;

        assert_eq!(derived.status_info.status, JobStatus::Failed);
        assert!(derived
            .status_info
            .message
            .as_deref()
            .unwrap()
            .contains("paused"));
    }

    #[tokio::test]
    async fn immediate_results_synthesize_success() {
        let provider = provider();
        let job = job();
        let client = MockHttpClient::new();
        let response = Response::of_json(200, &json!({"outputs": {"root": 2}}));

        let derived = StatusDeriver::default()
            .derive(&ctx(&response, &provider, &job, &client))
            .await;

        assert_eq!(derived.status_info.status, JobStatus::Successful);
        assert_eq!(derived.status_info.progress, Some(100));
        assert_eq!(derived.outputs, Some(json!({"root": 2})));
        // Outputs never leak into the snapshot itself.
        assert_eq!(
            serde_json::to_value(&derived.status_info)
                .unwrap()
                .get("outputs"),
            None
        );
        let results_link = derived
            .status_info
            .links
            .iter()
            .find(|link| link.rel.contains("results"))
            .unwrap();
        assert_eq!(
            results_link.href,
            format!("http://gateway:5000/jobs/{}/results", job.id)
        );
    }

    #[tokio::test]
    async fn location_follow_up_resolves_relative_urls() {
        let provider = provider();
        let job = job();
        let client = MockHttpClient::new();
        client.script(
            "GET",
            "http://ms1/status/abc",
            Ok(Response::of_json(
                200,
                &json!({"jobID": "abc", "status": "running", "type": "process"}),
            )),
        );
        let response = Response::empty(201).with_header("location", "/status/abc");

        let derived = StatusDeriver::default()
            .derive(&ctx(&response, &provider, &job, &client))
            .await;

        assert_eq!(derived.status_info.status, JobStatus::Running);
        assert_eq!(derived.remote_job_id.as_deref(), Some("abc"));
        assert_eq!(
            derived.remote_status_url.as_deref(),
            Some("http://ms1/status/abc")
        );
    }

    #[tokio::test]
    async fn location_follow_up_keeps_the_url_when_the_probe_fails() {
        let provider = provider();
        let job = job();
        let client = MockHttpClient::new();
        let response = Response::empty(201).with_header("location", "http://other-host/st/1");

        let derived = StatusDeriver::default()
            .derive(&ctx(&response, &provider, &job, &client))
            .await;

        // Cross-host locations are followed and stored as-is.
        assert_eq!(client.request_count("GET", "http://other-host/st/1"), 1);
        assert_eq!(
            derived.remote_status_url.as_deref(),
            Some("http://other-host/st/1")
        );
        assert_eq!(derived.status_info.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn fallback_failure_carries_status_and_excerpt() {
        let provider = provider();
        let job = job();
        let client = MockHttpClient::new();
        let mut response = Response::empty(503);
        response.body = bytes::Bytes::from(vec![b'e'; 1000]);

        let derived = StatusDeriver::default()
            .derive(&ctx(&response, &provider, &job, &client))
            .await;

        assert_eq!(derived.status_info.status, JobStatus::Failed);
        let message = derived.status_info.message.unwrap();
        assert!(message.contains("503"));
        // Excerpts stay bounded.
        assert!(message.len() < 600);
    }

    #[tokio::test]
    async fn identical_responses_derive_identical_snapshots() {
        let provider = provider();
        let job = job();
        let client = MockHttpClient::new();
        let response = Response::of_json(
            200,
            &json!({"jobID": "r-1", "status": "running", "progress": 40}),
        );

        let deriver = StatusDeriver::default();
        let first = deriver.derive(&ctx(&response, &provider, &job, &client)).await;
        let second = deriver.derive(&ctx(&response, &provider, &job, &client)).await;
        assert_eq!(first.status_info, second.status_info);
    }

    #[tokio::test]
    async fn lenient_mode_ignores_unrecognizable_answers() {
        let provider = provider();
        let job = job();
        let client = MockHttpClient::new();
        let deriver = StatusDeriver::default();

        let garbage = Response::of_json(200, &json!({"hello": "world"}));
        assert!(deriver
            .derive_lenient(&ctx(&garbage, &provider, &job, &client))
            .await
            .is_none());

        let error = Response::empty(500);
        assert!(deriver
            .derive_lenient(&ctx(&error, &provider, &job, &client))
            .await
            .is_none());

        let real = Response::of_json(200, &json!({"jobID": "r", "status": "successful"}));
        let derived = deriver
            .derive_lenient(&ctx(&real, &provider, &job, &client))
            .await
            .unwrap();
        assert_eq!(derived.status_info.status, JobStatus::Successful);
    }

    // Arc is used by the manager; keep the trait object-safe.
    #[test]
    fn strategies_are_object_safe() {
        let _strategies: Vec<Arc<dyn DeriveStrategy>> = vec![Arc::new(FallbackFailure)];
    }
}
