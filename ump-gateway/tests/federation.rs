//! End-to-end tests driving the gateway router against scripted upstreams.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{self, HeaderMap, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use ump_common::client::{MockHttpClient, Response};
use ump_common::retry::RetryPolicy;
use ump_gateway::cache::ProcessCache;
use ump_gateway::handlers::{add_routes, AppState};
use ump_gateway::jobs::{JobManager, JobManagerSettings, MemoryJobStore};
use ump_gateway::processes::ProcessManager;
use ump_gateway::providers::ProvidersRegistry;

const PROVIDERS: &str = r#"
providers:
  ms1:
    url: http://ms1
  ms2:
    url: http://ms2
    processes:
      localstore:
        result_storage: local
"#;

const API_BASE: &str = "http://gateway:5000/v1.0";

fn app() -> (Router, Arc<MockHttpClient>) {
    let client = Arc::new(MockHttpClient::new());
    let registry = Arc::new(
        ProvidersRegistry::from_yaml(PROVIDERS, Duration::from_secs(5)).unwrap(),
    );
    let processes = Arc::new(ProcessManager::new(
        registry.clone(),
        client.clone(),
        ProcessCache::new(Duration::from_secs(60)),
        API_BASE,
        true,
    ));
    let jobs = JobManager::new(
        Arc::new(MemoryJobStore::new()),
        client.clone(),
        registry,
        processes.clone(),
        JobManagerSettings {
            api_base: API_BASE.to_owned(),
            forward_retry: RetryPolicy::new(
                3,
                Duration::from_millis(5),
                Duration::from_millis(10),
            )
            .unwrap(),
            poll_interval: Duration::from_millis(50),
            ..Default::default()
        },
        Vec::new(),
    );

    let router = add_routes(
        Router::new(),
        AppState {
            processes,
            jobs,
            api_base: API_BASE.to_owned(),
        },
    );
    (router, client)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, headers, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(http::Method::POST)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_string(body).unwrap()))
        .unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method(http::Method::DELETE)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

fn script_square(client: &MockHttpClient) {
    client.script(
        "GET",
        "http://ms1/processes/square",
        Ok(Response::of_json(200, &json!({"id": "square"}))),
    );
}

#[tokio::test]
async fn process_listing_aggregates_providers() {
    let (app, client) = app();
    client.script(
        "GET",
        "http://ms1/processes",
        Ok(Response::of_json(
            200,
            &json!({"processes": [{"id": "square", "title": "Square"}]}),
        )),
    );
    client.script(
        "GET",
        "http://ms2/processes",
        Ok(Response::empty(503)),
    );

    let (status, _, body) = send(&app, get("/v1.0/processes")).await;
    assert_eq!(status, StatusCode::OK);

    let processes = body["processes"].as_array().unwrap();
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0]["id"], json!("ms1:square"));
    assert_eq!(processes[0]["version"], json!("1.0.0"));
    assert_eq!(body["links"][0]["rel"], json!("self"));
}

#[tokio::test]
async fn process_descriptor_roundtrip() {
    let (app, client) = app();
    client.script(
        "GET",
        "http://ms1/processes/square",
        Ok(Response::of_json(
            200,
            &json!({"id": "square", "inputs": {"n": {"schema": {"type": "integer"}}}}),
        )),
    );

    let (status, _, body) = send(&app, get("/v1.0/processes/ms1:square")).await;
    assert_eq!(status, StatusCode::OK);
    assert_json_diff::assert_json_include!(
        actual: body.clone(),
        expected: json!({
            "id": "ms1:square",
            "version": "1.0.0",
            "jobControlOptions": ["async-execute"],
        })
    );
    assert!(body["inputs"].is_object());

    let (status, _, body) = send(&app, get("/v1.0/processes/ms1:absent")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], json!(404));
    assert!(body["detail"].is_string());
}

#[tokio::test]
async fn execute_answers_201_with_location_and_local_ids_only() {
    let (app, client) = app();
    script_square(&client);
    client.script(
        "POST",
        "http://ms1/processes/square/execution",
        Ok(Response::of_json(
            201,
            &json!({"jobID": "r-99", "status": "running", "type": "process", "progress": 0}),
        )
        .with_header("location", "http://ms1/jobs/r-99")),
    );
    client.script(
        "GET",
        "http://ms1/jobs/r-99",
        Ok(Response::of_json(
            200,
            &json!({"jobID": "r-99", "status": "running", "type": "process"}),
        )),
    );

    let (status, headers, body) = send(
        &app,
        post_json("/v1.0/processes/ms1:square/execution", &json!({"inputs": {"n": 4}})),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    let job_id: Uuid = body["jobID"].as_str().unwrap().parse().unwrap();
    assert_eq!(
        headers.get("location").unwrap().to_str().unwrap(),
        format!("{API_BASE}/jobs/{job_id}")
    );
    assert_eq!(body["status"], json!("running"));
    assert_eq!(body["processID"], json!("ms1:square"));
    // Neither the upstream job id nor the inputs appear in the document.
    let rendered = body.to_string();
    assert!(!rendered.contains("r-99"));
    assert!(body.get("inputs").is_none());

    // The job routes serve the same snapshot under the local id.
    let (status, _, fetched) = send(&app, get(&format!("/v1.0/jobs/{job_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["jobID"], body["jobID"]);

    let (status, _, listed) = send(&app, get("/v1.0/jobs?status=running")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["jobs"].as_array().unwrap().len(), 1);
    assert!(!listed.to_string().contains("r-99"));
}

#[tokio::test]
async fn execute_of_unknown_process_is_a_404_exception() {
    let (app, client) = app();
    client.script(
        "GET",
        "http://ms1/processes/absent",
        Ok(Response::empty(404)),
    );

    let (status, _, body) = send(
        &app,
        post_json("/v1.0/processes/ms1:absent/execution", &json!({"inputs": {}})),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], json!(404));
    assert!(body["type"].as_str().unwrap().contains("no-such-process"));
}

#[tokio::test]
async fn execute_with_a_non_object_body_is_a_400() {
    let (app, client) = app();
    script_square(&client);

    let (status, _, body) = send(
        &app,
        post_json("/v1.0/processes/ms1:square/execution", &json!(["not", "an", "object"])),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], json!(400));
}

#[tokio::test]
async fn forward_failure_still_creates_the_job() {
    let (app, client) = app();
    script_square(&client);
    client.script(
        "POST",
        "http://ms1/processes/square/execution",
        Ok(Response::empty(503)),
    );

    let (status, headers, body) = send(
        &app,
        post_json("/v1.0/processes/ms1:square/execution", &json!({"inputs": {"n": 4}})),
    )
    .await;

    // Still 201: the local job exists, the failure lives in the snapshot.
    assert_eq!(status, StatusCode::CREATED);
    assert!(headers.contains_key("location"));
    assert_eq!(body["status"], json!("failed"));
    assert!(body["message"].as_str().unwrap().contains("503"));
}

#[tokio::test]
async fn immediate_results_are_served_from_the_gateway() {
    let (app, client) = app();
    script_square(&client);
    client.script(
        "POST",
        "http://ms1/processes/square/execution",
        Ok(Response::of_json(200, &json!({"outputs": {"root": 2}}))),
    );

    let (status, _, body) = send(
        &app,
        post_json("/v1.0/processes/ms1:square/execution", &json!({"inputs": {"n": 4}})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], json!("successful"));
    assert_eq!(body["progress"], json!(100));
    let job_id = body["jobID"].as_str().unwrap().to_owned();

    let results_link = body["links"]
        .as_array()
        .unwrap()
        .iter()
        .find(|link| link["rel"].as_str().unwrap().contains("results"))
        .expect("successful jobs carry a results link");
    assert_eq!(
        results_link["href"],
        json!(format!("{API_BASE}/jobs/{job_id}/results"))
    );

    let (status, _, results) = send(&app, get(&format!("/v1.0/jobs/{job_id}/results"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(results, json!({"root": 2}));
}

#[tokio::test]
async fn results_before_success_are_a_409() {
    let (app, client) = app();
    script_square(&client);
    client.script(
        "POST",
        "http://ms1/processes/square/execution",
        Ok(Response::of_json(
            201,
            &json!({"jobID": "r-1", "status": "running", "type": "process"}),
        )),
    );

    let (_, _, body) = send(
        &app,
        post_json("/v1.0/processes/ms1:square/execution", &json!({"inputs": {}})),
    )
    .await;
    let job_id = body["jobID"].as_str().unwrap().to_owned();

    let (status, _, exception) = send(&app, get(&format!("/v1.0/jobs/{job_id}/results"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(exception["status"], json!(409));
}

#[tokio::test]
async fn remote_results_redirect_to_the_upstream() {
    let (app, client) = app();
    script_square(&client);
    client.script(
        "POST",
        "http://ms1/processes/square/execution",
        Ok(Response::of_json(
            201,
            &json!({"jobID": "r-9", "status": "successful", "type": "process"}),
        )
        .with_header("location", "http://ms1/jobs/r-9")),
    );
    client.script(
        "HEAD",
        "http://ms1/jobs/r-9/results",
        Ok(Response::empty(200)),
    );

    let (_, _, body) = send(
        &app,
        post_json("/v1.0/processes/ms1:square/execution", &json!({"inputs": {}})),
    )
    .await;
    let job_id = body["jobID"].as_str().unwrap().to_owned();

    let (status, headers, _) = send(&app, get(&format!("/v1.0/jobs/{job_id}/results"))).await;
    assert_eq!(status, StatusCode::FOUND);
    assert_eq!(
        headers.get("location").unwrap().to_str().unwrap(),
        "http://ms1/jobs/r-9/results"
    );
}

#[tokio::test]
async fn dismissal_route_reaches_the_terminal_state() {
    let (app, client) = app();
    script_square(&client);
    client.script(
        "POST",
        "http://ms1/processes/square/execution",
        Ok(Response::of_json(
            201,
            &json!({"jobID": "r-9", "status": "running", "type": "process"}),
        )
        .with_header("location", "http://ms1/jobs/r-9")),
    );
    client.script(
        "GET",
        "http://ms1/jobs/r-9",
        Ok(Response::of_json(
            200,
            &json!({"jobID": "r-9", "status": "running", "type": "process"}),
        )),
    );
    client.script("DELETE", "http://ms1/jobs/r-9", Ok(Response::empty(204)));

    let (_, _, body) = send(
        &app,
        post_json("/v1.0/processes/ms1:square/execution", &json!({"inputs": {}})),
    )
    .await;
    let job_id = body["jobID"].as_str().unwrap().to_owned();

    let (status, _, dismissed) = send(&app, delete(&format!("/v1.0/jobs/{job_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dismissed["status"], json!("dismissed"));

    // A second dismissal hits the terminal-state rule.
    let (status, _, _) = send(&app, delete(&format!("/v1.0/jobs/{job_id}"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_jobs_and_bad_filters_are_rejected() {
    let (app, _client) = app();

    let (status, _, body) = send(
        &app,
        get(&format!("/v1.0/jobs/{}", Uuid::now_v7())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], json!(404));

    let (status, _, _) = send(&app, get("/v1.0/jobs?status=exploded")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn job_listing_pages_with_links() {
    let (app, client) = app();
    script_square(&client);
    client.script(
        "POST",
        "http://ms1/processes/square/execution",
        Ok(Response::of_json(200, &json!({"outputs": {"root": 1}}))),
    );

    for _ in 0..3 {
        let (status, _, _) = send(
            &app,
            post_json("/v1.0/processes/ms1:square/execution", &json!({"inputs": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, _, page) = send(&app, get("/v1.0/jobs?limit=2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["jobs"].as_array().unwrap().len(), 2);
    let rels: Vec<&str> = page["links"]
        .as_array()
        .unwrap()
        .iter()
        .map(|link| link["rel"].as_str().unwrap())
        .collect();
    assert!(rels.contains(&"next"));

    let (_, _, rest) = send(&app, get("/v1.0/jobs?limit=2&offset=2")).await;
    assert_eq!(rest["jobs"].as_array().unwrap().len(), 1);
    let rels: Vec<String> = rest["links"]
        .as_array()
        .unwrap()
        .iter()
        .map(|link| link["rel"].as_str().unwrap().to_owned())
        .collect();
    assert!(rels.contains(&"prev".to_owned()));
}
