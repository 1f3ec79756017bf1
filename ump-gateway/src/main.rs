//! Composition root: every dependency is constructed here and injected;
//! nothing in the engine reaches for globals.

use std::future::ready;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use eyre::{Result, WrapErr};

use ump_common::client::ReqwestClient;
use ump_common::metrics::{install_recorder, record_api_request};
use ump_common::retry::RetryPolicy;

use ump_gateway::cache::ProcessCache;
use ump_gateway::config::Config;
use ump_gateway::handlers::{self, AppState};
use ump_gateway::jobs::pg::PgJobStore;
use ump_gateway::jobs::{JobManager, JobManagerSettings, JobStore, MemoryJobStore};
use ump_gateway::processes::ProcessManager;
use ump_gateway::providers::ProvidersRegistry;
use ump_gateway::server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;

    let providers_document = std::fs::read_to_string(&config.providers_file)
        .wrap_err_with(|| format!("failed to read {}", config.providers_file))?;
    let registry = Arc::new(
        ProvidersRegistry::from_yaml(&providers_document, config.default_provider_timeout.0)
            .wrap_err("invalid providers document")?,
    );
    tracing::info!(providers = registry.list().len(), "providers configured");

    let client = Arc::new(ReqwestClient::new("urban-model-platform-gateway"));

    let store: Arc<dyn JobStore> = match &config.database_url {
        Some(url) => Arc::new(
            PgJobStore::new(url, 10)
                .await
                .map_err(|error| eyre::eyre!("failed to connect to the job store: {error}"))?,
        ),
        None => {
            tracing::warn!("UMP_DATABASE_URL is unset, job state is in-memory only");
            Arc::new(MemoryJobStore::new())
        }
    };

    let api_base = format!("{}/v1.0", config.api_server_url.trim_end_matches('/'));
    let processes = Arc::new(ProcessManager::new(
        registry.clone(),
        client.clone(),
        ProcessCache::new(config.process_cache_ttl.0),
        &api_base,
        config.rewrite_remote_links,
    ));

    let forward_retry = RetryPolicy::new(
        config.forward_max_retries,
        config.forward_retry_base.0,
        config.forward_retry_max.0,
    )
    .map_err(|error| eyre::eyre!("UMP_FORWARD_MAX_RETRIES: {error}"))?;
    let poll_retry = RetryPolicy::new(
        config.poll_max_retries,
        config.forward_retry_base.0,
        config.forward_retry_max.0,
    )
    .map_err(|error| eyre::eyre!("UMP_POLL_MAX_RETRIES: {error}"))?;

    let jobs = JobManager::new(
        store,
        client,
        registry,
        processes.clone(),
        JobManagerSettings {
            api_base: api_base.clone(),
            forward_retry,
            poll_retry,
            poll_interval: config.poll_interval.0,
            poll_timeout: config.poll_timeout.map(|timeout| timeout.0),
            shutdown_grace: config.shutdown_grace.0,
            results_verify_downgrade: config.results_verify_downgrade,
        },
        Vec::new(),
    );

    let state = AppState {
        processes,
        jobs: jobs.clone(),
        api_base,
    };
    let heartbeat = jobs.heartbeat();
    let prometheus = install_recorder();
    let app = handlers::add_routes(Router::new(), state)
        .route("/_readiness", get(handlers::index))
        .route(
            "/_liveness",
            get(move || {
                let status = if heartbeat.is_alive() {
                    StatusCode::OK
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                ready((
                    status,
                    format!("poll scheduler heartbeat age {:?}", heartbeat.age()),
                ))
            }),
        )
        .route("/metrics", get(move || ready(prometheus.render())))
        .layer(axum::middleware::from_fn(record_api_request));

    let shutdown = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for the shutdown signal");
        }
    };
    server::serve(app, &config.bind(), shutdown).await?;

    // The listener is closed; stop the poll tasks and refuse stragglers.
    jobs.shutdown().await;

    Ok(())
}
