//! Federated process discovery: fan-out listing, descriptor lookup and
//! prefixed-id resolution across every configured provider.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use ump_common::client::HttpClient;
use ump_common::process::{
    is_valid_segment, ProcessDescriptor, ProcessId, ProcessSummary,
};

use crate::api::GatewayError;
use crate::cache::ProcessCache;
use crate::pipeline::{PipelineContext, ProcessPipeline};
use crate::providers::{Provider, ProvidersRegistry};

pub struct ProcessManager {
    registry: Arc<ProvidersRegistry>,
    client: Arc<dyn HttpClient>,
    cache: ProcessCache,
    pipeline: ProcessPipeline,
    gateway_base: String,
    rewrite_links: bool,
}

impl ProcessManager {
    pub fn new(
        registry: Arc<ProvidersRegistry>,
        client: Arc<dyn HttpClient>,
        cache: ProcessCache,
        gateway_base: &str,
        rewrite_links: bool,
    ) -> Self {
        Self {
            registry,
            client,
            cache,
            pipeline: ProcessPipeline::default(),
            gateway_base: gateway_base.trim_end_matches('/').to_owned(),
            rewrite_links,
        }
    }

    fn pipeline_ctx<'a>(&'a self, provider: &'a Provider) -> PipelineContext<'a> {
        PipelineContext {
            provider,
            gateway_base: &self.gateway_base,
            rewrite_links: self.rewrite_links,
        }
    }

    /// All federated processes. Providers are queried concurrently and fail
    /// independently; a broken upstream contributes an empty list.
    pub async fn list_all(&self) -> Vec<ProcessSummary> {
        let providers = self.registry.list();
        let lists =
            futures::future::join_all(providers.iter().map(|provider| self.list_for(provider)))
                .await;
        lists.into_iter().flatten().collect()
    }

    /// The process list of one provider, cache-aside. Failures are logged
    /// and reported as an empty list so sibling providers keep working.
    pub async fn list_for(&self, provider: &Provider) -> Vec<ProcessSummary> {
        if let Some(cached) = self.cache.get_list(&provider.name) {
            return cached;
        }

        match self.fetch_list(provider).await {
            Ok(summaries) => summaries,
            Err(error) => {
                metrics::counter!("gateway_provider_list_failures_total").increment(1);
                warn!(provider = %provider.name, %error, "failed to list upstream processes");
                Vec::new()
            }
        }
    }

    async fn fetch_list(&self, provider: &Provider) -> Result<Vec<ProcessSummary>, GatewayError> {
        let url = provider.url("processes");
        let response = self
            .client
            .get(&url, provider.timeout, &provider.headers())
            .await
            .map_err(|error| GatewayError::Upstream(error.to_string()))?;
        if !response.is_success() {
            return Err(GatewayError::Upstream(format!(
                "{url} answered {}",
                response.status
            )));
        }

        let document = response
            .require_json(&url)
            .map_err(|error| GatewayError::Upstream(error.to_string()))?;
        let raw = document
            .get("processes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let ctx = self.pipeline_ctx(provider);
        let mut summaries = Vec::with_capacity(raw.len());
        for doc in raw {
            let Some(doc) = self.pipeline.apply(doc, &ctx) else {
                continue;
            };
            let summary: ProcessSummary = match serde_json::from_value(doc) {
                Ok(summary) => summary,
                Err(error) => {
                    warn!(provider = %provider.name, %error, "skipping unparsable process document");
                    continue;
                }
            };
            let Ok(id) = summary.process_id() else {
                continue;
            };
            if provider.policy(id.bare()).excluded {
                continue;
            }
            summaries.push(summary);
        }

        self.cache.put_list(&provider.name, summaries.clone());
        Ok(summaries)
    }

    /// Descriptor lookup by canonical or bare id.
    pub async fn get(&self, reference: &str) -> Result<ProcessDescriptor, GatewayError> {
        if let Ok(id) = ProcessId::parse(reference) {
            return self.get_canonical(&id).await;
        }
        if is_valid_segment(reference) {
            return self.get_bare(reference).await;
        }
        Err(GatewayError::InvalidInput(format!(
            "{reference} is not a valid process id"
        )))
    }

    async fn get_canonical(&self, id: &ProcessId) -> Result<ProcessDescriptor, GatewayError> {
        let canonical = id.to_string();
        let provider = self
            .registry
            .resolve(id)
            .ok_or_else(|| GatewayError::NotFound(canonical.clone()))?;
        if provider.policy(id.bare()).excluded {
            return Err(GatewayError::NotFound(canonical));
        }

        if let Some(descriptor) = self.cache.get_descriptor(&canonical) {
            return Ok(descriptor);
        }

        let descriptor = self.fetch_descriptor(&provider, id).await?;
        self.cache.put_descriptor(&descriptor);
        Ok(descriptor)
    }

    async fn fetch_descriptor(
        &self,
        provider: &Provider,
        id: &ProcessId,
    ) -> Result<ProcessDescriptor, GatewayError> {
        let url = provider.url(&format!("processes/{}", id.bare()));
        let response = self
            .client
            .get(&url, provider.timeout, &provider.headers())
            .await
            .map_err(|error| GatewayError::Upstream(error.to_string()))?;

        if response.status.as_u16() == 404 {
            return Err(GatewayError::NotFound(id.to_string()));
        }
        if !response.is_success() {
            return Err(GatewayError::Upstream(format!(
                "{url} answered {}",
                response.status
            )));
        }

        let document = response
            .require_json(&url)
            .map_err(|error| GatewayError::Upstream(error.to_string()))?;
        let doc = self
            .pipeline
            .apply(document, &self.pipeline_ctx(provider))
            .ok_or_else(|| GatewayError::Upstream(format!("{url} returned an unusable document")))?;

        serde_json::from_value(doc)
            .map_err(|error| GatewayError::Upstream(format!("{url}: {error}")))
    }

    /// Unqualified lookup: first provider in registry order whose list
    /// carries the bare id wins.
    async fn get_bare(&self, bare: &str) -> Result<ProcessDescriptor, GatewayError> {
        if let Some(descriptor) = self.cache.descriptors_for_bare(bare).into_iter().next() {
            return Ok(descriptor);
        }

        for provider in self.registry.list().iter() {
            let summaries = self.list_for(provider).await;
            let found = summaries.into_iter().find(|summary| {
                summary
                    .process_id()
                    .map(|id| id.bare() == bare)
                    .unwrap_or(false)
            });
            let Some(summary) = found else {
                continue;
            };
            let id = summary.process_id().expect("id checked above");

            return match self.get_canonical(&id).await {
                Ok(descriptor) => Ok(descriptor),
                Err(GatewayError::NotFound(reference)) => Err(GatewayError::NotFound(reference)),
                // The list knows the process but its description endpoint is
                // broken; serve what the summary gives us.
                Err(error) => {
                    warn!(process = %id, %error, "synthesizing descriptor from summary");
                    Ok(ProcessDescriptor::from_summary(summary))
                }
            };
        }

        Err(GatewayError::NotFound(bare.to_owned()))
    }
}
