//! Ordered transforms applied to every raw upstream process document before
//! it reaches a cache or a response body.

use serde_json::{json, Value};
use tracing::{debug, warn};

use ump_common::process::{is_valid_segment, rel};

use crate::providers::Provider;

pub struct PipelineContext<'a> {
    pub provider: &'a Provider,
    /// Public base URL of this gateway, no trailing slash.
    pub gateway_base: &'a str,
    pub rewrite_links: bool,
}

pub enum HandlerOutcome {
    Keep,
    /// Remove the document from further processing.
    Drop(String),
}

pub trait ProcessHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, doc: &mut Value, ctx: &PipelineContext) -> HandlerOutcome;
}

/// Rewrites the upstream `id` to the canonical `{provider}:{bare}` form.
/// Documents without a usable id are dropped.
struct EnforceId;

impl ProcessHandler for EnforceId {
    fn name(&self) -> &'static str {
        "enforce-id"
    }

    fn apply(&self, doc: &mut Value, ctx: &PipelineContext) -> HandlerOutcome {
        let Some(id) = doc.get("id").and_then(Value::as_str) else {
            return HandlerOutcome::Drop("document has no id".to_owned());
        };

        // Already-canonical ids pass through unchanged on a second run.
        let prefix = format!("{}:", ctx.provider.name);
        let bare = id.strip_prefix(&prefix).unwrap_or(id);

        if !is_valid_segment(bare) {
            return HandlerOutcome::Drop(format!("id {id} is not usable as a process id"));
        }

        doc["id"] = json!(format!("{}:{}", ctx.provider.name, bare));
        HandlerOutcome::Keep
    }
}

/// Injects the defaults the OGC document shape requires but many upstreams
/// omit, including a self link pointing at this gateway.
struct FillDefaults;

impl ProcessHandler for FillDefaults {
    fn name(&self) -> &'static str {
        "fill-defaults"
    }

    fn apply(&self, doc: &mut Value, ctx: &PipelineContext) -> HandlerOutcome {
        let Some(object) = doc.as_object_mut() else {
            return HandlerOutcome::Drop("document is not an object".to_owned());
        };

        object
            .entry("version")
            .or_insert_with(|| json!("1.0.0"));
        object
            .entry("jobControlOptions")
            .or_insert_with(|| json!(["async-execute"]));
        object
            .entry("outputTransmission")
            .or_insert_with(|| json!(["reference", "value"]));

        let id = object
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let links = object.entry("links").or_insert_with(|| json!([]));
        let Some(links) = links.as_array_mut() else {
            return HandlerOutcome::Drop("links is not an array".to_owned());
        };

        let has_self = links
            .iter()
            .any(|link| link.get("rel").and_then(Value::as_str) == Some(rel::SELF));
        if !has_self {
            links.push(json!({
                "href": format!("{}/processes/{}", ctx.gateway_base, id),
                "rel": rel::SELF,
                "type": "application/json",
            }));
        }

        HandlerOutcome::Keep
    }
}

/// Drops metadata entries that are not objects; the rest of the document is
/// left alone.
struct SanitizeMetadata;

impl ProcessHandler for SanitizeMetadata {
    fn name(&self) -> &'static str {
        "sanitize-metadata"
    }

    fn apply(&self, doc: &mut Value, _ctx: &PipelineContext) -> HandlerOutcome {
        if let Some(metadata) = doc.get_mut("metadata").and_then(Value::as_array_mut) {
            metadata.retain(|entry| {
                let keep = entry.is_object();
                if !keep {
                    debug!(?entry, "dropping malformed metadata entry");
                }
                keep
            });
        }
        HandlerOutcome::Keep
    }
}

/// Replaces provider-internal link prefixes with the gateway's public base
/// URL so clients never talk to an upstream directly.
struct RewriteLinks;

impl ProcessHandler for RewriteLinks {
    fn name(&self) -> &'static str {
        "rewrite-links"
    }

    fn apply(&self, doc: &mut Value, ctx: &PipelineContext) -> HandlerOutcome {
        if !ctx.rewrite_links {
            return HandlerOutcome::Keep;
        }

        let upstream_base = ctx.provider.base_url.as_str().trim_end_matches('/');
        if let Some(links) = doc.get_mut("links").and_then(Value::as_array_mut) {
            for link in links {
                let Some(href) = link.get("href").and_then(Value::as_str) else {
                    continue;
                };
                if let Some(remainder) = href.strip_prefix(upstream_base) {
                    link["href"] = json!(format!("{}{}", ctx.gateway_base, remainder));
                }
            }
        }
        HandlerOutcome::Keep
    }
}

/// The ordered handler chain. Applying it twice yields the same document as
/// applying it once.
pub struct ProcessPipeline {
    handlers: Vec<Box<dyn ProcessHandler>>,
}

impl Default for ProcessPipeline {
    fn default() -> Self {
        Self {
            handlers: vec![
                Box::new(EnforceId),
                Box::new(FillDefaults),
                Box::new(SanitizeMetadata),
                Box::new(RewriteLinks),
            ],
        }
    }
}

impl ProcessPipeline {
    /// Run every handler over `doc`; `None` means the document was dropped.
    pub fn apply(&self, mut doc: Value, ctx: &PipelineContext) -> Option<Value> {
        for handler in &self.handlers {
            match handler.apply(&mut doc, ctx) {
                HandlerOutcome::Keep => {}
                HandlerOutcome::Drop(reason) => {
                    warn!(
                        provider = %ctx.provider.name,
                        handler = handler.name(),
                        reason,
                        "dropping upstream process document"
                    );
                    return None;
                }
            }
        }
        Some(doc)
    }
}
