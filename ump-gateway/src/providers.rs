//! Configured upstream model servers and the registry that snapshots them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use ump_common::process::{is_valid_segment, ProcessId};

#[derive(Error, Debug)]
pub enum ProviderConfigError {
    #[error("provider name {0} contains characters outside [A-Za-z0-9_-]")]
    InvalidName(String),
    #[error("provider {name} has an invalid base url: {error}")]
    InvalidBaseUrl { name: String, error: url::ParseError },
    #[error("provider {name} declares an invalid process id {process}")]
    InvalidProcessId { name: String, process: String },
    #[error("failed to parse providers document: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Where a finished job's outputs live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStorage {
    /// Outputs stay on the upstream; the results route redirects.
    #[default]
    Remote,
    /// Outputs are fetched through the gateway and served inline.
    Local,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProcessPolicy {
    pub excluded: bool,
    pub anonymous: bool,
    pub deterministic: bool,
    pub result_storage: ResultStorage,
    pub graph_props: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderAuth {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    Headers(HashMap<String, String>),
}

impl ProviderAuth {
    /// Headers added to every request against this provider.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        match self {
            ProviderAuth::None => {}
            ProviderAuth::Bearer { token } => {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                    headers.insert(AUTHORIZATION, value);
                }
            }
            ProviderAuth::Basic { username, password } => {
                use base64::Engine as _;
                let encoded = base64::engine::general_purpose::STANDARD
                    .encode(format!("{username}:{password}"));
                if let Ok(value) = HeaderValue::from_str(&format!("Basic {encoded}")) {
                    headers.insert(AUTHORIZATION, value);
                }
            }
            ProviderAuth::Headers(map) => {
                for (name, value) in map {
                    let parsed = (
                        name.parse::<HeaderName>(),
                        HeaderValue::from_str(value),
                    );
                    if let (Ok(name), Ok(value)) = parsed {
                        headers.insert(name, value);
                    }
                }
            }
        }
        headers
    }
}

/// One federated upstream. Immutable once constructed; configuration reload
/// swaps whole snapshots in the registry.
#[derive(Debug, Clone)]
pub struct Provider {
    pub name: String,
    pub base_url: Url,
    pub auth: ProviderAuth,
    pub timeout: Duration,
    pub processes: HashMap<String, ProcessPolicy>,
}

impl Provider {
    /// Absolute URL for a path under this provider's base.
    pub fn url(&self, path: &str) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        format!("{}/{}", base, path.trim_start_matches('/'))
    }

    pub fn headers(&self) -> HeaderMap {
        self.auth.headers()
    }

    /// Policy for a bare process id; unlisted processes get the defaults.
    pub fn policy(&self, bare_id: &str) -> ProcessPolicy {
        self.processes.get(bare_id).cloned().unwrap_or_default()
    }

    /// Whether `href` points into this provider.
    pub fn owns_url(&self, href: &str) -> bool {
        href.starts_with(self.base_url.as_str().trim_end_matches('/'))
    }
}

/// Serialized form of one provider in the YAML document.
#[derive(Debug, Deserialize)]
struct ProviderConfig {
    url: String,
    #[serde(default)]
    auth: ProviderAuth,
    #[serde(default)]
    timeout_s: Option<u64>,
    #[serde(default)]
    processes: HashMap<String, ProcessPolicy>,
}

#[derive(Debug, Deserialize)]
struct ProvidersDocument {
    providers: HashMap<String, ProviderConfig>,
}

/// Read-only provider snapshots with atomic replacement. `list()` hands out
/// the current snapshot; callers holding it keep a consistent view across a
/// concurrent `swap`.
#[derive(Debug)]
pub struct ProvidersRegistry {
    snapshot: RwLock<Arc<Vec<Provider>>>,
}

impl ProvidersRegistry {
    pub fn new(mut providers: Vec<Provider>) -> Self {
        // Bare-id resolution scans first-match-wins; name order keeps that
        // deterministic regardless of document order.
        providers.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            snapshot: RwLock::new(Arc::new(providers)),
        }
    }

    /// Parse the YAML providers document into a registry.
    pub fn from_yaml(
        document: &str,
        default_timeout: Duration,
    ) -> Result<Self, ProviderConfigError> {
        let parsed: ProvidersDocument = serde_yaml::from_str(document)?;
        let mut providers = Vec::with_capacity(parsed.providers.len());

        for (name, config) in parsed.providers {
            if !is_valid_segment(&name) {
                return Err(ProviderConfigError::InvalidName(name));
            }
            let base_url = Url::parse(&config.url)
                .map_err(|error| ProviderConfigError::InvalidBaseUrl {
                    name: name.clone(),
                    error,
                })?;
            for process in config.processes.keys() {
                if !is_valid_segment(process) {
                    return Err(ProviderConfigError::InvalidProcessId {
                        name,
                        process: process.clone(),
                    });
                }
            }
            providers.push(Provider {
                name,
                base_url,
                auth: config.auth,
                timeout: config
                    .timeout_s
                    .map(Duration::from_secs)
                    .unwrap_or(default_timeout),
                processes: config.processes,
            });
        }

        Ok(Self::new(providers))
    }

    pub fn list(&self) -> Arc<Vec<Provider>> {
        self.snapshot
            .read()
            .expect("poisoned providers registry lock")
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Provider> {
        self.list()
            .iter()
            .find(|provider| provider.name == name)
            .cloned()
    }

    pub fn resolve(&self, id: &ProcessId) -> Option<Provider> {
        self.get(id.provider())
    }

    /// Atomically replace the snapshot, e.g. after a configuration reload.
    pub fn swap(&self, mut providers: Vec<Provider>) {
        providers.sort_by(|a, b| a.name.cmp(&b.name));
        *self
            .snapshot
            .write()
            .expect("poisoned providers registry lock") = Arc::new(providers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"
providers:
  ms1:
    url: http://ms1:8000/api
    timeout_s: 30
    processes:
      square:
        result_storage: local
      hidden-model:
        excluded: true
  ms2:
    url: http://ms2/
    auth: !bearer
      token: sekrit
"#;

    fn registry() -> ProvidersRegistry {
        ProvidersRegistry::from_yaml(DOCUMENT, Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn parses_the_providers_document() {
        let registry = registry();
        let providers = registry.list();
        assert_eq!(providers.len(), 2);

        let ms1 = registry.get("ms1").unwrap();
        assert_eq!(ms1.timeout, Duration::from_secs(30));
        assert_eq!(ms1.url("processes/square"), "http://ms1:8000/api/processes/square");
        assert!(ms1.policy("hidden-model").excluded);
        assert_eq!(ms1.policy("square").result_storage, ResultStorage::Local);
        // Unlisted processes fall back to defaults.
        assert!(!ms1.policy("other").excluded);
        assert_eq!(ms1.policy("other").result_storage, ResultStorage::Remote);

        let ms2 = registry.get("ms2").unwrap();
        assert_eq!(ms2.timeout, Duration::from_secs(60));
        let auth = ms2.headers();
        assert_eq!(auth.get(AUTHORIZATION).unwrap(), "Bearer sekrit");
    }

    #[test]
    fn rejects_invalid_provider_names() {
        let document = "providers:\n  'bad name':\n    url: http://x/\n";
        let error = ProvidersRegistry::from_yaml(document, Duration::from_secs(60)).unwrap_err();
        assert!(matches!(error, ProviderConfigError::InvalidName(_)));
    }

    #[test]
    fn resolve_uses_the_provider_half() {
        let registry = registry();
        let id = ProcessId::new("ms2", "buildings").unwrap();
        assert_eq!(registry.resolve(&id).unwrap().name, "ms2");
        let unknown = ProcessId::new("ms9", "buildings").unwrap();
        assert!(registry.resolve(&unknown).is_none());
    }

    #[test]
    fn swap_is_atomic_for_held_snapshots() {
        let registry = registry();
        let before = registry.list();
        registry.swap(Vec::new());
        // The old snapshot stays intact for whoever grabbed it.
        assert_eq!(before.len(), 2);
        assert!(registry.list().is_empty());
    }

    #[test]
    fn owns_url_matches_prefix() {
        let ms1 = registry().get("ms1").unwrap();
        assert!(ms1.owns_url("http://ms1:8000/api/jobs/42"));
        assert!(!ms1.owns_url("http://elsewhere/jobs/42"));
    }
}
