use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "5000")]
    pub port: u16,

    /// Public base URL used in self links and the execute `Location` header.
    #[envconfig(from = "UMP_API_SERVER_URL", default = "http://localhost:5000")]
    pub api_server_url: String,

    /// YAML file describing the federated providers.
    #[envconfig(from = "UMP_PROVIDERS_FILE", default = "providers.yaml")]
    pub providers_file: String,

    /// Postgres job store when set; in-memory store otherwise.
    #[envconfig(from = "UMP_DATABASE_URL")]
    pub database_url: Option<String>,

    #[envconfig(from = "UMP_POLL_INTERVAL_S", default = "5")]
    pub poll_interval: EnvSeconds,

    /// Maximum job runtime; non-terminal jobs past it are failed.
    #[envconfig(from = "UMP_POLL_TIMEOUT_S")]
    pub poll_timeout: Option<EnvSeconds>,

    #[envconfig(from = "UMP_POLL_MAX_RETRIES", default = "1")]
    pub poll_max_retries: u32,

    #[envconfig(from = "UMP_FORWARD_MAX_RETRIES", default = "3")]
    pub forward_max_retries: u32,

    #[envconfig(from = "UMP_FORWARD_RETRY_BASE_S", default = "1.0")]
    pub forward_retry_base: EnvSecondsF64,

    #[envconfig(from = "UMP_FORWARD_RETRY_MAX_S", default = "5.0")]
    pub forward_retry_max: EnvSecondsF64,

    #[envconfig(from = "UMP_REWRITE_REMOTE_LINKS", default = "true")]
    pub rewrite_remote_links: bool,

    #[envconfig(from = "UMP_PROCESS_CACHE_TTL_S", default = "60")]
    pub process_cache_ttl: EnvSeconds,

    #[envconfig(from = "UMP_DEFAULT_PROVIDER_TIMEOUT_S", default = "60")]
    pub default_provider_timeout: EnvSeconds,

    #[envconfig(from = "UMP_SHUTDOWN_GRACE_S", default = "5")]
    pub shutdown_grace: EnvSeconds,

    /// When true, a failed results probe downgrades the job to failed
    /// instead of only logging a warning.
    #[envconfig(from = "UMP_RESULTS_VERIFY_DOWNGRADE", default = "false")]
    pub results_verify_downgrade: bool,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Whole-second duration read from the environment.
#[derive(Debug, Clone, Copy)]
pub struct EnvSeconds(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvSecondsError;

impl FromStr for EnvSeconds {
    type Err = ParseEnvSecondsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let secs = s.parse::<u64>().map_err(|_| ParseEnvSecondsError)?;
        Ok(EnvSeconds(Duration::from_secs(secs)))
    }
}

/// Fractional-second duration read from the environment.
#[derive(Debug, Clone, Copy)]
pub struct EnvSecondsF64(pub Duration);

impl FromStr for EnvSecondsF64 {
    type Err = ParseEnvSecondsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let secs = s.parse::<f64>().map_err(|_| ParseEnvSecondsError)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(ParseEnvSecondsError);
        }
        Ok(EnvSecondsF64(Duration::from_secs_f64(secs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_durations() {
        assert_eq!("5".parse::<EnvSeconds>().unwrap().0, Duration::from_secs(5));
        assert!("5.5".parse::<EnvSeconds>().is_err());
        assert_eq!(
            "0.5".parse::<EnvSecondsF64>().unwrap().0,
            Duration::from_millis(500)
        );
        assert!("-1".parse::<EnvSecondsF64>().is_err());
        assert!("plenty".parse::<EnvSecondsF64>().is_err());
    }
}
