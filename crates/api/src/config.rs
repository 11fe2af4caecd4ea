//! Application configuration loaded from environment variables.

use std::time::Duration;

use saga::{RetryPolicy, ServiceEndpoints};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `8080`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `json` for JSON lines, anything else for text
/// - `DATABASE_URL`: PostgreSQL saga log; unset keeps sagas in memory
/// - `LEALTAD_CONTENIDO_URL`, `AFILIADOS_COMISIONES_URL`,
///   `COLABORACIONES_URL`, `MONITOREO_URL`: remote service base URLs
/// - `SAGA_STEP_TIMEOUT_MS`, `SAGA_MAX_RETRIES`, `SAGA_BASE_DELAY_MS`,
///   `SAGA_BACKOFF_MULTIPLIER`, `SAGA_MAX_DELAY_MS`: forward retry policy
/// - `SAGA_COMPENSATION_MAX_RETRIES`, `SAGA_COMPENSATION_BASE_DELAY_MS`:
///   compensation retry policy (other settings shared with forward steps)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub services: ServiceEndpoints,
    pub forward_retry: RetryPolicy,
    pub compensation_retry: RetryPolicy,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`. Unparseable values fall back to
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |key: &str, default: Duration| {
            parse(key).map(Duration::from_millis).unwrap_or(default)
        };

        let forward = defaults.forward_retry;
        let forward_retry = RetryPolicy {
            max_retries: parse("SAGA_MAX_RETRIES")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(forward.max_retries),
            base_delay: millis("SAGA_BASE_DELAY_MS", forward.base_delay),
            multiplier: lookup("SAGA_BACKOFF_MULTIPLIER")
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|m| m.is_finite() && *m >= 1.0)
                .unwrap_or(forward.multiplier),
            max_delay: millis("SAGA_MAX_DELAY_MS", forward.max_delay),
            jitter: forward.jitter,
            attempt_timeout: millis("SAGA_STEP_TIMEOUT_MS", forward.attempt_timeout),
        };

        let compensation = defaults.compensation_retry;
        let compensation_retry = RetryPolicy {
            max_retries: parse("SAGA_COMPENSATION_MAX_RETRIES")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(compensation.max_retries),
            base_delay: millis("SAGA_COMPENSATION_BASE_DELAY_MS", compensation.base_delay),
            ..forward_retry.clone()
        };

        let service = |key: &str, default: String| lookup(key).unwrap_or(default);
        let endpoints = defaults.services;

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match lookup("LOG_FORMAT") {
                Some(format) if format.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            services: ServiceEndpoints {
                loyalty_content: service("LEALTAD_CONTENIDO_URL", endpoints.loyalty_content),
                affiliate_registry: service(
                    "AFILIADOS_COMISIONES_URL",
                    endpoints.affiliate_registry,
                ),
                collaborations: service("COLABORACIONES_URL", endpoints.collaborations),
                monitoring: service("MONITOREO_URL", endpoints.monitoring),
            },
            forward_retry,
            compensation_retry,
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            services: ServiceEndpoints::default(),
            forward_retry: RetryPolicy::default(),
            compensation_retry: RetryPolicy::for_compensation(),
        }
    }
}
