use std::time::Duration;

use serde::Serialize;
use url::Url;

pub const DEFAULT_UPSTREAM_URL: &str = "https://api.shodan.io";

/// Where credential state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    Postgres,
    /// In-process only; state is lost on restart.
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub ledger: LedgerBackend,
    pub admin_key: Option<String>,
    pub upstream: UpstreamConfig,
    pub quota: QuotaConfig,
    /// Seconds between background health refreshes. 0 = disabled.
    pub refresh_interval_secs: u64,
    pub log_json: bool,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: Url,
    /// Query parameter that carries the credential secret.
    pub auth_param: String,
    /// Endpoint the health checker probes for remaining quota.
    pub probe_path: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

/// Quota knobs handed explicitly to the forwarder and admin handlers.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QuotaConfig {
    /// Limit applied to new credentials that don't specify one.
    pub default_quota_limit: i64,
    /// Units reserved per proxied request.
    pub cost_per_request: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_quota_limit: 100,
            cost_per_request: 0,
        }
    }
}

impl QuotaConfig {
    /// Both knobs feed `quota_used` arithmetic, which must never go negative.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cost_per_request < 0 {
            anyhow::bail!(
                "KEYPOOL_COST_PER_REQUEST must be >= 0, got {}",
                self.cost_per_request
            );
        }
        if self.default_quota_limit < 0 {
            anyhow::bail!(
                "KEYPOOL_DEFAULT_QUOTA must be >= 0, got {}",
                self.default_quota_limit
            );
        }
        Ok(())
    }
}

impl UpstreamConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            auth_param: "key".into(),
            probe_path: "/api-info".into(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let upstream_raw =
        std::env::var("KEYPOOL_UPSTREAM_URL").unwrap_or_else(|_| DEFAULT_UPSTREAM_URL.into());
    let base_url = parse_upstream_url(&upstream_raw)?;

    let ledger = match std::env::var("KEYPOOL_LEDGER")
        .unwrap_or_default()
        .to_lowercase()
        .as_str()
    {
        "" | "postgres" => LedgerBackend::Postgres,
        "memory" => LedgerBackend::Memory,
        other => anyhow::bail!("KEYPOOL_LEDGER must be 'postgres' or 'memory', got '{}'", other),
    };

    let defaults = QuotaConfig::default();
    let quota = QuotaConfig {
        default_quota_limit: env_or("KEYPOOL_DEFAULT_QUOTA", defaults.default_quota_limit),
        cost_per_request: env_or("KEYPOOL_COST_PER_REQUEST", defaults.cost_per_request),
    };
    quota.validate()?;

    Ok(Config {
        port: env_or("KEYPOOL_PORT", 8080),
        database_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/keypool".into()),
        ledger,
        admin_key: std::env::var("KEYPOOL_ADMIN_KEY")
            .ok()
            .filter(|k| !k.is_empty()),
        upstream: UpstreamConfig {
            base_url,
            auth_param: std::env::var("KEYPOOL_AUTH_PARAM").unwrap_or_else(|_| "key".into()),
            probe_path: std::env::var("KEYPOOL_PROBE_PATH")
                .unwrap_or_else(|_| "/api-info".into()),
            timeout: Duration::from_secs(env_or("KEYPOOL_UPSTREAM_TIMEOUT_SECS", 30)),
            connect_timeout: Duration::from_secs(env_or("KEYPOOL_CONNECT_TIMEOUT_SECS", 5)),
        },
        quota,
        refresh_interval_secs: env_or("KEYPOOL_REFRESH_INTERVAL_SECS", 0),
        log_json: std::env::var("KEYPOOL_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false),
    })
}

/// Accepts only absolute http(s) URLs.
pub fn parse_upstream_url(raw: &str) -> anyhow::Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| anyhow::anyhow!("invalid upstream URL '{}': {}", raw, e))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("upstream URL must be http or https, got '{}'", url.scheme());
    }
    Ok(url)
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
