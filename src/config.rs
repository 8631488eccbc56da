//! Service configuration loaded from the environment.

use anyhow::{anyhow, bail, Context};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g. "0.0.0.0:8080").
    pub bind_addr: String,

    /// SQLite database holding the event table.
    pub db_path: PathBuf,

    /// Shared secret the cron trigger presents as a bearer token.
    pub cron_secret: String,

    /// Bearer tokens accepted on admin routes.
    pub admin_tokens: HashSet<String>,

    /// Initial kill switch position.
    pub processing_enabled: bool,

    /// Downstream endpoint events are forwarded to.
    pub forward_url: Option<String>,

    /// Secret used to sign forwarded bodies.
    pub forward_secret: Option<String>,

    pub default_batch_size: usize,
    pub max_batch_size: usize,

    /// Upper bound on a single downstream attempt.
    pub attempt_timeout: Duration,

    /// `processing` rows older than this are failed by the reaper. `None`
    /// leaves them for an operator.
    pub stale_after: Option<Duration>,

    /// Inbound verification secrets keyed by lowercase source name.
    pub source_secrets: HashMap<String, String>,
}

const SOURCE_SECRET_PREFIX: &str = "WEBHOOK_SECRET_";

impl Config {
    /// Load configuration from process environment variables.
    ///
    /// Required: `CRON_SECRET`, `ADMIN_API_TOKENS` (comma separated).
    pub fn from_env() -> anyhow::Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        let config = Self::from_vars(&vars)?;

        tracing::info!(
            bind_addr = %config.bind_addr,
            db_path = %config.db_path.display(),
            processing_enabled = config.processing_enabled,
            forward_configured = config.forward_url.is_some(),
            admin_token_count = config.admin_tokens.len(),
            source_secret_count = config.source_secrets.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> anyhow::Result<Self> {
        let get = |key: &str| {
            vars.get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let cron_secret =
            get("CRON_SECRET").ok_or_else(|| anyhow!("CRON_SECRET environment variable is required"))?;

        let admin_tokens: HashSet<String> = get("ADMIN_API_TOKENS")
            .ok_or_else(|| anyhow!("ADMIN_API_TOKENS environment variable is required"))?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if admin_tokens.is_empty() {
            bail!("ADMIN_API_TOKENS must contain at least one token");
        }

        let processing_enabled = match get("WEBHOOK_PROCESSING_ENABLED") {
            Some(raw) => parse_flag(&raw)
                .with_context(|| format!("invalid WEBHOOK_PROCESSING_ENABLED: {raw}"))?,
            None => true,
        };

        let default_batch_size = parse_or(&get, "WEBHOOK_BATCH_SIZE", 25usize)?;
        let max_batch_size = parse_or(&get, "WEBHOOK_MAX_BATCH_SIZE", 500usize)?;
        if default_batch_size == 0 || max_batch_size == 0 {
            bail!("batch sizes must be at least 1");
        }
        if default_batch_size > max_batch_size {
            bail!("WEBHOOK_BATCH_SIZE ({default_batch_size}) exceeds WEBHOOK_MAX_BATCH_SIZE ({max_batch_size})");
        }

        let attempt_timeout =
            Duration::from_secs(parse_or(&get, "WEBHOOK_ATTEMPT_TIMEOUT_SECS", 30u64)?);
        if attempt_timeout.is_zero() {
            bail!("WEBHOOK_ATTEMPT_TIMEOUT_SECS must be at least 1");
        }

        let stale_after = get("WEBHOOK_STALE_AFTER_SECS")
            .map(|raw| {
                raw.parse::<u64>()
                    .with_context(|| format!("invalid WEBHOOK_STALE_AFTER_SECS: {raw}"))
            })
            .transpose()?
            .map(Duration::from_secs);
        if let Some(stale) = stale_after {
            if stale <= attempt_timeout {
                bail!(
                    "WEBHOOK_STALE_AFTER_SECS ({}) must exceed WEBHOOK_ATTEMPT_TIMEOUT_SECS ({})",
                    stale.as_secs(),
                    attempt_timeout.as_secs()
                );
            }
            let representable = chrono::Duration::from_std(stale)
                .ok()
                .and_then(|age| chrono::Utc::now().checked_sub_signed(age))
                .is_some();
            if !representable {
                bail!("WEBHOOK_STALE_AFTER_SECS is out of range: {}", stale.as_secs());
            }
        }

        let source_secrets = vars
            .iter()
            .filter_map(|(key, value)| {
                let source = key.strip_prefix(SOURCE_SECRET_PREFIX)?;
                let value = value.trim();
                if source.is_empty() || value.is_empty() {
                    return None;
                }
                Some((source.to_ascii_lowercase(), value.to_string()))
            })
            .collect();

        Ok(Self {
            bind_addr: get("WEBHOOK_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            db_path: get("WEBHOOK_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("webhook-events.db")),
            cron_secret,
            admin_tokens,
            processing_enabled,
            forward_url: get("WEBHOOK_FORWARD_URL"),
            forward_secret: get("WEBHOOK_FORWARD_SECRET"),
            default_batch_size,
            max_batch_size,
            attempt_timeout,
            stale_after,
            source_secrets,
        })
    }

    /// Inbound secret for `source`, if one is configured.
    pub fn source_secret(&self, source: &str) -> Option<&str> {
        self.source_secrets
            .get(&source.replace('-', "_").to_ascii_lowercase())
            .map(String::as_str)
    }
}

fn parse_flag(raw: &str) -> anyhow::Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => bail!("expected true/false"),
    }
}

fn parse_or<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid {key}: {raw}")),
        None => Ok(default),
    }
}
