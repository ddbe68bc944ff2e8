use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Client settings. Every field has a default, so an empty environment works.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_base: String,
    pub api_token: Option<String>,
    pub session_dir: PathBuf,
    /// Persisted descriptors older than this are discarded, never resumed.
    pub stale_after: Duration,
    pub balance_refresh_delay: Duration,
    pub progress_tick: Duration,
    pub reveal_interval: Duration,
    pub max_stream_reattach: u32,
    pub log: LogConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8080".to_string(),
            api_token: None,
            session_dir: PathBuf::from(".iconflow"),
            stale_after: Duration::from_secs(2 * 60 * 60),
            balance_refresh_delay: Duration::from_millis(3000),
            progress_tick: Duration::from_millis(100),
            reveal_interval: Duration::from_millis(150),
            max_stream_reattach: 3,
            log: LogConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Loads `.env` (if any) and then reads `ICONFLOW_*` variables.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let log = LogConfig {
            level: non_empty("ICONFLOW_LOG_LEVEL").unwrap_or(defaults.log.level),
            format: match non_empty("ICONFLOW_LOG_FORMAT").as_deref() {
                Some("json") => LogFormat::Json,
                Some("text") | None => LogFormat::Text,
                Some(other) => {
                    warn!(value = other, "unknown ICONFLOW_LOG_FORMAT, using text");
                    LogFormat::Text
                }
            },
        };

        Self {
            api_base: non_empty("ICONFLOW_API_BASE")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_base),
            api_token: non_empty("ICONFLOW_API_TOKEN"),
            session_dir: non_empty("ICONFLOW_SESSION_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.session_dir),
            stale_after: parse_or(&non_empty, "ICONFLOW_STALE_AFTER_SECS", defaults.stale_after.as_secs())
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_after),
            balance_refresh_delay: millis_or(&non_empty, "ICONFLOW_BALANCE_REFRESH_DELAY_MS", defaults.balance_refresh_delay),
            progress_tick: millis_or(&non_empty, "ICONFLOW_PROGRESS_TICK_MS", defaults.progress_tick),
            reveal_interval: millis_or(&non_empty, "ICONFLOW_REVEAL_INTERVAL_MS", defaults.reveal_interval),
            max_stream_reattach: parse_or(&non_empty, "ICONFLOW_MAX_STREAM_REATTACH", defaults.max_stream_reattach)
                .unwrap_or(defaults.max_stream_reattach),
            log,
        }
    }
}

fn parse_or<T: FromStr + Copy>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "invalid numeric setting, using default");
            Some(default)
        }
    }
}

fn millis_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    match parse_or::<u64>(lookup, key, default.as_millis() as u64) {
        Some(0) => {
            warn!(key, "zero interval is not allowed, using default");
            default
        }
        Some(ms) => Duration::from_millis(ms),
        None => default,
    }
}
