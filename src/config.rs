use std::time::Duration;

use thiserror::Error;

/// Default resource store, matching a local json-server.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:5000";

pub const DEFAULT_PORT: u16 = 8081;

pub const DEFAULT_SESSION_TTL_HOURS: i64 = 24;

/// How often an ETag-guarded lesson append is retried after a `412`.
pub const DEFAULT_LESSON_APPEND_RETRIES: u32 = 3;

#[derive(Debug, Error)]
#[error("invalid value {value:?} for {key}")]
pub struct ConfigError {
    pub key: &'static str,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_base_url: String,
    pub port: u16,
    pub static_dir: String,
    /// Per-request timeout for the resource store. Unset means none.
    pub api_timeout: Option<Duration>,
    pub session_ttl: chrono::Duration,
    pub lesson_append_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.into(),
            port: DEFAULT_PORT,
            static_dir: "./public".into(),
            api_timeout: None,
            session_ttl: chrono::Duration::hours(DEFAULT_SESSION_TTL_HOURS),
            lesson_append_retries: DEFAULT_LESSON_APPEND_RETRIES,
        }
    }
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(url) = lookup("API_BASE_URL").filter(|s| !s.trim().is_empty()) {
            cfg.api_base_url = url;
        }
        if let Some(port) = parsed(&lookup, "PORT")? {
            cfg.port = port;
        }
        if let Some(dir) = lookup("STATIC_DIR") {
            cfg.static_dir = dir;
        }
        if let Some(secs) = parsed::<u64, _>(&lookup, "API_TIMEOUT_SECS")? {
            cfg.api_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(hours) = parsed::<i64, _>(&lookup, "SESSION_TTL_HOURS")? {
            cfg.session_ttl = (hours > 0)
                .then(|| chrono::Duration::try_hours(hours))
                .flatten()
                .ok_or_else(|| ConfigError {
                    key: "SESSION_TTL_HOURS",
                    value: hours.to_string(),
                })?;
        }
        if let Some(n) = parsed(&lookup, "LESSON_APPEND_RETRIES")? {
            cfg.lesson_append_retries = n;
        }
        Ok(cfg)
    }
}

fn parsed<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError { key, value: raw }),
    }
}
