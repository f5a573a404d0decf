// Configuration module for ttmm
// Reads from environment variables with sensible defaults

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::OnceLock;

/// Global configuration instance
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Database connection pool size (TTMM_POOL_SIZE)
    pub pool_size: u32,

    /// Database connection pool minimum idle connections (TTMM_POOL_MIN_IDLE)
    pub pool_min_idle: u32,

    /// How long a writer waits on a foreign SQLite lock (TTMM_BUSY_TIMEOUT_MS)
    pub busy_timeout_ms: u64,

    /// Churn lookback window in days, 0 means all history (TTMM_CHURN_DAYS)
    pub churn_days: u32,

    /// Interpreter used by the tracer (TTMM_PYTHON)
    pub python: String,

    /// Trace wall-clock limit in seconds, 0 means unlimited (TTMM_TRACE_TIMEOUT_SECS)
    pub trace_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_size: 10,
            pool_min_idle: 2,
            busy_timeout_ms: 200,
            churn_days: 0,
            python: "python3".to_string(),
            trace_timeout_secs: 0,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let mut config = Config::default();
        override_from_env("TTMM_POOL_SIZE", &mut config.pool_size);
        override_from_env("TTMM_POOL_MIN_IDLE", &mut config.pool_min_idle);
        override_from_env("TTMM_BUSY_TIMEOUT_MS", &mut config.busy_timeout_ms);
        override_from_env("TTMM_CHURN_DAYS", &mut config.churn_days);
        override_from_env("TTMM_TRACE_TIMEOUT_SECS", &mut config.trace_timeout_secs);
        if let Ok(val) = env::var("TTMM_PYTHON") {
            if val.trim().is_empty() {
                tracing::warn!("empty TTMM_PYTHON, using default: {}", config.python);
            } else {
                config.python = val;
            }
        }
        config
    }

    /// Get the global configuration instance
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(Config::from_env)
    }
}

fn override_from_env<T>(key: &str, slot: &mut T)
where
    T: FromStr + Display,
{
    let Ok(val) = env::var(key) else {
        return;
    };
    match val.trim().parse() {
        Ok(parsed) => *slot = parsed,
        Err(_) => tracing::warn!("invalid {key} value: {val}, using default: {slot}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.pool_min_idle, 2);
        assert_eq!(config.churn_days, 0);
        assert_eq!(config.python, "python3");
        assert_eq!(config.trace_timeout_secs, 0);
    }
}
