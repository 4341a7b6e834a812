// Runtime configuration for cxref.
// Reads from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::warn;

/// Global configuration instance
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Indexing worker threads (CXREF_WORKERS)
    pub workers: usize,

    /// Upper bound on a single wait of the merge thread, in milliseconds
    /// (CXREF_MERGE_WAIT_MS)
    pub merge_wait_ms: u64,

    /// Default result limit for symbol search (CXREF_SEARCH_LIMIT)
    pub search_limit: usize,

    /// SQLite busy timeout in seconds (CXREF_DB_BUSY_TIMEOUT_SECS)
    pub db_busy_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            merge_wait_ms: 200,
            search_limit: 50,
            db_busy_timeout_secs: 30,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let mut config = Config::default();
        override_from_env("CXREF_WORKERS", &mut config.workers);
        override_from_env("CXREF_MERGE_WAIT_MS", &mut config.merge_wait_ms);
        override_from_env("CXREF_SEARCH_LIMIT", &mut config.search_limit);
        override_from_env(
            "CXREF_DB_BUSY_TIMEOUT_SECS",
            &mut config.db_busy_timeout_secs,
        );
        if config.workers == 0 {
            warn!("CXREF_WORKERS must be at least 1, using 1");
            config.workers = 1;
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
    T: FromStr + std::fmt::Display,
{
    let Ok(val) = env::var(key) else {
        return;
    };
    match parse_setting(&val) {
        Some(parsed) => *slot = parsed,
        None => warn!("invalid {key} value: {val}, using default: {slot}"),
    }
}

fn parse_setting<T: FromStr>(val: &str) -> Option<T> {
    val.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.workers >= 1);
        assert_eq!(config.merge_wait_ms, 200);
        assert_eq!(config.search_limit, 50);
        assert_eq!(config.db_busy_timeout_secs, 30);
    }

    #[test]
    fn settings_parse_with_surrounding_whitespace() {
        assert_eq!(parse_setting::<usize>(" 8 "), Some(8));
        assert_eq!(parse_setting::<u64>("fast"), None);
        assert_eq!(parse_setting::<u64>("-1"), None);
    }
}
