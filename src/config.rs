use std::env;
use std::time::Duration;

/// Runtime configuration, read once at startup from the environment
/// and passed down by value. Defaults match the values the service
/// has been tuned with in production.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub pool_size: usize,
    pub max_requests_per_browser: u64,
    pub nav_timeout: Duration,
    pub poll_interval: Duration,
    pub poll_max_attempts: u32,
    pub settle_delay: Duration,
    pub lease_retry_interval: Duration,
    pub lease_max_retries: u32,
    pub default_max_timeout: Duration,
    /// Passed straight through to Chrome as `--proxy-server=...`.
    pub proxy_server: Option<String>,
    /// Override for the Chrome binary path.
    pub chrome_path: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            port: env_parse("PORT", 8080),
            pool_size: env_parse("POOL_SIZE", 1),
            max_requests_per_browser: env_parse("MAX_REQUESTS_PER_BROWSER", 50),
            nav_timeout: Duration::from_millis(env_parse("NAV_TIMEOUT_MS", 20_000)),
            poll_interval: Duration::from_millis(env_parse("POLL_INTERVAL_MS", 1_000)),
            poll_max_attempts: env_parse("POLL_MAX_ATTEMPTS", 10),
            settle_delay: Duration::from_millis(env_parse("SETTLE_DELAY_MS", 500)),
            lease_retry_interval: Duration::from_millis(env_parse("LEASE_RETRY_INTERVAL_MS", 100)),
            lease_max_retries: env_parse("LEASE_MAX_RETRIES", 100),
            default_max_timeout: Duration::from_millis(env_parse("DEFAULT_MAX_TIMEOUT_MS", 25_000)),
            proxy_server: env::var("PROXY_SERVER").ok().filter(|s| !s.is_empty()),
            chrome_path: env::var("CHROME_PATH").ok().filter(|s| !s.is_empty()),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!("⚠️ Invalid value for {}: '{}', using default", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}
