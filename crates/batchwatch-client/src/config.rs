use std::time::Duration;
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "http://localhost:7777";
const WS_PATH: &str = "/ws";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid base url '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("unsupported scheme '{0}': expected http or https")]
    UnsupportedScheme(String),
}

/// Backoff schedule for reconnect attempts: `min(base * 2^attempts, max)`,
/// giving up after `max_attempts` scheduled tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: Url,
    pub ws_url: Url,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(base_url: &str) -> Result<Self, ConfigError> {
        let base_url = Url::parse(base_url.trim().trim_end_matches('/')).map_err(|err| {
            ConfigError::InvalidBaseUrl {
                url: base_url.to_string(),
                reason: err.to_string(),
            }
        })?;
        let ws_url = ws_url_from_base(&base_url)?;
        Ok(Self {
            base_url,
            ws_url,
            reconnect: ReconnectPolicy::default(),
        })
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Flag value wins, then `BATCHWATCH_BASE_URL`, then the default.
pub fn resolve_base_url(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    if let Ok(value) = std::env::var("BATCHWATCH_BASE_URL") {
        if !value.trim().is_empty() {
            return value.trim().to_string();
        }
    }
    DEFAULT_BASE_URL.to_string()
}

fn ws_url_from_base(base: &Url) -> Result<Url, ConfigError> {
    let mut ws = base.clone();
    let scheme = match base.scheme() {
        "http" => "ws",
        "https" => "wss",
        other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
    };
    ws.set_scheme(scheme)
        .map_err(|_| ConfigError::UnsupportedScheme(base.scheme().to_string()))?;
    ws.set_path(WS_PATH);
    Ok(ws)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_ws_url_from_http_base() {
        let config = ClientConfig::new("http://localhost:7777").expect("config");
        assert_eq!(config.ws_url.as_str(), "ws://localhost:7777/ws");
    }

    #[test]
    fn derives_wss_url_from_https_base() {
        let config = ClientConfig::new("https://processing.example.com").expect("config");
        assert_eq!(config.ws_url.as_str(), "wss://processing.example.com/ws");
    }

    #[test]
    fn trailing_slash_is_stripped() {
        let config = ClientConfig::new("http://localhost:7777/").expect("config");
        assert_eq!(config.base_url.as_str(), "http://localhost:7777/");
        assert_eq!(config.ws_url.as_str(), "ws://localhost:7777/ws");
    }

    #[test]
    fn rejects_non_http_scheme() {
        let result = ClientConfig::new("ftp://example.com");
        assert!(matches!(result, Err(ConfigError::UnsupportedScheme(_))));
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<Duration> = (0..7).map(|n| policy.delay_for(n)).collect();
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[2], Duration::from_secs(4));
        assert_eq!(delays[3], Duration::from_secs(8));
        assert_eq!(delays[4], Duration::from_secs(16));
        assert_eq!(delays[5], Duration::from_secs(30));
        assert_eq!(delays[6], Duration::from_secs(30));
        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "delays must be non-decreasing");
        }
    }

    #[test]
    fn backoff_survives_huge_attempt_counts() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(30));
    }
}
