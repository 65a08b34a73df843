use std::time::Duration;

/// Proxy timeouts and cache policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Time allowed to open a backend connection or tunnel sub-connection
    pub dial_timeout: Duration,
    /// Time allowed until the backend's response headers arrive
    pub request_timeout: Duration,
    /// Unused handlers are evicted after this long
    pub cache_idle_period: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
            cache_idle_period: Duration::from_secs(30 * 60),
        }
    }
}
