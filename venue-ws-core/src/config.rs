//! Connection, pool and per-venue configuration

use std::env;
use std::time::Duration;

use crate::exchanges::backoff::{BackoffPolicy, Jitter};
use crate::exchanges::errors::{ExchangeError, ExchangeResult};

/// Timing and retry configuration for a single connection
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Handshake timeout for a single connect attempt
    pub connect_timeout: Duration,
    /// Attempt budget for the initial connect when rate limited
    pub connect_max_attempts: u32,
    pub rate_limit_base_delay: Duration,
    pub rate_limit_max_delay: Duration,
    /// Proportional jitter for rate-limit backoff (0.2 = ±20%)
    pub rate_limit_jitter: f64,
    pub reconnect_min_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Additive jitter for reconnect backoff
    pub reconnect_jitter: Duration,
    /// `None` disables the keepalive loop
    pub ping_interval: Option<Duration>,
    /// Consecutive ping send failures before the socket is treated as dead
    pub ping_fail_threshold: u32,
    /// `None` waits on reads indefinitely
    pub recv_idle_timeout: Option<Duration>,
    pub close_timeout: Duration,
    /// Bound on a single frame write
    pub send_timeout: Duration,
    /// Default deadline for `Connection::post`
    pub request_timeout: Duration,
    /// Periodically recycle the socket even when healthy
    pub force_reconnect_interval: Option<Duration>,
    /// Resubscribe an orderbook channel as soon as a sequence gap is seen
    pub resubscribe_on_gap: bool,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            connect_max_attempts: 6,
            rate_limit_base_delay: Duration::from_millis(500),
            rate_limit_max_delay: Duration::from_secs(30),
            rate_limit_jitter: 0.2,
            reconnect_min_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(8),
            reconnect_jitter: Duration::from_millis(500),
            ping_interval: Some(Duration::from_secs(20)),
            ping_fail_threshold: 2,
            recv_idle_timeout: Some(Duration::from_secs(60)),
            close_timeout: Duration::from_secs(2),
            send_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            force_reconnect_interval: None,
            resubscribe_on_gap: false,
        }
    }
}

impl WebSocketConfig {
    #[must_use]
    pub fn with_ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval;
        self
    }

    #[must_use]
    pub fn with_recv_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.recv_idle_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_reconnect_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.reconnect_min_delay = min;
        self.reconnect_max_delay = max;
        self
    }

    #[must_use]
    pub fn with_reconnect_jitter(mut self, jitter: Duration) -> Self {
        self.reconnect_jitter = jitter;
        self
    }

    #[must_use]
    pub fn with_rate_limit_backoff(mut self, base: Duration, max: Duration, jitter: f64) -> Self {
        self.rate_limit_base_delay = base;
        self.rate_limit_max_delay = max;
        self.rate_limit_jitter = jitter;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_connect_max_attempts(mut self, attempts: u32) -> Self {
        self.connect_max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_ping_fail_threshold(mut self, threshold: u32) -> Self {
        self.ping_fail_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_force_reconnect_interval(mut self, interval: Option<Duration>) -> Self {
        self.force_reconnect_interval = interval;
        self
    }

    #[must_use]
    pub fn with_resubscribe_on_gap(mut self, enabled: bool) -> Self {
        self.resubscribe_on_gap = enabled;
        self
    }

    pub fn rate_limit_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: self.rate_limit_base_delay,
            max_delay: self.rate_limit_max_delay,
            factor: 2.0,
            jitter: Jitter::Proportional(self.rate_limit_jitter),
        }
    }

    pub fn reconnect_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial_delay: self.reconnect_min_delay,
            max_delay: self.reconnect_max_delay,
            factor: 2.0,
            jitter: Jitter::Additive(self.reconnect_jitter),
        }
    }

    pub fn validate(&self) -> ExchangeResult<()> {
        if self.connect_timeout.is_zero() {
            return Err(invalid("connect timeout must be > 0"));
        }
        if self.connect_max_attempts == 0 {
            return Err(invalid("connect attempt budget must be >= 1"));
        }
        if self.send_timeout.is_zero() {
            return Err(invalid("send timeout must be > 0"));
        }
        if self.ping_fail_threshold == 0 {
            return Err(invalid("ping failure threshold must be >= 1"));
        }
        if matches!(self.ping_interval, Some(d) if d.is_zero()) {
            return Err(invalid("ping interval must be > 0 when set"));
        }
        if matches!(self.recv_idle_timeout, Some(d) if d.is_zero()) {
            return Err(invalid("receive idle timeout must be > 0 when set"));
        }
        if matches!(self.force_reconnect_interval, Some(d) if d.is_zero()) {
            return Err(invalid("force reconnect interval must be > 0 when set"));
        }
        self.rate_limit_backoff().validate()?;
        self.reconnect_backoff().validate()?;
        Ok(())
    }
}

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Logical subscribers sharing one physical socket per account
    pub subscribers_per_socket: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            subscribers_per_socket: 10,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> ExchangeResult<()> {
        if self.subscribers_per_socket == 0 {
            return Err(invalid("subscribers per socket must be >= 1"));
        }
        Ok(())
    }
}

/// Per-venue settings read from plain environment variables
#[derive(Debug, Clone)]
pub struct VenueSettings {
    pub ws_url: String,
    pub account: Option<String>,
    pub websocket: WebSocketConfig,
    pub pool: PoolConfig,
}

impl VenueSettings {
    /// Reads `<PREFIX>_WS_URL` and the optional tuning variables.
    ///
    /// A value of `0` for an optional interval disables it.
    pub fn from_env(prefix: &str) -> ExchangeResult<Self> {
        Self::from_lookup(prefix, |key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        prefix: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> ExchangeResult<Self> {
        let var = |name: &str| {
            lookup(&format!("{prefix}_{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let secs = |name: &str| -> ExchangeResult<Option<f64>> {
            match var(name) {
                None => Ok(None),
                Some(raw) => raw
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite() && *v >= 0.0)
                    .map(Some)
                    .ok_or_else(|| invalid(&format!("{prefix}_{name} must be seconds, got {raw:?}"))),
            }
        };
        let optional_interval = |v: f64| (v > 0.0).then(|| Duration::from_secs_f64(v));

        let ws_url = var("WS_URL").ok_or_else(|| invalid(&format!("{prefix}_WS_URL is not set")))?;
        let ws_url = normalize_ws_url(&ws_url)?;

        let mut websocket = WebSocketConfig::default();
        if let Some(v) = secs("PING_INTERVAL_SECS")? {
            websocket.ping_interval = optional_interval(v);
        }
        if let Some(v) = secs("RECV_IDLE_TIMEOUT_SECS")? {
            websocket.recv_idle_timeout = optional_interval(v);
        }
        if let Some(v) = secs("RECONNECT_MIN_SECS")? {
            websocket.reconnect_min_delay = Duration::from_secs_f64(v);
        }
        if let Some(v) = secs("RECONNECT_MAX_SECS")? {
            websocket.reconnect_max_delay = Duration::from_secs_f64(v);
        }
        websocket.validate()?;

        let mut pool = PoolConfig::default();
        if let Some(raw) = var("SUBSCRIBERS_PER_SOCKET") {
            pool.subscribers_per_socket = raw.parse().map_err(|_| {
                invalid(&format!("{prefix}_SUBSCRIBERS_PER_SOCKET must be an integer, got {raw:?}"))
            })?;
        }
        pool.validate()?;

        Ok(Self {
            ws_url,
            account: var("ACCOUNT"),
            websocket,
            pool,
        })
    }
}

/// Canonical form of a websocket endpoint.
///
/// Accepts `http(s)` base URLs and rewrites them to `ws(s)`. Scheme and host
/// are lowercased and a trailing `/` is dropped, so two spellings of one
/// endpoint compare equal.
pub fn normalize_ws_url(raw: &str) -> ExchangeResult<String> {
    let mut url = url::Url::parse(raw.trim())?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        "ws" | "wss" => "",
        other => return Err(invalid(&format!("unsupported url scheme {other:?}"))),
    };
    if !scheme.is_empty() {
        url.set_scheme(scheme)
            .map_err(|_| invalid(&format!("cannot rewrite scheme of {raw}")))?;
    }

    let mut normalized = url.to_string();
    if url.query().is_none() && url.fragment().is_none() {
        while normalized.ends_with('/') {
            normalized.pop();
        }
    }
    Ok(normalized)
}

fn invalid(details: &str) -> ExchangeError {
    ExchangeError::InvalidConfig {
        details: details.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = WebSocketConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ping_fail_threshold, 2);
        assert_eq!(config.connect_max_attempts, 6);
        assert_eq!(PoolConfig::default().subscribers_per_socket, 10);
    }

    #[test]
    fn test_settings_from_env() {
        let settings = VenueSettings::from_lookup(
            "LIGHTER",
            lookup(&[
                ("LIGHTER_WS_URL", "https://mainnet.zklighter.elliot.ai/stream"),
                ("LIGHTER_PING_INTERVAL_SECS", "0"),
                ("LIGHTER_RECV_IDLE_TIMEOUT_SECS", "45"),
                ("LIGHTER_SUBSCRIBERS_PER_SOCKET", "4"),
                ("LIGHTER_ACCOUNT", "12345"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.ws_url, "wss://mainnet.zklighter.elliot.ai/stream");
        assert_eq!(settings.websocket.ping_interval, None);
        assert_eq!(settings.websocket.recv_idle_timeout, Some(Duration::from_secs(45)));
        assert_eq!(settings.pool.subscribers_per_socket, 4);
        assert_eq!(settings.account.as_deref(), Some("12345"));
    }

    #[test]
    fn test_settings_reject_bad_values() {
        assert!(VenueSettings::from_lookup("HL", lookup(&[])).is_err());
        assert!(VenueSettings::from_lookup(
            "HL",
            lookup(&[("HL_WS_URL", "wss://api.hyperliquid.xyz/ws"), ("HL_PING_INTERVAL_SECS", "soon")])
        )
        .is_err());
        assert!(VenueSettings::from_lookup(
            "HL",
            lookup(&[("HL_WS_URL", "wss://api.hyperliquid.xyz/ws"), ("HL_SUBSCRIBERS_PER_SOCKET", "0")])
        )
        .is_err());
    }

    #[test]
    fn test_normalize_ws_url() {
        assert_eq!(
            normalize_ws_url("https://api.hyperliquid.xyz/ws").unwrap(),
            "wss://api.hyperliquid.xyz/ws"
        );
        assert_eq!(normalize_ws_url("ws://127.0.0.1:9000/").unwrap(), "ws://127.0.0.1:9000");
        assert_eq!(
            normalize_ws_url(" WSS://Api.Example.com/ws/ ").unwrap(),
            "wss://api.example.com/ws"
        );
        assert_eq!(normalize_ws_url("wss://h/ws?x=1").unwrap(), "wss://h/ws?x=1");
        assert!(normalize_ws_url("ftp://example.com").is_err());
    }
}
