//! Endpoint and reconnection configuration.

use std::time::Duration;

use stratus_core::TransportError;

/// Environment variable overriding the broker host.
pub const HOST_ENV: &str = "STRATUS_BROKER_HOST";

/// Environment variable overriding the broker port.
pub const PORT_ENV: &str = "STRATUS_BROKER_PORT";

/// Default broker host.
pub const DEFAULT_HOST: &str = "localhost";

/// Default broker port (the standard MQTT port).
pub const DEFAULT_PORT: u16 = 1883;

/// Bounded exponential backoff used when (re)connecting to a broker.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% jitter to each delay.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that fails on the first error.
    #[must_use]
    pub fn never() -> Self {
        Self::default().max_retries(0)
    }

    #[must_use]
    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Delay to wait before retry number `attempt` (zero based).
    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        // Negative or NaN multipliers clamp to zero.
        let delay = base.min(self.max_delay.as_secs_f64()).max(0.0);

        let delay = if self.jitter {
            delay * (1.0 + jitter_fraction() * 0.25)
        } else {
            delay
        };
        Duration::try_from_secs_f64(delay).unwrap_or(self.max_delay)
    }
}

/// Uniform value in `[0, 1)` drawn from a v4 UUID's random bits.
#[allow(clippy::cast_precision_loss)]
fn jitter_fraction() -> f64 {
    let bits = uuid::Uuid::new_v4().as_u128() as u64 >> 11;
    bits as f64 / (1u64 << 53) as f64
}

/// Identity of a broker endpoint. Connections are shared per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Configuration for one broker endpoint.
///
/// Two configurations with the same host and port share a connection
/// through [`ConnectionRegistry`](crate::ConnectionRegistry); the remaining
/// fields are taken from whichever configuration created it.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointConfig {
    /// Broker host.
    pub host: String,

    /// Broker port.
    pub port: u16,

    /// Prefix of the generated client identifier.
    pub client_id_prefix: String,

    /// Timeout of a single connection attempt.
    pub connect_timeout: Duration,

    /// Retry policy for connection attempts.
    pub reconnect: ReconnectPolicy,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            client_id_prefix: "stratus".to_string(),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl EndpointConfig {
    /// Create a new endpoint configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `STRATUS_BROKER_HOST` and `STRATUS_BROKER_PORT`.
    pub fn from_env() -> Result<Self, TransportError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, TransportError> {
        let mut config = Self::default();
        if let Some(host) = lookup(HOST_ENV).filter(|h| !h.is_empty()) {
            config.host = host;
        }
        if let Some(port) = lookup(PORT_ENV) {
            config.port = port.parse().map_err(|_| {
                TransportError::InvalidConfig(format!("{PORT_ENV}={port} is not a valid port"))
            })?;
        }
        Ok(config)
    }

    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn client_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.client_id_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Registry key of this endpoint.
    #[must_use]
    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// A fresh client identifier, unique per call.
    #[must_use]
    pub fn client_id(&self) -> String {
        format!("{}-{}", self.client_id_prefix, uuid::Uuid::new_v4().simple())
    }
}
