// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Configuration of channels, pools, breakers and retries.
//!
//! Every type validates its numeric fields when a component is constructed from it, so
//! invalid configuration fails at startup and never at first use. All types can be
//! deserialized with `serde`; durations accept the human-friendly format (`"30s"`,
//! `"1m 30s"`) as well as ISO 8601 (`"PT30S"`).

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Error, ErrorKind};

const MAX_INTERVAL: Duration = Duration::from_secs(60 * 60);
const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const MAX_THRESHOLD: u32 = 1000;
const MAX_RETRY_ATTEMPTS: u32 = 100;
const MAX_MULTIPLIER: f64 = 10.0;

/// Transport security protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TlsVersion {
    /// TLS 1.0, always rejected.
    #[serde(rename = "1.0")]
    Tls10,
    /// TLS 1.1, always rejected.
    #[serde(rename = "1.1")]
    Tls11,
    /// TLS 1.2.
    #[serde(rename = "1.2")]
    Tls12,
    /// TLS 1.3.
    #[serde(rename = "1.3")]
    Tls13,
}

impl TlsVersion {
    /// The oldest version a channel may negotiate.
    pub const MINIMUM: Self = Self::Tls12;
}

/// Whether the peer's identity is verified during the handshake.
///
/// `Disabled` exists so that configuration files stating it are rejected loudly
/// rather than silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerVerification {
    /// The peer must assert exactly the expected identity.
    #[default]
    Required,
    /// Rejected at construction.
    Disabled,
}

/// Configuration of a [`SecureChannel`][crate::SecureChannel].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfig {
    /// The oldest protocol version offered during the handshake.
    pub min_tls_version: TlsVersion,
    /// The newest protocol version offered during the handshake.
    pub max_tls_version: TlsVersion,
    /// Per-request timeout.
    #[serde(with = "friendly_duration")]
    pub timeout: Duration,
    /// Peer verification mode; only `Required` is accepted.
    pub peer_verification: PeerVerification,
    /// Retries applied to requests on this channel.
    pub retry: Option<RetryConfig>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            min_tls_version: TlsVersion::Tls12,
            max_tls_version: TlsVersion::Tls13,
            timeout: Duration::from_secs(30),
            peer_verification: PeerVerification::Required,
            retry: None,
        }
    }
}

impl ChannelConfig {
    /// Checks every field against its bounds.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peer_verification == PeerVerification::Disabled {
            return Err(ConfigError::new("peer_verification", "peer verification cannot be disabled"));
        }

        if self.min_tls_version < TlsVersion::MINIMUM {
            return Err(ConfigError::new(
                "min_tls_version",
                format!("{:?} is below the minimum of {:?}", self.min_tls_version, TlsVersion::MINIMUM),
            ));
        }

        if self.max_tls_version < self.min_tls_version {
            return Err(ConfigError::new("max_tls_version", "must not be older than min_tls_version"));
        }

        check_duration("timeout", self.timeout, MAX_REQUEST_TIMEOUT)?;

        if let Some(retry) = &self.retry {
            retry.validate()?;
        }

        Ok(())
    }
}

/// Configuration of a [`ConnectionPool`][crate::ConnectionPool].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Upper bound of connections to a single target.
    pub max_connections_per_target: usize,
    /// Upper bound of connections across all targets.
    pub max_total_connections: usize,
    /// Idle connections older than this are closed by the cleanup worker.
    #[serde(with = "friendly_duration")]
    pub idle_timeout: Duration,
    /// How often idle connections are probed for liveness.
    #[serde(with = "friendly_duration")]
    pub health_check_interval: Duration,
    /// How often idle connections are evicted.
    #[serde(with = "friendly_duration")]
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_target: 10,
            max_total_connections: 100,
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// Checks every field against its bounds.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections_per_target == 0 {
            return Err(ConfigError::new("max_connections_per_target", "must be at least 1"));
        }

        if self.max_total_connections < self.max_connections_per_target {
            return Err(ConfigError::new(
                "max_total_connections",
                "must be at least max_connections_per_target",
            ));
        }

        check_duration("idle_timeout", self.idle_timeout, MAX_INTERVAL)?;
        check_duration("health_check_interval", self.health_check_interval, MAX_INTERVAL)?;
        check_duration("cleanup_interval", self.cleanup_interval, MAX_INTERVAL)
    }
}

/// Configuration of a [`CircuitBreaker`][crate::CircuitBreaker].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive successful probes that close the circuit again.
    pub success_threshold: u32,
    /// How long the circuit stays open before it lets a probe through.
    #[serde(with = "friendly_duration")]
    pub recovery_timeout: Duration,
    /// Error kinds that neither count as failures nor reset the failure counter.
    ///
    /// Defaults to caller-side failures: invalid requests and local pool limits or closure.
    pub excluded: BTreeSet<ErrorKind>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            excluded: BTreeSet::from([ErrorKind::InvalidRequest, ErrorKind::PoolExhausted, ErrorKind::PoolClosed]),
        }
    }
}

impl BreakerConfig {
    /// Checks every field against its bounds.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_threshold("failure_threshold", self.failure_threshold)?;
        check_threshold("success_threshold", self.success_threshold)?;
        check_duration("recovery_timeout", self.recovery_timeout, MAX_INTERVAL)
    }
}

/// Configuration of a [`RetryPolicy`][crate::RetryPolicy].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "friendly_duration")]
    pub base_delay: Duration,
    /// Upper bound of any single delay.
    #[serde(with = "friendly_duration")]
    pub max_delay: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
    /// Whether the actual wait is drawn uniformly from `[0, delay]`.
    pub jitter: bool,
    /// Error kinds that are retried.
    pub retryable: BTreeSet<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
            retryable: BTreeSet::from([ErrorKind::Timeout, ErrorKind::Connect, ErrorKind::Transport]),
        }
    }
}

impl RetryConfig {
    /// Checks every field against its bounds.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_RETRY_ATTEMPTS).contains(&self.max_attempts) {
            return Err(ConfigError::new(
                "max_attempts",
                format!("must be between 1 and {MAX_RETRY_ATTEMPTS}"),
            ));
        }

        check_duration("base_delay", self.base_delay, MAX_INTERVAL)?;
        check_duration("max_delay", self.max_delay, MAX_INTERVAL)?;

        if self.base_delay > self.max_delay {
            return Err(ConfigError::new("base_delay", "must not exceed max_delay"));
        }

        if !self.multiplier.is_finite() || !(1.0..=MAX_MULTIPLIER).contains(&self.multiplier) {
            return Err(ConfigError::new(
                "multiplier",
                format!("must be a finite value between 1.0 and {MAX_MULTIPLIER}"),
            ));
        }

        if let Some(kind) = self.retryable.iter().find(|kind| !kind.is_retryable()) {
            return Err(ConfigError::new(
                "retryable",
                format!("`{}` errors are never retried", kind.as_str()),
            ));
        }

        Ok(())
    }
}

/// Configuration of a whole [`Client`][crate::Client].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Pool limits and maintenance intervals.
    pub pool: PoolConfig,
    /// Template for every channel the pool opens.
    pub channel: ChannelConfig,
    /// Breaker applied per target.
    pub breaker: BreakerConfig,
    /// Retries applied by the client around each pooled attempt.
    ///
    /// Takes precedence over `channel.retry`, which the client lifts out of the
    /// channel template so that requests are never retried at two levels.
    pub retry: Option<RetryConfig>,
}

impl TransportConfig {
    /// Deserializes and validates a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the document is malformed or any value is out of bounds.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// let config = tether::TransportConfig::from_json(r#"{ "pool": { "max_connections_per_target": 4 } }"#)?;
    /// assert_eq!(config.pool.max_connections_per_target, 4);
    /// assert_eq!(config.channel.timeout, Duration::from_secs(30));
    /// # Ok::<(), tether::Error>(())
    /// ```
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::new("transport", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks every nested configuration.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        self.channel.validate()?;
        self.breaker.validate()?;

        match &self.retry {
            Some(retry) => retry.validate(),
            None => Ok(()),
        }
    }
}

fn check_duration(field: &'static str, value: Duration, max: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::new(field, "must be positive"));
    }

    if value > max {
        return Err(ConfigError::new(field, format!("must not exceed {max:?}")));
    }

    Ok(())
}

fn check_threshold(field: &'static str, value: u32) -> Result<(), ConfigError> {
    if !(1..=MAX_THRESHOLD).contains(&value) {
        return Err(ConfigError::new(field, format!("must be between 1 and {MAX_THRESHOLD}")));
    }

    Ok(())
}

mod friendly_duration {
    use std::time::Duration;

    use jiff::SignedDuration;
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let signed = SignedDuration::try_from(*value).map_err(S::Error::custom)?;
        serializer.collect_str(&signed)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        let signed: SignedDuration = text.parse().map_err(D::Error::custom)?;
        Duration::try_from(signed).map_err(D::Error::custom)
    }
}
