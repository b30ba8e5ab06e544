// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use recoverable::{Recovery, RecoveryInfo};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::breaker::BreakerMetrics;

/// A shareable, type-erased error source.
pub(crate) type Source = Arc<dyn std::error::Error + Send + Sync>;

/// Any error surfaced by the transport and resilience layer.
///
/// The type is `Clone` so that the outcome of a single in-flight handshake can be
/// handed to every caller that was waiting on it.
///
/// # Thread safety
///
/// This type is thread-safe.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum Error {
    /// Construction parameters were rejected. Never retried.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The peer completed the handshake but asserted an unexpected identity.
    ///
    /// The channel that observed this is permanently unusable.
    #[error(transparent)]
    PeerVerification(#[from] PeerVerificationError),

    /// The pool has no capacity left for the target.
    #[error("connection pool exhausted for `{target}`: {scope} limit of {limit} connections reached")]
    PoolExhausted {
        /// The target that could not be served.
        target: String,
        /// The configured maximum that was hit.
        limit: usize,
        /// Which of the two limits was hit.
        scope: LimitScope,
    },

    /// The circuit breaker for the target is open.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// The request did not complete within its timeout.
    #[error("request to `{target}` timed out after {timeout:?}")]
    Timeout {
        /// The remote party.
        target: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// Establishing the secure session failed before identities could be compared.
    #[error("failed to connect to `{target}`")]
    Connect {
        /// The remote party.
        target: String,
        /// The underlying cause.
        #[source]
        source: Source,
    },

    /// The established session failed while exchanging a request.
    #[error("transport failure talking to `{target}`")]
    Transport {
        /// The remote party.
        target: String,
        /// The underlying cause.
        #[source]
        source: Source,
    },

    /// The identity provider could not supply usable credentials or trust material.
    #[error("identity provider failure: {message}")]
    Identity {
        /// What went wrong.
        message: Cow<'static, str>,
    },

    /// The caller handed over a request that can never succeed.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// What is wrong with the request.
        message: Cow<'static, str>,
    },

    /// The channel was closed and cannot be used anymore.
    #[error("channel to `{target}` is closed")]
    Closed {
        /// The remote party of the closed channel.
        target: String,
    },

    /// The pool was shut down.
    #[error("connection pool is closed")]
    PoolClosed,
}

impl Error {
    /// Returns the classification tag of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::PeerVerification(_) => ErrorKind::PeerVerification,
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Connect { .. } => ErrorKind::Connect,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Identity { .. } => ErrorKind::Identity,
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::Closed { .. } => ErrorKind::Closed,
            Self::PoolClosed => ErrorKind::PoolClosed,
        }
    }

    /// Creates a [`Error::Connect`] error from any error type.
    pub fn connect(target: impl fmt::Display, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Connect {
            target: target.to_string(),
            source: Arc::from(source.into()),
        }
    }

    /// Creates a [`Error::Transport`] error from any error type.
    pub fn transport(target: impl fmt::Display, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Transport {
            target: target.to_string(),
            source: Arc::from(source.into()),
        }
    }

    /// Creates a [`Error::Identity`] error.
    pub fn identity(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Identity { message: message.into() }
    }

    /// Creates a [`Error::InvalidRequest`] error.
    pub fn invalid_request(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidRequest { message: message.into() }
    }
}

impl Recovery for Error {
    fn recovery(&self) -> RecoveryInfo {
        match self.kind() {
            ErrorKind::Timeout | ErrorKind::Connect | ErrorKind::Transport => RecoveryInfo::retry(),
            ErrorKind::PoolExhausted | ErrorKind::CircuitOpen => RecoveryInfo::unavailable(),
            _ => RecoveryInfo::never(),
        }
    }
}

/// A specialized `Result` for the transport and resilience layer.
pub type Result<T> = std::result::Result<T, Error>;

/// The tag of an [`Error`], used to configure which failures are retried or
/// excluded from circuit breaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorKind {
    /// See [`Error::Config`].
    Config,
    /// See [`Error::PeerVerification`].
    PeerVerification,
    /// See [`Error::PoolExhausted`].
    PoolExhausted,
    /// See [`Error::CircuitOpen`].
    CircuitOpen,
    /// See [`Error::Timeout`].
    Timeout,
    /// See [`Error::Connect`].
    Connect,
    /// See [`Error::Transport`].
    Transport,
    /// See [`Error::Identity`].
    Identity,
    /// See [`Error::InvalidRequest`].
    InvalidRequest,
    /// See [`Error::Closed`].
    Closed,
    /// See [`Error::PoolClosed`].
    PoolClosed,
}

impl ErrorKind {
    /// The `snake_case` name used in configuration and telemetry.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::PeerVerification => "peer_verification",
            Self::PoolExhausted => "pool_exhausted",
            Self::CircuitOpen => "circuit_open",
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::Transport => "transport",
            Self::Identity => "identity",
            Self::InvalidRequest => "invalid_request",
            Self::Closed => "closed",
            Self::PoolClosed => "pool_closed",
        }
    }

    /// Whether a retry policy may retry this kind at all.
    ///
    /// Configuration and peer-verification failures never are, whatever
    /// [`RetryConfig::retryable`][crate::RetryConfig::retryable] says.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Config | Self::PeerVerification)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which pool limit was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitScope {
    /// `max_connections_per_target`.
    PerTarget,
    /// `max_total_connections`.
    Total,
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PerTarget => f.write_str("per-target"),
            Self::Total => f.write_str("total"),
        }
    }
}

/// How a resilience primitive treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Systemic failure that may go away; retried and counted by breakers.
    Transient,
    /// Systemic failure that will not go away by retrying; counted by breakers.
    Terminal,
    /// Semantic failure caused by the caller; neither retried nor counted.
    Excluded,
}

/// Invalid construction parameters.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration for `{field}`: {reason}")]
pub struct ConfigError {
    field: Cow<'static, str>,
    reason: Cow<'static, str>,
}

impl ConfigError {
    /// Creates a new configuration error for the given field.
    pub fn new(field: impl Into<Cow<'static, str>>, reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// The name of the rejected field.
    #[must_use]
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Why the field was rejected.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// The identity asserted by a peer did not match the expected one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerVerificationError {
    expected: String,
    actual: Option<String>,
}

impl PeerVerificationError {
    pub(crate) fn new(expected: impl Into<String>, actual: Option<String>) -> Self {
        Self {
            expected: expected.into(),
            actual,
        }
    }

    /// The identity the channel was created for.
    #[must_use]
    pub fn expected(&self) -> &str {
        &self.expected
    }

    /// The identity the peer asserted, if its credential carried one.
    #[must_use]
    pub fn actual(&self) -> Option<&str> {
        self.actual.as_deref()
    }
}

impl fmt::Display for PeerVerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.actual {
            Some(actual) => write!(
                f,
                "peer verification failed: expected `{}`, peer asserted `{actual}`",
                self.expected
            ),
            None => write!(
                f,
                "peer verification failed: expected `{}`, peer asserted no workload identity",
                self.expected
            ),
        }
    }
}

impl std::error::Error for PeerVerificationError {}

/// A call was rejected because the circuit is open.
#[derive(Debug, Clone, Error)]
#[error("circuit `{}` is open, call rejected", .metrics.name)]
pub struct CircuitOpenError {
    metrics: BreakerMetrics,
}

impl CircuitOpenError {
    pub(crate) fn new(metrics: BreakerMetrics) -> Self {
        Self { metrics }
    }

    /// The name of the breaker that rejected the call.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metrics.name
    }

    /// Snapshot of the breaker at the time of rejection.
    #[must_use]
    pub fn metrics(&self) -> &BreakerMetrics {
        &self.metrics
    }
}
