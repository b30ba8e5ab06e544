// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Identity-verified, pooled and fault-tolerant channels between workloads.
//!
//! Every byte this crate sends travels over a [`SecureChannel`] whose peer proved,
//! during the handshake, that it is exactly the [`WorkloadId`] the caller asked for.
//! On top of that guarantee sit the usual resilience tools for distributed systems:
//! bounded connection pooling, per-target circuit breaking and retries with
//! exponential backoff and jitter.
//!
//! # Core Types
//!
//! - [`WorkloadId`]: A validated SPIFFE ID naming a workload.
//! - [`SecureChannel`]: One logical connection to one verified peer.
//! - [`ConnectionPool`]: Bounded per-target sets of channels handed out through [`PoolGuard`].
//! - [`CircuitBreaker`]: Fails fast while a target keeps failing, probes for recovery.
//! - [`RetryPolicy`]: Retries transient failures with capped exponential backoff.
//! - [`Client`]: All of the above composed per request.
//! - [`Router`]: Explicit registry of inbound handlers, served in-process by [`Loopback`].
//!
//! # Identity
//!
//! A peer that asserts any identity other than the expected one makes the channel fail
//! closed with [`Error::PeerVerification`]. The failure is permanent: the channel never
//! attempts another handshake and the pool discards it. Verification cannot be turned
//! off; a [`ChannelConfig`] that tries is rejected at construction.
//!
//! The network itself is abstracted behind the [`Connector`] and [`Session`] traits, and
//! credentials come from an [`IdentityProvider`].
//!
//! # Quick Start
//!
//! ```
//! use bytes::Bytes;
//! use http::{Method, Response};
//! use tether::{CallContext, Client, Loopback, Router, TransportConfig, WorkloadId};
//!
//! # async fn example(identity: tether::StaticIdentity, peer: tether::PeerCredential) -> Result<(), tether::Error> {
//! let config = TransportConfig::from_json(
//!     r#"{
//!         "pool": { "max_connections_per_target": 4, "idle_timeout": "2m" },
//!         "breaker": { "failure_threshold": 3, "recovery_timeout": "15s" },
//!         "retry": { "max_attempts": 4, "base_delay": "50ms" }
//!     }"#,
//! )?;
//!
//! let router = Router::new().route(Method::POST, "/tasks", |request: http::Request<Bytes>, _ctx: CallContext| async move {
//!     Ok(Response::new(request.into_body()))
//! });
//!
//! let client = Client::new(identity, Loopback::new(router, peer), config, tick::Clock::new_tokio())?;
//! client.start()?;
//!
//! let planner = WorkloadId::parse("spiffe://example.org/planner")?;
//! let ctx = CallContext::new().with_task_id("task-42");
//! client.post(&planner, "/tasks", "payload", &ctx).await?;
//!
//! client.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Errors
//!
//! All fallible operations return [`Error`]. [`Error::kind`] gives the [`ErrorKind`]
//! tag that retry and breaker configuration refer to, and [`Error`] implements
//! [`Recovery`] so generic resilience code can classify it.
//!
//! # Logging
//!
//! Handshakes, evictions, breaker transitions and retries are reported as [`tracing`]
//! events named `tether.*`. No subscriber is installed by this crate.

#[doc(inline)]
pub use recoverable::{Recovery, RecoveryInfo, RecoveryKind};

mod breaker;
mod channel;
mod client;
mod config;
mod context;
mod error;
mod identity;
mod pool;
mod retry;
mod rnd;
mod router;
mod svid;
mod transport;

pub use breaker::{BreakerMetrics, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use channel::{CALLER_ID_HEADER, ChannelState, SecureChannel, TASK_ID_HEADER};
pub use client::Client;
pub use config::{BreakerConfig, ChannelConfig, PeerVerification, PoolConfig, RetryConfig, TlsVersion, TransportConfig};
pub use context::CallContext;
pub use error::{CircuitOpenError, Classification, ConfigError, Error, ErrorKind, LimitScope, PeerVerificationError, Result};
pub use identity::{Credential, IdentityProvider, PeerCredential, StaticIdentity, TrustBundle, WorkloadId};
pub use pool::{ConnectionPool, PoolGuard, PoolStats};
pub use retry::{RetryAttempt, RetryPolicy, RetryStats};
pub use router::{Loopback, LoopbackSession, Router};
pub use svid::spiffe_id_from_der;
pub use transport::{Connector, HandshakeParams, Session};

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
pub(crate) mod testing;
