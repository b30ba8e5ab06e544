// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, Response};
use tick::Clock;

use crate::breaker::{BreakerMetrics, CircuitBreaker, CircuitBreakerRegistry};
use crate::config::TransportConfig;
use crate::context::CallContext;
use crate::error::Result;
use crate::identity::{IdentityProvider, WorkloadId};
use crate::pool::{ConnectionPool, PoolStats};
use crate::retry::{RetryPolicy, RetryStats};
use crate::transport::Connector;

/// The full transport stack for talking to other workloads.
///
/// Every request runs through the breaker of its target, which wraps a retry policy,
/// which acquires a pooled channel per attempt:
///
/// ```text
/// breaker(target) -> retry -> pool.acquire(target) -> channel.request
/// ```
///
/// The channel is returned to the pool after each attempt, so a retry may use a
/// different connection. When the breaker is open, requests fail with
/// [`Error::CircuitOpen`][crate::Error::CircuitOpen] without touching the pool.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use http::{Method, Response};
/// use tether::{CallContext, Client, Loopback, Router, TransportConfig, WorkloadId};
///
/// # async fn example(identity: tether::StaticIdentity, peer: tether::PeerCredential) -> Result<(), tether::Error> {
/// let router = Router::new().route(Method::GET, "/status", |_request, _ctx: CallContext| async {
///     Ok(Response::new(Bytes::from_static(b"ok")))
/// });
///
/// let client = Client::new(
///     identity,
///     Loopback::new(router, peer),
///     TransportConfig::default(),
///     tick::Clock::new_tokio(),
/// )?;
///
/// let target = WorkloadId::parse("spiffe://example.org/status")?;
/// let response = client.get(&target, "/status", &CallContext::new()).await?;
/// assert_eq!(response.body(), &Bytes::from_static(b"ok"));
///
/// client.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Client<P, C: Connector> {
    pool: ConnectionPool<P, C>,
    breakers: CircuitBreakerRegistry,
    retry: RetryPolicy,
}

impl<P, C> Client<P, C>
where
    P: IdentityProvider,
    C: Connector,
{
    /// Builds the stack described by `config`.
    ///
    /// Retries come from `config.retry`, falling back to `config.channel.retry`; the
    /// channel template itself never retries. Without either, the default
    /// [`RetryConfig`][crate::RetryConfig] applies.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`][crate::Error::Config] when any part of `config` is invalid.
    pub fn new(identity: P, connector: C, config: TransportConfig, clock: Clock) -> Result<Self> {
        config.validate()?;

        let TransportConfig {
            pool,
            mut channel,
            breaker,
            retry,
        } = config;

        let retry = retry.or_else(|| channel.retry.take()).unwrap_or_default();
        channel.retry = None;

        Ok(Self {
            pool: ConnectionPool::new(Arc::new(identity), Arc::new(connector), pool, channel, clock.clone())?,
            breakers: CircuitBreakerRegistry::new(breaker, clock.clone())?,
            retry: RetryPolicy::new(retry, clock)?,
        })
    }

    /// Starts the pool maintenance workers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolClosed`][crate::Error::PoolClosed] after [`Client::close`].
    pub fn start(&self) -> Result<()> {
        self.pool.start()
    }

    /// Stops the workers and closes every connection.
    pub async fn close(&self) {
        self.pool.close_all().await;
    }

    /// Sends a request to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitOpen`][crate::Error::CircuitOpen] while the target's
    /// breaker is open, the last failure once retries are exhausted, or the first
    /// failure that is not retryable.
    pub async fn request(
        &self,
        target: &WorkloadId,
        method: Method,
        path: &str,
        body: Bytes,
        ctx: &CallContext,
    ) -> Result<Response<Bytes>> {
        let breaker = self.breakers.get(target);
        let (method, body) = (&method, &body);

        breaker
            .call(|| {
                self.retry.execute(move || async move {
                    let channel = self.pool.acquire(target).await?;
                    channel.request(method.clone(), path, body.clone(), ctx).await
                })
            })
            .await
    }

    /// Sends a `GET` request.
    ///
    /// # Errors
    ///
    /// See [`Client::request`].
    pub async fn get(&self, target: &WorkloadId, path: &str, ctx: &CallContext) -> Result<Response<Bytes>> {
        self.request(target, Method::GET, path, Bytes::new(), ctx).await
    }

    /// Sends a `DELETE` request.
    ///
    /// # Errors
    ///
    /// See [`Client::request`].
    pub async fn delete(&self, target: &WorkloadId, path: &str, ctx: &CallContext) -> Result<Response<Bytes>> {
        self.request(target, Method::DELETE, path, Bytes::new(), ctx).await
    }

    /// Sends a `POST` request.
    ///
    /// # Errors
    ///
    /// See [`Client::request`].
    pub async fn post(&self, target: &WorkloadId, path: &str, body: impl Into<Bytes>, ctx: &CallContext) -> Result<Response<Bytes>> {
        self.request(target, Method::POST, path, body.into(), ctx).await
    }

    /// Sends a `PUT` request.
    ///
    /// # Errors
    ///
    /// See [`Client::request`].
    pub async fn put(&self, target: &WorkloadId, path: &str, body: impl Into<Bytes>, ctx: &CallContext) -> Result<Response<Bytes>> {
        self.request(target, Method::PUT, path, body.into(), ctx).await
    }

    /// The breaker guarding `target`.
    #[must_use]
    pub fn breaker(&self, target: &WorkloadId) -> Arc<CircuitBreaker> {
        self.breakers.get(target)
    }

    /// Forces the breaker of `target` closed; `false` if no breaker exists yet.
    pub fn reset_breaker(&self, target: &WorkloadId) -> bool {
        self.breakers.reset(target)
    }

    /// Snapshots of every breaker, sorted by target.
    #[must_use]
    pub fn breaker_metrics(&self) -> Vec<BreakerMetrics> {
        self.breakers.metrics()
    }

    /// Pool occupancy and counters.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Retry counters across all requests.
    #[must_use]
    pub fn retry_stats(&self) -> RetryStats {
        self.retry.stats()
    }
}

impl<P, C: Connector> fmt::Debug for Client<P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("pool", &self.pool)
            .field("breakers", &self.breakers)
            .field("retry", &self.retry)
            .finish()
    }
}
