// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A single verified connection to one peer.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use http::header::HeaderValue;
use http::{HeaderName, Method, Request, Response};
use parking_lot::Mutex;
use tick::{Clock, FutureExt as _};
use tracing::Level;

use crate::config::ChannelConfig;
use crate::context::CallContext;
use crate::error::{Error, PeerVerificationError, Result};
use crate::identity::{IdentityProvider, WorkloadId};
use crate::retry::RetryPolicy;
use crate::transport::{Connector, HandshakeParams, Session};

/// Header carrying [`CallContext::task_id`].
pub const TASK_ID_HEADER: HeaderName = HeaderName::from_static("x-task-id");

/// Header carrying the [`CallContext::caller`] identity.
pub const CALLER_ID_HEADER: HeaderName = HeaderName::from_static("x-caller-id");

type Handshake<S> = Shared<BoxFuture<'static, Result<Arc<S>>>>;

/// The lifecycle state of a [`SecureChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// No session yet; the next request performs the handshake.
    Idle,
    /// A handshake is in flight and every request awaits it.
    Handshaking,
    /// The peer was verified and requests flow.
    Ready,
    /// The peer asserted an unexpected identity. Terminal.
    Failed,
    /// The channel was closed. Terminal.
    Closed,
}

/// A logical connection to exactly one peer whose identity is verified before any
/// request is sent.
///
/// The handshake happens lazily on first use and at most once at a time: concurrent
/// first callers all await the same in-flight handshake. If the peer asserts any
/// identity other than the expected one, byte for byte, the channel fails closed
/// with [`Error::PeerVerification`] and keeps returning that error without ever
/// handshaking again. Other handshake failures leave the channel idle so that a
/// later request can try again.
pub struct SecureChannel<P, C: Connector> {
    target: WorkloadId,
    config: ChannelConfig,
    identity: Arc<P>,
    connector: Arc<C>,
    clock: Clock,
    retry: Option<RetryPolicy>,
    phase: Mutex<Phase<C::Session>>,
}

enum Phase<S> {
    Idle,
    Handshaking(Handshake<S>),
    Ready(Arc<S>),
    Failed(Error),
    Closed,
}

impl<P, C> SecureChannel<P, C>
where
    P: IdentityProvider,
    C: Connector,
{
    /// Creates an idle channel to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when `config` disables peer verification, allows a
    /// protocol version below TLS 1.2 or has out of bounds values.
    pub fn new(
        identity: Arc<P>,
        connector: Arc<C>,
        target: WorkloadId,
        config: ChannelConfig,
        clock: Clock,
    ) -> Result<Self> {
        config.validate()?;

        let retry = config
            .retry
            .clone()
            .map(|retry| RetryPolicy::new(retry, clock.clone()))
            .transpose()?;

        Ok(Self {
            target,
            config,
            identity,
            connector,
            clock,
            retry,
            phase: Mutex::new(Phase::Idle),
        })
    }

    /// The identity the peer must assert.
    #[must_use]
    pub fn target(&self) -> &WorkloadId {
        &self.target
    }

    /// The configuration the channel was created with.
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// The current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        match &*self.phase.lock() {
            Phase::Idle => ChannelState::Idle,
            Phase::Handshaking(_) => ChannelState::Handshaking,
            Phase::Ready(_) => ChannelState::Ready,
            Phase::Failed(_) => ChannelState::Failed,
            Phase::Closed => ChannelState::Closed,
        }
    }

    /// Whether the channel can still serve requests.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        !matches!(self.state(), ChannelState::Failed | ChannelState::Closed)
    }

    /// Sends a `GET` request.
    ///
    /// # Errors
    ///
    /// See [`SecureChannel::request`].
    pub async fn get(&self, path: &str, ctx: &CallContext) -> Result<Response<Bytes>> {
        self.request(Method::GET, path, Bytes::new(), ctx).await
    }

    /// Sends a `DELETE` request.
    ///
    /// # Errors
    ///
    /// See [`SecureChannel::request`].
    pub async fn delete(&self, path: &str, ctx: &CallContext) -> Result<Response<Bytes>> {
        self.request(Method::DELETE, path, Bytes::new(), ctx).await
    }

    /// Sends a `POST` request.
    ///
    /// # Errors
    ///
    /// See [`SecureChannel::request`].
    pub async fn post(&self, path: &str, body: impl Into<Bytes>, ctx: &CallContext) -> Result<Response<Bytes>> {
        self.request(Method::POST, path, body.into(), ctx).await
    }

    /// Sends a `PUT` request.
    ///
    /// # Errors
    ///
    /// See [`SecureChannel::request`].
    pub async fn put(&self, path: &str, body: impl Into<Bytes>, ctx: &CallContext) -> Result<Response<Bytes>> {
        self.request(Method::PUT, path, body.into(), ctx).await
    }

    /// Sends a request, performing the handshake first if needed.
    ///
    /// The timeout is the configured one, shortened to what is left of the
    /// context's deadline. Retryable failures are retried when the channel was
    /// configured with a retry policy.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] when `path` does not start with `/` or a header
    ///   value cannot be encoded.
    /// - [`Error::PeerVerification`] when the peer asserted another identity.
    /// - [`Error::Closed`] after [`SecureChannel::close`].
    /// - [`Error::Timeout`] when the timeout elapses or the deadline already passed.
    /// - Handshake and transport errors reported by the identity provider and connector.
    pub async fn request(&self, method: Method, path: &str, body: Bytes, ctx: &CallContext) -> Result<Response<Bytes>> {
        match &self.retry {
            Some(retry) => {
                let (method, body) = (&method, &body);
                retry
                    .execute(move || self.request_once(method.clone(), path, body.clone(), ctx))
                    .await
            }
            None => self.request_once(method, path, body, ctx).await,
        }
    }

    /// Checks the liveness of the established session; `false` unless ready.
    pub async fn probe(&self) -> bool {
        let session = match &*self.phase.lock() {
            Phase::Ready(session) => Arc::clone(session),
            _ => return false,
        };

        session.is_alive().await
    }

    /// Closes the channel and its session. Idempotent.
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.phase.lock(), Phase::Closed);

        if matches!(previous, Phase::Closed) {
            return;
        }

        if let Phase::Ready(session) = previous {
            session.close().await;
        }

        tracing::event!(
            name: "tether.channel.closed",
            Level::DEBUG,
            channel.target = %self.target,
        );
    }

    /// Marks the channel closed and hands out the session, if any, for closing elsewhere.
    pub(crate) fn detach(&self) -> Option<Arc<C::Session>> {
        match std::mem::replace(&mut *self.phase.lock(), Phase::Closed) {
            Phase::Ready(session) => Some(session),
            _ => None,
        }
    }

    async fn request_once(&self, method: Method, path: &str, body: Bytes, ctx: &CallContext) -> Result<Response<Bytes>> {
        let request = build_request(method, path, body, ctx)?;

        let timeout = ctx
            .remaining(&self.clock)
            .map_or(self.config.timeout, |remaining| remaining.min(self.config.timeout));

        if timeout.is_zero() {
            return Err(Error::Timeout {
                target: self.target.to_string(),
                timeout,
            });
        }

        let exchange = async {
            let session = self.session().await?;
            session.send(request).await
        };

        exchange
            .timeout(&self.clock, timeout)
            .await
            .unwrap_or_else(|_elapsed| {
                Err(Error::Timeout {
                    target: self.target.to_string(),
                    timeout,
                })
            })
    }

    async fn session(&self) -> Result<Arc<C::Session>> {
        let handshake = {
            let mut phase = self.phase.lock();

            match &*phase {
                Phase::Ready(session) => return Ok(Arc::clone(session)),
                Phase::Failed(error) => return Err(error.clone()),
                Phase::Closed => return Err(self.closed()),
                Phase::Handshaking(handshake) => handshake.clone(),
                Phase::Idle => {
                    let handshake = self.handshake().shared();
                    *phase = Phase::Handshaking(handshake.clone());
                    handshake
                }
            }
        };

        let result = handshake.clone().await;
        self.settle(&handshake, result).await
    }

    /// Records the outcome of `handshake`, unless another caller already did.
    async fn settle(&self, handshake: &Handshake<C::Session>, result: Result<Arc<C::Session>>) -> Result<Arc<C::Session>> {
        let orphaned = {
            let mut phase = self.phase.lock();

            let pending = matches!(&*phase, Phase::Handshaking(current) if current.ptr_eq(handshake));

            if pending {
                *phase = match &result {
                    Ok(session) => Phase::Ready(Arc::clone(session)),
                    Err(error @ Error::PeerVerification(_)) => Phase::Failed(error.clone()),
                    Err(_) => Phase::Idle,
                };
                self.log_handshake(&result);
                None
            } else if matches!(&*phase, Phase::Closed) {
                Some(result.as_ref().ok().map(Arc::clone))
            } else {
                None
            }
        };

        // The channel was closed while the handshake was in flight.
        if let Some(session) = orphaned {
            if let Some(session) = session {
                session.close().await;
            }
            return Err(self.closed());
        }

        result
    }

    fn handshake(&self) -> BoxFuture<'static, Result<Arc<C::Session>>> {
        let identity = Arc::clone(&self.identity);
        let connector = Arc::clone(&self.connector);
        let target = self.target.clone();
        let clock = self.clock.clone();
        let (min_tls_version, max_tls_version) = (self.config.min_tls_version, self.config.max_tls_version);
        let timeout = self.config.timeout;

        let handshake = async move {
            let credential = identity.own_credential().await?;

            if credential.is_expired(clock.system_time()) {
                return Err(Error::identity(format!(
                    "credential of `{}` has expired",
                    credential.identity()
                )));
            }

            let trust_bundle = identity.trust_bundle(&target).await?;

            let session = connector
                .connect(HandshakeParams {
                    target: target.clone(),
                    credential,
                    trust_bundle,
                    min_tls_version,
                    max_tls_version,
                })
                .await?;

            let asserted = session.peer_credential().asserted_identity();

            if asserted.as_deref() != Some(target.as_str()) {
                session.close().await;
                return Err(PeerVerificationError::new(target.as_str(), asserted).into());
            }

            Ok(Arc::new(session))
        };

        let target = self.target.clone();
        let clock = self.clock.clone();

        async move {
            handshake
                .timeout(&clock, timeout)
                .await
                .unwrap_or_else(|_elapsed| {
                    Err(Error::Timeout {
                        target: target.to_string(),
                        timeout,
                    })
                })
        }
        .boxed()
    }

    fn log_handshake(&self, result: &Result<Arc<C::Session>>) {
        match result {
            Ok(_) => tracing::event!(
                name: "tether.channel.handshake",
                Level::INFO,
                channel.target = %self.target,
                channel.state = "ready",
            ),
            Err(Error::PeerVerification(mismatch)) => tracing::event!(
                name: "tether.channel.handshake",
                Level::ERROR,
                channel.target = %self.target,
                channel.state = "failed",
                channel.peer = mismatch.actual().unwrap_or("<none>"),
            ),
            Err(error) => tracing::event!(
                name: "tether.channel.handshake",
                Level::WARN,
                channel.target = %self.target,
                channel.state = "idle",
                error.kind = error.kind().as_str(),
                error.message = %error,
            ),
        }
    }

    fn closed(&self) -> Error {
        Error::Closed {
            target: self.target.to_string(),
        }
    }
}

fn build_request(method: Method, path: &str, body: Bytes, ctx: &CallContext) -> Result<Request<Bytes>> {
    if !path.starts_with('/') {
        return Err(Error::invalid_request(format!("path `{path}` must start with `/`")));
    }

    let mut builder = Request::builder().method(method).uri(path);

    if let Some(task_id) = ctx.task_id() {
        let value = HeaderValue::from_str(task_id)
            .map_err(|e| Error::invalid_request(format!("task id cannot be sent as a header: {e}")))?;
        builder = builder.header(TASK_ID_HEADER, value);
    }

    if let Some(caller) = ctx.caller() {
        let value = HeaderValue::from_str(caller.as_str())
            .map_err(|e| Error::invalid_request(format!("caller cannot be sent as a header: {e}")))?;
        builder = builder.header(CALLER_ID_HEADER, value);
    }

    builder
        .body(body)
        .map_err(|e| Error::invalid_request(format!("malformed request to `{path}`: {e}")))
}

impl<P, C: Connector> fmt::Debug for SecureChannel<P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.phase.lock() {
            Phase::Idle => ChannelState::Idle,
            Phase::Handshaking(_) => ChannelState::Handshaking,
            Phase::Ready(_) => ChannelState::Ready,
            Phase::Failed(_) => ChannelState::Failed,
            Phase::Closed => ChannelState::Closed,
        };

        f.debug_struct("SecureChannel")
            .field("target", &self.target)
            .field("state", &state)
            .field("timeout", &self.config.timeout)
            .finish_non_exhaustive()
    }
}
