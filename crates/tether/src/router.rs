// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Explicit registry of inbound operations.
//!
//! Handlers are registered by method and path with [`Router::route`]; nothing is
//! discovered at runtime. [`Loopback`] serves a router in-process through the
//! [`Connector`] seam, which is how local wiring and tests reach it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::ALLOW;
use http::{HeaderValue, Method, Request, Response, StatusCode};
use tracing::Level;

use crate::channel::{CALLER_ID_HEADER, TASK_ID_HEADER};
use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::identity::{PeerCredential, WorkloadId};
use crate::transport::{Connector, HandshakeParams, Session};

type Handler = Arc<dyn Fn(Request<Bytes>, CallContext) -> BoxFuture<'static, Result<Response<Bytes>>> + Send + Sync>;

/// Maps method and path to an async handler.
///
/// # Examples
///
/// ```
/// use bytes::Bytes;
/// use http::{Method, Request, Response, StatusCode};
/// use tether::{CallContext, Router};
///
/// # async fn example() -> Result<(), tether::Error> {
/// let router = Router::new().route(Method::GET, "/status", |_request, _ctx: CallContext| async {
///     Ok(Response::new(Bytes::from_static(b"ok")))
/// });
///
/// let request = Request::get("/missing").body(Bytes::new()).unwrap();
/// let response = router.dispatch(request).await?;
/// assert_eq!(response.status(), StatusCode::NOT_FOUND);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct Router {
    routes: HashMap<String, HashMap<Method, Handler>>,
}

impl Router {
    /// An empty router; every request is answered with 404.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `method` on `path`, replacing any previous handler.
    #[must_use]
    pub fn route<F, Fut>(mut self, method: Method, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Request<Bytes>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response<Bytes>>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |request, ctx| Box::pin(handler(request, ctx)));
        self.routes.entry(path.into()).or_default().insert(method, handler);
        self
    }

    /// Whether any handler is registered on `path`.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.routes.contains_key(path)
    }

    /// Routes `request` to its handler.
    ///
    /// The [`CallContext`] handed to the handler carries the caller and task id taken
    /// from the request headers. Unknown paths are answered with 404, known paths with
    /// another method with 405 and an `Allow` header, and an unparsable caller
    /// identity with 400.
    ///
    /// # Errors
    ///
    /// Returns whatever error the handler returns.
    pub async fn dispatch(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let Some(methods) = self.routes.get(request.uri().path()) else {
            return Ok(status(StatusCode::NOT_FOUND));
        };

        let Some(handler) = methods.get(request.method()) else {
            let mut allowed: Vec<_> = methods.keys().map(Method::as_str).collect();
            allowed.sort_unstable();

            let mut response = status(StatusCode::METHOD_NOT_ALLOWED);
            if let Ok(value) = HeaderValue::from_str(&allowed.join(", ")) {
                response.headers_mut().insert(ALLOW, value);
            }
            return Ok(response);
        };

        let Ok(ctx) = context_from(&request) else {
            return Ok(status(StatusCode::BAD_REQUEST));
        };

        handler(request, ctx).await
    }
}

fn context_from(request: &Request<Bytes>) -> Result<CallContext> {
    let headers = request.headers();
    let mut ctx = CallContext::new();

    if let Some(value) = headers.get(TASK_ID_HEADER) {
        let task_id = value.to_str().map_err(|_| Error::invalid_request("task id is not visible ASCII"))?;
        ctx = ctx.with_task_id(task_id);
    }

    if let Some(value) = headers.get(CALLER_ID_HEADER) {
        let caller = value.to_str().map_err(|_| Error::invalid_request("caller id is not visible ASCII"))?;
        ctx = ctx.with_caller(WorkloadId::parse(caller)?);
    }

    Ok(ctx)
}

fn status(code: StatusCode) -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = code;
    response
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut paths: Vec<_> = self.routes.keys().collect();
        paths.sort_unstable();

        f.debug_struct("Router").field("paths", &paths).finish()
    }
}

/// An in-process [`Connector`] whose sessions are served by a [`Router`].
///
/// Every session presents the configured peer credential, so the channel's identity
/// check runs exactly as it would against a remote peer.
#[derive(Debug, Clone)]
pub struct Loopback {
    router: Arc<Router>,
    peer: PeerCredential,
    handshakes: Arc<AtomicUsize>,
}

impl Loopback {
    /// Serves `router`, presenting `peer` during handshakes.
    #[must_use]
    pub fn new(router: Router, peer: PeerCredential) -> Self {
        Self {
            router: Arc::new(router),
            peer,
            handshakes: Arc::default(),
        }
    }

    /// Handshakes performed so far.
    #[must_use]
    pub fn handshakes(&self) -> usize {
        self.handshakes.load(Ordering::Relaxed)
    }
}

impl Connector for Loopback {
    type Session = LoopbackSession;

    async fn connect(&self, params: HandshakeParams) -> Result<LoopbackSession> {
        self.handshakes.fetch_add(1, Ordering::Relaxed);

        tracing::event!(
            name: "tether.loopback.connect",
            Level::DEBUG,
            loopback.target = %params.target,
            loopback.caller = %params.credential.identity(),
        );

        Ok(LoopbackSession {
            target: params.target,
            router: Arc::clone(&self.router),
            peer: self.peer.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

/// A session produced by [`Loopback`].
#[derive(Debug)]
pub struct LoopbackSession {
    target: WorkloadId,
    router: Arc<Router>,
    peer: PeerCredential,
    closed: AtomicBool,
}

impl Session for LoopbackSession {
    fn peer_credential(&self) -> &PeerCredential {
        &self.peer
    }

    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::transport(&self.target, "session closed"));
        }

        self.router.dispatch(request).await
    }

    async fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
