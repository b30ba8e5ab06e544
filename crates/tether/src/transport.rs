// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The seam between channels and the network.
//!
//! A [`Connector`] performs the cryptographic handshake, including validation of
//! the peer's certificate chain against the [`TrustBundle`], and yields a
//! [`Session`]. Comparing the identity the peer asserted with the expected one is
//! left to the channel, so that no connector can skip it.

use bytes::Bytes;
use http::{Request, Response};

use crate::config::TlsVersion;
use crate::error::Result;
use crate::identity::{Credential, PeerCredential, TrustBundle, WorkloadId};

/// Everything a connector needs to establish a mutually authenticated session.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct HandshakeParams {
    /// The workload the session is opened to.
    pub target: WorkloadId,
    /// This workload's credential, presented to the peer.
    pub credential: Credential,
    /// Trust material for validating the peer's chain.
    pub trust_bundle: TrustBundle,
    /// Oldest acceptable protocol version.
    pub min_tls_version: TlsVersion,
    /// Newest acceptable protocol version.
    pub max_tls_version: TlsVersion,
}

/// Establishes secure sessions.
pub trait Connector: Send + Sync + 'static {
    /// The session type produced by this connector.
    type Session: Session;

    /// Performs the handshake described by `params`.
    ///
    /// Failures before the peer's credential is known are reported as
    /// [`Error::Connect`][crate::Error::Connect].
    fn connect(&self, params: HandshakeParams) -> impl Future<Output = Result<Self::Session>> + Send;
}

/// An established, mutually authenticated session.
pub trait Session: Send + Sync + 'static {
    /// The credential the peer presented during the handshake.
    fn peer_credential(&self) -> &PeerCredential;

    /// Exchanges one request for one response.
    fn send(&self, request: Request<Bytes>) -> impl Future<Output = Result<Response<Bytes>>> + Send;

    /// A lightweight liveness probe.
    fn is_alive(&self) -> impl Future<Output = bool> + Send;

    /// Releases the underlying resources.
    fn close(&self) -> impl Future<Output = ()> + Send;
}
