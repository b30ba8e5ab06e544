// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test doubles shared by the unit tests of this crate.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode};
use parking_lot::Mutex;
use rcgen::{CertificateParams, KeyPair, SanType};

use crate::error::{Error, Result};
use crate::identity::{Credential, PeerCredential, StaticIdentity, TrustBundle, WorkloadId};
use crate::transport::{Connector, HandshakeParams, Session};

/// A self-signed DER certificate carrying `id` as URI SAN.
pub(crate) fn svid_der(id: &str) -> Vec<u8> {
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.subject_alt_names.push(SanType::URI(id.try_into().unwrap()));
    self_signed(&params)
}

/// A self-signed DER certificate with a DNS SAN only.
pub(crate) fn dns_only_der(host: &str) -> Vec<u8> {
    let params = CertificateParams::new(vec![host.to_string()]).unwrap();
    self_signed(&params)
}

fn self_signed(params: &CertificateParams) -> Vec<u8> {
    let key = KeyPair::generate().unwrap();
    params.self_signed(&key).unwrap().der().to_vec()
}

pub(crate) fn credential(id: &str) -> Credential {
    credential_expiring(id, SystemTime::now() + Duration::from_secs(365 * 24 * 60 * 60))
}

pub(crate) fn credential_expiring(id: &str, expires_at: SystemTime) -> Credential {
    let key = KeyPair::generate().unwrap();

    Credential::new(
        WorkloadId::parse(id).unwrap(),
        vec![Bytes::from(svid_der(id))],
        Bytes::from(key.serialize_der()),
        expires_at,
    )
}

pub(crate) fn peer_credential(id: &str) -> PeerCredential {
    PeerCredential::new(vec![Bytes::from(svid_der(id))])
}

/// A provider for `id` that trusts its own trust domain.
pub(crate) fn identity(id: &str) -> StaticIdentity {
    let workload = WorkloadId::parse(id).unwrap();
    let bundle = TrustBundle::new(workload.trust_domain(), vec![Bytes::from(svid_der(id))]);

    StaticIdentity::new(credential(id), bundle)
}

/// A request as observed by a [`FakeConnector`] session.
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Default)]
struct FakeState {
    handshakes: AtomicUsize,
    connect_failures: AtomicUsize,
    request_failures: AtomicUsize,
    closed: AtomicUsize,
    hang: AtomicBool,
    dead: AtomicBool,
    yield_on_connect: AtomicBool,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// A scriptable connector whose peers assert a fixed identity.
///
/// Clones share their script and counters.
#[derive(Debug, Clone)]
pub(crate) struct FakeConnector {
    peer: PeerCredential,
    state: Arc<FakeState>,
}

impl FakeConnector {
    pub fn new(peer: &str) -> Self {
        Self {
            peer: peer_credential(peer),
            state: Arc::default(),
        }
    }

    /// Peers present a certificate without any workload identity.
    pub fn anonymous() -> Self {
        Self {
            peer: PeerCredential::new(vec![Bytes::from(dns_only_der("peer.example.org"))]),
            state: Arc::default(),
        }
    }

    pub fn handshakes(&self) -> usize {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    pub fn closed_sessions(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }

    /// The next `count` handshakes fail with a connect error.
    pub fn fail_connects(&self, count: usize) {
        self.state.connect_failures.store(count, Ordering::SeqCst);
    }

    /// The next `count` requests fail with a transport error.
    pub fn fail_requests(&self, count: usize) {
        self.state.request_failures.store(count, Ordering::SeqCst);
    }

    pub fn hang_requests(&self, hang: bool) {
        self.state.hang.store(hang, Ordering::SeqCst);
    }

    pub fn set_alive(&self, alive: bool) {
        self.state.dead.store(!alive, Ordering::SeqCst);
    }

    /// Handshakes suspend once before completing.
    pub fn yield_on_connect(&self) {
        self.state.yield_on_connect.store(true, Ordering::SeqCst);
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl Connector for FakeConnector {
    type Session = FakeSession;

    async fn connect(&self, params: HandshakeParams) -> Result<FakeSession> {
        self.state.handshakes.fetch_add(1, Ordering::SeqCst);

        if self.state.yield_on_connect.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }

        if take_one(&self.state.connect_failures) {
            return Err(Error::connect(params.target, "connection refused"));
        }

        Ok(FakeSession {
            target: params.target,
            peer: self.peer.clone(),
            state: Arc::clone(&self.state),
        })
    }
}

#[derive(Debug)]
pub(crate) struct FakeSession {
    target: WorkloadId,
    peer: PeerCredential,
    state: Arc<FakeState>,
}

impl Session for FakeSession {
    fn peer_credential(&self) -> &PeerCredential {
        &self.peer
    }

    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let (parts, body) = request.into_parts();
        self.state.requests.lock().push(RecordedRequest {
            method: parts.method,
            path: parts.uri.path().to_string(),
            headers: parts.headers,
            body: body.clone(),
        });

        if self.state.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        if take_one(&self.state.request_failures) {
            return Err(Error::transport(&self.target, "connection reset by peer"));
        }

        let mut response = Response::new(body);
        *response.status_mut() = StatusCode::OK;
        Ok(response)
    }

    async fn is_alive(&self) -> bool {
        !self.state.dead.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}
