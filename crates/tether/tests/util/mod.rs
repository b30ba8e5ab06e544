// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Workload identities and certificates for the integration tests.

#![allow(dead_code, reason = "not every test crate uses every helper")]

use std::time::{Duration, SystemTime};

use bytes::Bytes;
use rcgen::{CertificateParams, KeyPair, SanType};
use tether::{Credential, PeerCredential, StaticIdentity, TrustBundle, WorkloadId};

pub const CLIENT: &str = "spiffe://example.org/client";

/// A self-signed DER certificate carrying `id` as URI SAN.
pub fn svid(id: &str) -> Bytes {
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.subject_alt_names.push(SanType::URI(id.try_into().unwrap()));
    let key = KeyPair::generate().unwrap();
    Bytes::from(params.self_signed(&key).unwrap().der().to_vec())
}

/// A peer presenting a certificate for `id`.
pub fn peer(id: &str) -> PeerCredential {
    PeerCredential::new(vec![svid(id)])
}

/// An identity for `id` whose credential expires at `expires_at`.
pub fn identity_expiring(id: &str, expires_at: SystemTime) -> StaticIdentity {
    let key = KeyPair::generate().unwrap();
    let credential = Credential::new(
        WorkloadId::parse(id).unwrap(),
        vec![svid(id)],
        Bytes::from(key.serialize_der()),
        expires_at,
    );

    StaticIdentity::new(credential, TrustBundle::new("example.org", vec![svid(id)]))
}

/// The calling workload, valid for the next hour.
pub fn client_identity() -> StaticIdentity {
    identity_expiring(CLIENT, SystemTime::now() + Duration::from_secs(3600))
}
