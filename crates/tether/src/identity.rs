// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Workload identities, credentials and the identity provider seam.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::{ConfigError, Error, Result};
use crate::svid;

const SCHEME: &str = "spiffe://";
const MAX_ID_LEN: usize = 2048;
const MAX_TRUST_DOMAIN_LEN: usize = 255;

/// A validated workload identity in the SPIFFE namespace, `spiffe://<trust-domain>/<path>`.
///
/// Used as the key for pooling and circuit breaking. Cloning is cheap and the value
/// never changes once constructed.
///
/// # Examples
///
/// ```
/// use tether::WorkloadId;
///
/// let id: WorkloadId = "spiffe://example.org/ns/prod/billing".parse()?;
/// assert_eq!(id.trust_domain(), "example.org");
/// assert_eq!(id.path(), "/ns/prod/billing");
/// # Ok::<(), tether::Error>(())
/// ```
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkloadId {
    raw: Arc<str>,
    path_start: usize,
}

impl WorkloadId {
    /// Parses and validates a workload identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when `value` is not a well-formed SPIFFE ID.
    pub fn parse(value: &str) -> Result<Self> {
        let path_start = validate(value).map_err(|reason| ConfigError::new("target", format!("`{value}` {reason}")))?;

        Ok(Self {
            raw: Arc::from(value),
            path_start,
        })
    }

    /// The full identity string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The trust domain, e.g. `example.org`.
    #[must_use]
    pub fn trust_domain(&self) -> &str {
        &self.raw[SCHEME.len()..self.path_start]
    }

    /// The workload path, always starting with `/`.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.raw[self.path_start..]
    }
}

/// Returns the byte offset of the path on success.
fn validate(value: &str) -> std::result::Result<usize, &'static str> {
    if value.len() > MAX_ID_LEN {
        return Err("exceeds the maximum identity length");
    }

    let rest = value.strip_prefix(SCHEME).ok_or("is not a spiffe:// identity")?;
    let slash = rest.find('/').ok_or("has no workload path")?;
    let (trust_domain, path) = rest.split_at(slash);

    if trust_domain.is_empty() {
        return Err("has an empty trust domain");
    }

    if trust_domain.len() > MAX_TRUST_DOMAIN_LEN {
        return Err("has a trust domain that is too long");
    }

    if !trust_domain
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'_'))
    {
        return Err("has invalid characters in the trust domain");
    }

    for segment in path[1..].split('/') {
        match segment {
            "" => return Err("has an empty path segment"),
            "." | ".." => return Err("has a relative path segment"),
            _ if !segment
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_')) =>
            {
                return Err("has invalid characters in the path");
            }
            _ => {}
        }
    }

    Ok(SCHEME.len() + slash)
}

impl FromStr for WorkloadId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for WorkloadId {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl AsRef<str> for WorkloadId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WorkloadId").field(&&*self.raw).finish()
    }
}

/// This workload's own credential: an X.509 SVID and its private key.
#[derive(Clone)]
pub struct Credential {
    identity: WorkloadId,
    chain: Vec<Bytes>,
    private_key: Bytes,
    expires_at: SystemTime,
}

impl Credential {
    /// Creates a credential from a DER certificate chain (leaf first) and a DER private key.
    #[must_use]
    pub fn new(identity: WorkloadId, chain: Vec<Bytes>, private_key: Bytes, expires_at: SystemTime) -> Self {
        Self {
            identity,
            chain,
            private_key,
            expires_at,
        }
    }

    /// The identity this credential asserts.
    #[must_use]
    pub fn identity(&self) -> &WorkloadId {
        &self.identity
    }

    /// The DER certificate chain, leaf first.
    #[must_use]
    pub fn chain(&self) -> &[Bytes] {
        &self.chain
    }

    /// The DER-encoded private key.
    #[must_use]
    pub fn private_key(&self) -> &Bytes {
        &self.private_key
    }

    /// When the leaf certificate stops being valid.
    #[must_use]
    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    /// Whether the credential is expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("identity", &self.identity)
            .field("chain_len", &self.chain.len())
            .field("private_key", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Trust material used to validate certificates issued within a trust domain.
#[derive(Debug, Clone)]
pub struct TrustBundle {
    trust_domain: String,
    roots: Vec<Bytes>,
}

impl TrustBundle {
    /// Creates a bundle from DER root certificates.
    #[must_use]
    pub fn new(trust_domain: impl Into<String>, roots: Vec<Bytes>) -> Self {
        Self {
            trust_domain: trust_domain.into(),
            roots,
        }
    }

    /// The trust domain the roots belong to.
    #[must_use]
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// The DER root certificates.
    #[must_use]
    pub fn roots(&self) -> &[Bytes] {
        &self.roots
    }
}

/// The credential a peer presented during the handshake.
#[derive(Debug, Clone)]
pub struct PeerCredential {
    chain: Vec<Bytes>,
}

impl PeerCredential {
    /// Wraps the DER chain presented by the peer, leaf first.
    #[must_use]
    pub fn new(chain: Vec<Bytes>) -> Self {
        Self { chain }
    }

    /// The DER chain presented by the peer.
    #[must_use]
    pub fn chain(&self) -> &[Bytes] {
        &self.chain
    }

    /// Extracts the workload identity asserted by the leaf certificate.
    ///
    /// Returns `None` when the peer presented no certificate, or a leaf without a
    /// `spiffe://` URI SAN, or a leaf that cannot be parsed.
    #[must_use]
    pub fn asserted_identity(&self) -> Option<String> {
        let leaf = self.chain.first()?;
        svid::spiffe_id_from_der(leaf).ok()
    }
}

/// Supplies this workload's credentials and the trust material for its peers.
///
/// Implementations must be safe to call concurrently and may cache or rotate
/// credentials transparently.
pub trait IdentityProvider: Send + Sync + 'static {
    /// Returns this workload's current credential.
    fn own_credential(&self) -> impl Future<Output = Result<Credential>> + Send;

    /// Returns the trust material needed to validate the credential of `peer`.
    fn trust_bundle(&self, peer: &WorkloadId) -> impl Future<Output = Result<TrustBundle>> + Send;
}

/// An [`IdentityProvider`] serving a fixed credential and trust bundle.
///
/// The credential can be swapped at runtime through [`StaticIdentity::rotate`].
#[derive(Debug)]
pub struct StaticIdentity {
    credential: RwLock<Credential>,
    bundle: TrustBundle,
}

impl StaticIdentity {
    /// Creates a provider from a credential and the bundle used for every peer.
    #[must_use]
    pub fn new(credential: Credential, bundle: TrustBundle) -> Self {
        Self {
            credential: RwLock::new(credential),
            bundle,
        }
    }

    /// Replaces the credential handed out by subsequent calls.
    pub fn rotate(&self, credential: Credential) {
        *self.credential.write() = credential;
    }
}

impl IdentityProvider for StaticIdentity {
    async fn own_credential(&self) -> Result<Credential> {
        Ok(self.credential.read().clone())
    }

    async fn trust_bundle(&self, peer: &WorkloadId) -> Result<TrustBundle> {
        if peer.trust_domain() != self.bundle.trust_domain() {
            return Err(Error::identity(format!(
                "no trust bundle for trust domain `{}`",
                peer.trust_domain()
            )));
        }

        Ok(self.bundle.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing;

    #[test]
    fn parse_valid_identity() {
        let id = WorkloadId::parse("spiffe://example.org/ns/prod/sa/billing").unwrap();

        assert_eq!(id.as_str(), "spiffe://example.org/ns/prod/sa/billing");
        assert_eq!(id.trust_domain(), "example.org");
        assert_eq!(id.path(), "/ns/prod/sa/billing");
        assert_eq!(id.to_string(), "spiffe://example.org/ns/prod/sa/billing");
    }

    #[test]
    fn parse_rejects_malformed_identities() {
        let cases = [
            "target-A",
            "https://example.org/a",
            "SPIFFE://example.org/a",
            "spiffe://",
            "spiffe://example.org",
            "spiffe://example.org/",
            "spiffe:///a",
            "spiffe://Example.org/a",
            "spiffe://example.org/a//b",
            "spiffe://example.org/a/../b",
            "spiffe://example.org/a?x=1",
            "spiffe://example.org/a#frag",
            "spiffe://exa mple.org/a",
        ];

        for case in cases {
            let error = WorkloadId::parse(case).unwrap_err();
            let Error::Config(config) = error else {
                panic!("expected a configuration error for {case}");
            };
            assert_eq!(config.field(), "target");
        }
    }

    #[test]
    fn parse_rejects_overlong_identity() {
        let long = format!("spiffe://example.org/{}", "a".repeat(MAX_ID_LEN));
        WorkloadId::parse(&long).unwrap_err();
    }

    #[test]
    fn ordering_and_equality_follow_the_raw_string() {
        let a: WorkloadId = "spiffe://example.org/a".parse().unwrap();
        let b: WorkloadId = "spiffe://example.org/b".parse().unwrap();
        let a2 = WorkloadId::try_from("spiffe://example.org/a").unwrap();

        assert!(a < b);
        assert_eq!(a, a2);
        assert_eq!(format!("{a:?}"), r#"WorkloadId("spiffe://example.org/a")"#);
    }

    #[test]
    fn credential_debug_redacts_key() {
        let credential = testing::credential("spiffe://example.org/client");
        let debug = format!("{credential:?}");

        assert!(debug.contains("<redacted>"));
        assert!(debug.contains("spiffe://example.org/client"));
    }

    #[test]
    fn credential_expiry() {
        let credential = testing::credential("spiffe://example.org/client");
        let expires = credential.expires_at();

        assert!(!credential.is_expired(expires - Duration::from_secs(1)));
        assert!(credential.is_expired(expires));
    }

    #[test]
    fn peer_credential_extracts_spiffe_id() {
        let peer = testing::peer_credential("spiffe://example.org/target-Y");
        assert_eq!(peer.asserted_identity().as_deref(), Some("spiffe://example.org/target-Y"));
    }

    #[test]
    fn peer_credential_without_chain_asserts_nothing() {
        assert_eq!(PeerCredential::new(Vec::new()).asserted_identity(), None);
        assert_eq!(PeerCredential::new(vec![Bytes::from_static(b"garbage")]).asserted_identity(), None);
    }

    #[tokio::test]
    async fn static_identity_rotates_credentials() {
        let provider = testing::identity("spiffe://example.org/client");
        assert_eq!(provider.own_credential().await.unwrap().identity().as_str(), "spiffe://example.org/client");

        provider.rotate(testing::credential("spiffe://example.org/client-v2"));
        assert_eq!(
            provider.own_credential().await.unwrap().identity().as_str(),
            "spiffe://example.org/client-v2"
        );
    }

    #[tokio::test]
    async fn static_identity_rejects_foreign_trust_domain() {
        let provider = testing::identity("spiffe://example.org/client");
        let foreign: WorkloadId = "spiffe://other.org/server".parse().unwrap();

        let error = provider.trust_bundle(&foreign).await.unwrap_err();
        assert!(matches!(error, Error::Identity { .. }));
    }
}
