// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Integration tests for secure channels using only public API.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode};
use tether::{
    CallContext, ChannelConfig, ChannelState, Error, ErrorKind, Loopback, PeerVerification, SecureChannel, StaticIdentity,
    TlsVersion, WorkloadId,
};
use tick::Clock;
use util::{CLIENT, client_identity, identity_expiring};

mod util;

const TARGET_X: &str = "spiffe://example.org/target-X";
const TARGET_Y: &str = "spiffe://example.org/target-Y";

fn router() -> tether::Router {
    tether::Router::new()
        .route(Method::GET, "/status", |_request, _ctx: CallContext| async {
            Ok(Response::new(Bytes::from_static(b"ok")))
        })
        .route(Method::POST, "/whoami", |_request: Request<Bytes>, ctx: CallContext| async move {
            let caller = ctx.caller().map(ToString::to_string).unwrap_or_default();
            let task = ctx.task_id().unwrap_or_default().to_string();
            Ok(Response::new(Bytes::from(format!("{caller}|{task}"))))
        })
}

fn loopback(peer: &str) -> Arc<Loopback> {
    Arc::new(Loopback::new(router(), util::peer(peer)))
}

fn channel(connector: &Arc<Loopback>, target: &str) -> SecureChannel<StaticIdentity, Loopback> {
    SecureChannel::new(
        Arc::new(client_identity()),
        Arc::clone(connector),
        WorkloadId::parse(target).unwrap(),
        ChannelConfig::default(),
        Clock::new_tokio(),
    )
    .unwrap()
}

#[tokio::test]
async fn mismatched_peer_fails_closed_without_second_handshake() {
    let connector = loopback(TARGET_Y);
    let channel = channel(&connector, TARGET_X);
    let ctx = CallContext::new();

    let error = channel.get("/status", &ctx).await.unwrap_err();

    let Error::PeerVerification(mismatch) = &error else {
        panic!("expected a verification failure, got {error:?}");
    };
    assert_eq!(mismatch.expected(), TARGET_X);
    assert_eq!(mismatch.actual(), Some(TARGET_Y));
    assert_eq!(channel.state(), ChannelState::Failed);
    assert!(!channel.is_usable());

    let again = channel.post("/whoami", "payload", &ctx).await.unwrap_err();

    assert_eq!(again.kind(), ErrorKind::PeerVerification);
    assert_eq!(connector.handshakes(), 1);
}

#[tokio::test]
async fn verified_peer_serves_requests() {
    let connector = loopback(TARGET_X);
    let channel = channel(&connector, TARGET_X);

    let response = channel.get("/status", &CallContext::new()).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.body(), &Bytes::from_static(b"ok"));
    assert_eq!(channel.state(), ChannelState::Ready);
    assert!(channel.probe().await);
}

#[tokio::test]
async fn context_travels_with_request() {
    let connector = loopback(TARGET_X);
    let channel = channel(&connector, TARGET_X);
    let ctx = CallContext::new()
        .with_caller(WorkloadId::parse(CLIENT).unwrap())
        .with_task_id("task-7");

    let response = channel.post("/whoami", Bytes::new(), &ctx).await.unwrap();

    assert_eq!(response.body(), &Bytes::from(format!("{CLIENT}|task-7")));
}

#[tokio::test]
async fn unknown_routes_surface_as_responses() {
    let connector = loopback(TARGET_X);
    let channel = channel(&connector, TARGET_X);
    let ctx = CallContext::new();

    assert_eq!(channel.get("/missing", &ctx).await.unwrap().status(), StatusCode::NOT_FOUND);
    assert_eq!(channel.delete("/status", &ctx).await.unwrap().status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_use_shares_one_handshake() {
    let connector = loopback(TARGET_X);
    let channel = Arc::new(channel(&connector, TARGET_X));

    let calls: Vec<_> = (0..32)
        .map(|_| {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.get("/status", &CallContext::new()).await })
        })
        .collect();

    for call in calls {
        call.await.unwrap().unwrap();
    }

    assert_eq!(connector.handshakes(), 1);
}

#[tokio::test]
async fn passed_deadline_fails_without_io() {
    let connector = loopback(TARGET_X);
    let channel = channel(&connector, TARGET_X);
    let clock = Clock::new_tokio();
    let ctx = CallContext::new().with_deadline(clock.instant());

    let error = channel.get("/status", &ctx).await.unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Timeout);
    assert_eq!(connector.handshakes(), 0);
}

#[tokio::test]
async fn expired_credential_is_refused() {
    let connector = loopback(TARGET_X);
    let channel = SecureChannel::new(
        Arc::new(identity_expiring(CLIENT, SystemTime::UNIX_EPOCH + Duration::from_secs(60))),
        Arc::clone(&connector),
        WorkloadId::parse(TARGET_X).unwrap(),
        ChannelConfig::default(),
        Clock::new_tokio(),
    )
    .unwrap();

    let error = channel.get("/status", &CallContext::new()).await.unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Identity);
    assert_eq!(connector.handshakes(), 0);
}

#[tokio::test]
async fn closed_channel_rejects_requests() {
    let connector = loopback(TARGET_X);
    let channel = channel(&connector, TARGET_X);
    channel.get("/status", &CallContext::new()).await.unwrap();

    channel.close().await;
    channel.close().await;

    let error = channel.get("/status", &CallContext::new()).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Closed);
    assert!(!channel.probe().await);
}

#[test]
fn unsafe_configuration_is_rejected_at_construction() {
    let connector = loopback(TARGET_X);
    let target = WorkloadId::parse(TARGET_X).unwrap();

    let configs = [
        ChannelConfig {
            peer_verification: PeerVerification::Disabled,
            ..ChannelConfig::default()
        },
        ChannelConfig {
            min_tls_version: TlsVersion::Tls11,
            ..ChannelConfig::default()
        },
        ChannelConfig {
            timeout: Duration::ZERO,
            ..ChannelConfig::default()
        },
    ];

    for config in configs {
        let identity = Arc::new(client_identity());
        let error = SecureChannel::new(identity, Arc::clone(&connector), target.clone(), config, Clock::new_frozen()).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Config);
    }
}

#[test]
fn malformed_target_is_rejected() {
    for target in ["target-X", "https://example.org/x", "spiffe://example.org", "spiffe://Example.org/x"] {
        let error = WorkloadId::parse(target).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Config, "{target}");
    }
}
