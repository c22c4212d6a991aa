//! Loopback sessions: end-to-end authorize, concurrency, busy refusal, close.

use std::time::Duration;

use serde_json::json;
use walletlink_protocol::{ProtocolVersion, RpcErrorObject};
use walletlink_session::{
    HandshakeError, RpcError, ScenarioConfig, ScenarioError, SessionState,
};

use crate::harness::{self, STEP};

#[tokio::test]
async fn test_local_authorize_end_to_end() {
    let setup = harness::local_setup().await;
    let (client, session) = harness::connect(&setup).await;

    assert_eq!(client.version(), ProtocolVersion::V2);
    assert_eq!(session.version(), ProtocolVersion::V2);
    assert_eq!(client.default_timeout(), Duration::from_secs(30));
    assert_eq!(setup.server.state(), SessionState::Active(session.id()));

    let result = client.authorize(&harness::authorize_request()).await.unwrap();
    assert_eq!(result.auth_token, harness::TEST_AUTH_TOKEN);
    assert_eq!(result.accounts.len(), 1);
    assert_eq!(result.accounts[0].address, vec![0xA5; 32]);

    client.deauthorize(&result.auth_token).await.unwrap();
}

#[tokio::test]
async fn test_authorization_refused_surfaces_remote_error() {
    let setup = harness::local_setup().await;
    let (client, _session) = harness::connect(&setup).await;

    let mut request = harness::authorize_request();
    request.identity.name = None;
    match client.authorize(&request).await {
        Err(RpcError::Remote { code, .. }) => {
            assert_eq!(code, RpcErrorObject::AUTHORIZATION_FAILED)
        }
        other => panic!("unexpected: {other:?}"),
    }

    // The channel survives an application-level error.
    let echoed = client.call("echo", json!([1, 2, 3]), STEP).await.unwrap();
    assert_eq!(echoed, json!([1, 2, 3]));
}

#[tokio::test]
async fn test_concurrent_calls_resolve_out_of_order() {
    let setup = harness::local_setup().await;
    let (client, _session) = harness::connect(&setup).await;

    let slow = client.begin("sleep", json!({ "ms": 400 }), STEP).await.unwrap();
    let medium = client.begin("sleep", json!({ "ms": 200 }), STEP).await.unwrap();
    let fast = client.begin("sleep", json!({ "ms": 10 }), STEP).await.unwrap();
    assert_eq!(client.pending_count(), 3);

    let (slow, medium, fast) = tokio::join!(slow.wait(), medium.wait(), fast.wait());
    assert_eq!(slow.unwrap(), json!({ "slept": 400 }));
    assert_eq!(medium.unwrap(), json!({ "slept": 200 }));
    assert_eq!(fast.unwrap(), json!({ "slept": 10 }));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_many_parallel_callers() {
    let setup = harness::local_setup().await;
    let (client, _session) = harness::connect(&setup).await;

    let mut tasks = Vec::new();
    for i in 0..32u64 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            client.call("echo", json!({ "n": i }), STEP).await
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap().unwrap(), json!({ "n": i }));
    }
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let setup = harness::local_setup().await;
    let (client, session) = harness::connect(&setup).await;

    setup.scenario.close().await;
    setup.scenario.close().await;

    assert!(client.is_closed());
    assert!(matches!(
        client.call("echo", json!(null), STEP).await,
        Err(RpcError::ChannelClosed)
    ));
    tokio::time::timeout(STEP, session.closed()).await.unwrap();
    assert!(setup.server.gate().wait_idle(STEP).await);
    assert!(matches!(setup.scenario.start().await, Err(ScenarioError::Closed)));
}

#[tokio::test]
async fn test_close_fails_pending_calls() {
    let setup = harness::local_setup().await;
    let (client, _session) = harness::connect(&setup).await;

    let call = client.begin("hang", json!(null), Duration::from_secs(30)).await.unwrap();
    setup.scenario.close().await;
    let result = tokio::time::timeout(STEP, call.wait()).await.unwrap();
    assert!(matches!(result, Err(RpcError::ChannelClosed)));
}

#[tokio::test]
async fn test_wallet_close_fails_dapp_calls() {
    let setup = harness::local_setup().await;
    let (client, session) = harness::connect(&setup).await;

    let call = client.begin("hang", json!(null), Duration::from_secs(30)).await.unwrap();
    session.close();
    session.close();
    let result = tokio::time::timeout(STEP, call.wait()).await.unwrap();
    assert!(matches!(result, Err(RpcError::ChannelClosed)));
    assert!(setup.server.gate().wait_idle(STEP).await);
}

#[tokio::test]
async fn test_second_dapp_gets_session_busy() {
    let setup = harness::local_setup().await;
    let (_client, _session) = harness::connect(&setup).await;

    let second = harness::another_scenario(&setup, setup.keypair.clone());
    let result = second.start().await;
    assert!(matches!(
        result,
        Err(ScenarioError::Handshake(HandshakeError::SessionBusy))
    ));
    assert!(matches!(setup.server.state(), SessionState::Active(_)));

    // Once the first session ends the wallet admits a new one.
    setup.scenario.close().await;
    assert!(setup.server.gate().wait_idle(STEP).await);

    let third = harness::another_scenario(&setup, setup.keypair.clone());
    let client = third.start().await.unwrap();
    let _session = setup.server.next_session(STEP).await.unwrap();
    let result = client.authorize(&harness::authorize_request()).await.unwrap();
    assert_eq!(result.auth_token, harness::TEST_AUTH_TOKEN);
}

#[tokio::test]
async fn test_unknown_association_key_rejected() {
    let setup = harness::local_setup().await;
    let stranger = harness::another_scenario(&setup, harness::keypair());

    let result = stranger.start().await;
    assert!(matches!(
        result,
        Err(ScenarioError::Handshake(HandshakeError::ConnectionClosed))
    ));
    assert!(setup.server.gate().wait_idle(STEP).await);
    assert!(setup.server.next_session(Duration::from_millis(100)).await.is_err());
}

#[tokio::test]
async fn test_disjoint_versions_fail_scenario() {
    let config = ScenarioConfig {
        supported_versions: vec![ProtocolVersion(7)],
        ..harness::test_config()
    };
    let setup = harness::local_setup_with(ScenarioConfig {
        supported_versions: vec![ProtocolVersion::V1],
        ..harness::test_config()
    })
    .await;
    let dapp = walletlink_session::Scenario::local(
        setup.keypair.clone(),
        setup.server.local_port(),
        config,
    )
    .unwrap();

    let result = dapp.start().await;
    assert!(matches!(
        result,
        Err(ScenarioError::Handshake(HandshakeError::VersionMismatch { .. }))
    ));
    assert!(setup.server.gate().wait_idle(STEP).await);
}

#[tokio::test]
async fn test_negotiates_highest_common_version() {
    let setup = harness::local_setup_with(ScenarioConfig {
        supported_versions: vec![ProtocolVersion::V1],
        ..harness::test_config()
    })
    .await;
    // The dApp advertises both; the wallet only speaks v1.
    let dapp = harness::another_scenario(&setup, setup.keypair.clone());
    let client = dapp.start().await.unwrap();
    assert_eq!(client.version(), ProtocolVersion::V1);
}

#[tokio::test]
async fn test_start_twice_rejected() {
    let setup = harness::local_setup().await;
    let (_client, _session) = harness::connect(&setup).await;
    assert!(matches!(
        setup.scenario.start().await,
        Err(ScenarioError::AlreadyStarted)
    ));
}
