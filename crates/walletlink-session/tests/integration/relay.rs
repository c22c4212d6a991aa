//! Relayed sessions through an in-process reflector.

use std::time::Duration;

use walletlink_protocol::{AssociationDescriptor, RelaySessionId};
use walletlink_session::{
    ReflectorConfig, Scenario, ScenarioConfig, ScenarioError, ScenarioKind, SessionGate,
    SessionState, TransportError, WalletEndpoint,
};

use crate::harness::{self, STEP};

#[tokio::test]
async fn test_unknown_relay_session_rejected() {
    let reflector = harness::reflector(ReflectorConfig::default()).await;
    let scenario = Scenario::remote(
        harness::keypair(),
        &reflector.host_authority(),
        RelaySessionId::from("abc123"),
        harness::test_config(),
    )
    .unwrap();
    assert_eq!(scenario.kind(), ScenarioKind::Remote);

    let result = scenario.start().await;
    assert!(matches!(
        result,
        Err(ScenarioError::Transport(TransportError::RelayRejected(_)))
    ));
}

#[tokio::test]
async fn test_relay_without_peer_rejected() {
    let reflector = harness::reflector(ReflectorConfig {
        pairing_timeout: Duration::from_millis(300),
        ..ReflectorConfig::default()
    })
    .await;
    let id = RelaySessionId::from("abc123");
    reflector.register(&id, None);

    let scenario = Scenario::remote(
        harness::keypair(),
        &reflector.host_authority(),
        id,
        harness::test_config(),
    )
    .unwrap();
    match scenario.start().await {
        Err(ScenarioError::Transport(TransportError::RelayRejected(reason))) => {
            assert_eq!(reason, "no peer")
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn test_timed_out_dapp_not_paired_with_later_caller() {
    let reflector = harness::reflector(ReflectorConfig {
        pairing_timeout: Duration::from_millis(500),
        ..ReflectorConfig::default()
    })
    .await;
    let id = RelaySessionId::from("abc123");
    reflector.register(&id, None);

    let impatient = Scenario::remote(
        harness::keypair(),
        &reflector.host_authority(),
        id.clone(),
        ScenarioConfig {
            connect_timeout: Duration::from_millis(200),
            ..harness::test_config()
        },
    )
    .unwrap();
    assert!(matches!(
        impatient.start().await,
        Err(ScenarioError::Transport(TransportError::Timeout(_)))
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = Scenario::remote(
        harness::keypair(),
        &reflector.host_authority(),
        id,
        harness::test_config(),
    )
    .unwrap();
    match second.start().await {
        Err(ScenarioError::Transport(TransportError::RelayRejected(reason))) => {
            assert_eq!(reason, "no peer")
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn test_relay_end_to_end() {
    let reflector = harness::reflector(ReflectorConfig::default()).await;
    let id = RelaySessionId::from("abc123");
    reflector.register(&id, None);

    let keypair = harness::keypair();
    let scenario = Scenario::remote(
        keypair.clone(),
        &reflector.host_authority(),
        id,
        harness::test_config(),
    )
    .unwrap();

    // The wallet only sees the descriptor URI.
    let descriptor = AssociationDescriptor::parse(&scenario.association_uri()).unwrap();
    let gate = SessionGate::new();
    let wallet = {
        let gate = gate.clone();
        tokio::spawn(async move {
            WalletEndpoint::join_relay(
                &descriptor,
                harness::demo_wallet(),
                &harness::test_config(),
                &gate,
            )
            .await
        })
    };

    let client = scenario.start().await.unwrap();
    let session = wallet.await.unwrap().unwrap();
    assert_eq!(gate.state(), SessionState::Active(session.id()));
    assert_eq!(client.version(), session.version());

    let result = client.authorize(&harness::authorize_request()).await.unwrap();
    assert_eq!(result.auth_token, harness::TEST_AUTH_TOKEN);

    scenario.close().await;
    tokio::time::timeout(STEP, session.closed()).await.unwrap();
    assert!(gate.wait_idle(STEP).await);
}

#[tokio::test]
async fn test_relay_join_refused_while_busy() {
    let keypair = harness::keypair();
    let descriptor = AssociationDescriptor::relay(
        keypair.public_key().to_vec(),
        harness::test_config().supported_versions,
        "127.0.0.1:9",
        RelaySessionId::from("abc123"),
    )
    .unwrap();
    let gate = SessionGate::new();
    let _lease = gate.try_begin().unwrap();

    let result = WalletEndpoint::join_relay(
        &descriptor,
        harness::demo_wallet(),
        &harness::test_config(),
        &gate,
    )
    .await;
    assert!(matches!(result, Err(ScenarioError::Busy(_))));
}

#[tokio::test]
async fn test_relay_unreachable() {
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let scenario = Scenario::remote(
        harness::keypair(),
        &format!("127.0.0.1:{port}"),
        RelaySessionId::from("abc123"),
        harness::test_config(),
    )
    .unwrap();
    assert!(matches!(
        scenario.start().await,
        Err(ScenarioError::Transport(TransportError::RelayUnreachable(_)))
    ));
}

#[tokio::test]
async fn test_relay_pairing_bounded_by_connect_timeout() {
    let reflector = harness::reflector(ReflectorConfig::default()).await;
    let id = reflector.open_session(None);
    let scenario = Scenario::remote(
        harness::keypair(),
        &reflector.host_authority(),
        id,
        ScenarioConfig {
            connect_timeout: Duration::from_millis(200),
            ..harness::test_config()
        },
    )
    .unwrap();
    assert!(matches!(
        scenario.start().await,
        Err(ScenarioError::Transport(TransportError::Timeout(_)))
    ));
}
