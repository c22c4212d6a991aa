//! Deadlines: per-call timeouts, cancellation, handshake and connect bounds.

use std::time::{Duration, Instant};

use serde_json::json;
use walletlink_session::{HandshakeError, RpcError, Scenario, ScenarioConfig, ScenarioError, TransportError};

use crate::harness::{self, STEP};

#[tokio::test]
async fn test_call_times_out_and_channel_stays_usable() {
    let setup = harness::local_setup().await;
    let (client, _session) = harness::connect(&setup).await;

    let started = Instant::now();
    let result = client.call("hang", json!(null), Duration::from_secs(1)).await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(RpcError::TimedOut(t)) if t == Duration::from_secs(1)));
    assert!(elapsed >= Duration::from_millis(950), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "returned late: {elapsed:?}");
    assert_eq!(client.pending_count(), 0);

    let result = client.authorize(&harness::authorize_request()).await.unwrap();
    assert_eq!(result.auth_token, harness::TEST_AUTH_TOKEN);
}

#[tokio::test]
async fn test_late_response_after_timeout_is_discarded() {
    let setup = harness::local_setup().await;
    let (client, _session) = harness::connect(&setup).await;

    let result = client
        .call("sleep", json!({ "ms": 300 }), Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(RpcError::TimedOut(_))));

    // Let the late response arrive, then make sure nothing is confused.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let echoed = client.call("echo", json!("next"), STEP).await.unwrap();
    assert_eq!(echoed, json!("next"));
}

#[tokio::test]
async fn test_cancelled_call_removed_locally() {
    let setup = harness::local_setup().await;
    let (client, _session) = harness::connect(&setup).await;

    let call = client.begin("sleep", json!({ "ms": 200 }), STEP).await.unwrap();
    assert_eq!(client.pending_count(), 1);
    call.cancel();
    assert_eq!(client.pending_count(), 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!client.is_closed());
    let echoed = client.call("echo", json!(42), STEP).await.unwrap();
    assert_eq!(echoed, json!(42));
}

#[tokio::test]
async fn test_handshake_timeout_against_silent_listener() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let hold = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        drop(stream);
    });

    let scenario = Scenario::local(
        harness::keypair(),
        port,
        ScenarioConfig {
            handshake_timeout: Duration::from_millis(300),
            ..harness::test_config()
        },
    )
    .unwrap();
    let started = Instant::now();
    let result = scenario.start().await;
    assert!(matches!(
        result,
        Err(ScenarioError::Handshake(HandshakeError::Timeout(_)))
    ));
    assert!(started.elapsed() < Duration::from_secs(2));
    hold.abort();
}

#[tokio::test]
async fn test_connect_refused_is_connection_error() {
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let scenario = Scenario::local(harness::keypair(), port, harness::test_config()).unwrap();
    assert!(matches!(
        scenario.start().await,
        Err(ScenarioError::Transport(TransportError::Connection(_)))
    ));
}
