//! User-visible failure and disconnect scenarios (§7, §8).

use vmnx_core::RequestPayload;
use vmnx_engine::SendOutcome;

use crate::infra::{client_with_silent_peer, connected_pair, test_config};

#[tokio::test]
async fn request_times_out_when_peer_never_responds() {
    let mut config = test_config();
    config.message_timeout_ms = 100;
    let (client, _silent_peer) = client_with_silent_peer(&config).await;

    let outcome = client.send_request(RequestPayload::Ping { nonce: 1 }).await;
    assert!(matches!(outcome, SendOutcome::MessageSendingTimeout));
}

#[tokio::test]
async fn send_request_after_local_disconnect_is_rejected_immediately() {
    let pair = connected_pair(&test_config()).await;
    pair.client.disconnect();

    let outcome = pair.client.send_request(RequestPayload::Ping { nonce: 1 }).await;
    assert!(matches!(outcome, SendOutcome::DisconnectedFromServer));
}

/// §8 "sudden disconnect": one side tears down its transport mid-session;
/// the other observes a `TransportFatal` fail event and its connected
/// predicate flips to false, without the process crashing or hanging.
#[tokio::test]
async fn peer_closing_the_socket_is_detected_as_transport_fatal() {
    let pair = connected_pair(&test_config()).await;
    let mut server_fail_events = pair.server.subscribe_fail_events();

    pair.client.disconnect();

    let event = tokio::time::timeout(std::time::Duration::from_secs(2), server_fail_events.recv())
        .await
        .expect("server should observe a fail event within the deadline")
        .expect("fail event channel should not close first");

    assert_eq!(event.category, vmnx_engine::engine::FailCategory::TransportFatal);

    // is_connected() should settle to false shortly after the event fires.
    for _ in 0..50 {
        if !pair.server.is_connected() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(!pair.server.is_connected());
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let pair = connected_pair(&test_config()).await;
    pair.client.disconnect();
    // A second call must not panic.
    pair.client.disconnect();
    assert!(!pair.client.is_connected());
}
