//! Request/response and UDP media-frame scenarios (§8).

use vmnx_core::{InfoUdpPayload, Message, RequestPayload, ResponsePayload};
use vmnx_engine::SendOutcome;

use crate::infra::{connected_pair, connected_pair_client_without_udp, test_config};

#[tokio::test]
async fn ping_request_gets_pong_response() {
    let pair = connected_pair(&test_config()).await;

    let outcome = pair.client.send_request(RequestPayload::Ping { nonce: 42 }).await;
    match outcome {
        SendOutcome::Success(Message::Response {
            payload: ResponsePayload::Pong { nonce },
            ..
        }) => assert_eq!(nonce, 42),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn create_vm_request_gets_vm_created_response() {
    let pair = connected_pair(&test_config()).await;

    let outcome = pair
        .client
        .send_request(RequestPayload::CreateVm {
            name: "web-1".to_string(),
            ram_mb: 1024,
            cpu_cores: 2,
        })
        .await;

    match outcome {
        SendOutcome::Success(Message::Response {
            payload: ResponsePayload::VmCreated { vm_id },
            ..
        }) => assert_eq!(vm_id, 1),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn invalid_request_gets_invalid_request_data_sentinel() {
    let pair = connected_pair(&test_config()).await;

    let outcome = pair
        .client
        .send_request(RequestPayload::CreateVm {
            name: String::new(),
            ram_mb: 0,
            cpu_cores: 0,
        })
        .await;

    assert!(matches!(outcome, SendOutcome::InvalidMessageData));
}

/// §8 scenario 3: a UDP media message larger than one datagram's payload
/// budget arrives reassembled in full and in order on the other side.
#[tokio::test]
async fn vm_screen_frame_reassembles_across_multiple_datagrams() {
    let pair = connected_pair(&test_config()).await;

    let frame_bytes = vec![0xABu8; 200_000];
    let msg = Message::new_info_udp(InfoUdpPayload::VmScreenFrame {
        frame_no: 1,
        bytes: frame_bytes.clone(),
    });
    pair.server.send_info(msg);

    let mut received = None;
    for _ in 0..100 {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let infos = pair.client_info.udp_infos();
        if let Some(InfoUdpPayload::VmScreenFrame { bytes, .. }) = infos.into_iter().next() {
            received = Some(bytes);
            break;
        }
    }

    let received = received.expect("frame should have been reassembled within the deadline");
    assert_eq!(received, frame_bytes);
}

/// A side with no UDP socket at all (a thin request-only client) still
/// delivers UDP-marked info messages — they fall back to the TCP channel.
#[tokio::test]
async fn info_falls_back_to_tcp_when_sender_has_no_udp_socket() {
    let pair = connected_pair_client_without_udp(&test_config()).await;

    pair.client
        .send_info(Message::new_info_udp(InfoUdpPayload::VmScreenFrame {
            frame_no: 1,
            bytes: vec![1, 2, 3],
        }));

    let mut received = None;
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let infos = pair.server_info.udp_infos();
        if let Some(info) = infos.into_iter().next() {
            received = Some(info);
            break;
        }
    }

    match received.expect("info should have arrived over TCP") {
        InfoUdpPayload::VmScreenFrame { frame_no, bytes } => {
            assert_eq!(frame_no, 1);
            assert_eq!(bytes, vec![1, 2, 3]);
        }
        other => panic!("unexpected info: {other:?}"),
    }
}

/// Sending after disconnect is a no-op, not a panic.
#[tokio::test]
async fn send_info_after_disconnect_is_silently_dropped() {
    let pair = connected_pair(&test_config()).await;
    pair.client.disconnect();

    pair.server
        .send_info(Message::new_info_udp(InfoUdpPayload::VmScreenFrame {
            frame_no: 1,
            bytes: vec![1, 2, 3],
        }));
}
