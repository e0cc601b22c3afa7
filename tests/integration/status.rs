//! Connection-state, transfer-count, and crypto-generation scenarios (§8) —
//! the same facts `vmnxd`'s `GET /status` endpoint reports.

use std::io::Cursor;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use vmnx_core::RequestPayload;
use vmnx_engine::{Download, RateLimiter, SendOutcome, TransferHandle, Upload};

use crate::infra::{connected_pair, test_config};

#[tokio::test]
async fn fresh_pair_is_connected_with_no_transfers_and_generation_zero() {
    let pair = connected_pair(&test_config()).await;

    assert!(pair.client.is_connected());
    assert!(pair.server.is_connected());
    assert_eq!(pair.client.transfers().len(), 0);
    assert_eq!(pair.client.crypto_generation(), 0);
}

#[tokio::test]
async fn disconnect_flips_connected_predicate_to_false() {
    let pair = connected_pair(&test_config()).await;
    pair.client.disconnect();
    assert!(!pair.client.is_connected());
}

/// §4.C: an application-triggered rekey bumps the generation counter and the
/// peer keeps decrypting datagrams correctly across the rotation.
#[tokio::test]
async fn trigger_rekey_bumps_generation_and_traffic_survives() {
    let pair = connected_pair(&test_config()).await;
    assert_eq!(pair.server.crypto_generation(), 0);

    pair.server.trigger_rekey();
    // Give the CryptoReset info-tcp message a moment to be applied.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(pair.server.crypto_generation(), 1);

    let outcome = pair.client.send_request(RequestPayload::Ping { nonce: 9 }).await;
    assert!(matches!(outcome, SendOutcome::Success(_)));
}

/// §8 "rekey under load": once the server has sent more datagrams than
/// `rekey_threshold`, it rekeys on its own without the application asking,
/// and the client keeps receiving correctly afterwards.
#[tokio::test]
async fn automatic_rekey_triggers_after_threshold_datagrams() {
    let mut config = test_config();
    config.rekey_threshold = 3;
    let pair = connected_pair(&config).await;

    for frame_no in 0..10u64 {
        pair.server
            .send_info(vmnx_core::Message::new_info_udp(
                vmnx_core::InfoUdpPayload::VmScreenFrame {
                    frame_no,
                    bytes: vec![0u8; 16],
                },
            ));
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    assert!(pair.server.crypto_generation() >= 1);
    assert!(!pair.client_info.udp_infos().is_empty());
}

/// A registered transfer shows up in the transfer table's count and is
/// removed once it ends.
#[tokio::test]
async fn transfer_table_reflects_in_flight_transfer() {
    let pair = connected_pair(&test_config()).await;

    let sink: Box<dyn vmnx_engine::transfer::TransferSink> =
        Box::new(Cursor::new(Vec::<u8>::new()));
    let id = vmnx_core::MessageId::generate();
    let (download, events, _completion) = Download::new(id, 5, sink);
    pair.client.transfers().register(TransferHandle::Download(download.clone()), events);

    assert_eq!(pair.client.transfers().len(), 1);

    download.receive_async(&[1, 2, 3, 4, 5], 0);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    assert_eq!(pair.client.transfers().len(), 0);
}

#[tokio::test]
async fn upload_transfer_is_visible_while_running() {
    let pair = connected_pair(&test_config()).await;

    let source: Box<dyn vmnx_engine::transfer::TransferSource> =
        Box::new(Cursor::new(vec![1u8; 1024 * 64]));
    let id = vmnx_core::MessageId::generate();
    let cancel = CancellationToken::new();
    let (upload, events) = Upload::new(id, source, cancel);
    pair.client
        .transfers()
        .register(TransferHandle::Upload(upload.clone()), events);

    assert_eq!(pair.client.transfers().len(), 1);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    upload.start(Arc::new(RateLimiter::new(0.0)), tx);

    // Drain emitted chunks until the source is exhausted and the transfer
    // removes itself from the table.
    for _ in 0..200 {
        if pair.client.transfers().is_empty() {
            break;
        }
        let _ = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
    }
    assert!(pair.client.transfers().is_empty());
}
