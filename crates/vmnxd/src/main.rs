//! vmnxd — reference server hosting one `vmnx-engine` connection.
//!
//! Accepts exactly one control connection, brings up the paired UDP channel,
//! and wires example `Ping`/`CreateVm`/`RequestRekey` request handling plus a
//! periodic `VmScreenFrame` info producer, so the engine can be exercised
//! manually or from the integration tests without a real hypervisor on the
//! other end. Never multiplexes more than one peer per process.

mod status;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UdpSocket};

use vmnx_core::config::EngineConfig;
use vmnx_core::crypto::{generate_rekey_material, Role};
use vmnx_core::{
    InfoTcpPayload, InfoUdpPayload, Message, MessageId, RequestPayload, ResponsePayload,
};
use vmnx_engine::dispatch::{InfoHandler, RequestHandler};
use vmnx_engine::EngineHandle;

/// Default port for the `GET /status` endpoint; overridable so more than one
/// vmnxd instance can run side by side on one host.
const DEFAULT_STATUS_PORT: u16 = 7423;

struct ExampleRequestHandler {
    next_vm_id: AtomicU64,
    /// Set once the engine handle exists (§9: `EngineHandle::spawn` needs the
    /// handler before it can hand back a handle, so this is filled in right
    /// after `spawn` returns rather than threaded through the constructor).
    engine: OnceLock<EngineHandle>,
}

impl RequestHandler for ExampleRequestHandler {
    fn process_request(&self, request_id: MessageId, payload: RequestPayload) -> ResponsePayload {
        match payload {
            RequestPayload::Ping { nonce } => {
                tracing::debug!(%request_id, nonce, "answered ping");
                ResponsePayload::Pong { nonce }
            }
            RequestPayload::CreateVm {
                name,
                ram_mb,
                cpu_cores,
            } => {
                let vm_id = self.next_vm_id.fetch_add(1, Ordering::SeqCst) + 1;
                tracing::info!(vm_id, name, ram_mb, cpu_cores, "created example VM");
                ResponsePayload::VmCreated { vm_id }
            }
            RequestPayload::RequestRekey => {
                if let Some(engine) = self.engine.get() {
                    engine.trigger_rekey();
                }
                ResponsePayload::RekeyAcknowledged
            }
        }
    }
}

struct ExampleInfoHandler;

impl InfoHandler for ExampleInfoHandler {
    fn process_info_tcp(&self, payload: InfoTcpPayload) {
        tracing::debug!(?payload, "info-tcp received");
    }

    fn process_info_udp(&self, payload: InfoUdpPayload) {
        match payload {
            InfoUdpPayload::VmScreenFrame { frame_no, bytes } => {
                tracing::trace!(frame_no, bytes = bytes.len(), "vm screen frame received");
            }
            InfoUdpPayload::TransferData { .. } => {
                // Routed to the transfer table before reaching here; seeing
                // one means it targeted an unknown transfer id.
                tracing::debug!("stray transfer-data info reached the application handler");
            }
        }
    }
}

/// Example "media" producer: a fixed-rate stream of dummy VM screen frames
/// sent over the UDP channel, for exercising reassembly and the rate limiter
/// without a real hypervisor attached.
async fn vm_screen_frame_producer(engine: EngineHandle) {
    let mut frame_no: u64 = 0;
    let mut interval = tokio::time::interval(Duration::from_millis(33));
    loop {
        interval.tick().await;
        if !engine.is_connected() {
            return;
        }
        frame_no += 1;
        let msg = Message::new_info_udp(InfoUdpPayload::VmScreenFrame {
            frame_no,
            bytes: vec![0u8; 4096],
        });
        engine.send_info(msg);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = EngineConfig::load().context("failed to load engine configuration")?;

    let tcp_addr = SocketAddr::new(config.server_ip, config.tcp_port);
    let listener = TcpListener::bind(tcp_addr)
        .await
        .with_context(|| format!("failed to bind TCP control listener on {tcp_addr}"))?;
    tracing::info!(addr = %tcp_addr, "vmnxd listening for the control connection");

    let (tcp_stream, peer_addr) = listener
        .accept()
        .await
        .context("failed to accept the control connection")?;
    tracing::info!(peer = %peer_addr, "accepted control connection");

    let udp_bind_addr = SocketAddr::new(config.server_ip, config.udp_port);
    let udp_socket = UdpSocket::bind(udp_bind_addr)
        .await
        .with_context(|| format!("failed to bind UDP socket on {udp_bind_addr}"))?;
    let peer_udp_addr = SocketAddr::new(peer_addr.ip(), config.udp_port);
    udp_socket
        .connect(peer_udp_addr)
        .await
        .with_context(|| format!("failed to connect UDP channel to {peer_udp_addr}"))?;
    tracing::info!(peer = %peer_udp_addr, "UDP channel connected");

    // Authentication and key exchange are out of this engine's scope; an
    // ephemeral key/salt pair stands in for whatever handshake a real
    // deployment would run before handing the connection to the engine.
    let (master_key, salt) = generate_rekey_material();

    let request_handler = Arc::new(ExampleRequestHandler {
        next_vm_id: AtomicU64::new(0),
        engine: OnceLock::new(),
    });
    let info_handler = Arc::new(ExampleInfoHandler);

    let engine = EngineHandle::spawn(
        tcp_stream,
        Some(Arc::new(udp_socket)),
        Role::Server,
        &config,
        master_key,
        salt,
        request_handler.clone(),
        info_handler,
    );
    let _ = request_handler.engine.set(engine.clone());

    let status_port: u16 = std::env::var("VMNX_STATUS_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_STATUS_PORT);

    let mut fail_events = engine.subscribe_fail_events();

    tokio::select! {
        () = vm_screen_frame_producer(engine.clone()) => {}
        result = status::serve(engine.clone(), status_port) => {
            if let Err(err) = result {
                tracing::error!(%err, "status endpoint exited");
            }
        }
        _ = fail_events.recv() => {
            tracing::info!("connection torn down, vmnxd exiting");
        }
    }

    Ok(())
}
