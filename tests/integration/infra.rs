//! Shared two-engine loopback harness. Not a test module itself — every
//! other file in this crate builds on `connected_pair`.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream, UdpSocket};

use vmnx_core::config::EngineConfig;
use vmnx_core::crypto::Role;
use vmnx_core::{InfoTcpPayload, InfoUdpPayload, MessageId, RequestPayload, ResponsePayload};
use vmnx_engine::dispatch::{InfoHandler, RequestHandler};
use vmnx_engine::EngineHandle;

/// Answers `Ping`/`CreateVm`/`RequestRekey` the same way `vmnxd`'s example
/// handler does, so either side of a pair can be the target of requests.
pub struct EchoRequestHandler {
    next_vm_id: AtomicU64,
}

impl EchoRequestHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_vm_id: AtomicU64::new(0),
        })
    }
}

impl RequestHandler for EchoRequestHandler {
    fn process_request(&self, _request_id: MessageId, payload: RequestPayload) -> ResponsePayload {
        match payload {
            RequestPayload::Ping { nonce } => ResponsePayload::Pong { nonce },
            RequestPayload::CreateVm { .. } => {
                let vm_id = self.next_vm_id.fetch_add(1, Ordering::SeqCst) + 1;
                ResponsePayload::VmCreated { vm_id }
            }
            RequestPayload::RequestRekey => ResponsePayload::RekeyAcknowledged,
        }
    }
}

/// Records every info notification delivered to the application layer so
/// tests can assert on them without wiring up real side effects.
#[derive(Default)]
pub struct RecordingInfoHandler {
    tcp: Mutex<Vec<InfoTcpPayload>>,
    udp: Mutex<Vec<InfoUdpPayload>>,
}

impl RecordingInfoHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn tcp_infos(&self) -> Vec<InfoTcpPayload> {
        self.tcp.lock().unwrap().clone()
    }

    pub fn udp_infos(&self) -> Vec<InfoUdpPayload> {
        self.udp.lock().unwrap().clone()
    }
}

impl InfoHandler for RecordingInfoHandler {
    fn process_info_tcp(&self, payload: InfoTcpPayload) {
        self.tcp.lock().unwrap().push(payload);
    }

    fn process_info_udp(&self, payload: InfoUdpPayload) {
        self.udp.lock().unwrap().push(payload);
    }
}

/// A connected server/client engine pair, plus each side's recording info
/// handler for assertions.
pub struct Pair {
    pub server: EngineHandle,
    pub client: EngineHandle,
    pub server_info: Arc<RecordingInfoHandler>,
    pub client_info: Arc<RecordingInfoHandler>,
}

/// A config tuned for fast, deterministic tests: short message timeout, and
/// a rekey threshold low enough to trigger within a handful of datagrams.
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.message_timeout_ms = 2_000;
    config.rekey_threshold = 5;
    config
}

/// Bring up a connected pair over real loopback TCP + UDP sockets with
/// ephemeral ports. Both sides start from the same master key/salt since
/// nothing in this harness performs a real key exchange.
pub async fn connected_pair(config: &EngineConfig) -> Pair {
    let tcp_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let tcp_addr = tcp_listener.local_addr().unwrap();

    let server_udp = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
    let client_udp = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
    let server_udp_addr = server_udp.local_addr().unwrap();
    let client_udp_addr = client_udp.local_addr().unwrap();
    server_udp.connect(client_udp_addr).await.unwrap();
    client_udp.connect(server_udp_addr).await.unwrap();

    let (accept_result, connect_result) =
        tokio::join!(tcp_listener.accept(), TcpStream::connect(tcp_addr));
    let (server_stream, _) = accept_result.unwrap();
    let client_stream = connect_result.unwrap();

    let master_key = [7u8; 32];
    let salt = [9u8; 32];

    let server_info = RecordingInfoHandler::new();
    let client_info = RecordingInfoHandler::new();

    let server = EngineHandle::spawn(
        server_stream,
        Some(Arc::new(server_udp)),
        Role::Server,
        config,
        master_key,
        salt,
        EchoRequestHandler::new(),
        server_info.clone(),
    );
    let client = EngineHandle::spawn(
        client_stream,
        Some(Arc::new(client_udp)),
        Role::Client,
        config,
        master_key,
        salt,
        EchoRequestHandler::new(),
        client_info.clone(),
    );

    Pair {
        server,
        client,
        server_info,
        client_info,
    }
}

/// Same as `connected_pair`, but the client side never brings up a UDP
/// socket — the shape a thin request-only client (like `vmnx-ctl`) uses.
pub async fn connected_pair_client_without_udp(config: &EngineConfig) -> Pair {
    let tcp_listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let tcp_addr = tcp_listener.local_addr().unwrap();
    let server_udp = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();

    let (accept_result, connect_result) =
        tokio::join!(tcp_listener.accept(), TcpStream::connect(tcp_addr));
    let (server_stream, _) = accept_result.unwrap();
    let client_stream = connect_result.unwrap();

    let master_key = [7u8; 32];
    let salt = [9u8; 32];

    let server_info = RecordingInfoHandler::new();
    let client_info = RecordingInfoHandler::new();

    let server = EngineHandle::spawn(
        server_stream,
        Some(Arc::new(server_udp)),
        Role::Server,
        config,
        master_key,
        salt,
        EchoRequestHandler::new(),
        server_info.clone(),
    );
    let client = EngineHandle::spawn(
        client_stream,
        None,
        Role::Client,
        config,
        master_key,
        salt,
        EchoRequestHandler::new(),
        client_info.clone(),
    );

    Pair {
        server,
        client,
        server_info,
        client_info,
    }
}

/// A client-side engine connected to a peer that accepts the TCP connection
/// but never reads or writes anything — useful for exercising the engine's
/// own timeout handling without a cooperating peer. The returned `TcpStream`
/// must be kept alive for the duration of the test; dropping it closes the
/// connection.
pub async fn client_with_silent_peer(config: &EngineConfig) -> (EngineHandle, TcpStream) {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (accept_result, connect_result) = tokio::join!(listener.accept(), TcpStream::connect(addr));
    let (silent_peer, _) = accept_result.unwrap();
    let client_stream = connect_result.unwrap();

    let client_info = RecordingInfoHandler::new();
    let client = EngineHandle::spawn(
        client_stream,
        None,
        Role::Client,
        config,
        [1u8; 32],
        [2u8; 32],
        EchoRequestHandler::new(),
        client_info,
    );

    (client, silent_peer)
}
