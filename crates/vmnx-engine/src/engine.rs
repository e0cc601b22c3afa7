//! Messaging engine (§4.F): owns the two transports, the four async loops,
//! the response-correlation table, the transfer table, and the dispatch
//! switch. `EngineHandle` is the cloneable application-facing front door.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use zerocopy::AsBytes;

use vmnx_core::codec;
use vmnx_core::config::EngineConfig;
use vmnx_core::crypto::{CryptoState, Role};
use vmnx_core::wire::{self, UdpHeader, MAGIC};
use vmnx_core::{Message, MessageId, RequestPayload};

use crate::dispatch::{self, DispatchContext, InfoHandler, RequestHandler};
use crate::rate_limiter::RateLimiter;
use crate::reassembly::{self, IncomingTable, ReceiveOutcome};
use crate::response_table::ResponseTable;
use crate::transfer::TransferTable;

const FAIL_EVENT_CHANNEL_CAPACITY: usize = 64;

/// Outcome of a `send_request` call (§7 "User-visible failure").
#[derive(Debug, Clone)]
pub enum SendOutcome {
    Success(Message),
    MessageSendingTimeout,
    InvalidMessageData,
    DisconnectedFromServer,
}

/// The category accompanying the engine's single fail-event stream (§7
/// "Propagation policy").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailCategory {
    TransportFatal,
    UdpCrypto,
    Application,
}

#[derive(Debug, Clone, Copy)]
pub struct FailEvent {
    pub category: FailCategory,
}

struct Inner {
    cancel: CancellationToken,
    tcp_tx: mpsc::UnboundedSender<Message>,
    udp_tx: mpsc::UnboundedSender<Message>,
    response_table: Arc<ResponseTable>,
    transfers: Arc<TransferTable>,
    crypto: Arc<CryptoState>,
    role: Role,
    rate_limiter: Arc<RateLimiter>,
    tcp_connected: AtomicBool,
    udp_up: AtomicBool,
    message_timeout: Duration,
    disconnected_once: AtomicBool,
    fail_events: broadcast::Sender<FailEvent>,
}

/// §4.C "Rekey": generate fresh key material, apply it locally, and
/// announce it to the peer over the authenticated TCP channel. Only the
/// server side initiates rekeys; the client applies them passively via
/// dispatch's `CryptoReset` handling.
fn perform_rekey(crypto: &CryptoState, tcp_tx: &mpsc::UnboundedSender<Message>) {
    let (key, salt) = vmnx_core::crypto::generate_rekey_material();
    crypto.apply_rekey(key, salt);
    let announcement = Message::new_info_tcp(vmnx_core::InfoTcpPayload::CryptoReset { key, salt });
    if tcp_tx.send(announcement).is_err() {
        tracing::debug!("could not announce rekey, TCP channel already closed");
    } else {
        tracing::info!(generation = crypto.generation(), "rekeyed UDP crypto state");
    }
}

/// Application-facing handle to a running engine. Clones share the same
/// underlying connection.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<Inner>,
}

impl EngineHandle {
    /// Start the four loops over an already-connected TCP stream and an
    /// optional already-`connect()`-ed UDP socket, and return the handle.
    pub fn spawn(
        tcp_stream: TcpStream,
        udp_socket: Option<Arc<UdpSocket>>,
        role: Role,
        config: &EngineConfig,
        master_key: [u8; 32],
        salt: [u8; 32],
        request_handler: Arc<dyn RequestHandler>,
        info_handler: Arc<dyn InfoHandler>,
    ) -> EngineHandle {
        let cancel = CancellationToken::new();
        let (tcp_tx, tcp_rx) = mpsc::unbounded_channel::<Message>();
        let (udp_tx, udp_rx) = mpsc::unbounded_channel::<Message>();
        let (fail_tx, _fail_rx) = broadcast::channel(FAIL_EVENT_CHANNEL_CAPACITY);

        let response_table = Arc::new(ResponseTable::new());
        let transfers = Arc::new(TransferTable::new());
        let crypto = Arc::new(CryptoState::new(role, master_key, salt, config.rekey_threshold));
        let rate_limiter = Arc::new(RateLimiter::new(0.0));
        let max_payload = config.datagram_size.saturating_sub(wire::HEADER_SIZE);
        let incoming = Arc::new(IncomingTable::new(max_payload));

        let inner = Arc::new(Inner {
            cancel: cancel.clone(),
            tcp_tx: tcp_tx.clone(),
            udp_tx: udp_tx.clone(),
            response_table: response_table.clone(),
            transfers: transfers.clone(),
            crypto: crypto.clone(),
            rate_limiter: rate_limiter.clone(),
            tcp_connected: AtomicBool::new(true),
            udp_up: AtomicBool::new(udp_socket.is_some()),
            message_timeout: Duration::from_millis(config.message_timeout_ms),
            disconnected_once: AtomicBool::new(false),
            fail_events: fail_tx.clone(),
            role,
        });

        let dispatch_ctx = Arc::new(DispatchContext {
            response_table,
            transfers,
            crypto: crypto.clone(),
            request_handler,
            info_handler,
            outbound: tcp_tx.clone(),
            cancel: cancel.clone(),
        });

        let (tcp_read, tcp_write) = tcp_stream.into_split();

        tokio::spawn(tcp_receive_loop(
            tcp_read,
            dispatch_ctx.clone(),
            inner.clone(),
        ));
        tokio::spawn(tcp_send_loop(
            tcp_write,
            tcp_rx,
            rate_limiter.clone(),
            cancel.clone(),
            inner.clone(),
        ));

        if let Some(socket) = udp_socket {
            tokio::spawn(udp_receive_loop(
                socket.clone(),
                incoming,
                crypto.clone(),
                dispatch_ctx,
                cancel.clone(),
                config.max_udp_message_size,
                config.datagram_size,
            ));
            tokio::spawn(udp_send_loop(
                socket,
                udp_rx,
                crypto,
                role,
                tcp_tx,
                cancel,
                config.datagram_size,
            ));
        }

        EngineHandle { inner }
    }

    /// §6 "Connected predicate": service initialized and the TCP transport
    /// is up (WebSocket-open is the alternate-transport equivalent, not
    /// modeled separately here since it shares the same loops).
    pub fn is_connected(&self) -> bool {
        self.inner.tcp_connected.load(Ordering::SeqCst)
    }

    pub fn subscribe_fail_events(&self) -> broadcast::Receiver<FailEvent> {
        self.inner.fail_events.subscribe()
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.rate_limiter
    }

    pub fn transfers(&self) -> &Arc<TransferTable> {
        &self.inner.transfers
    }

    /// Number of rekeys applied so far on this connection's UDP crypto
    /// state, for the status endpoint.
    pub fn crypto_generation(&self) -> u64 {
        self.inner.crypto.generation()
    }

    /// Rotate the UDP AEAD master key on application demand (§4.C). Only
    /// the server side actually performs a rekey; calling this on a client
    /// handle is a no-op since the server is the one that owns this
    /// decision in the product this engine serves.
    pub fn trigger_rekey(&self) {
        if self.inner.role == Role::Server {
            perform_rekey(&self.inner.crypto, &self.inner.tcp_tx);
        }
    }

    /// §4.F `SendRequest`.
    pub async fn send_request(&self, payload: RequestPayload) -> SendOutcome {
        if !self.is_connected() {
            return SendOutcome::DisconnectedFromServer;
        }

        let msg = Message::new_request(payload);
        let id = msg.id();
        let pending = self.inner.response_table.register(id);

        if self.inner.tcp_tx.send(msg).is_err() {
            self.inner.response_table.remove(id);
            return SendOutcome::DisconnectedFromServer;
        }

        match tokio::time::timeout(self.inner.message_timeout, pending).await {
            Ok(Ok(response)) => {
                if response.is_invalid_request_sentinel() || !response.is_valid() {
                    SendOutcome::InvalidMessageData
                } else {
                    SendOutcome::Success(response)
                }
            }
            // Sender half dropped without resolving: engine disconnected mid-wait.
            Ok(Err(_)) => SendOutcome::DisconnectedFromServer,
            Err(_elapsed) => {
                self.inner.response_table.remove(id);
                SendOutcome::MessageSendingTimeout
            }
        }
    }

    /// Enqueue a one-way info message. Channel choice (§4.F): UDP-marked
    /// messages go to the UDP queue only if UDP is up; otherwise they fall
    /// back to TCP so a client without an established UDP path can still
    /// receive notifications.
    pub fn send_info(&self, msg: Message) {
        let use_udp = msg.is_udp() && self.inner.udp_up.load(Ordering::SeqCst);
        let sent = if use_udp {
            self.inner.udp_tx.send(msg)
        } else {
            self.inner.tcp_tx.send(msg)
        };
        if sent.is_err() {
            tracing::debug!("dropped outgoing info message, engine already disconnected");
        }
    }

    /// §4.F "Disconnect". Idempotent: the first call wins, later calls are
    /// no-ops.
    pub fn disconnect(&self) {
        if self.inner.disconnected_once.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.tcp_connected.store(false, Ordering::SeqCst);
        self.inner.udp_up.store(false, Ordering::SeqCst);
        let _ = self.inner.fail_events.send(FailEvent {
            category: FailCategory::TransportFatal,
        });
    }
}

fn report_transport_fatal(inner: &Arc<Inner>) {
    inner.tcp_connected.store(false, Ordering::SeqCst);
    inner.udp_up.store(false, Ordering::SeqCst);
    let _ = inner.fail_events.send(FailEvent {
        category: FailCategory::TransportFatal,
    });
    inner.cancel.cancel();
}

enum FrameOutcome {
    Message(Message),
    Malformed,
}

/// Read one length-prefixed TCP frame. `Ok(None)` means clean EOF; a
/// bad length prefix is treated as fatal (the stream framing can no longer
/// be trusted), a body that fails to decode is `Malformed` (already fully
/// consumed, so the stream position is still valid).
async fn read_one_frame(reader: &mut OwnedReadHalf) -> std::io::Result<Option<FrameOutcome>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let declared_len = codec::decode_frame_len(len_buf)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;

    let mut body = vec![0u8; declared_len as usize];
    reader.read_exact(&mut body).await?;

    match codec::decode_frame_body(declared_len, &body) {
        Ok(msg) => Ok(Some(FrameOutcome::Message(msg))),
        Err(_) => Ok(Some(FrameOutcome::Malformed)),
    }
}

/// *TCP receive* loop (§4.F).
async fn tcp_receive_loop(
    mut reader: OwnedReadHalf,
    dispatch_ctx: Arc<DispatchContext>,
    inner: Arc<Inner>,
) {
    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => return,
            result = read_one_frame(&mut reader) => {
                match result {
                    Ok(Some(FrameOutcome::Message(msg))) => dispatch::dispatch(&dispatch_ctx, msg),
                    Ok(Some(FrameOutcome::Malformed)) => {
                        tracing::debug!("dropped malformed TCP frame body");
                    }
                    Ok(None) => {
                        tracing::info!("TCP peer closed the connection");
                        report_transport_fatal(&inner);
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(%err, "TCP receive error");
                        report_transport_fatal(&inner);
                        return;
                    }
                }
            }
        }
    }
}

/// *TCP send* loop (§4.F). Updates the rate limiter with the observed
/// effective throughput of each send (§9 design note: the limiter is paced
/// by its own most-recent observation, kept as a deliberate design choice).
async fn tcp_send_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Message>,
    rate_limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
    inner: Arc<Inner>,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            maybe_msg = rx.recv() => {
                let Some(msg) = maybe_msg else { return };
                let frame = codec::encode_frame(&msg);
                let started = tokio::time::Instant::now();
                if let Err(err) = writer.write_all(&frame).await {
                    tracing::warn!(%err, "TCP send failed");
                    report_transport_fatal(&inner);
                    return;
                }
                let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);
                rate_limiter.set_rate(frame.len() as f64 / elapsed);
            }
        }
    }
}

/// *UDP send* loop (§4.F): serialize, packetize, encrypt, send each chunk.
/// Also watches the send counter for the rekey threshold (§4.C): only the
/// server side acts on it, the client applies rekeys passively via dispatch.
async fn udp_send_loop(
    socket: Arc<UdpSocket>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    crypto: Arc<CryptoState>,
    role: Role,
    tcp_tx: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    datagram_size: usize,
) {
    let max_payload = datagram_size.saturating_sub(wire::HEADER_SIZE);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            maybe_msg = rx.recv() => {
                let Some(msg) = maybe_msg else { return };
                let message_id = msg.id();
                let bytes = codec::encode(&msg);
                for chunk in reassembly::split_into_chunks(message_id, &bytes, max_payload) {
                    let sequence = crypto.next_sequence();
                    let mut header = UdpHeader {
                        magic: MAGIC,
                        sequence,
                        tag: [0u8; 16],
                        message_id: message_id.to_le_bytes_as_u128(),
                        total_size: chunk.total_size as i32,
                        offset: chunk.offset as i32,
                    };
                    let aad = header.aad();
                    let (ciphertext, tag) = match crypto.encrypt(sequence, &aad, &chunk.payload) {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(%err, "UDP encrypt failed, dropping chunk");
                            continue;
                        }
                    };
                    header.tag = tag;

                    let mut datagram = Vec::with_capacity(wire::HEADER_SIZE + ciphertext.len());
                    datagram.extend_from_slice(header.as_bytes());
                    datagram.extend_from_slice(&ciphertext);

                    if let Err(err) = socket.send(&datagram).await {
                        tracing::debug!(%err, "UDP send failed, datagram dropped");
                    }
                }

                if role == Role::Server && crypto.should_rekey() {
                    perform_rekey(&crypto, &tcp_tx);
                }
            }
        }
    }
}

/// *UDP receive* loop (§4.F): runs the §4.B receive pipeline, dispatches
/// complete messages. UDP errors are never transport-fatal (§7 "UDP-specific").
async fn udp_receive_loop(
    socket: Arc<UdpSocket>,
    incoming: Arc<IncomingTable>,
    crypto: Arc<CryptoState>,
    dispatch_ctx: Arc<DispatchContext>,
    cancel: CancellationToken,
    max_message_size: usize,
    datagram_size: usize,
) {
    let mut buf = vec![0u8; datagram_size];
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            result = socket.recv(&mut buf) => {
                let n = match result {
                    Ok(n) => n,
                    Err(err) => {
                        tracing::debug!(%err, "UDP recv error, ignored");
                        continue;
                    }
                };
                let datagram = &buf[..n];

                let header = match wire::structural_check(datagram, datagram_size, max_message_size) {
                    Ok(h) => h,
                    Err(_) => continue,
                };
                let sequence = header.sequence;
                let message_id_raw = header.message_id;
                let total_size = header.total_size;
                let offset = header.offset;
                let tag = header.tag;
                let aad = header.aad();
                let ciphertext = datagram[wire::HEADER_SIZE..n].to_vec();

                let message_id = MessageId::from_u128(message_id_raw);
                // Can-receive pre-check (§4.B step 3) runs before AEAD
                // verification (§4.B step 4) to save CPU on adversarial
                // traffic; a decrypt failure only drops the packet, it never
                // evicts the Incoming (§4.C "Failure semantics").
                let outcome = incoming.receive_chunk(
                    message_id,
                    total_size as usize,
                    offset as usize,
                    ciphertext.len(),
                    || crypto.decrypt(sequence, &aad, &ciphertext, &tag).map_err(|_| ()),
                    &cancel,
                );
                match outcome {
                    ReceiveOutcome::Complete(bytes) => match codec::decode(&bytes) {
                        Ok(msg) => dispatch::dispatch(&dispatch_ctx, msg),
                        Err(_) => tracing::debug!(%message_id, "UDP message reassembled but failed to decode"),
                    },
                    ReceiveOutcome::DecryptFailed => {
                        tracing::debug!(%message_id, %sequence, "UDP packet dropped: decrypt/auth failed");
                    }
                    ReceiveOutcome::Invalid(_) | ReceiveOutcome::Duplicate | ReceiveOutcome::Pending => {}
                }
            }
        }
    }
}
