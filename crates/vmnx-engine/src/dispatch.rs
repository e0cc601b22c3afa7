//! Message dispatch switch (§4.F "Dispatch").
//!
//! A deserialized `Message` is matched on its variant and routed to exactly
//! one of: the response table, a registered transfer, the crypto state (for
//! `CryptoReset`), or one of the two application-overridable handlers.
//! Nothing here blocks the calling receive loop — request/info handling
//! runs on its own spawned, cancellation-linked task.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vmnx_core::crypto::CryptoState;
use vmnx_core::{InfoTcpPayload, InfoUdpPayload, Message, MessageId, RequestPayload, ResponsePayload};

use crate::response_table::ResponseTable;
use crate::transfer::TransferHandle;
use crate::TransferTable;

/// Application hook for incoming requests. Implemented by the binary
/// embedding the engine (e.g. `vmnxd`'s example handlers).
pub trait RequestHandler: Send + Sync {
    fn process_request(&self, request_id: MessageId, payload: RequestPayload) -> ResponsePayload;
}

/// Application hook for one-way info notifications that aren't one of the
/// engine's own distinguished variants (`TransferData`, `CryptoReset`).
pub trait InfoHandler: Send + Sync {
    fn process_info_tcp(&self, payload: InfoTcpPayload);
    fn process_info_udp(&self, payload: InfoUdpPayload);
}

/// Everything `dispatch` needs to route one message.
pub struct DispatchContext {
    pub response_table: Arc<ResponseTable>,
    pub transfers: Arc<TransferTable>,
    pub crypto: Arc<CryptoState>,
    pub request_handler: Arc<dyn RequestHandler>,
    pub info_handler: Arc<dyn InfoHandler>,
    pub outbound: mpsc::UnboundedSender<Message>,
    pub cancel: CancellationToken,
}

/// Route one already-decoded, already-validity-checked message.
///
/// `msg` is assumed to have already passed `Message::is_valid` for
/// `Response`/info variants; `Request` validity is re-checked here since an
/// invalid request still needs its `InvalidRequestData` reply.
pub fn dispatch(ctx: &Arc<DispatchContext>, msg: Message) {
    match msg {
        Message::Response {
            request_id,
            payload,
            ..
        } => dispatch_response(ctx, request_id, payload),
        Message::Request { id, payload } => dispatch_request(ctx, id, payload),
        Message::InfoUdp {
            payload: InfoUdpPayload::TransferData {
                stream_id,
                offset,
                bytes,
            },
            ..
        } => dispatch_transfer_data(ctx, stream_id, offset, bytes),
        Message::InfoTcp {
            payload: InfoTcpPayload::CryptoReset { key, salt },
            ..
        } => dispatch_crypto_reset(ctx, key, salt),
        Message::InfoTcp { payload, .. } => dispatch_other_tcp_info(ctx, payload),
        Message::InfoUdp { payload, .. } => dispatch_other_udp_info(ctx, payload),
    }
}

fn dispatch_response(ctx: &Arc<DispatchContext>, request_id: MessageId, payload: ResponsePayload) {
    let response = Message::new_response(request_id, payload);
    if !ctx.response_table.resolve(request_id, response) {
        tracing::debug!(%request_id, "response for unknown or already-resolved request dropped");
    }
}

fn dispatch_request(ctx: &Arc<DispatchContext>, id: MessageId, payload: RequestPayload) {
    let probe = Message::Request {
        id,
        payload: payload.clone(),
    };
    if !probe.is_valid() {
        let reply = Message::new_response(
            id,
            ResponsePayload::InvalidRequestData {
                reason: "request failed its validity predicate".to_string(),
            },
        );
        if ctx.outbound.send(reply).is_err() {
            tracing::warn!(%id, "failed to enqueue InvalidRequestData reply, peer likely gone");
        }
        return;
    }

    let ctx = Arc::clone(ctx);
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = cancel.cancelled() => {}
            () = async {
                let response_payload = ctx.request_handler.process_request(id, payload);
                let reply = Message::new_response(id, response_payload);
                if ctx.outbound.send(reply).is_err() {
                    tracing::warn!(%id, "failed to enqueue response, peer likely gone");
                }
            } => {}
        }
    });
}

fn dispatch_transfer_data(ctx: &Arc<DispatchContext>, stream_id: MessageId, offset: u64, bytes: Vec<u8>) {
    match ctx.transfers.get(stream_id) {
        Some(TransferHandle::Download(download)) => download.receive_async(&bytes, offset),
        Some(TransferHandle::Upload(_)) => {
            tracing::debug!(%stream_id, "TransferData addressed to an Upload handle, dropped");
        }
        None => {
            tracing::debug!(%stream_id, "TransferData for unknown transfer id, dropped");
        }
    }
}

fn dispatch_crypto_reset(ctx: &Arc<DispatchContext>, key: [u8; 32], salt: [u8; 32]) {
    ctx.crypto.apply_rekey(key, salt);
    tracing::info!("applied peer-initiated rekey");
}

fn dispatch_other_tcp_info(ctx: &Arc<DispatchContext>, payload: InfoTcpPayload) {
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        tokio::select! {
            () = ctx.cancel.cancelled() => {}
            () = async { ctx.info_handler.process_info_tcp(payload) } => {}
        }
    });
}

fn dispatch_other_udp_info(ctx: &Arc<DispatchContext>, payload: InfoUdpPayload) {
    let ctx = Arc::clone(ctx);
    tokio::spawn(async move {
        tokio::select! {
            () = ctx.cancel.cancelled() => {}
            () = async { ctx.info_handler.process_info_udp(payload) } => {}
        }
    });
}
