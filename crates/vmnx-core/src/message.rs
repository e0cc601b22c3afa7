//! The application message model.
//!
//! Every message is one of three top-level variants: a `Request` that expects
//! exactly one correlated `Response`, a `Response` to some earlier request, or
//! a one-way `Info` notification sent over whichever transport the sender
//! judged appropriate (`InfoTcp` for reliable control traffic, `InfoUdp` for
//! best-effort media/bulk traffic). `TransferData` is a distinguished
//! `InfoUdp` variant.
//!
//! `Message` carries its own 128-bit id in every variant; `Response` also
//! carries the id of the request it answers. The codec (see `codec.rs`)
//! recovers the concrete variant from the bytes alone — no side channel
//! indicates which variant is coming.

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// A globally-unique 128-bit message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u128);

impl MessageId {
    /// Generate a fresh random id. Collision probability is negligible for
    /// any realistic session length.
    pub fn generate() -> Self {
        let mut buf = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut buf);
        Self(u128::from_le_bytes(buf))
    }

    pub fn to_le_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_le_bytes(bytes))
    }

    /// This id as the raw `u128` the UDP header's `message_id` field carries.
    pub fn to_le_bytes_as_u128(self) -> u128 {
        self.0
    }

    pub fn from_u128(value: u128) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Top-level message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum Message {
    Request {
        id: MessageId,
        payload: RequestPayload,
    },
    Response {
        id: MessageId,
        request_id: MessageId,
        payload: ResponsePayload,
    },
    InfoTcp {
        id: MessageId,
        payload: InfoTcpPayload,
    },
    InfoUdp {
        id: MessageId,
        payload: InfoUdpPayload,
    },
}

impl Message {
    /// Build a Request message with a freshly generated id.
    pub fn new_request(payload: RequestPayload) -> Self {
        Message::Request {
            id: MessageId::generate(),
            payload,
        }
    }

    /// Build a Response addressed to `request_id`.
    pub fn new_response(request_id: MessageId, payload: ResponsePayload) -> Self {
        Message::Response {
            id: MessageId::generate(),
            request_id,
            payload,
        }
    }

    pub fn new_info_tcp(payload: InfoTcpPayload) -> Self {
        Message::InfoTcp {
            id: MessageId::generate(),
            payload,
        }
    }

    pub fn new_info_udp(payload: InfoUdpPayload) -> Self {
        Message::InfoUdp {
            id: MessageId::generate(),
            payload,
        }
    }

    /// This message's own id. For a Response this is distinct from the
    /// `request_id` it answers.
    pub fn id(&self) -> MessageId {
        match self {
            Message::Request { id, .. }
            | Message::Response { id, .. }
            | Message::InfoTcp { id, .. }
            | Message::InfoUdp { id, .. } => *id,
        }
    }

    /// Transport marker: does this message prefer the UDP channel? Used by
    /// the engine's channel-choice logic (`vmnx-engine::engine`).
    pub fn is_udp(&self) -> bool {
        matches!(self, Message::InfoUdp { .. })
    }

    /// Structural + domain validity. The codec already rejected anything
    /// that fails to parse; this is the per-variant `IsValid` predicate.
    pub fn is_valid(&self) -> bool {
        match self {
            Message::Request { id, payload } => id.0 != 0 && payload.is_valid(),
            Message::Response {
                id,
                request_id,
                payload,
            } => id.0 != 0 && request_id.0 != 0 && payload.is_valid(),
            Message::InfoTcp { id, payload } => id.0 != 0 && payload.is_valid(),
            Message::InfoUdp { id, payload } => id.0 != 0 && payload.is_valid(),
        }
    }

    /// True when this is the distinguished sentinel response sent whenever
    /// an incoming request fails its validity predicate.
    pub fn is_invalid_request_sentinel(&self) -> bool {
        matches!(
            self,
            Message::Response {
                payload: ResponsePayload::InvalidRequestData { .. },
                ..
            }
        )
    }
}

/// Application-level request payloads. New request types are added here as
/// the product grows; this set covers the handlers demonstrated by `vmnxd`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "fields")]
pub enum RequestPayload {
    /// Liveness probe; answered with `Pong`.
    Ping { nonce: u64 },

    /// A representative "real" request with fields that can be invalid —
    /// used to exercise the validity predicate and `InvalidRequestData`.
    CreateVm {
        name: String,
        ram_mb: u32,
        cpu_cores: u32,
    },

    /// Ask the peer to rotate the UDP AEAD master key on demand.
    RequestRekey,
}

impl RequestPayload {
    fn is_valid(&self) -> bool {
        match self {
            RequestPayload::Ping { .. } => true,
            RequestPayload::CreateVm {
                name,
                ram_mb,
                cpu_cores,
            } => !name.is_empty() && *ram_mb > 0 && *cpu_cores > 0,
            RequestPayload::RequestRekey => true,
        }
    }
}

/// Response payloads. `InvalidRequestData` is the distinguished sentinel
/// returned whenever an incoming request fails `RequestPayload::is_valid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "fields")]
pub enum ResponsePayload {
    Pong { nonce: u64 },
    VmCreated { vm_id: u64 },
    RekeyAcknowledged,
    InvalidRequestData { reason: String },
}

impl ResponsePayload {
    fn is_valid(&self) -> bool {
        match self {
            ResponsePayload::Pong { .. } => true,
            ResponsePayload::VmCreated { vm_id } => *vm_id != 0,
            ResponsePayload::RekeyAcknowledged => true,
            ResponsePayload::InvalidRequestData { .. } => true,
        }
    }
}

/// One-way notifications sent over the reliable TCP channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "fields")]
pub enum InfoTcpPayload {
    /// Authenticated rekey announcement (§4.C). Sent only over TCP so that
    /// the new key material is covered by the transport's own security.
    CryptoReset {
        key: [u8; 32],
        salt: [u8; 32],
    },
    Shutdown,
}

impl InfoTcpPayload {
    fn is_valid(&self) -> bool {
        match self {
            InfoTcpPayload::CryptoReset { .. } => true,
            InfoTcpPayload::Shutdown => true,
        }
    }
}

/// One-way notifications sent over the best-effort UDP channel (falling
/// back to TCP if UDP isn't up yet).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "fields")]
pub enum InfoUdpPayload {
    /// A fragment of an in-progress transfer. `stream_id` identifies the
    /// Transfer this fragment belongs to; `offset` is its byte offset.
    TransferData {
        stream_id: MessageId,
        offset: u64,
        bytes: Vec<u8>,
    },
    /// Example latency-sensitive media payload (hypervisor frame, out of
    /// scope for this crate to produce — just a representative shape).
    VmScreenFrame { frame_no: u64, bytes: Vec<u8> },
}

impl InfoUdpPayload {
    fn is_valid(&self) -> bool {
        match self {
            InfoUdpPayload::TransferData { bytes, .. } => !bytes.is_empty(),
            InfoUdpPayload::VmScreenFrame { bytes, .. } => !bytes.is_empty(),
        }
    }
}
