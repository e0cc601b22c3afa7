//! UDP packetizer / reassembler (§4.B).
//!
//! The sender side (splitting a serialized message into chunks) lives here
//! as free functions; the receiver side is the `IncomingTable`, one entry
//! per in-flight UDP message keyed by message id.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use vmnx_core::wire::{self, INCOMING_DEADLINE_SECS};
use vmnx_core::MessageId;

/// One chunk to send: `(offset, payload)`. The sender emits these in
/// ascending offset order, though the receiver tolerates any arrival order.
pub fn split_into_chunks(message_id: MessageId, bytes: &[u8], max_payload: usize) -> Vec<Chunk> {
    let total_size = bytes.len();
    let count = wire::chunk_count(total_size, max_payload) as usize;
    let mut chunks = Vec::with_capacity(count);
    for i in 0..count {
        let offset = i * max_payload;
        let len = wire::expected_chunk_len(total_size, offset, max_payload);
        chunks.push(Chunk {
            message_id,
            total_size,
            offset,
            payload: bytes[offset..offset + len].to_vec(),
        });
    }
    chunks
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub message_id: MessageId,
    pub total_size: usize,
    pub offset: usize,
    pub payload: Vec<u8>,
}

/// Why a received chunk could not be applied to its `Incoming` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanReceiveError {
    /// Declared message size does not match this message id's first packet.
    SizeMismatch,
    /// Chunk offset does not land on a valid chunk boundary.
    BadOffset,
    /// Payload length does not match the expected length for this chunk.
    BadPayloadLen,
}

/// Receiver-side reassembly record for one in-flight UDP message.
pub struct Incoming {
    total_size: usize,
    max_payload: usize,
    chunk_count: usize,
    buffer: Vec<u8>,
    received: Vec<bool>,
    bytes_received: usize,
}

impl Incoming {
    fn new(total_size: usize, max_payload: usize) -> Self {
        let chunk_count = wire::chunk_count(total_size, max_payload) as usize;
        Self {
            total_size,
            max_payload,
            chunk_count,
            buffer: vec![0u8; total_size],
            received: vec![false; chunk_count],
            bytes_received: 0,
        }
    }

    /// Step 3 of §4.B: validate a chunk against this record before any
    /// decrypt is attempted.
    fn can_receive(&self, total_size: usize, offset: usize, payload_len: usize) -> Result<bool, CanReceiveError> {
        if total_size != self.total_size {
            return Err(CanReceiveError::SizeMismatch);
        }
        if offset % self.max_payload != 0 {
            return Err(CanReceiveError::BadOffset);
        }
        let index = offset / self.max_payload;
        if index >= self.chunk_count {
            return Err(CanReceiveError::BadOffset);
        }
        let expected = wire::expected_chunk_len(self.total_size, offset, self.max_payload);
        if payload_len != expected {
            return Err(CanReceiveError::BadPayloadLen);
        }
        Ok(self.received[index])
    }

    /// Apply a validated, decrypted chunk. Returns `true` once the message
    /// is complete.
    fn apply(&mut self, offset: usize, payload: &[u8]) -> bool {
        let index = offset / self.max_payload;
        self.buffer[offset..offset + payload.len()].copy_from_slice(payload);
        self.received[index] = true;
        self.bytes_received += payload.len();
        self.bytes_received == self.total_size
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

/// Outcome of handing one decrypted chunk to the table.
pub enum ReceiveOutcome {
    /// Chunk accepted; message still incomplete.
    Pending,
    /// Chunk accepted; the message is now complete. Bytes are the full
    /// reassembled payload, ready for the codec.
    Complete(Vec<u8>),
    /// Chunk rejected by the can-receive pre-check; the Incoming (if any)
    /// was evicted.
    Invalid(CanReceiveError),
    /// Chunk is a duplicate of one already received; silently dropped.
    Duplicate,
    /// AEAD decryption/authentication failed; packet dropped, Incoming left
    /// in place (§4.C, §4.B step 4 — the authentic sender may still
    /// complete the message).
    DecryptFailed,
}

/// Receiver-side table of in-flight UDP messages, keyed by message id.
/// Concurrent: readers/writers take no external lock (§5).
pub struct IncomingTable {
    entries: DashMap<MessageId, Incoming>,
    max_payload: usize,
}

impl IncomingTable {
    pub fn new(max_payload: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_payload,
        }
    }

    /// Handle one structurally-valid ciphertext chunk: run the can-receive
    /// pre-check (§4.B step 3) *before* spending CPU on AEAD verification,
    /// then decrypt via `decrypt`, then apply the plaintext (§4.B steps 4-5).
    ///
    /// A can-receive failure invalidates and evicts the Incoming. A decrypt
    /// failure only drops the packet — the Incoming is left in place since
    /// the authentic sender may still complete the message.
    ///
    /// `cancel` is the engine-wide token; the spawned deadline timer is
    /// linked to it so Disconnect doesn't leave orphaned tasks running.
    pub fn receive_chunk(
        self: &Arc<Self>,
        message_id: MessageId,
        total_size: usize,
        offset: usize,
        ciphertext_len: usize,
        decrypt: impl FnOnce() -> Result<Vec<u8>, ()>,
        cancel: &CancellationToken,
    ) -> ReceiveOutcome {
        if !self.entries.contains_key(&message_id) {
            let incoming = Incoming::new(total_size, self.max_payload);
            self.entries.insert(message_id, incoming);
            self.spawn_deadline(message_id, cancel.clone());
        }

        let mut entry = match self.entries.get_mut(&message_id) {
            Some(e) => e,
            None => return ReceiveOutcome::Invalid(CanReceiveError::SizeMismatch),
        };

        let is_duplicate = match entry.can_receive(total_size, offset, ciphertext_len) {
            Err(e) => {
                drop(entry);
                self.entries.remove(&message_id);
                return ReceiveOutcome::Invalid(e);
            }
            Ok(is_duplicate) => is_duplicate,
        };
        if is_duplicate {
            return ReceiveOutcome::Duplicate;
        }

        // Can-receive passed; now spend the CPU on AEAD verification. The
        // entry guard is held across this call, but `decrypt` is synchronous
        // crypto work, never an await point, so no other task is blocked.
        let plaintext = match decrypt() {
            Ok(p) => p,
            Err(()) => return ReceiveOutcome::DecryptFailed,
        };

        let complete = entry.apply(offset, &plaintext);
        if complete {
            drop(entry);
            let (_, incoming) = self.entries.remove(&message_id).expect("just observed");
            ReceiveOutcome::Complete(incoming.into_bytes())
        } else {
            ReceiveOutcome::Pending
        }
    }

    fn spawn_deadline(self: &Arc<Self>, message_id: MessageId, cancel: CancellationToken) {
        let table = Arc::clone(self);
        tokio::spawn(async move {
            let deadline = tokio::time::sleep_until(
                Instant::now() + Duration::from_secs(INCOMING_DEADLINE_SECS),
            );
            tokio::select! {
                _ = deadline => {
                    if table.entries.remove(&message_id).is_some() {
                        tracing::debug!(%message_id, "incoming UDP message timed out, evicted");
                    }
                }
                _ = cancel.cancelled() => {}
            }
        });
    }

    #[cfg(test)]
    fn in_flight_count(&self) -> usize {
        self.entries.len()
    }
}
