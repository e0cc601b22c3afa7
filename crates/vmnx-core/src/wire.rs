//! UDP packet wire format (§3, §4.B).
//!
//! These types ARE the UDP protocol: field order, width, and endianness are
//! the wire contract. `UdpHeader` is `#[repr(C, packed)]` with `zerocopy`
//! derives for safe, allocation-free (de)serialization — there is no unsafe
//! code in this module.
//!
//! Wire layout (52-byte header):
//!
//! | Offset | Len | Field                              |
//! |-------:|----:|-------------------------------------|
//! |      0 |   4 | Magic `VMNX`                        |
//! |      4 |   8 | Sequence number (u64 LE)             |
//! |     12 |  16 | AEAD tag                             |
//! |     28 |  16 | Message id (u128 LE)                 |
//! |     44 |   4 | Total message size (i32 LE)          |
//! |     48 |   4 | Offset of this packet's payload (i32)|

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Magic bytes identifying a vmnx UDP datagram.
pub const MAGIC: [u8; 4] = *b"VMNX";

/// Header size in bytes.
pub const HEADER_SIZE: usize = 52;

/// Default datagram MTU the engine is willing to send (§6 `datagram-size`).
pub const DEFAULT_DATAGRAM_MTU: usize = 1200;

/// Maximum payload bytes per packet at the default MTU.
pub const MAX_PAYLOAD: usize = DEFAULT_DATAGRAM_MTU - HEADER_SIZE;

/// Default reassembly cap (§6 `max-udp-message-size`).
pub const DEFAULT_MAX_UDP_MESSAGE_SIZE: usize = 150 * 1024 * 1024;

/// Per-message reassembly deadline (§3, §5).
pub const INCOMING_DEADLINE_SECS: u64 = 3;

/// Replay sliding-window width (§4.C).
pub const REPLAY_WINDOW_SIZE: u64 = 1024;

/// Rekey grace window during which both old and new keys are accepted.
pub const REKEY_GRACE_SECS: u64 = 1;

/// The 52-byte fixed header preceding every UDP packet's payload.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct UdpHeader {
    /// `MAGIC`.
    pub magic: [u8; 4],
    /// Sender's per-direction monotonic counter; also the nonce's
    /// variable part (§4.C).
    pub sequence: u64,
    /// AEAD authentication tag.
    pub tag: [u8; 16],
    /// Id of the logical message this packet is a fragment of.
    pub message_id: u128,
    /// Total size in bytes of the reassembled message.
    pub total_size: i32,
    /// Byte offset of this packet's payload within the reassembled message.
    pub offset: i32,
}

assert_eq_size!(UdpHeader, [u8; HEADER_SIZE]);

impl UdpHeader {
    /// Bytes that are authenticated but not encrypted (§4.C AAD): the
    /// header minus the tag field itself.
    pub fn aad(&self) -> Vec<u8> {
        let sequence = self.sequence;
        let message_id = self.message_id;
        let total_size = self.total_size;
        let offset = self.offset;

        let mut aad = Vec::with_capacity(HEADER_SIZE - 16);
        aad.extend_from_slice(&self.magic);
        aad.extend_from_slice(&sequence.to_le_bytes());
        aad.extend_from_slice(&message_id.to_le_bytes());
        aad.extend_from_slice(&total_size.to_le_bytes());
        aad.extend_from_slice(&offset.to_le_bytes());
        aad
    }
}

/// Number of MaxPayload-sized chunks needed to carry `total_size` bytes.
pub fn chunk_count(total_size: usize, max_payload: usize) -> u32 {
    total_size.div_ceil(max_payload) as u32
}

/// Expected payload length for the chunk starting at `offset`, given the
/// message's `total_size` (§4.B can-receive check: all chunks are exactly
/// `max_payload` except the last, which is the remainder).
pub fn expected_chunk_len(total_size: usize, offset: usize, max_payload: usize) -> usize {
    max_payload.min(total_size.saturating_sub(offset))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram shorter than header ({0} < {HEADER_SIZE})")]
    DatagramTooShort(usize),
    #[error("datagram longer than MTU ({0} > {1})")]
    DatagramTooLong(usize, usize),
    #[error("bad magic bytes")]
    BadMagic,
    #[error("declared message size is zero")]
    ZeroMessageSize,
    #[error("declared message size {0} exceeds policy maximum {1}")]
    MessageTooLarge(usize, usize),
    #[error("chunk offset {0} is not a valid chunk boundary")]
    BadOffset(usize),
}

/// Structural check (§4.B step 1), run before any table lookup or decrypt.
pub fn structural_check(
    datagram: &[u8],
    mtu: usize,
    max_message_size: usize,
) -> Result<UdpHeader, WireError> {
    if datagram.len() < HEADER_SIZE {
        return Err(WireError::DatagramTooShort(datagram.len()));
    }
    if datagram.len() > mtu {
        return Err(WireError::DatagramTooLong(datagram.len(), mtu));
    }
    let header = UdpHeader::read_from_prefix(datagram).expect("length already checked");
    if header.magic != MAGIC {
        return Err(WireError::BadMagic);
    }
    let total_size = header.total_size;
    if total_size <= 0 {
        return Err(WireError::ZeroMessageSize);
    }
    if total_size as usize > max_message_size {
        return Err(WireError::MessageTooLarge(
            total_size as usize,
            max_message_size,
        ));
    }
    Ok(header)
}
