//! UDP crypto service (§4.C) — per-packet AES-256-GCM with per-direction
//! HKDF subkeys, sliding-window replay protection, and rekey with a grace
//! period.
//!
//! Unlike the product's control-plane transport (TCP/WebSocket, secured by
//! its own transport-layer security), every UDP datagram is individually
//! AEAD-sealed: confidentiality and authenticity per packet, plus replay
//! detection, since UDP has no session state of its own to lean on.
//!
//! All key material is wrapped in `Zeroizing` so it is wiped from memory on
//! drop or replacement (rekey). There is no unsafe code in this module.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::wire::{REKEY_GRACE_SECS, REPLAY_WINDOW_SIZE};

/// Which side of the connection this `CryptoState` belongs to. Subkeys are
/// derived per-direction so a compromised packet from one direction cannot
/// be replayed as if sent in the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    fn own_label(self) -> &'static str {
        match self {
            Role::Server => "S\u{2192}C",
            Role::Client => "C\u{2192}S",
        }
    }

    fn peer_label(self) -> &'static str {
        match self {
            Role::Server => "C\u{2192}S",
            Role::Client => "S\u{2192}C",
        }
    }

    fn own_direction_byte(self) -> u8 {
        match self {
            Role::Server => 0,
            Role::Client => 1,
        }
    }

    fn peer_direction_byte(self) -> u8 {
        match self {
            Role::Server => 1,
            Role::Client => 0,
        }
    }
}

fn derive_subkey(master_key: &[u8; 32], salt: &[u8; 32], label: &str) -> Zeroizing<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(salt), master_key);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(label.as_bytes(), okm.as_mut())
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

fn build_nonce(salt: &[u8; 32], direction_byte: u8, sequence: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[0..4].copy_from_slice(&salt[0..4]);
    nonce[4] = direction_byte;
    nonce[5..12].copy_from_slice(&sequence.to_le_bytes()[0..7]);
    nonce
}

/// Generate fresh random key and salt material for a rekey.
pub fn generate_rekey_material() -> ([u8; 32], [u8; 32]) {
    let mut key = [0u8; 32];
    let mut salt = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    rand::thread_rng().fill_bytes(&mut salt);
    (key, salt)
}

/// RFC 6479-style sliding-window replay filter.
struct ReplayWindow {
    highest: u64,
    bitmap: Vec<u64>,
}

impl ReplayWindow {
    fn new() -> Self {
        Self {
            highest: 0,
            bitmap: vec![0u64; (REPLAY_WINDOW_SIZE / 64) as usize],
        }
    }

    fn check(&self, sequence: u64) -> bool {
        if sequence + REPLAY_WINDOW_SIZE < self.highest {
            return false;
        }
        if sequence > self.highest {
            return true;
        }
        let diff = self.highest - sequence;
        let (word, bit) = ((diff / 64) as usize, (diff % 64) as u32);
        self.bitmap[word] & (1u64 << bit) == 0
    }

    fn mark(&mut self, sequence: u64) {
        if sequence > self.highest {
            let shift = sequence - self.highest;
            self.shift_window(shift);
            self.highest = sequence;
        }
        let diff = self.highest - sequence;
        let (word, bit) = ((diff / 64) as usize, (diff % 64) as u32);
        self.bitmap[word] |= 1u64 << bit;
    }

    fn shift_window(&mut self, shift: u64) {
        if shift >= REPLAY_WINDOW_SIZE {
            self.bitmap.fill(0);
            return;
        }
        let word_shift = (shift / 64) as usize;
        let bit_shift = (shift % 64) as u32;
        if word_shift > 0 {
            self.bitmap.rotate_right(word_shift);
            for w in &mut self.bitmap[..word_shift] {
                *w = 0;
            }
        }
        if bit_shift > 0 {
            let len = self.bitmap.len();
            for i in (1..len).rev() {
                self.bitmap[i] =
                    (self.bitmap[i] << bit_shift) | (self.bitmap[i - 1] >> (64 - bit_shift));
            }
            self.bitmap[0] <<= bit_shift;
        }
    }
}

struct RecvGeneration {
    subkey: Zeroizing<[u8; 32]>,
    salt: [u8; 32],
    window: ReplayWindow,
}

struct RecvState {
    current: RecvGeneration,
    /// Previous generation, kept for `REKEY_GRACE_SECS` after a rekey so
    /// packets still in flight under the old key are not dropped.
    previous: Option<(RecvGeneration, Instant)>,
}

/// Per-connection AEAD state: one instance per engine, shared by the UDP
/// send and receive loops.
pub struct CryptoState {
    role: Role,
    send_subkey: Mutex<Zeroizing<[u8; 32]>>,
    send_salt: Mutex<[u8; 32]>,
    send_counter: AtomicU64,
    recv: Mutex<RecvState>,
    rekey_threshold: u64,
    generation: AtomicU64,
}

impl CryptoState {
    pub fn new(role: Role, master_key: [u8; 32], salt: [u8; 32], rekey_threshold: u64) -> Self {
        let send_subkey = derive_subkey(&master_key, &salt, role.own_label());
        let recv_subkey = derive_subkey(&master_key, &salt, role.peer_label());
        Self {
            role,
            send_subkey: Mutex::new(send_subkey),
            send_salt: Mutex::new(salt),
            send_counter: AtomicU64::new(0),
            recv: Mutex::new(RecvState {
                current: RecvGeneration {
                    subkey: recv_subkey,
                    salt,
                    window: ReplayWindow::new(),
                },
                previous: None,
            }),
            rekey_threshold,
            generation: AtomicU64::new(0),
        }
    }

    /// Number of rekeys applied so far, for observability (e.g. the status
    /// endpoint). Starts at 0.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Reserve the next send sequence number. A single atomic increment
    /// (§5 shared-resource policy).
    pub fn next_sequence(&self) -> u64 {
        self.send_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// True once the send counter has crossed the configured rekey
    /// threshold. The server checks this to decide when to rotate keys.
    pub fn should_rekey(&self) -> bool {
        self.send_counter.load(Ordering::SeqCst) >= self.rekey_threshold
    }

    /// Encrypt `plaintext` under AAD `aad` for the already-reserved
    /// `sequence`. Returns `(ciphertext, tag)`.
    pub fn encrypt(
        &self,
        sequence: u64,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, [u8; 16]), CryptoError> {
        let salt = *self.send_salt.lock().unwrap();
        let subkey = self.send_subkey.lock().unwrap().clone();
        let nonce = build_nonce(&salt, self.role.own_direction_byte(), sequence);

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(subkey.as_ref()));
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::SealFailed)?;

        let tag_at = sealed.len() - 16;
        let mut tag = [0u8; 16];
        tag.copy_from_slice(&sealed[tag_at..]);
        Ok((sealed[..tag_at].to_vec(), tag))
    }

    /// Decrypt and authenticate a packet. Checks the replay window before
    /// running the (comparatively expensive) AEAD verification, and falls
    /// back to the previous key generation during the rekey grace window.
    pub fn decrypt(
        &self,
        sequence: u64,
        aad: &[u8],
        ciphertext: &[u8],
        tag: &[u8; 16],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut recv = self.recv.lock().unwrap();

        if recv.current.window.check(sequence) {
            if let Ok(plain) = Self::try_open(
                &recv.current.subkey,
                &recv.current.salt,
                self.role.peer_direction_byte(),
                sequence,
                aad,
                ciphertext,
                tag,
            ) {
                recv.current.window.mark(sequence);
                return Ok(plain);
            }
        }

        if let Some((prev, started)) = &mut recv.previous {
            if started.elapsed().as_secs() <= REKEY_GRACE_SECS && prev.window.check(sequence) {
                if let Ok(plain) = Self::try_open(
                    &prev.subkey,
                    &prev.salt,
                    self.role.peer_direction_byte(),
                    sequence,
                    aad,
                    ciphertext,
                    tag,
                ) {
                    prev.window.mark(sequence);
                    return Ok(plain);
                }
            }
        }

        if !recv.current.window.check(sequence) {
            return Err(CryptoError::Replay);
        }
        Err(CryptoError::AuthenticationFailed)
    }

    fn try_open(
        subkey: &[u8; 32],
        salt: &[u8; 32],
        direction_byte: u8,
        sequence: u64,
        aad: &[u8],
        ciphertext: &[u8],
        tag: &[u8; 16],
    ) -> Result<Vec<u8>, CryptoError> {
        let nonce = build_nonce(salt, direction_byte, sequence);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(subkey));
        let mut sealed = Vec::with_capacity(ciphertext.len() + 16);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);
        cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: &sealed, aad })
            .map_err(|_| CryptoError::AuthenticationFailed)
    }

    /// Apply a rekey: derive fresh subkeys from `new_master_key`/`new_salt`,
    /// reset the send counter, and keep the previous receive generation
    /// around for the grace window.
    pub fn apply_rekey(&self, new_master_key: [u8; 32], new_salt: [u8; 32]) {
        let new_send_subkey = derive_subkey(&new_master_key, &new_salt, self.role.own_label());
        let new_recv_subkey = derive_subkey(&new_master_key, &new_salt, self.role.peer_label());

        *self.send_subkey.lock().unwrap() = new_send_subkey;
        *self.send_salt.lock().unwrap() = new_salt;
        self.send_counter.store(0, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);

        let mut recv = self.recv.lock().unwrap();
        let old_current = std::mem::replace(
            &mut recv.current,
            RecvGeneration {
                subkey: new_recv_subkey,
                salt: new_salt,
                window: ReplayWindow::new(),
            },
        );
        recv.previous = Some((old_current, Instant::now()));
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("AEAD seal failed")]
    SealFailed,
    #[error("AEAD authentication failed")]
    AuthenticationFailed,
    #[error("replayed or too-old sequence number")]
    Replay,
}
