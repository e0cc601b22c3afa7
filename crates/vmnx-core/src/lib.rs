//! vmnx-core — shared wire format, message model, and cryptographic primitives
//! for the dual-transport messaging engine. All other vmnx crates depend on
//! this one.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod message;
pub mod wire;

pub use message::{
    InfoTcpPayload, InfoUdpPayload, Message, MessageId, RequestPayload, ResponsePayload,
};
