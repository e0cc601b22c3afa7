//! Client-side requests driven directly over the engine's own TCP channel
//! (`ping`, `create-vm`, `rekey`). These don't go through the status HTTP
//! endpoint — they speak the same framed protocol `vmnxd` does, acting as a
//! throwaway client connection that asks exactly one request and exits.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::TcpStream;

use vmnx_core::config::EngineConfig;
use vmnx_core::crypto::Role;
use vmnx_core::{InfoTcpPayload, InfoUdpPayload, MessageId, RequestPayload, ResponsePayload};
use vmnx_engine::dispatch::{InfoHandler, RequestHandler};
use vmnx_engine::{EngineHandle, SendOutcome};

/// The CLI never serves inbound requests or info of its own; these are the
/// no-op handlers `EngineHandle::spawn` still requires on the client side.
struct NoRequestHandler;

impl RequestHandler for NoRequestHandler {
    fn process_request(&self, _request_id: MessageId, _payload: RequestPayload) -> ResponsePayload {
        ResponsePayload::InvalidRequestData {
            reason: "vmnx-ctl does not serve inbound requests".to_string(),
        }
    }
}

struct NoInfoHandler;

impl InfoHandler for NoInfoHandler {
    fn process_info_tcp(&self, _payload: InfoTcpPayload) {}
    fn process_info_udp(&self, _payload: InfoUdpPayload) {}
}

/// Connect to `addr`'s control port as a client engine. No UDP socket is
/// brought up — `Ping`/`CreateVm`/`RequestRekey` all travel over the TCP
/// channel, so the client-side UDP crypto key never needs to match the
/// server's (it's never used here).
async fn connect(addr: SocketAddr, config: &EngineConfig) -> Result<EngineHandle> {
    let tcp_stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to vmnxd at {addr} — is it running?"))?;

    // No UDP socket, so this key/salt pair is never actually used to
    // encrypt anything.
    let master_key = [0u8; 32];
    let salt = [0u8; 32];

    Ok(EngineHandle::spawn(
        tcp_stream,
        None,
        Role::Client,
        config,
        master_key,
        salt,
        Arc::new(NoRequestHandler),
        Arc::new(NoInfoHandler),
    ))
}

fn describe_outcome(outcome: SendOutcome) -> Result<ResponsePayload> {
    match outcome {
        SendOutcome::Success(vmnx_core::Message::Response { payload, .. }) => Ok(payload),
        SendOutcome::Success(other) => bail!("unexpected reply variant: {other:?}"),
        SendOutcome::MessageSendingTimeout => bail!("vmnxd did not reply before the timeout"),
        SendOutcome::InvalidMessageData => bail!("vmnxd rejected the request as invalid"),
        SendOutcome::DisconnectedFromServer => bail!("disconnected from vmnxd before a reply arrived"),
    }
}

pub async fn cmd_ping(addr: SocketAddr, config: &EngineConfig, nonce: u64) -> Result<()> {
    let engine = connect(addr, config).await?;
    let outcome = engine.send_request(RequestPayload::Ping { nonce }).await;
    engine.disconnect();

    match describe_outcome(outcome)? {
        ResponsePayload::Pong { nonce } => {
            println!("pong (nonce={nonce})");
            Ok(())
        }
        other => bail!("unexpected response to Ping: {other:?}"),
    }
}

pub async fn cmd_create_vm(
    addr: SocketAddr,
    config: &EngineConfig,
    name: &str,
    ram_mb: u32,
    cpu_cores: u32,
) -> Result<()> {
    let engine = connect(addr, config).await?;
    let outcome = engine
        .send_request(RequestPayload::CreateVm {
            name: name.to_string(),
            ram_mb,
            cpu_cores,
        })
        .await;
    engine.disconnect();

    match describe_outcome(outcome)? {
        ResponsePayload::VmCreated { vm_id } => {
            println!("created VM {vm_id}");
            Ok(())
        }
        ResponsePayload::InvalidRequestData { reason } => bail!("request rejected: {reason}"),
        other => bail!("unexpected response to CreateVm: {other:?}"),
    }
}

pub async fn cmd_rekey(addr: SocketAddr, config: &EngineConfig) -> Result<()> {
    let engine = connect(addr, config).await?;
    let outcome = engine.send_request(RequestPayload::RequestRekey).await;
    engine.disconnect();

    match describe_outcome(outcome)? {
        ResponsePayload::RekeyAcknowledged => {
            println!("rekey acknowledged");
            Ok(())
        }
        other => bail!("unexpected response to RequestRekey: {other:?}"),
    }
}
