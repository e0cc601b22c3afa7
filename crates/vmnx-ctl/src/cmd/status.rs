//! `status` command: queries vmnxd's `GET /status` endpoint.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json};

#[derive(Deserialize)]
struct StatusResponse {
    connected: bool,
    transfer_count: usize,
    crypto_generation: u64,
}

pub async fn cmd_status(status_port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(status_port))).await?;

    println!("vmnxd status");
    println!("  connected          : {}", resp.connected);
    println!("  transfers in flight: {}", resp.transfer_count);
    println!("  crypto generation  : {}", resp.crypto_generation);

    Ok(())
}
