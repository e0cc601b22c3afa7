//! Shared HTTP request helper for the status command.

use anyhow::{Context, Result};
use serde::Deserialize;

pub fn base_url(status_port: u16) -> String {
    format!("http://127.0.0.1:{}", status_port)
}

pub async fn get_json<T: for<'de> Deserialize<'de>>(url: &str) -> Result<T> {
    reqwest::get(url)
        .await
        .with_context(|| format!("failed to connect to vmnxd's status endpoint at {} — is it running?", url))?
        .json::<T>()
        .await
        .context("failed to parse response")
}
