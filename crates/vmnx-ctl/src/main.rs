//! vmnx-ctl — command-line interface for a running `vmnxd`.

use std::net::{IpAddr, SocketAddr};

use anyhow::{Context, Result};

use vmnx_core::config::EngineConfig;

mod cmd;

const DEFAULT_STATUS_PORT: u16 = 7423;

fn print_usage(config: &EngineConfig) {
    println!("Usage: vmnx-ctl [--addr <ip>] [--port <port>] [--status-port <port>] <command>");
    println!();
    println!("Commands:");
    println!("  status                               Query the status endpoint");
    println!("  ping [nonce]                          Send a Ping request, print the Pong");
    println!("  create-vm <name> <ram-mb> <cpu-cores> Send a CreateVm request");
    println!("  rekey                                 Ask vmnxd to rotate its UDP crypto key");
    println!("  help                                  Show this message");
    println!();
    println!(
        "Options:\n  --addr <ip>          vmnxd's address (default: 127.0.0.1)\n  \
         --port <port>        vmnxd's TCP control port (default: {})\n  \
         --status-port <port> vmnxd's HTTP status port (default: {})",
        config.tcp_port, DEFAULT_STATUS_PORT
    );
    println!();
    println!("Examples:");
    println!("  vmnx-ctl status");
    println!("  vmnx-ctl ping");
    println!("  vmnx-ctl create-vm web-1 2048 2");
    println!("  vmnx-ctl rekey");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut config = EngineConfig::load().context("failed to load engine configuration")?;
    let mut addr_ip: IpAddr = [127, 0, 0, 1].into();
    let mut status_port = DEFAULT_STATUS_PORT;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut remaining: Vec<String> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" => {
                i += 1;
                addr_ip = args
                    .get(i)
                    .context("--addr requires a value")?
                    .parse()
                    .context("--addr must be an IP address")?;
            }
            "--port" => {
                i += 1;
                config.tcp_port = args
                    .get(i)
                    .context("--port requires a value")?
                    .parse()
                    .context("--port must be a number")?;
            }
            "--status-port" => {
                i += 1;
                status_port = args
                    .get(i)
                    .context("--status-port requires a value")?
                    .parse()
                    .context("--status-port must be a number")?;
            }
            other => remaining.push(other.to_string()),
        }
        i += 1;
    }

    let remaining_refs: Vec<&str> = remaining.iter().map(|s| s.as_str()).collect();
    let control_addr = SocketAddr::new(addr_ip, config.tcp_port);

    match remaining_refs.as_slice() {
        ["status"] | [] => cmd::status::cmd_status(status_port).await,
        ["ping"] => cmd::request::cmd_ping(control_addr, &config, 1).await,
        ["ping", nonce] => {
            let nonce: u64 = nonce.parse().context("nonce must be a number")?;
            cmd::request::cmd_ping(control_addr, &config, nonce).await
        }
        ["create-vm", name, ram_mb, cpu_cores] => {
            let ram_mb: u32 = ram_mb.parse().context("ram-mb must be a number")?;
            let cpu_cores: u32 = cpu_cores.parse().context("cpu-cores must be a number")?;
            cmd::request::cmd_create_vm(control_addr, &config, name, ram_mb, cpu_cores).await
        }
        ["rekey"] => cmd::request::cmd_rekey(control_addr, &config).await,
        ["help"] | ["--help"] | ["-h"] => {
            print_usage(&config);
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage(&config);
            std::process::exit(1);
        }
    }
}
