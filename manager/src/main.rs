//! Controlling-host entry point (§6): a minimal text driver, not a GUI.
//! `--list` prints known agents; `--connect` escalates a connection and
//! drops into a line-oriented command loop.

mod connect;
mod relay_client;
mod session;
mod tier_probe;
mod transport;

use anyhow::{Context, Result};
use clap::Parser;
use mimalloc::MiMalloc;
use std::io::BufRead;
use std::net::IpAddr;
use tokio::sync::mpsc;
use wellcom_core::connection_manager::AgentTargets;
use wellcom_core::directory_client::DirectoryClient;
use wellcom_core::identity::{AgentId, Endpoint};
use wellcom_core::Config;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Controlling-host process: connection escalation and session control.
#[derive(Parser, Debug)]
#[command(name = "wellcom-manager", version, about)]
struct Cli {
    /// Directory service base URL, overrides the persisted config.
    #[arg(long)]
    api_url: Option<String>,

    /// List known agents and exit.
    #[arg(long)]
    list: bool,

    /// Connect to this agent id and enter the command loop.
    #[arg(long)]
    connect: Option<String>,

    /// Direct LAN/WAN IP override for `--connect` (skips directory endpoint
    /// discovery, which this driver does not implement).
    #[arg(long)]
    host: Option<IpAddr>,

    /// Port paired with `--host`.
    #[arg(long, default_value_t = 21350)]
    port: u16,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("building tokio runtime")?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load().context("loading config")?;
    if let Some(api_url) = cli.api_url {
        config.api_url = api_url;
    }
    if !config.has_token() {
        anyhow::bail!("no directory token configured; log in and persist a token first");
    }

    let directory = DirectoryClient::new(config.api_url.clone()).context("building directory client")?;

    if cli.list {
        let agents = directory
            .list_agents(&config.api_token)
            .await
            .context("listing agents")?;
        for agent in agents {
            println!(
                "{:<24} {:<24} online={} group={:?} name={:?}",
                agent.agent_id, agent.hostname, agent.online, agent.group, agent.name
            );
        }
        return Ok(());
    }

    let Some(agent_id) = cli.connect else {
        anyhow::bail!("pass --list or --connect <agent-id>");
    };

    let targets = AgentTargets {
        agent_id: AgentId::from(agent_id.clone()),
        lan_endpoint: cli.host.map(|ip| Endpoint::new(ip, cli.port)),
        wan_endpoint: None,
        signaling_available: true,
    };

    let manager_id = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "manager".to_string());
    let relay_url = relay_url_from_api(&config.api_url);

    let established = connect::connect(targets, relay_url, manager_id.clone(), config.api_token.clone())
        .await
        .context("connecting to agent")?;
    println!("connected via {:?}", established.mode);

    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if cmd_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    let ctx = session::SessionContext {
        manager_id,
        agent_id,
        token: config.api_token,
    };
    println!("commands: stream, stop, thumbnail, keyframe, clipboard, monitors, exec <cmd>, quit");
    session::run(ctx, established.inbound, established.transport, cmd_rx).await;

    Ok(())
}

fn relay_url_from_api(api_url: &str) -> String {
    let trimmed = api_url.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}/relay")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}/relay")
    } else {
        format!("wss://{trimmed}/relay")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_url_swaps_scheme_and_appends_path() {
        assert_eq!(relay_url_from_api("https://directory.example.com"), "wss://directory.example.com/relay");
        assert_eq!(relay_url_from_api("http://localhost:3000/"), "ws://localhost:3000/relay");
    }
}
