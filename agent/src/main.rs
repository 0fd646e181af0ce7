//! Controlled-host agent entry point (§6): parses CLI flags, loads
//! persisted config, handles `--install`/`--uninstall`, then runs the
//! directory heartbeat loop, the relay fallback, and the direct WS
//! listener concurrently until interrupted.

mod autostart;
mod capability;
mod clipboard_loop;
mod directory_loop;
mod listener;
mod registry;
mod relay_loop;
mod session_runner;
mod transport;
mod udp_rendezvous;

use anyhow::{Context, Result};
use capability::{ArboardClipboard, LoggingInjector, SyntheticCapture};
use clap::Parser;
use mimalloc::MiMalloc;
use registry::SessionRegistry;
use session_runner::AgentContext;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use wellcom_core::directory_client::DirectoryClient;
use wellcom_core::identity::CapabilityDescriptor;
use wellcom_core::Config;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const SYNTHETIC_WIDTH: u32 = 1920;
const SYNTHETIC_HEIGHT: u32 = 1080;

/// Controlled-host process for a remote administration session.
#[derive(Parser, Debug)]
#[command(name = "wellcom-agent", version, about)]
struct Cli {
    /// Directory service base URL, overrides the persisted config.
    #[arg(long)]
    api_url: Option<String>,

    /// Port the direct WebSocket listener binds to, overrides the persisted config.
    #[arg(long)]
    ws_port: Option<u16>,

    /// Register this agent to start on login, then exit.
    #[arg(long)]
    install: bool,

    /// Remove the autostart registration, then exit.
    #[arg(long)]
    uninstall: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    if cli.install {
        return match autostart::install() {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("install failed: {e:#}");
                std::process::exit(1);
            }
        };
    }
    if cli.uninstall {
        return match autostart::uninstall() {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("uninstall failed: {e:#}");
                std::process::exit(1);
            }
        };
    }

    let runtime = tokio::runtime::Runtime::new().context("building tokio runtime")?;
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load().context("loading config")?;
    if let Some(api_url) = cli.api_url {
        config.api_url = api_url;
    }
    if let Some(ws_port) = cli.ws_port {
        config.ws_port = ws_port;
    }

    let agent_id = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-agent".to_string());
    let hostname = agent_id.clone();

    let capability = CapabilityDescriptor {
        os: std::env::consts::OS.to_string(),
        screen_width: SYNTHETIC_WIDTH,
        screen_height: SYNTHETIC_HEIGHT,
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        hardware_summary: "synthetic capture backend".to_string(),
    };

    let directory = if config.has_token() && !config.api_url.is_empty() {
        Some(Arc::new(
            DirectoryClient::new(config.api_url.clone()).context("building directory client")?,
        ))
    } else {
        None
    };

    let arboard_clipboard = Arc::new(ArboardClipboard::new());
    let (clipboard_tx, _) = tokio::sync::broadcast::channel(16);

    let ctx = Arc::new(AgentContext {
        agent_id: agent_id.clone(),
        hostname,
        capability: capability.clone(),
        capture: Arc::new(SyntheticCapture::new(SYNTHETIC_WIDTH, SYNTHETIC_HEIGHT)),
        injector: Arc::new(LoggingInjector),
        clipboard: arboard_clipboard.clone(),
        save_dir: config.save_dir.clone(),
        directory: directory.clone(),
        registry: SessionRegistry::new(),
        clipboard_tx: clipboard_tx.clone(),
    });

    tokio::spawn(clipboard_loop::run(arboard_clipboard, clipboard_tx));

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            log::info!("received interrupt, shutting down");
            shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
        })
        .context("installing signal handler")?;
    }

    if let Some(directory) = directory {
        let signaling_available = Arc::new(AtomicBool::new(false));
        tokio::spawn(directory_loop::run(
            directory,
            config.api_token.clone(),
            agent_id.clone(),
            ctx.hostname.clone(),
            capability,
            std::time::Duration::from_secs(config.heartbeat_interval),
            signaling_available,
        ));
    }

    let relay_url = relay_url_from_api(&config.api_url);
    tokio::spawn(relay_loop::run(
        ctx.clone(),
        relay_url,
        agent_id,
        config.api_token.clone(),
    ));

    tokio::select! {
        result = listener::run(ctx, config.ws_port, config.ws_max_connections) => {
            result.context("direct listener exited")?;
        }
        () = wait_for_shutdown(shutdown) => {
            log::info!("shutdown complete");
        }
    }

    Ok(())
}

async fn wait_for_shutdown(shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(std::sync::atomic::Ordering::Relaxed) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

/// Derives the relay WebSocket URL from the directory's HTTP(S) base URL:
/// `https://host/...` ⇒ `wss://host/relay`, `http` ⇒ `ws`.
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
        assert_eq!(
            relay_url_from_api("https://directory.example.com"),
            "wss://directory.example.com/relay"
        );
        assert_eq!(
            relay_url_from_api("http://localhost:3000/"),
            "ws://localhost:3000/relay"
        );
    }
}
