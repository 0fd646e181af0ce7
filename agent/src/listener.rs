//! Direct WebSocket listener (§6): `0.0.0.0:ws_port`, max message size
//! 50 MiB, one task per accepted connection.

use crate::session_runner::{self, AgentContext, Inbound};
use crate::transport::WsTransport;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;

const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

pub async fn run(ctx: Arc<AgentContext>, ws_port: u16, ws_max_connections: usize) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", ws_port)).await?;
    log::info!("listener: accepting direct connections on 0.0.0.0:{ws_port}");

    let active = Arc::new(AtomicUsize::new(0));

    loop {
        let (stream, peer) = listener.accept().await?;
        if active.load(Ordering::Relaxed) >= ws_max_connections {
            log::warn!("listener: rejecting {peer}, ws_max_connections={ws_max_connections} reached");
            drop(stream);
            continue;
        }

        let ctx = ctx.clone();
        let active = active.clone();
        active.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            if let Err(e) = handle_connection(ctx, stream).await {
                log::debug!("listener: connection from {peer} ended: {e}");
            }
            active.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

async fn handle_connection(ctx: Arc<AgentContext>, stream: tokio::net::TcpStream) -> anyhow::Result<()> {
    let config = WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE_SIZE),
        ..Default::default()
    };
    let ws = tokio_tungstenite::accept_async_with_config(stream, Some(config)).await?;
    let (sink, mut stream) = ws.split();

    let (tx, rx) = tokio::sync::mpsc::channel(64);
    let reader = tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if tx.send(Inbound::Text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Binary(data)) => {
                    if tx.send(Inbound::Binary(data)).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    log::debug!("listener: read error: {e}");
                    break;
                }
            }
        }
    });

    session_runner::run(ctx, rx, WsTransport { sink }).await;
    reader.abort();
    Ok(())
}
