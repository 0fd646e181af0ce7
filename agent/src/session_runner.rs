//! Transport-agnostic session driver (§4.6 handshake + message loop, §4.7
//! encoder tick, §4.9 thumbnail push): the same state machine runs whether
//! the peer arrived through the direct WS listener or the relay.

use crate::registry::SessionRegistry;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use wellcom_core::clipboard::{ClipboardBridge, ClipboardContent};
use wellcom_core::directory_client::DirectoryClient;
use wellcom_core::encoder::CaptureSource;
use wellcom_core::identity::CapabilityDescriptor;
use wellcom_core::input::Injector;
use wellcom_core::protocol::ControlMessage;
use wellcom_core::session::{authenticate, Session};

/// One inbound frame from either transport.
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

/// Capability/identity context shared by every session on this agent.
pub struct AgentContext {
    pub agent_id: String,
    pub hostname: String,
    pub capability: CapabilityDescriptor,
    pub capture: Arc<dyn CaptureSource>,
    pub injector: Arc<dyn Injector>,
    pub clipboard: Arc<dyn ClipboardBridge>,
    pub save_dir: std::path::PathBuf,
    pub directory: Option<Arc<DirectoryClient>>,
    pub registry: Arc<SessionRegistry>,
    /// Broadcasts local OS clipboard changes (§4.6, §4.9) observed by
    /// [`crate::clipboard_loop`] to every live session, which echoes them
    /// out as an outbound `clipboard` frame.
    pub clipboard_tx: tokio::sync::broadcast::Sender<ClipboardContent>,
}

const THUMBNAIL_INTERVAL_FALLBACK: Duration = Duration::from_secs(60 * 60 * 24);

/// Run the handshake then the session loop to completion. `inbound` must
/// yield the `auth` frame first; anything else aborts the connection.
pub async fn run(
    ctx: Arc<AgentContext>,
    mut inbound: tokio::sync::mpsc::Receiver<Inbound>,
    mut transport: impl Transport,
) {
    let first = match inbound.recv().await {
        Some(Inbound::Text(text)) => text,
        _ => {
            log::warn!("session: connection closed before auth");
            return;
        }
    };

    let auth_msg: ControlMessage = match serde_json::from_str(&first) {
        Ok(m) => m,
        Err(e) => {
            log::warn!("session: auth frame not valid JSON: {e}");
            return;
        }
    };
    let (manager_id, token) = match auth_msg {
        ControlMessage::Auth { manager_id, token } => (manager_id, token),
        _ => {
            log::warn!("session: first message was not `auth`");
            let fail = ControlMessage::AuthFail {
                reason: "expected_auth".to_string(),
            };
            transport.send_text(serde_json::to_string(&fail).unwrap()).await;
            return;
        }
    };

    if let Err(e) = authenticate(ctx.directory.as_deref(), &token).await {
        log::info!("session[{manager_id}]: auth rejected: {e:?}");
        let fail = ControlMessage::AuthFail {
            reason: "token_rejected".to_string(),
        };
        let _ = transport.send_text(serde_json::to_string(&fail).unwrap()).await;
        return;
    }

    let mut registration = ctx.registry.register(&manager_id);

    let mut session = Session::new(
        manager_id.clone(),
        ctx.capability.clone(),
        ctx.capture.clone(),
        ctx.injector.clone(),
        ctx.clipboard.clone(),
        ctx.save_dir.clone(),
    );
    let ok = session.auth_ok(&ctx.agent_id, &ctx.hostname);
    let ok_msg = ControlMessage::AuthOk {
        agent_id: ok.agent_id,
        hostname: ok.hostname,
        os_info: ok.os_info,
        screen_width: ok.screen_width,
        screen_height: ok.screen_height,
    };
    if !transport.send_text(serde_json::to_string(&ok_msg).unwrap()).await {
        ctx.registry.unregister(&manager_id, &registration);
        return;
    }
    log::info!("session[{manager_id}]: authenticated");

    let mut sequence: u32 = 0;
    let mut clipboard_rx = ctx.clipboard_tx.subscribe();

    loop {
        let stream_sleep = if session.is_streaming() {
            let fps = session.stream_fps().unwrap_or(30).max(1);
            Duration::from_millis((1000 / fps) as u64)
        } else {
            Duration::from_secs(3600)
        };
        let thumb_interval = session
            .thumbnail_push_interval()
            .map(Duration::from_secs_f64)
            .unwrap_or(THUMBNAIL_INTERVAL_FALLBACK);

        tokio::select! {
            biased;

            result = registration.cancel_rx.changed() => {
                if result.is_err() || *registration.cancel_rx.borrow() {
                    log::info!("session[{manager_id}]: superseded, closing");
                    break;
                }
            }

            msg = inbound.recv() => {
                match msg {
                    Some(Inbound::Text(text)) => {
                        if !dispatch_text(&mut session, &text, &mut transport).await {
                            break;
                        }
                    }
                    Some(Inbound::Binary(data)) => {
                        if let Some(reply) = session.handle_file_chunk(&data) {
                            let _ = transport.send_text(serde_json::to_string(&reply).unwrap()).await;
                        }
                    }
                    None => {
                        log::info!("session[{manager_id}]: transport closed");
                        break;
                    }
                }
            }

            () = tokio::time::sleep(stream_sleep), if session.is_streaming() => {
                sequence = sequence.wrapping_add(1);
                if let Some(frame) = session.encode_tick(sequence) {
                    let mut wire = Vec::with_capacity(5 + frame.payload.len());
                    wire.push(frame.codec_header_byte);
                    wire.extend_from_slice(&frame.sequence.to_be_bytes());
                    wire.extend_from_slice(&frame.payload);
                    if !transport.send_binary(wire).await {
                        break;
                    }
                }
            }

            () = tokio::time::sleep(thumb_interval), if session.thumbnail_push_interval().is_some() => {
                for reply in session.handle(ControlMessage::RequestThumbnail) {
                    let _ = transport.send_text(serde_json::to_string(&reply).unwrap()).await;
                }
            }

            result = clipboard_rx.recv() => {
                match result {
                    Ok(content) => {
                        let message = ControlMessage::Clipboard {
                            format: content.format,
                            data: content.data,
                        };
                        if !transport.send_text(serde_json::to_string(&message).unwrap()).await {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        log::debug!("session[{manager_id}]: missed clipboard broadcasts, continuing");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {}
                }
            }
        }
    }

    session.close();
    ctx.registry.unregister(&manager_id, &registration);
}

/// Decode and route one text control frame, returning `false` if the
/// connection should close.
async fn dispatch_text(session: &mut Session, text: &str, transport: &mut impl Transport) -> bool {
    let message: ControlMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            log::debug!("session: dropping unparseable control frame: {e}");
            return true;
        }
    };

    // Execute runs a subprocess and update_request's reply is immediate;
    // both need an async reply the synchronous `Session::handle` router
    // can't produce, so they're handled here instead of falling through.
    match message {
        ControlMessage::Execute { command } => {
            let reply = wellcom_core::session::run_execute(&command).await;
            return transport.send_text(serde_json::to_string(&reply).unwrap()).await;
        }
        ControlMessage::UpdateRequest => {
            let reply = ControlMessage::UpdateStarted;
            return transport.send_text(serde_json::to_string(&reply).unwrap()).await;
        }
        message => {
            for reply in session.handle(message) {
                if !transport.send_text(serde_json::to_string(&reply).unwrap()).await {
                    return false;
                }
            }
        }
    }
    true
}
