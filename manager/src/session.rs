//! Manager-side session driver: sends `auth`, decodes inbound video, and
//! turns typed stdin commands into control frames (§4.6–4.8, manager side).
//!
//! There is no display surface in this minimal text driver (§6 Non-goals);
//! decoded frames are logged (dimensions + outcome) rather than rendered.

use crate::transport::Transport;
use tokio::sync::mpsc;
use wellcom_core::decoder::{codec_for_header_byte, decode_mjpeg, H264Decoder};
use wellcom_core::protocol::{Codec, ControlMessage};

pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
}

pub struct SessionContext {
    pub manager_id: String,
    pub agent_id: String,
    pub token: String,
}

pub async fn run(
    ctx: SessionContext,
    mut inbound: mpsc::Receiver<Inbound>,
    mut transport: Box<dyn Transport>,
    mut commands: mpsc::Receiver<String>,
) {
    let auth = ControlMessage::Auth {
        manager_id: ctx.manager_id.clone(),
        token: ctx.token.clone(),
    };
    if !transport.send_text(serde_json::to_string(&auth).unwrap()).await {
        log::error!("session[{}]: failed to send auth", ctx.agent_id);
        return;
    }

    let mut h264: Option<H264Decoder> = None;

    loop {
        tokio::select! {
            msg = inbound.recv() => {
                match msg {
                    Some(Inbound::Text(text)) => handle_text(&ctx, &text),
                    Some(Inbound::Binary(data)) => handle_binary(&ctx, &data, &mut h264),
                    None => {
                        log::info!("session[{}]: transport closed", ctx.agent_id);
                        break;
                    }
                }
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(line) => {
                        let line = line.trim();
                        if line == "quit" || line == "exit" {
                            break;
                        }
                        if let Some(message) = parse_command(line) {
                            if !transport.send_text(serde_json::to_string(&message).unwrap()).await {
                                break;
                            }
                        } else if !line.is_empty() {
                            println!("unrecognized command: {line}");
                        }
                    }
                    None => break,
                }
            }
        }
    }
}

fn handle_text(ctx: &SessionContext, text: &str) {
    let message: ControlMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            log::debug!("session[{}]: unparseable frame: {e}", ctx.agent_id);
            return;
        }
    };
    match message {
        ControlMessage::AuthOk { agent_id, hostname, os_info, screen_width, screen_height } => {
            println!(
                "connected: agent_id={agent_id} hostname={hostname} os={os_info} screen={screen_width}x{screen_height}"
            );
        }
        ControlMessage::AuthFail { reason } => println!("auth failed: {reason}"),
        ControlMessage::StreamStarted { codec, encoder, width, height, fps, quality } => {
            println!("stream started: {codec:?} via {encoder} {width}x{height} @{fps}fps q={quality}");
        }
        ControlMessage::Thumbnail { data } => println!("thumbnail received: {} bytes", data.len()),
        ControlMessage::FileProgress { received, total } => println!("file progress: {received}/{total}"),
        ControlMessage::FileComplete { path, status } => println!("file complete: {path} ({status})"),
        ControlMessage::ExecuteResult { stdout, stderr, returncode } => {
            println!("execute result (code {returncode}):\n{stdout}{stderr}");
        }
        ControlMessage::Clipboard { format, data } => println!("clipboard[{format:?}]: {data}"),
        other => log::debug!("session[{}]: {other:?}", ctx.agent_id),
    }
}

fn handle_binary(ctx: &SessionContext, data: &[u8], h264: &mut Option<H264Decoder>) {
    if data.len() < 5 {
        log::debug!("session[{}]: binary frame too short to be a wire frame", ctx.agent_id);
        return;
    }
    let header_byte = data[0];
    let sequence = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    let payload = &data[5..];

    let Some(codec) = codec_for_header_byte(header_byte) else {
        log::debug!("session[{}]: unknown codec header byte {header_byte:#x}", ctx.agent_id);
        return;
    };

    match codec {
        Codec::Mjpeg => match decode_mjpeg(payload) {
            Ok(image) => println!("frame #{sequence}: {}x{} (mjpeg)", image.width, image.height),
            Err(e) => log::warn!("session[{}]: mjpeg decode failed: {e}", ctx.agent_id),
        },
        Codec::H264 => {
            if h264.is_none() {
                match H264Decoder::new() {
                    Ok(d) => *h264 = Some(d),
                    Err(e) => {
                        log::error!("session[{}]: h264 decoder unavailable: {e}", ctx.agent_id);
                        return;
                    }
                }
            }
            let decoder = h264.as_mut().expect("just initialized");
            let is_keyframe = header_byte == 0x03;
            let (outcome, image) = decoder.feed(sequence, is_keyframe, payload);
            if let Some(image) = image {
                println!("frame #{sequence}: {}x{} (h264, {outcome:?})", image.width, image.height);
            } else {
                log::debug!("session[{}]: frame #{sequence} outcome {outcome:?}", ctx.agent_id);
            }
        }
    }
}

fn parse_command(line: &str) -> Option<ControlMessage> {
    match line {
        "stream" => Some(ControlMessage::StartStream {
            fps: 30,
            quality: 75,
            codec: Codec::Mjpeg,
            keyframe_interval: 60,
        }),
        "stop" => Some(ControlMessage::StopStream),
        "thumbnail" => Some(ControlMessage::RequestThumbnail),
        "keyframe" => Some(ControlMessage::RequestKeyframe),
        "clipboard" => Some(ControlMessage::GetClipboard),
        "monitors" => Some(ControlMessage::RequestMonitors),
        _ => {
            if let Some(command) = line.strip_prefix("exec ") {
                return Some(ControlMessage::Execute {
                    command: command.to_string(),
                });
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_commands_parse_to_control_messages() {
        assert!(matches!(parse_command("stream"), Some(ControlMessage::StartStream { .. })));
        assert!(matches!(parse_command("stop"), Some(ControlMessage::StopStream)));
        assert!(matches!(parse_command("thumbnail"), Some(ControlMessage::RequestThumbnail)));
        assert!(matches!(parse_command("keyframe"), Some(ControlMessage::RequestKeyframe)));
        assert!(matches!(parse_command("clipboard"), Some(ControlMessage::GetClipboard)));
        assert!(matches!(parse_command("monitors"), Some(ControlMessage::RequestMonitors)));
        match parse_command("exec echo hi") {
            Some(ControlMessage::Execute { command }) => assert_eq!(command, "echo hi"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unrecognized_command_is_none() {
        assert!(parse_command("banana").is_none());
        assert!(parse_command("").is_none());
    }

    #[test]
    fn handle_binary_rejects_short_frames_without_panicking() {
        let mut h264 = None;
        let ctx = SessionContext {
            manager_id: "m1".to_string(),
            agent_id: "a1".to_string(),
            token: "t".to_string(),
        };
        handle_binary(&ctx, &[0x02, 0x00], &mut h264);
        assert!(h264.is_none());
    }
}
