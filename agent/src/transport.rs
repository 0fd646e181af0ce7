//! Outbound-frame abstraction shared by the direct WS listener and the
//! relay fallback so [`crate::session_runner::run`] drives either the same
//! way (§4.5, §4.6).

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use wellcom_core::relay_session::RelaySender;
use wellcom_core::udp_channel::{FrameType, UdpChannel};

#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> bool;
    async fn send_binary(&mut self, data: Vec<u8>) -> bool;
}

pub struct WsTransport {
    pub sink: SplitSink<WebSocketStream<TcpStream>, Message>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> bool {
        self.sink.send(Message::Text(text)).await.is_ok()
    }

    async fn send_binary(&mut self, data: Vec<u8>) -> bool {
        self.sink.send(Message::Binary(data)).await.is_ok()
    }
}

/// Wraps outbound frames with a `manager_id` tag so the relay loop's
/// single inbound stream can be demultiplexed back to the right
/// [`crate::session_runner::run`] task on the far end (the relay itself
/// is agent-wide, not per-manager).
pub struct RelayTransport {
    pub sender: RelaySender,
    pub manager_id: String,
}

#[async_trait]
impl Transport for RelayTransport {
    async fn send_text(&mut self, text: String) -> bool {
        let Ok(mut value) = serde_json::from_str::<serde_json::Value>(&text) else {
            return false;
        };
        if let serde_json::Value::Object(ref mut map) = value {
            map.insert(
                "manager_id".to_string(),
                serde_json::Value::String(self.manager_id.clone()),
            );
        }
        self.sender.send_text(value.to_string()).await
    }

    async fn send_binary(&mut self, data: Vec<u8>) -> bool {
        let id_bytes = self.manager_id.as_bytes();
        let mut wire = Vec::with_capacity(1 + id_bytes.len() + data.len());
        wire.push(id_bytes.len() as u8);
        wire.extend_from_slice(id_bytes);
        wire.extend_from_slice(&data);
        self.sender.send_binary(wire).await
    }
}

/// The udp-p2p session transport (§3, §4.3): video frames go out lossy via
/// [`UdpChannel::send_video`], control frames (including `auth`/`auth_ok`
/// and file chunks, which `session_runner` only ever sends as text/JSON on
/// the agent side) go out reliably via `send_control`. No `manager_id`
/// tagging needed: the channel is already 1:1 for this session.
pub struct UdpTransport {
    pub channel: UdpChannel,
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_text(&mut self, text: String) -> bool {
        self.channel.send_control(text.as_bytes()).await.is_ok()
    }

    async fn send_binary(&mut self, data: Vec<u8>) -> bool {
        let Some((&header_byte, rest)) = data.split_first() else {
            return false;
        };
        let Some(frame_type) = FrameType::from_byte(header_byte) else {
            log::debug!("udp transport: unknown codec header byte {header_byte:#x}");
            return false;
        };
        self.channel.send_video(frame_type, rest).await;
        true
    }
}
