//! Outbound-frame abstraction for whichever mode [`crate::tier_probe`]
//! escalated to, mirroring the agent's transport split (§4.4–4.6).

use crate::relay_client::RelaySender;
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use wellcom_core::udp_channel::UdpChannel;

#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> bool;
    async fn send_binary(&mut self, data: Vec<u8>) -> bool;
}

pub struct WsTransport {
    pub sink: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
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

pub struct RelayTransport {
    pub sender: RelaySender,
}

#[async_trait]
impl Transport for RelayTransport {
    async fn send_text(&mut self, text: String) -> bool {
        self.sender.send_text(text).await
    }

    async fn send_binary(&mut self, data: Vec<u8>) -> bool {
        self.sender.send_binary(data).await
    }
}

/// The manager side of a udp-p2p session (§3, §4.3, §4.4's
/// `TRY_UDP_PUNCH → CONNECTED(mode=udp-p2p)`). The manager only ever sends
/// control frames (auth, commands), so both methods go out reliably over
/// `send_control`; the agent distinguishes JSON control text from raw
/// binary by content on its own receive path.
pub struct UdpTransport {
    pub channel: UdpChannel,
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_text(&mut self, text: String) -> bool {
        self.channel.send_control(text.as_bytes()).await.is_ok()
    }

    async fn send_binary(&mut self, data: Vec<u8>) -> bool {
        self.channel.send_control(&data).await.is_ok()
    }
}
