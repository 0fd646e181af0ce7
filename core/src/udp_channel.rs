//! Framed UDP data channel (§4.2): lossy video, reliable control with
//! ACK+retransmit, fragmentation/reassembly, keep-alive — all on one socket.

use crate::error::{CoreError, CoreResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;

const MAGIC: u16 = 0x5743;
const MAX_UDP_PAYLOAD: usize = 1200;
const HEADER_SIZE: usize = 9; // magic(2) + seq(4) + type(1) + len(2)
const CHUNK_HEADER_EXTRA: usize = 2; // chunk_idx(1) + total_chunks(1)
const SINGLE_MAX_PAYLOAD: usize = MAX_UDP_PAYLOAD - HEADER_SIZE;
const CHUNK_MAX_PAYLOAD: usize = MAX_UDP_PAYLOAD - HEADER_SIZE - CHUNK_HEADER_EXTRA;
const FRAGMENT_BIT: u8 = 0x80;

const ACK_TIMEOUT: Duration = Duration::from_millis(150);
const ACK_RETRIES: u32 = 3;
const PING_INTERVAL: Duration = Duration::from_secs(5);
const PING_TIMEOUT: Duration = Duration::from_secs(15);
const REASSEMBLY_TTL: Duration = Duration::from_secs(2);

/// Wire type space (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Thumbnail,
    StreamMjpeg,
    H264Key,
    H264Delta,
    Control,
    ControlAck,
    Ping,
    Pong,
}

impl FrameType {
    pub fn to_byte(self) -> u8 {
        match self {
            Self::Thumbnail => 0x01,
            Self::StreamMjpeg => 0x02,
            Self::H264Key => 0x03,
            Self::H264Delta => 0x04,
            Self::Control => 0x10,
            Self::ControlAck => 0x11,
            Self::Ping => 0xFE,
            Self::Pong => 0xFF,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Thumbnail),
            0x02 => Some(Self::StreamMjpeg),
            0x03 => Some(Self::H264Key),
            0x04 => Some(Self::H264Delta),
            0x10 => Some(Self::Control),
            0x11 => Some(Self::ControlAck),
            0xFE => Some(Self::Ping),
            0xFF => Some(Self::Pong),
            _ => None,
        }
    }

    fn is_video(self) -> bool {
        matches!(
            self,
            Self::Thumbnail | Self::StreamMjpeg | Self::H264Key | Self::H264Delta
        )
    }
}

/// An event delivered to the channel's owner.
#[derive(Debug)]
pub enum ChannelEvent {
    Control(Vec<u8>),
    Video(FrameType, Vec<u8>),
}

struct Reassembly {
    chunks: HashMap<u8, Vec<u8>>,
    total: u8,
    frame_type_byte: u8,
    started_at: Instant,
}

struct Inner {
    sock: UdpSocket,
    remote: Mutex<SocketAddr>,
    seq: std::sync::atomic::AtomicU32,
    last_recv: Mutex<Instant>,
    ack_waiters: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    reassembly: Mutex<HashMap<u32, Reassembly>>,
    running: std::sync::atomic::AtomicBool,
}

/// A data channel over a hole-punched (or otherwise connected) UDP socket.
///
/// Cloning shares the same underlying socket and state; the receive and
/// keep-alive loops run as background tasks started by [`UdpChannel::spawn`].
#[derive(Clone)]
pub struct UdpChannel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for UdpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpChannel").finish_non_exhaustive()
    }
}

impl UdpChannel {
    /// Wrap an already-connected (or punched) UDP socket and spawn its
    /// receive and ping background tasks. Returns the channel plus a
    /// receiver of [`ChannelEvent`]s.
    pub fn spawn(sock: UdpSocket, remote: SocketAddr) -> (Self, mpsc::Receiver<ChannelEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let inner = Arc::new(Inner {
            sock,
            remote: Mutex::new(remote),
            seq: std::sync::atomic::AtomicU32::new(0),
            last_recv: Mutex::new(Instant::now()),
            ack_waiters: Mutex::new(HashMap::new()),
            reassembly: Mutex::new(HashMap::new()),
            running: std::sync::atomic::AtomicBool::new(true),
        });
        let channel = Self { inner };

        tokio::spawn(channel.clone().recv_loop(tx));
        tokio::spawn(channel.clone().ping_loop());

        (channel, rx)
    }

    fn next_seq(&self) -> u32 {
        self.inner
            .seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            .wrapping_add(1)
    }

    /// True if a datagram of any kind has arrived within the last 15 s.
    pub async fn is_alive(&self) -> bool {
        self.inner.running.load(std::sync::atomic::Ordering::Relaxed)
            && self.inner.last_recv.lock().await.elapsed() < PING_TIMEOUT
    }

    async fn remote_addr(&self) -> SocketAddr {
        *self.inner.remote.lock().await
    }

    /// Fire-and-forget video frame send: no retransmit, losses tolerated.
    pub async fn send_video(&self, frame_type: FrameType, data: &[u8]) {
        if !self.inner.running.load(std::sync::atomic::Ordering::Relaxed) {
            return;
        }
        let seq = self.next_seq();
        let remote = self.remote_addr().await;
        if data.len() <= SINGLE_MAX_PAYLOAD {
            self.send_packet(seq, frame_type.to_byte(), data, remote).await;
        } else {
            self.send_chunked(seq, frame_type.to_byte(), data, remote).await;
        }
    }

    /// Reliable control send: awaits `CONTROL_ACK(seq)` within 150 ms,
    /// retransmitting up to 3 times (§4.2, §8 P2).
    pub async fn send_control(&self, payload: &[u8]) -> CoreResult<()> {
        if !self.inner.running.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(CoreError::Network("channel closed".into()));
        }
        let seq = self.next_seq();
        let remote = self.remote_addr().await;

        for attempt in 0..=ACK_RETRIES {
            let (ack_tx, ack_rx) = oneshot::channel();
            self.inner.ack_waiters.lock().await.insert(seq, ack_tx);

            if payload.len() <= SINGLE_MAX_PAYLOAD {
                self.send_packet(seq, FrameType::Control.to_byte(), payload, remote)
                    .await;
            } else {
                self.send_chunked(seq, FrameType::Control.to_byte(), payload, remote)
                    .await;
            }

            match timeout(ACK_TIMEOUT, ack_rx).await {
                Ok(Ok(())) => {
                    self.inner.ack_waiters.lock().await.remove(&seq);
                    return Ok(());
                }
                _ => {
                    self.inner.ack_waiters.lock().await.remove(&seq);
                    if attempt < ACK_RETRIES {
                        log::debug!("udp_channel: retransmit #{} seq={seq}", attempt + 1);
                    }
                }
            }
        }

        log::warn!("udp_channel: control send failed seq={seq}");
        Err(CoreError::Network(format!(
            "control message seq={seq} failed after {ACK_RETRIES} retries"
        )))
    }

    async fn send_packet(&self, seq: u32, ptype: u8, payload: &[u8], remote: SocketAddr) {
        let mut header = Vec::with_capacity(HEADER_SIZE + payload.len());
        header.extend_from_slice(&MAGIC.to_be_bytes());
        header.extend_from_slice(&seq.to_be_bytes());
        header.push(ptype);
        header.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        header.extend_from_slice(payload);
        if let Err(e) = self.inner.sock.send_to(&header, remote).await {
            log::debug!("udp_channel: send error: {e}");
        }
    }

    async fn send_chunked(&self, seq: u32, ptype: u8, data: &[u8], remote: SocketAddr) {
        let total = data.len().div_ceil(CHUNK_MAX_PAYLOAD);
        if total > 255 {
            log::warn!("udp_channel: payload too large: {} bytes, {total} chunks", data.len());
            return;
        }
        for (i, chunk) in data.chunks(CHUNK_MAX_PAYLOAD).enumerate() {
            let mut header = Vec::with_capacity(HEADER_SIZE + CHUNK_HEADER_EXTRA + chunk.len());
            header.extend_from_slice(&MAGIC.to_be_bytes());
            header.extend_from_slice(&seq.to_be_bytes());
            header.push(ptype | FRAGMENT_BIT);
            header.extend_from_slice(&((chunk.len() + CHUNK_HEADER_EXTRA) as u16).to_be_bytes());
            header.push(i as u8);
            header.push(total as u8);
            header.extend_from_slice(chunk);
            if let Err(e) = self.inner.sock.send_to(&header, remote).await {
                log::debug!("udp_channel: chunk send error: {e}");
            }
        }
    }

    async fn send_ack(&self, seq: u32, remote: SocketAddr) {
        self.send_packet(seq, FrameType::ControlAck.to_byte(), &[], remote).await;
    }

    async fn send_ping(&self) {
        let seq = self.next_seq();
        let remote = self.remote_addr().await;
        self.send_packet(seq, FrameType::Ping.to_byte(), &[], remote).await;
    }

    async fn send_pong(&self, seq: u32, remote: SocketAddr) {
        self.send_packet(seq, FrameType::Pong.to_byte(), &[], remote).await;
    }

    async fn recv_loop(self, out: mpsc::Sender<ChannelEvent>) {
        let mut buf = vec![0u8; 65536];
        while self.inner.running.load(std::sync::atomic::Ordering::Relaxed) {
            let recv = timeout(Duration::from_secs(1), self.inner.sock.recv_from(&mut buf)).await;
            let Ok(Ok((len, from))) = recv else {
                continue;
            };
            if len < HEADER_SIZE {
                continue;
            }
            *self.inner.last_recv.lock().await = Instant::now();
            self.process_packet(&buf[..len], from, &out).await;
        }
    }

    async fn process_packet(&self, data: &[u8], from: SocketAddr, out: &mpsc::Sender<ChannelEvent>) {
        let seq = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let ptype = data[6];
        let plen = u16::from_be_bytes([data[7], data[8]]) as usize;
        let payload = &data[HEADER_SIZE..];

        if ptype & FRAGMENT_BIT != 0 {
            let actual_type = ptype & !FRAGMENT_BIT;
            if payload.len() < CHUNK_HEADER_EXTRA {
                return;
            }
            let chunk_idx = payload[0];
            let total_chunks = payload[1];
            let chunk_data = payload[2..].to_vec();
            self.handle_chunk(seq, actual_type, chunk_idx, total_chunks, chunk_data, from, out)
                .await;
            return;
        }

        let payload = &payload[..plen.min(payload.len())];

        match FrameType::from_byte(ptype) {
            Some(FrameType::ControlAck) => {
                if let Some(tx) = self.inner.ack_waiters.lock().await.remove(&seq) {
                    let _ = tx.send(());
                }
            }
            Some(FrameType::Ping) => self.send_pong(seq, from).await,
            Some(FrameType::Pong) => {}
            Some(FrameType::Control) => {
                self.send_ack(seq, from).await;
                let _ = out.send(ChannelEvent::Control(payload.to_vec())).await;
            }
            Some(ft) if ft.is_video() => {
                let _ = out.send(ChannelEvent::Video(ft, payload.to_vec())).await;
            }
            _ => {}
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_chunk(
        &self,
        seq: u32,
        ptype: u8,
        idx: u8,
        total: u8,
        data: Vec<u8>,
        from: SocketAddr,
        out: &mpsc::Sender<ChannelEvent>,
    ) {
        let mut guard = self.inner.reassembly.lock().await;
        let entry = guard.entry(seq).or_insert_with(|| Reassembly {
            chunks: HashMap::new(),
            total,
            frame_type_byte: ptype,
            started_at: Instant::now(),
        });
        entry.chunks.insert(idx, data);

        if entry.chunks.len() == entry.total as usize {
            let entry = guard.remove(&seq).expect("just inserted above");
            let mut full = Vec::new();
            let mut complete = true;
            for i in 0..entry.total {
                match entry.chunks.get(&i) {
                    Some(chunk) => full.extend_from_slice(chunk),
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            drop(guard);

            if complete {
                match FrameType::from_byte(entry.frame_type_byte) {
                    Some(FrameType::Control) => {
                        self.send_ack(seq, from).await;
                        let _ = out.send(ChannelEvent::Control(full)).await;
                    }
                    Some(ft) if ft.is_video() => {
                        let _ = out.send(ChannelEvent::Video(ft, full)).await;
                    }
                    _ => {}
                }
            }
        } else {
            let now = Instant::now();
            guard.retain(|_, r| now.duration_since(r.started_at) <= REASSEMBLY_TTL);
        }
    }

    async fn ping_loop(self) {
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        loop {
            ticker.tick().await;
            if !self.inner.running.load(std::sync::atomic::Ordering::Relaxed) {
                return;
            }
            self.send_ping().await;
            if !self.is_alive().await {
                log::warn!("udp_channel: keep-alive timeout, closing channel");
                self.inner.running.store(false, std::sync::atomic::Ordering::Relaxed);
                return;
            }
        }
    }

    /// Cancel the receive/ping loops, fail any outstanding ACK futures, and
    /// mark the channel dead. The underlying socket is dropped with `self`.
    pub async fn close(&self) {
        self.inner
            .running
            .store(false, std::sync::atomic::Ordering::Relaxed);
        self.inner.ack_waiters.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_pair() -> (UdpChannel, mpsc::Receiver<ChannelEvent>, UdpChannel, mpsc::Receiver<ChannelEvent>) {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();
        let (chan_a, rx_a) = UdpChannel::spawn(a, b_addr);
        let (chan_b, rx_b) = UdpChannel::spawn(b, a_addr);
        (chan_a, rx_a, chan_b, rx_b)
    }

    /// P1 (UDP framing round-trip), small-payload case.
    #[tokio::test]
    async fn video_frame_round_trips() {
        let (chan_a, _rx_a, _chan_b, mut rx_b) = make_pair().await;
        chan_a.send_video(FrameType::StreamMjpeg, b"hello-jpeg").await;

        let event = tokio::time::timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ChannelEvent::Video(ft, data) => {
                assert_eq!(ft, FrameType::StreamMjpeg);
                assert_eq!(data, b"hello-jpeg");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    /// P1, fragmented case: payload larger than a single packet reassembles
    /// correctly.
    #[tokio::test]
    async fn oversized_payload_reassembles() {
        let (chan_a, _rx_a, _chan_b, mut rx_b) = make_pair().await;
        let big: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        chan_a.send_video(FrameType::H264Key, &big).await;

        let event = tokio::time::timeout(Duration::from_secs(2), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ChannelEvent::Video(ft, data) => {
                assert_eq!(ft, FrameType::H264Key);
                assert_eq!(data, big);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    /// P2 (control reliability): a control message is ACKed and returns Ok.
    #[tokio::test]
    async fn control_message_is_acked() {
        let (chan_a, _rx_a, chan_b, mut rx_b) = make_pair().await;

        let send_fut = chan_a.send_control(b"{\"type\":\"ping\"}");
        let recv_fut = async {
            let event = rx_b.recv().await.unwrap();
            if let ChannelEvent::Control(payload) = event {
                assert_eq!(payload, b"{\"type\":\"ping\"}");
            }
        };
        let chan_b_clone = chan_b.clone();
        let (result, ()) = tokio::join!(send_fut, recv_fut);
        drop(chan_b_clone);
        assert!(result.is_ok());
    }

    #[test]
    fn frame_type_byte_round_trips() {
        for ft in [
            FrameType::Thumbnail,
            FrameType::StreamMjpeg,
            FrameType::H264Key,
            FrameType::H264Delta,
            FrameType::Control,
            FrameType::ControlAck,
            FrameType::Ping,
            FrameType::Pong,
        ] {
            assert_eq!(FrameType::from_byte(ft.to_byte()), Some(ft));
        }
    }
}
