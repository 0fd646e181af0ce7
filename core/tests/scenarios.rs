//! Cross-module scenario tests that exercise the public API the way a real
//! session would, rather than one function in isolation.

use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use wellcom_core::file_transfer::FileReceiver;
use wellcom_core::udp_channel::{ChannelEvent, FrameType, UdpChannel};

async fn make_pair() -> (UdpChannel, tokio::sync::mpsc::Receiver<ChannelEvent>, SocketAddr) {
    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let a_addr = a.local_addr().unwrap();
    let b_addr = b.local_addr().unwrap();
    let (chan_a, _rx_a) = UdpChannel::spawn(a, b_addr);
    let (_chan_b, rx_b) = UdpChannel::spawn(b, a_addr);
    (chan_a, rx_b, a_addr)
}

/// P7 driven through the real wire path: a file is split into chunks, each
/// sent as a control message over a live `UdpChannel` pair, and written
/// into a `FileReceiver` on the other end. The reassembled file's SHA-256
/// must match the source's.
#[tokio::test]
async fn file_transfer_survives_the_udp_channel() {
    let (sender, mut receiver_rx, _addr) = make_pair().await;

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();
    let expected_hash = {
        let mut hasher = Sha256::new();
        hasher.update(&payload);
        hasher.finalize()
    };

    let dir = tempfile::tempdir().unwrap();
    let save_dir = dir.path().to_path_buf();

    let receiver_task = tokio::spawn(async move {
        let mut receiver = FileReceiver::new(&save_dir);
        receiver.begin_file("payload.bin", payload.len() as u64).unwrap();
        loop {
            match tokio::time::timeout(std::time::Duration::from_secs(5), receiver_rx.recv()).await {
                Ok(Some(ChannelEvent::Control(chunk))) => {
                    if chunk == b"__end__" {
                        break;
                    }
                    receiver.write_chunk(&chunk).unwrap();
                }
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
        let path = receiver.finish_file().unwrap();
        std::fs::read(path).unwrap()
    });

    for chunk in payload.chunks(4096) {
        sender.send_control(chunk).await.unwrap();
    }
    sender.send_control(b"__end__").await.unwrap();

    let received = tokio::time::timeout(std::time::Duration::from_secs(5), receiver_task)
        .await
        .unwrap()
        .unwrap();

    let mut hasher = Sha256::new();
    hasher.update(&received);
    assert_eq!(hasher.finalize(), expected_hash);
}

/// Same channel pair, but exercised as a mixed video+control stream the way
/// a real session interleaves a stream frame with an out-of-band control
/// message (e.g. a thumbnail push racing a `request_keyframe`). Both must
/// arrive intact and distinguishable by frame type.
#[tokio::test]
async fn interleaved_video_and_control_frames_stay_distinguishable() {
    let (sender, mut receiver_rx, _addr) = make_pair().await;

    sender.send_video(FrameType::StreamMjpeg, b"frame-one").await;
    sender.send_control(b"{\"type\":\"request_keyframe\"}").await.unwrap();
    sender.send_video(FrameType::Thumbnail, b"thumb-bytes").await;

    let mut video_frames = Vec::new();
    let mut control_frames = Vec::new();
    for _ in 0..3 {
        match tokio::time::timeout(std::time::Duration::from_secs(2), receiver_rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ChannelEvent::Video(ft, data) => video_frames.push((ft, data)),
            ChannelEvent::Control(data) => control_frames.push(data),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    assert_eq!(video_frames.len(), 2);
    assert_eq!(control_frames.len(), 1);
    assert!(video_frames.iter().any(|(ft, d)| *ft == FrameType::StreamMjpeg && d == b"frame-one"));
    assert!(video_frames.iter().any(|(ft, d)| *ft == FrameType::Thumbnail && d == b"thumb-bytes"));
    assert_eq!(control_frames[0], b"{\"type\":\"request_keyframe\"}");
}
