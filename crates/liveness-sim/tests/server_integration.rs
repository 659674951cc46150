//! Integration tests for the simulated detector's socket server.
//!
//! These run `SimServer` in-process and talk to it over a real Unix socket
//! with the wire codec, covering accept order, shutdown and socket cleanup.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::path::PathBuf;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use liveness_core::{Frame, PixelFormat};
use liveness_protocol::{WireCodec, WireMessage};
use liveness_sim::{Gesture, ServeOutcome, SimOptions, SimServer};
use tempfile::TempDir;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for server socket to appear
const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Interval between socket existence checks
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound for any single receive
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Test Helpers
// ============================================================================

struct TestServer {
    socket_path: PathBuf,
    cancel_token: CancellationToken,
    handle: JoinHandle<ServeOutcome>,
    _temp_dir: TempDir,
}

impl TestServer {
    async fn spawn(options: SimOptions, challenge: Vec<Gesture>) -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = temp_dir.path().join("sim.sock");
        let cancel_token = CancellationToken::new();

        let server = SimServer::new(socket_path.clone(), options, challenge, cancel_token.clone());
        let handle = tokio::spawn(async move { server.run().await.expect("server runs") });

        let start = tokio::time::Instant::now();
        while start.elapsed() < SOCKET_WAIT_TIMEOUT && !socket_path.exists() {
            sleep(SOCKET_POLL_INTERVAL).await;
        }
        assert!(
            socket_path.exists(),
            "Server socket did not appear within {SOCKET_WAIT_TIMEOUT:?}"
        );

        Self {
            socket_path,
            cancel_token,
            handle,
            _temp_dir: temp_dir,
        }
    }

    async fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.socket_path).await.expect("connect");
        let (read, write) = stream.into_split();
        TestClient {
            reader: FramedRead::new(read, WireCodec::new()),
            writer: FramedWrite::new(write, WireCodec::new()),
        }
    }
}

struct TestClient {
    reader: FramedRead<OwnedReadHalf, WireCodec>,
    writer: FramedWrite<OwnedWriteHalf, WireCodec>,
}

impl TestClient {
    async fn send(&mut self, message: WireMessage) {
        self.writer.send(message).await.expect("send");
    }

    async fn recv(&mut self) -> WireMessage {
        timeout(RECEIVE_TIMEOUT, self.reader.next())
            .await
            .expect("message before timeout")
            .expect("stream open")
            .expect("wire ok")
            .expect("well-formed message")
    }

    /// Receives until a frame response shows up, skipping notifications.
    async fn recv_response(&mut self) -> WireMessage {
        loop {
            let message = self.recv().await;
            if matches!(message, WireMessage::FrameResponse { .. }) {
                return message;
            }
        }
    }
}

fn gesture(name: &str) -> Gesture {
    Gesture {
        name: name.to_string(),
        label: name.to_string(),
    }
}

fn frame(value: u8) -> Frame {
    Frame::filled(3, 2, PixelFormat::Bgr8, value).unwrap()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_frame_round_trip_over_socket() {
    let server = TestServer::spawn(SimOptions::default(), vec![]).await;
    let mut client = server.connect().await;

    client.send(WireMessage::frame_request(10, frame(5))).await;
    assert_eq!(
        client.recv_response().await,
        WireMessage::frame_response(10, Some(frame(250)))
    );
}

#[tokio::test]
async fn test_frames_per_gesture_paces_challenge() {
    let options = SimOptions {
        frames_per_gesture: 3,
        ..Default::default()
    };
    let server = TestServer::spawn(options, vec![gesture("smile")]).await;
    let mut client = server.connect().await;
    assert_eq!(client.recv().await, WireMessage::text("Please perform: smile"));

    for seq in 1..=2 {
        client.send(WireMessage::frame_request(seq, frame(0))).await;
        assert!(matches!(client.recv().await, WireMessage::FrameResponse { .. }));
    }

    client.send(WireMessage::frame_request(3, frame(0))).await;
    assert!(matches!(client.recv().await, WireMessage::FrameResponse { seq: 3, .. }));
    assert_eq!(client.recv().await, WireMessage::text("gesture smile detected"));
    assert_eq!(client.recv().await, WireMessage::capture_prompt(true));
    assert_eq!(client.recv().await, WireMessage::alive(true));
}

#[tokio::test]
async fn test_dropped_sequence_gets_no_response() {
    let options = SimOptions {
        drop_seq: Some(1),
        ..Default::default()
    };
    let server = TestServer::spawn(options, vec![]).await;
    let mut client = server.connect().await;

    client.send(WireMessage::frame_request(1, frame(0))).await;
    client.send(WireMessage::frame_request(2, frame(0))).await;
    assert!(matches!(
        client.recv_response().await,
        WireMessage::FrameResponse { seq: 2, .. }
    ));
}

#[tokio::test]
async fn test_serves_next_client_after_disconnect() {
    let server = TestServer::spawn(SimOptions::default(), vec![]).await;

    let mut first = server.connect().await;
    first.send(WireMessage::frame_request(1, frame(0))).await;
    first.recv_response().await;
    drop(first);

    let mut second = server.connect().await;
    second.send(WireMessage::frame_request(1, frame(1))).await;
    assert_eq!(
        second.recv_response().await,
        WireMessage::frame_response(1, Some(frame(254)))
    );
}

#[tokio::test]
async fn test_shutdown_removes_socket() {
    let server = TestServer::spawn(SimOptions::default(), vec![]).await;
    let _client = server.connect().await;

    server.cancel_token.cancel();
    let outcome = timeout(RECEIVE_TIMEOUT, server.handle).await.unwrap().unwrap();

    assert_eq!(outcome, ServeOutcome::Shutdown);
    assert!(!server.socket_path.exists());
}

#[tokio::test]
async fn test_crash_leaves_socket_behind() {
    let options = SimOptions {
        crash_after: Some(1),
        ..Default::default()
    };
    let server = TestServer::spawn(options, vec![]).await;
    let mut client = server.connect().await;

    client.send(WireMessage::frame_request(1, frame(0))).await;
    let outcome = timeout(RECEIVE_TIMEOUT, server.handle).await.unwrap().unwrap();

    assert_eq!(outcome, ServeOutcome::Crashed);
    assert!(server.socket_path.exists());
}

#[tokio::test]
async fn test_stale_socket_file_is_replaced() {
    let temp_dir = tempfile::tempdir().unwrap();
    let socket_path = temp_dir.path().join("stale.sock");
    std::fs::write(&socket_path, b"stale").unwrap();

    let cancel_token = CancellationToken::new();
    let server = SimServer::new(socket_path.clone(), SimOptions::default(), vec![], cancel_token.clone());
    let handle = tokio::spawn(async move { server.run().await });

    let start = tokio::time::Instant::now();
    let mut connected = None;
    while start.elapsed() < SOCKET_WAIT_TIMEOUT {
        if let Ok(stream) = UnixStream::connect(&socket_path).await {
            connected = Some(stream);
            break;
        }
        sleep(SOCKET_POLL_INTERVAL).await;
    }
    assert!(connected.is_some());

    cancel_token.cancel();
    handle.await.unwrap().unwrap();
}
