//! Robustness tests: malformed traffic, server crashes and teardown races.
//!
//! These verify that the session:
//! 1. Survives malformed messages without dropping the connection
//! 2. Faults (and only faults) when the server process dies
//! 3. Recovers through an explicit restart
//! 4. Wakes blocked callers when stopped or dropped
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use liveness_client::{Frame, LivenessSession, PixelFormat, ServerConfig, SessionError, SessionState};
use tempfile::TempDir;
use tokio::time::{sleep, timeout, Instant};

const SIM_SERVER: &str = env!("CARGO_BIN_EXE_liveness-sim-server");

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

const STATE_WAIT: Duration = Duration::from_secs(3);

// ============================================================================
// Test Helpers
// ============================================================================

fn sim_config(dir: &TempDir, extra_args: &[&str]) -> ServerConfig {
    let model = dir.path().join("model.dat");
    std::fs::write(&model, b"landmarks").unwrap();
    let gestures = dir.path().join("gestures");
    std::fs::create_dir_all(&gestures).unwrap();
    for name in ["blink", "nod"] {
        std::fs::write(gestures.join(format!("{name}.json")), "{}").unwrap();
    }

    let font = dir.path().join("font.ttf");
    std::fs::write(&font, b"font").unwrap();

    ServerConfig::new(SIM_SERVER, model, gestures, font)
        .with_socket_path(dir.path().join("detector.sock"))
        .with_extra_args(extra_args.iter().copied())
}

fn frame(value: u8) -> Frame {
    Frame::filled(2, 2, PixelFormat::Gray8, value).unwrap()
}

fn socket_path(dir: &TempDir) -> PathBuf {
    dir.path().join("detector.sock")
}

/// True once the process has exited, counting an unreaped zombie as gone.
fn process_gone(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        Err(_) => true,
    }
}

async fn wait_for_state(session: &LivenessSession, expected: SessionState) -> bool {
    let start = Instant::now();
    while start.elapsed() < STATE_WAIT {
        if session.state() == expected {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    false
}

// ============================================================================
// Malformed Traffic
// ============================================================================

#[tokio::test]
async fn test_corrupt_messages_do_not_break_session() {
    let dir = tempfile::tempdir().unwrap();
    let session = LivenessSession::new(sim_config(&dir, &["--corrupt-after", "1"]));

    let texts = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = texts.clone();
    session.set_string_callback(move |t| sink.lock().unwrap().push(t.to_string()));
    session.start_server().await.unwrap();

    let first = session
        .process_frame_with_timeout(frame(10), RESPONSE_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(first, Some(frame(245)));

    // The notification sent right after the corrupt batch still arrives
    let start = Instant::now();
    while start.elapsed() < STATE_WAIT && !texts.lock().unwrap().iter().any(|t| t == "corruption sent") {
        sleep(Duration::from_millis(10)).await;
    }
    assert!(texts.lock().unwrap().iter().any(|t| t == "corruption sent"));

    let second = session
        .process_frame_with_timeout(frame(20), RESPONSE_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(second, Some(frame(235)));
    assert_eq!(session.state(), SessionState::Ready);

    session.stop_server().await;
}

#[tokio::test]
async fn test_panicking_callback_does_not_stop_listener() {
    let dir = tempfile::tempdir().unwrap();
    let session = LivenessSession::new(sim_config(&dir, &[]));
    session.set_take_picture_callback(|_| panic!("callback bug"));

    session.start_server().await.unwrap();
    for value in 0..3u8 {
        let output = session
            .process_frame_with_timeout(frame(value), RESPONSE_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(output, Some(frame(255 - value)));
    }
    assert_eq!(session.state(), SessionState::Ready);

    session.stop_server().await;
}

// ============================================================================
// Server Crashes
// ============================================================================

#[tokio::test]
async fn test_crash_faults_session_and_restart_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let session = LivenessSession::new(sim_config(&dir, &["--crash-after", "2"]));
    session.start_server().await.unwrap();
    let first_pid = session.server_pid().unwrap();

    let output = session
        .process_frame_with_timeout(frame(0), RESPONSE_TIMEOUT)
        .await
        .unwrap();
    assert!(output.is_some());

    // The server dies on this frame instead of answering
    let result = session
        .process_frame_with_timeout(frame(0), RESPONSE_TIMEOUT)
        .await;
    assert!(matches!(result, Err(SessionError::NotRunning)));

    assert!(wait_for_state(&session, SessionState::Faulted).await);
    assert!(!session.is_running());
    assert!(matches!(
        session.process_frame(frame(0)).await,
        Err(SessionError::NotRunning)
    ));
    assert!(matches!(
        session.set_warning_message("x").await,
        Err(SessionError::NotRunning)
    ));
    assert!(process_gone(first_pid));

    session.start_server().await.unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    assert_ne!(session.server_pid(), Some(first_pid));

    let output = session
        .process_frame_with_timeout(frame(3), RESPONSE_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(output, Some(frame(252)));

    session.stop_server().await;
    assert_eq!(session.state(), SessionState::Stopped);
}

#[tokio::test]
async fn test_killed_server_detected_on_next_call() {
    let dir = tempfile::tempdir().unwrap();
    let session = LivenessSession::new(sim_config(&dir, &[]));
    session.start_server().await.unwrap();
    let pid = session.server_pid().unwrap();

    kill_server(pid);
    sleep(Duration::from_millis(200)).await;

    let result = session.process_frame(frame(0)).await;
    assert!(matches!(result, Err(SessionError::NotRunning)));
    assert!(wait_for_state(&session, SessionState::Faulted).await);

    session.stop_server().await;
    assert_eq!(session.state(), SessionState::Stopped);
    assert!(!socket_path(&dir).exists());
}

fn kill_server(pid: u32) {
    std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .expect("run kill");
}

// ============================================================================
// Teardown Races
// ============================================================================

#[tokio::test]
async fn test_stop_wakes_blocked_caller() {
    let dir = tempfile::tempdir().unwrap();
    let session = Arc::new(LivenessSession::new(sim_config(&dir, &["--drop-seq", "1"])));
    session.start_server().await.unwrap();

    let waiter = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .process_frame_with_timeout(frame(0), Duration::from_secs(30))
                .await
        })
    };

    sleep(Duration::from_millis(100)).await;
    session.stop_server().await;

    let result = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    assert!(matches!(result, Err(SessionError::NotRunning)));
}

#[tokio::test]
async fn test_drop_kills_server() {
    let dir = tempfile::tempdir().unwrap();
    let session = LivenessSession::new(sim_config(&dir, &[]));
    session.start_server().await.unwrap();
    let pid = session.server_pid().unwrap();

    drop(session);

    let start = Instant::now();
    while start.elapsed() < STATE_WAIT && !process_gone(pid) {
        sleep(Duration::from_millis(20)).await;
    }
    assert!(process_gone(pid));
}
