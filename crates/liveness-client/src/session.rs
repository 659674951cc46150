//! The liveness session facade.
//!
//! [`LivenessSession`] is what applications hold. It launches the detector
//! server, connects to it, and then:
//! - Sends frames and correlates each response with its request by sequence number
//! - Runs a listener task that routes notifications to registered callbacks
//! - Forwards overwrite/warning text as one-way control commands
//! - Tears everything down on [`stop_server`](LivenessSession::stop_server),
//!   on drop, or when the server dies
//!
//! # State Machine
//!
//! ```text
//! Idle ──start──▶ Starting ──ok──▶ Ready ──stop──▶ Stopping ──▶ Stopped
//!                    │                │                            │
//!                    └─fail─▶ Faulted ◀┘ transport/process failure  │
//!                                │                                 │
//!                                └──────────── start ◀─────────────┘
//! ```
//!
//! A `Faulted` session accepts no frames until it is started again.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use liveness_core::{Frame, ServerConfig};
use liveness_protocol::{WireMessage, MAX_MESSAGE_SIZE};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{CallbackRegistry, Notification};
use crate::error::{Result, SessionError, TransportError};
use crate::pending::PendingRequests;
use crate::supervisor::{LaunchOptions, ServerProcess};
use crate::transport::{self, ConnectOptions, ConnectionReader, ConnectionWriter};

/// How long [`LivenessSession::process_frame`] waits by default (about one
/// frame at 30 fps).
pub const DEFAULT_FRAME_TIMEOUT: Duration = Duration::from_millis(33);

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for a [`LivenessSession`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Default wait for a frame response.
    pub frame_timeout: Duration,

    /// Server launch and shutdown timing.
    pub launch: LaunchOptions,

    /// Connection retry and write timing.
    pub connect: ConnectOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
            launch: LaunchOptions::default(),
            connect: ConnectOptions::default(),
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Ready,
    Stopping,
    Stopped,
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Shared State
// ============================================================================

/// Server process and write half, torn down together.
struct Link {
    server: ServerProcess,
    writer: ConnectionWriter,
    cancel: CancellationToken,
}

struct Inner {
    state: SessionState,
    link: Option<Arc<Link>>,
}

/// State reachable from both callers and the listener task.
struct Shared {
    inner: Mutex<Inner>,
    pending: PendingRequests,
    callbacks: CallbackRegistry,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> SessionState {
        self.lock().state
    }

    fn set_state(&self, state: SessionState) {
        self.lock().state = state;
    }

    fn current_link(&self) -> Option<Arc<Link>> {
        self.lock().link.clone()
    }

    /// Publishes a freshly connected link and marks the session ready.
    fn install(&self, link: Arc<Link>) {
        let mut inner = self.lock();
        inner.link = Some(link);
        inner.state = SessionState::Ready;
    }

    /// Detaches the link for an orderly stop.
    fn begin_stop(&self) -> Option<Arc<Link>> {
        let mut inner = self.lock();
        inner.state = SessionState::Stopping;
        inner.link.take()
    }

    /// Moves a ready session to `Faulted` and tears its link down.
    ///
    /// Returns `false` if the link was already gone, meaning a stop or an
    /// earlier fault got there first.
    async fn fault(&self, reason: &(dyn fmt::Display + Sync)) -> bool {
        let link = {
            let mut inner = self.lock();
            let Some(link) = inner.link.take() else {
                return false;
            };
            inner.state = SessionState::Faulted;
            link
        };

        error!(reason = %reason, pid = link.server.pid(), "Detector session faulted");
        link.cancel.cancel();
        let woken = self.pending.fail_all();
        if woken > 0 {
            debug!(woken, "Woke pending frame requests");
        }
        link.writer.close().await;
        link.server.stop().await;
        true
    }

    fn route(&self, message: WireMessage) {
        match message {
            WireMessage::FrameResponse { seq, frame } => {
                if !self.pending.complete(seq, frame) {
                    debug!(seq, "Discarding response with no waiting request");
                }
            }
            other => match Notification::try_from(other) {
                Ok(notification) => {
                    self.callbacks.dispatch(&notification);
                }
                Err(unexpected) => {
                    warn!(tag = ?unexpected.tag(), "Ignoring message of unexpected type from server");
                }
            },
        }
    }
}

/// Reads server messages until cancelled or the connection fails.
async fn listen(shared: Arc<Shared>, mut reader: ConnectionReader, cancel: CancellationToken) {
    debug!("Listener started");
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Listener cancelled");
                return;
            }
            received = reader.receive() => received,
        };

        match received {
            Ok(Ok(message)) => shared.route(message),
            Ok(Err(e)) => {
                warn!(error = %e, "Discarding malformed message from server");
            }
            Err(e) => {
                shared.fault(&e).await;
                return;
            }
        }
    }
}

struct Running {
    link: Arc<Link>,
    listener: JoinHandle<()>,
}

// ============================================================================
// Liveness Session
// ============================================================================

/// Client-side handle to one detector server.
///
/// All methods take `&self`; wrap the session in an `Arc` to submit frames
/// from several tasks at once.
///
/// # Example
///
/// ```rust,ignore
/// let config = ServerConfig::new(
///     "/opt/liveness/server",
///     "/opt/liveness/model.dat",
///     "/opt/liveness/gestures",
///     "/opt/liveness/fonts/DejaVuSans.ttf",
/// );
/// let session = LivenessSession::new(config);
/// session.set_report_alive_callback(|alive| println!("alive: {alive}"));
/// session.start_server().await?;
///
/// let annotated = session.process_frame(frame).await?;
/// session.stop_server().await;
/// ```
pub struct LivenessSession {
    config: ServerConfig,
    options: SessionOptions,
    shared: Arc<Shared>,
    lifecycle: tokio::sync::Mutex<Option<Running>>,
    next_seq: AtomicU64,
}

impl LivenessSession {
    /// Creates an idle session with default options.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self::with_options(config, SessionOptions::default())
    }

    #[must_use]
    pub fn with_options(config: ServerConfig, options: SessionOptions) -> Self {
        Self {
            config,
            options,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: SessionState::Idle,
                    link: None,
                }),
                pending: PendingRequests::new(),
                callbacks: CallbackRegistry::new(),
            }),
            lifecycle: tokio::sync::Mutex::new(None),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// True while the session is ready and its server process is alive.
    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Ready
            && self.shared.current_link().is_some_and(|link| link.server.is_alive())
    }

    /// Process id of the current server, if one is running.
    pub fn server_pid(&self) -> Option<u32> {
        self.shared.current_link().and_then(|link| link.server.pid())
    }

    /// Launches the server and connects to it.
    ///
    /// A no-op when already ready. From `Faulted` the remains of the failed
    /// run are cleaned up first. On failure the session ends up `Faulted`
    /// with no process left behind.
    pub async fn start_server(&self) -> Result<()> {
        let mut running = self.lifecycle.lock().await;

        if self.state() == SessionState::Ready {
            debug!("Detector server already running");
            return Ok(());
        }
        if let Some(previous) = running.take() {
            self.teardown(previous).await;
        }

        self.shared.set_state(SessionState::Starting);
        info!(
            executable = %self.config.executable_path.display(),
            socket_path = %self.config.socket_path.display(),
            "Starting detector server"
        );

        match self.launch().await {
            Ok(started) => {
                *running = Some(started);
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(SessionState::Faulted);
                error!(error = %e, "Failed to start detector server");
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<Running> {
        let server = ServerProcess::launch(&self.config, &self.options.launch).await?;

        let connection = match transport::connect(&self.config.socket_path, &self.options.connect).await {
            Ok(connection) => connection,
            Err(e) => {
                server.stop().await;
                return Err(e.into());
            }
        };

        let (reader, writer) = connection.into_split(self.options.connect.write_timeout);
        let cancel = CancellationToken::new();
        let link = Arc::new(Link {
            server,
            writer,
            cancel: cancel.clone(),
        });

        self.shared.install(link.clone());
        let listener = tokio::spawn(listen(self.shared.clone(), reader, cancel));
        info!(pid = link.server.pid(), "Detector session ready");

        Ok(Running { link, listener })
    }

    /// Stops the listener, closes the connection and stops the server.
    ///
    /// Every caller blocked in [`process_frame`](Self::process_frame) wakes
    /// with [`SessionError::NotRunning`]. Safe to call repeatedly.
    pub async fn stop_server(&self) {
        let mut running = self.lifecycle.lock().await;
        match running.take() {
            Some(previous) => self.teardown(previous).await,
            None => {
                if self.state() == SessionState::Faulted {
                    self.shared.set_state(SessionState::Stopped);
                }
                debug!(state = %self.state(), "Detector server not running");
            }
        }
    }

    async fn teardown(&self, running: Running) {
        let Running { link, listener } = running;

        let _ = self.shared.begin_stop();
        link.cancel.cancel();
        let woken = self.shared.pending.fail_all();
        link.writer.close().await;

        if let Err(e) = listener.await {
            warn!(error = %e, "Listener task ended abnormally");
        }
        link.server.stop().await;

        self.shared.set_state(SessionState::Stopped);
        info!(woken, "Detector server stopped");
    }

    /// Submits a frame and waits up to the default frame timeout.
    ///
    /// Returns `Ok(None)` when the server sent no frame back or the wait
    /// timed out. A response that arrives after the timeout is discarded.
    pub async fn process_frame(&self, frame: Frame) -> Result<Option<Frame>> {
        self.process_frame_with_timeout(frame, self.options.frame_timeout).await
    }

    /// Like [`process_frame`](Self::process_frame) with an explicit wait.
    pub async fn process_frame_with_timeout(&self, frame: Frame, wait: Duration) -> Result<Option<Frame>> {
        let link = self.ready_link().await?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let request = WireMessage::frame_request(seq, frame);
        check_size(&request)?;
        let reply = self.shared.pending.register(seq);

        if let Err(e) = link.writer.send(request).await {
            self.shared.pending.cancel(seq);
            return Err(self.on_send_failure(e).await);
        }

        match timeout(wait, reply).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(SessionError::NotRunning),
            Err(_) => {
                self.shared.pending.cancel(seq);
                debug!(seq, timeout_ms = wait.as_millis() as u64, "Frame response timed out");
                Ok(None)
            }
        }
    }

    /// Replaces the text the server draws over its prompt.
    pub async fn set_overwrite_text(&self, text: impl Into<String>) -> Result<()> {
        self.send_control(WireMessage::overwrite_text(text)).await
    }

    /// Replaces the warning line the server shows.
    pub async fn set_warning_message(&self, text: impl Into<String>) -> Result<()> {
        self.send_control(WireMessage::warning_text(text)).await
    }

    async fn send_control(&self, message: WireMessage) -> Result<()> {
        let link = self.ready_link().await?;
        check_size(&message)?;
        match link.writer.send(message).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.on_send_failure(e).await),
        }
    }

    /// Registry behind the typed callback setters.
    pub fn callbacks(&self) -> &CallbackRegistry {
        &self.shared.callbacks
    }

    /// Handler for status text notifications.
    pub fn set_string_callback<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.shared.callbacks.set_string_callback(callback);
    }

    /// Handler for the liveness verdict.
    pub fn set_report_alive_callback<F>(&self, callback: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.shared.callbacks.set_report_alive_callback(callback);
    }

    /// Handler for capture prompts.
    pub fn set_take_picture_callback<F>(&self, callback: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.shared.callbacks.set_take_picture_callback(callback);
    }

    /// Returns the live link, or faults the session if its server died.
    async fn ready_link(&self) -> Result<Arc<Link>> {
        if self.state() != SessionState::Ready {
            return Err(SessionError::NotRunning);
        }
        let link = self.shared.current_link().ok_or(SessionError::NotRunning)?;
        if !link.server.is_alive() {
            self.shared.fault(&"detector server process exited").await;
            return Err(SessionError::NotRunning);
        }
        Ok(link)
    }

    async fn on_send_failure(&self, err: TransportError) -> SessionError {
        if self.shared.fault(&err).await {
            SessionError::Transport(err)
        } else {
            SessionError::NotRunning
        }
    }
}

/// Rejects a message the codec would refuse, before any byte is written.
fn check_size(message: &WireMessage) -> Result<()> {
    let size = message.body_len();
    if size > MAX_MESSAGE_SIZE {
        warn!(size, max = MAX_MESSAGE_SIZE, tag = ?message.tag(), "Message too large, not sent");
        return Err(SessionError::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

impl Drop for LivenessSession {
    fn drop(&mut self) {
        if let Some(link) = self.shared.lock().link.take() {
            link.cancel.cancel();
        }
        if let Some(running) = self.lifecycle.get_mut().take() {
            running.link.cancel.cancel();
            running.listener.abort();
        }
        self.shared.pending.fail_all();
    }
}

impl fmt::Debug for LivenessSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LivenessSession")
            .field("state", &self.state())
            .field("socket_path", &self.config.socket_path)
            .field("pending", &self.shared.pending.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConnectError, LaunchError};
    use liveness_core::PixelFormat;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn script_config(dir: &TempDir, body: &str) -> ServerConfig {
        let exe = dir.path().join("server.sh");
        fs::write(&exe, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
        let model = dir.path().join("model.bin");
        fs::write(&model, b"model").unwrap();
        let gestures = dir.path().join("gestures");
        fs::create_dir(&gestures).unwrap();
        let font = dir.path().join("font.ttf");
        fs::write(&font, b"font").unwrap();
        ServerConfig::new(exe, model, gestures, font).with_socket_path(dir.path().join("s.sock"))
    }

    fn fast_options() -> SessionOptions {
        SessionOptions {
            frame_timeout: DEFAULT_FRAME_TIMEOUT,
            launch: LaunchOptions {
                startup_timeout: Duration::from_millis(500),
                poll_interval: Duration::from_millis(10),
                stop_grace: Duration::from_millis(200),
            },
            connect: ConnectOptions {
                timeout: Duration::from_millis(200),
                ..Default::default()
            },
        }
    }

    fn frame() -> Frame {
        Frame::filled(4, 4, PixelFormat::Bgr8, 1).unwrap()
    }

    #[test]
    fn test_default_options() {
        let options = SessionOptions::default();
        assert_eq!(options.frame_timeout, Duration::from_millis(33));
    }

    #[tokio::test]
    async fn test_idle_session_rejects_work() {
        let dir = TempDir::new().unwrap();
        let session = LivenessSession::new(script_config(&dir, "exit 0"));

        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.is_running());
        assert!(matches!(
            session.process_frame(frame()).await,
            Err(SessionError::NotRunning)
        ));
        assert!(matches!(
            session.set_overwrite_text("hi").await,
            Err(SessionError::NotRunning)
        ));

        session.stop_server().await;
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_launch_failure_faults_then_stop_recovers() {
        let dir = TempDir::new().unwrap();
        let mut config = script_config(&dir, "exit 0");
        config.executable_path = dir.path().join("missing");
        let session = LivenessSession::with_options(config, fast_options());

        let err = session.start_server().await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Launch(LaunchError::ExecutableNotFound { .. })
        ));
        assert_eq!(session.state(), SessionState::Faulted);

        session.stop_server().await;
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_connect_failure_stops_server() {
        let dir = TempDir::new().unwrap();
        // Creates a plain file where the socket should be, so connects fail
        let pid_file = dir.path().join("pid");
        let config = script_config(
            &dir,
            &format!("echo $$ > {}\ntouch \"$8\"\nexec sleep 30", pid_file.display()),
        );
        let session = LivenessSession::with_options(config, fast_options());

        let err = session.start_server().await.unwrap_err();
        assert!(matches!(err, SessionError::Connect(ConnectError::Timeout { .. })));
        assert_eq!(session.state(), SessionState::Faulted);
        assert!(session.server_pid().is_none());

        let pid = fs::read_to_string(&pid_file).unwrap();
        assert!(!std::path::Path::new(&format!("/proc/{}", pid.trim())).exists());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Faulted.to_string(), "faulted");
        assert_eq!(SessionState::Ready.to_string(), "ready");
    }
}
