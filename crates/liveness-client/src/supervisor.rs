//! Detector server process supervision.
//!
//! [`ServerProcess`] owns the spawned detector server for one session:
//! - Validates the configuration and clears stale sockets before spawning
//! - Waits until the server starts listening (or fails trying)
//! - Forwards the server's stdout/stderr into `tracing`
//! - Stops the server with SIGTERM, escalating to SIGKILL after a grace period
//!
//! The child is spawned with `kill_on_drop`, so dropping the handle never
//! leaves an orphaned server behind.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use liveness_core::ServerConfig;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::LaunchError;

// ============================================================================
// Configuration
// ============================================================================

/// Timing knobs for launching and stopping the server.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// How long the server may take to start listening.
    pub startup_timeout: Duration,

    /// Interval between readiness checks during startup.
    pub poll_interval: Duration,

    /// How long to wait after SIGTERM before sending SIGKILL.
    pub stop_grace: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(20),
            stop_grace: Duration::from_secs(2),
        }
    }
}

// ============================================================================
// Process State
// ============================================================================

/// Observable state of a supervised server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// The process is alive.
    Running,
    /// The process exited on its own.
    Exited { code: Option<i32> },
    /// The process was stopped through [`ServerProcess::stop`].
    Stopped,
}

enum Slot {
    Running(Child),
    Exited(Option<i32>),
    Stopped,
}

// ============================================================================
// Server Process
// ============================================================================

/// Handle to a running detector server.
pub struct ServerProcess {
    pid: Option<u32>,
    socket_path: PathBuf,
    stop_grace: Duration,
    slot: Mutex<Slot>,
}

impl ServerProcess {
    /// Validates `config`, spawns the server and waits until it listens.
    ///
    /// On any failure after the spawn the child is killed and reaped before
    /// the error is returned.
    pub async fn launch(config: &ServerConfig, options: &LaunchOptions) -> Result<Self, LaunchError> {
        config.validate()?;
        prepare_socket(&config.socket_path).await?;

        let mut child = Command::new(&config.executable_path)
            .args(config.launch_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                path: config.executable_path.clone(),
                source,
            })?;

        let pid = child.id();
        info!(
            pid,
            executable = %config.executable_path.display(),
            socket_path = %config.socket_path.display(),
            "Spawned detector server"
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, pid, OutputStream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, pid, OutputStream::Stderr));
        }

        wait_until_listening(&mut child, &config.socket_path, options).await?;
        info!(pid, "Detector server is listening");

        Ok(Self {
            pid,
            socket_path: config.socket_path.clone(),
            stop_grace: options.stop_grace,
            slot: Mutex::new(Slot::Running(child)),
        })
    }

    /// OS process id, if the child was assigned one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Socket path the server listens on.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Non-blocking liveness check. Reaps the child if it has exited.
    pub fn is_alive(&self) -> bool {
        let mut slot = self.lock_slot();
        let Slot::Running(child) = &mut *slot else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!(pid = self.pid, code = ?status.code(), "Detector server exited unexpectedly");
                *slot = Slot::Exited(status.code());
                false
            }
            Err(e) => {
                warn!(pid = self.pid, error = %e, "Failed to poll detector server");
                false
            }
        }
    }

    /// Current process state, refreshed with a non-blocking poll.
    pub fn state(&self) -> ProcessState {
        self.is_alive();
        match &*self.lock_slot() {
            Slot::Running(_) => ProcessState::Running,
            Slot::Exited(code) => ProcessState::Exited { code: *code },
            Slot::Stopped => ProcessState::Stopped,
        }
    }

    /// Stops the server and removes its socket file.
    ///
    /// Sends SIGTERM, waits up to the grace period, then kills. Calling this
    /// again after the process is gone is a no-op.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lock_slot(), Slot::Stopped);
        match previous {
            Slot::Running(child) => {
                terminate(child, self.pid, self.stop_grace).await;
                remove_socket(&self.socket_path);
            }
            Slot::Exited(code) => {
                debug!(pid = self.pid, code = ?code, "Detector server already exited");
                remove_socket(&self.socket_path);
            }
            Slot::Stopped => {}
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Slot::Running(child) = slot {
            debug!(pid = self.pid, "Killing detector server on drop");
            if let Err(e) = child.start_kill() {
                debug!(pid = self.pid, error = %e, "start_kill failed");
            }
            remove_socket(&self.socket_path);
        }
    }
}

impl std::fmt::Debug for ServerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerProcess")
            .field("pid", &self.pid)
            .field("socket_path", &self.socket_path)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Refuses a socket that something is still serving; removes a stale one.
async fn prepare_socket(path: &Path) -> Result<(), LaunchError> {
    if !path.exists() {
        return Ok(());
    }
    if UnixStream::connect(path).await.is_ok() {
        return Err(LaunchError::AddressInUse {
            path: path.to_path_buf(),
        });
    }
    info!(socket_path = %path.display(), "Removing stale socket file");
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LaunchError::Spawn {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

async fn wait_until_listening(
    child: &mut Child,
    socket_path: &Path,
    options: &LaunchOptions,
) -> Result<(), LaunchError> {
    let deadline = Instant::now() + options.startup_timeout;

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                warn!(code = ?status.code(), "Detector server exited during startup");
                return Err(LaunchError::ExitedDuringStartup { code: status.code() });
            }
            Ok(None) => {}
            Err(e) => {
                kill_and_reap(child).await;
                return Err(LaunchError::Spawn {
                    path: socket_path.to_path_buf(),
                    source: e,
                });
            }
        }

        if socket_path.exists() {
            return Ok(());
        }

        if Instant::now() >= deadline {
            warn!(
                timeout_ms = options.startup_timeout.as_millis() as u64,
                "Detector server did not start listening in time"
            );
            kill_and_reap(child).await;
            remove_socket(socket_path);
            return Err(LaunchError::StartupTimeout {
                timeout: options.startup_timeout,
            });
        }

        sleep(options.poll_interval).await;
    }
}

async fn terminate(mut child: Child, pid: Option<u32>, grace: Duration) {
    match pid {
        Some(raw) => send_sigterm(raw),
        None => {
            // Already reaped by tokio
            let _ = child.wait().await;
            return;
        }
    }

    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            info!(pid, code = ?status.code(), "Detector server stopped");
        }
        Ok(Err(e)) => {
            warn!(pid, error = %e, "Failed waiting for detector server");
        }
        Err(_) => {
            warn!(
                pid,
                grace_ms = grace.as_millis() as u64,
                "Detector server ignored SIGTERM, killing"
            );
            kill_and_reap(&mut child).await;
        }
    }
}

fn send_sigterm(pid: u32) {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(raw, libc::SIGTERM) };
    if rc != 0 {
        debug!(pid, error = %io::Error::last_os_error(), "SIGTERM failed");
    }
}

async fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Failed to kill detector server");
    }
}

fn remove_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(socket_path = %path.display(), "Removed socket file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(socket_path = %path.display(), error = %e, "Failed to remove socket file"),
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

async fn forward_output<R>(stream: R, pid: Option<u32>, kind: OutputStream)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match kind {
                OutputStream::Stdout => debug!(target: "liveness_client::server", pid, "{line}"),
                OutputStream::Stderr => warn!(target: "liveness_client::server", pid, "{line}"),
            },
            Ok(None) => break,
            Err(e) => {
                debug!(pid, error = %e, "Stopped forwarding server output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Writes `body` as an executable shell script plus the assets a
    /// config needs. The socket path is the script's `$8`.
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

        ServerConfig::new(exe, model, gestures, font).with_socket_path(dir.path().join("server.sock"))
    }

    fn fast_options() -> LaunchOptions {
        LaunchOptions {
            startup_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
            stop_grace: Duration::from_millis(300),
        }
    }

    #[tokio::test]
    async fn test_launch_and_stop() {
        let dir = TempDir::new().unwrap();
        let config = script_config(&dir, "touch \"$8\"\nexec sleep 30");

        let server = ServerProcess::launch(&config, &fast_options()).await.unwrap();
        assert!(server.is_alive());
        assert_eq!(server.state(), ProcessState::Running);
        assert!(server.pid().is_some());

        server.stop().await;
        assert!(!server.is_alive());
        assert_eq!(server.state(), ProcessState::Stopped);
        assert!(!config.socket_path.exists());

        // Second stop is a no-op
        server.stop().await;
        assert_eq!(server.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_escalates_when_sigterm_ignored() {
        let dir = TempDir::new().unwrap();
        let config = script_config(
            &dir,
            "trap '' TERM\ntouch \"$8\"\nwhile true; do sleep 1; done",
        );

        let server = ServerProcess::launch(&config, &fast_options()).await.unwrap();
        let started = std::time::Instant::now();
        server.stop().await;

        assert!(!server.is_alive());
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let dir = TempDir::new().unwrap();
        let mut config = script_config(&dir, "exit 0");
        config.executable_path = dir.path().join("missing");

        let err = ServerProcess::launch(&config, &fast_options()).await.unwrap_err();
        assert!(matches!(err, LaunchError::ExecutableNotFound { .. }));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_spawn() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("ran");
        let mut config = script_config(&dir, &format!("touch {}", marker.display()));
        config.model_path = dir.path().join("missing-model");

        let err = ServerProcess::launch(&config, &fast_options()).await.unwrap_err();
        assert!(matches!(err, LaunchError::InvalidConfig(_)));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_exit_during_startup() {
        let dir = TempDir::new().unwrap();
        let config = script_config(&dir, "echo 'no camera' >&2\nexit 3");

        let err = ServerProcess::launch(&config, &fast_options()).await.unwrap_err();
        assert!(matches!(err, LaunchError::ExitedDuringStartup { code: Some(3) }));
    }

    #[tokio::test]
    async fn test_startup_timeout() {
        let dir = TempDir::new().unwrap();
        let config = script_config(&dir, "exec sleep 30");

        let err = ServerProcess::launch(&config, &fast_options()).await.unwrap_err();
        assert!(matches!(err, LaunchError::StartupTimeout { .. }));
    }

    #[tokio::test]
    async fn test_address_in_use() {
        let dir = TempDir::new().unwrap();
        let config = script_config(&dir, "touch \"$8\"\nexec sleep 30");
        let _listener = tokio::net::UnixListener::bind(&config.socket_path).unwrap();

        let err = ServerProcess::launch(&config, &fast_options()).await.unwrap_err();
        assert!(matches!(err, LaunchError::AddressInUse { .. }));
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = TempDir::new().unwrap();
        let config = script_config(&dir, "sleep 0.1\ntouch \"$8\"\nexec sleep 30");
        fs::write(&config.socket_path, b"").unwrap();

        let server = ServerProcess::launch(&config, &fast_options()).await.unwrap();
        assert!(server.is_alive());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_observed() {
        let dir = TempDir::new().unwrap();
        let config = script_config(&dir, "touch \"$8\"\nsleep 0.2\nexit 7");

        let server = ServerProcess::launch(&config, &fast_options()).await.unwrap();
        sleep(Duration::from_millis(600)).await;

        assert!(!server.is_alive());
        assert_eq!(server.state(), ProcessState::Exited { code: Some(7) });
        server.stop().await;
        assert_eq!(server.state(), ProcessState::Stopped);
    }
}
