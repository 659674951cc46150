//! Simulated liveness detector server
//!
//! Accepts the same command line as the native detector and serves the
//! detector socket protocol, answering frames with inverted copies and
//! completing one gesture every `--frames-per-gesture` frames.
//!
//! # Usage
//!
//! ```bash
//! liveness-sim-server \
//!     --model_path model.dat \
//!     --gestures_folder_path ./gestures \
//!     --language en \
//!     --socket_path /tmp/liveness.sock \
//!     --num_gestures 2
//!
//! # Enable debug logging
//! RUST_LOG=liveness_sim=debug liveness-sim-server ...
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown, removes the socket, exits 0

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use liveness_sim::{GestureSet, ServeOutcome, SimOptions, SimServer};

/// Exit code used when a crash is simulated.
const CRASH_EXIT_CODE: i32 = 70;

/// Separator for multi-path and multi-name arguments.
const LIST_SEPARATOR: char = ':';

/// Simulated liveness detector server
#[derive(Parser, Debug)]
#[command(name = "liveness-sim-server", version, about)]
struct Args {
    /// Face landmark model file (only checked for readability)
    #[arg(long = "model_path")]
    model_path: PathBuf,

    /// Gesture directories, separated by ':'
    #[arg(long = "gestures_folder_path")]
    gestures_folder_path: String,

    /// Prompt language
    #[arg(long = "language", default_value = "en")]
    language: String,

    /// Unix socket to listen on
    #[arg(long = "socket_path")]
    socket_path: PathBuf,

    /// Gestures in one challenge
    #[arg(long = "num_gestures", default_value_t = 2)]
    num_gestures: usize,

    /// Font for prompts (accepted, unused)
    #[arg(long = "font_path")]
    font_path: Option<PathBuf>,

    /// Localization directories, separated by ':' (accepted, unused)
    #[arg(long = "locales_paths")]
    locales_paths: Option<String>,

    /// Restrict the challenge to these gestures, separated by ':'
    #[arg(long = "gestures_list")]
    gestures_list: Option<String>,

    #[command(flatten)]
    sim: SimArgs,
}

/// Misbehaviour knobs for client tests.
#[derive(clap::Args, Debug)]
struct SimArgs {
    /// Frames needed to complete one gesture
    #[arg(long, default_value_t = 1)]
    frames_per_gesture: u64,

    /// Swap each consecutive pair of frame responses
    #[arg(long)]
    reorder_pairs: bool,

    /// Delay the response to this sequence number
    #[arg(long, requires = "delay_ms")]
    delay_seq: Option<u64>,

    /// Length of the delay for --delay-seq
    #[arg(long)]
    delay_ms: Option<u64>,

    /// Never answer this sequence number
    #[arg(long)]
    drop_seq: Option<u64>,

    /// Send malformed messages after this many responses
    #[arg(long)]
    corrupt_after: Option<u64>,

    /// Exit abruptly on receiving this many frames
    #[arg(long)]
    crash_after: Option<u64>,
}

impl SimArgs {
    fn into_options(self) -> SimOptions {
        let defaults = SimOptions::default();
        SimOptions {
            frames_per_gesture: self.frames_per_gesture.max(1),
            reorder_pairs: self.reorder_pairs,
            delay_seq: self.delay_seq,
            delay: self.delay_ms.map(Duration::from_millis).unwrap_or(defaults.delay),
            drop_seq: self.drop_seq,
            corrupt_after: self.corrupt_after,
            crash_after: self.crash_after,
        }
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(LIST_SEPARATOR).filter(|s| !s.is_empty())
}

fn main() -> Result<()> {
    let args = Args::parse();

    match run_server(args)? {
        ServeOutcome::Shutdown => Ok(()),
        ServeOutcome::Crashed => process::exit(CRASH_EXIT_CODE),
    }
}

#[tokio::main]
async fn run_server(args: Args) -> Result<ServeOutcome> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("liveness_sim=info".parse()?)
                .add_directive("liveness_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        language = %args.language,
        "Simulated detector starting"
    );

    std::fs::File::open(&args.model_path)
        .with_context(|| format!("Cannot read model {}", args.model_path.display()))?;

    let dirs: Vec<PathBuf> = split_list(&args.gestures_folder_path).map(PathBuf::from).collect();
    if dirs.is_empty() {
        bail!("--gestures_folder_path names no directories");
    }
    let allow: Vec<String> = args
        .gestures_list
        .as_deref()
        .map(|raw| split_list(raw).map(str::to_string).collect())
        .unwrap_or_default();

    let gestures = GestureSet::load(&dirs, &allow).context("Failed to load gestures")?;
    let challenge = gestures.challenge(args.num_gestures)?;
    info!(
        gestures = ?challenge.iter().map(|g| g.name.as_str()).collect::<Vec<_>>(),
        "Challenge selected"
    );

    let cancel_token = CancellationToken::new();

    // Register handlers before binding so an early SIGTERM is not lost
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        shutdown_token.cancel();
    });

    let server = SimServer::new(&args.socket_path, args.sim.into_options(), challenge, cancel_token);
    match server.run().await {
        Ok(outcome) => {
            info!(?outcome, "Simulated detector stopped");
            Ok(outcome)
        }
        Err(e) => {
            error!(error = %e, "Server error");
            Err(e.into())
        }
    }
}
