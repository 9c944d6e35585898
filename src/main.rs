//! # Starling Multicast File Receiver
//!
//! A command-line receiver for a reliable file-transfer protocol layered
//! over IP multicast: one sender broadcasts a file's blocks to a group,
//! every receiver tracks its own gaps and reports them so the sender can
//! retransmit, with no receiver-specific unicast retransmission.
//!
//! ## Features
//!
//! - Per-file handshake over a point-to-point control channel
//! - Multicast group reception with shared-port binding (IPv4 and IPv6)
//! - Gap tracking per block with periodic status reports to the sender
//! - Concurrent downloads, each independently stoppable
//! - Progress bars and operator log driven by a session event channel
//! - File content verification against the sender's hash
//!
//! ## Usage
//!
//! ```bash
//! starling <host> <port> <file>...
//! starling <host> <port> <file> -o <output-dir> -t <seconds>
//! ```
//!
//! ## Architecture
//!
//! The client follows a multi-threaded architecture:
//!
//! - **Main thread**: Parses arguments, starts the downloads, owns the
//!   display and drains the session event channel
//! - **Session threads**: Each drives one download end to end
//! - **Channels**: Sessions report progress and log lines to the display

#[macro_use]
extern crate log;

mod bitmask;
mod engine;
mod error;
mod handshake;
mod message;
mod observer;
mod registry;
mod session;
mod storage;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use engine::{Config, Engine};
use observer::TransferEvent;
use registry::SessionHandle;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A reliable multicast file-transfer receiver, written in Rust."
)]
struct Args {
    /// Sender host name or address (IPv6 preferred when both resolve)
    host: String,

    /// Sender control port
    port: u16,

    /// Files to download
    #[arg(required = true)]
    files: Vec<String>,

    /// Directory where received files are stored (defaults to the working
    /// directory)
    #[arg(short = 'o', long)]
    output_dir: Option<PathBuf>,

    /// Give up and stop the remaining transfers after this many seconds
    #[arg(short = 't', long)]
    timeout: Option<u64>,
}

fn run(args: Args) -> Result<()> {
    let config = Config {
        output_dir: args.output_dir.clone(),
        ..Config::default()
    };
    let (engine, events) = Engine::new(config);

    // Start one session per requested file
    let mut pending = 0usize;
    for file in &args.files {
        match engine.start_download(file, &args.host, args.port) {
            Ok(handle) => {
                info!("started download of '{}' (session {})", file, handle);
                pending += 1;
            }
            Err(e) => return Err(anyhow!("could not start download of '{}': {}", file, e)),
        }
    }

    // This thread owns the display; sessions only talk to it through the
    // event channel.
    let progress = MultiProgress::new();
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} {prefix} {pos}/{len} blocks [{bar:40.cyan/blue}] {percent}%")
        .unwrap()
        .progress_chars("#>-");
    let mut bars: HashMap<SessionHandle, ProgressBar> = HashMap::new();
    let mut completed = 0usize;
    let mut ended = 0usize;
    let deadline = args
        .timeout
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut timed_out = false;

    while ended < pending {
        let event = match deadline.filter(|_| !timed_out) {
            Some(deadline) => {
                let remaining = deadline
                    .checked_duration_since(Instant::now())
                    .unwrap_or(Duration::ZERO);
                match events.recv_timeout(remaining) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => {
                        // Time is up: report and stop whatever still runs.
                        timed_out = true;
                        for handle in bars.keys() {
                            if let Some(info) = engine.lookup_session(*handle) {
                                let _ = progress.println(format!(
                                    "timeout: stopping session {} ('{}' from {}, {}, {}/{} blocks)",
                                    info.handle,
                                    info.filename,
                                    info.peer,
                                    info.state,
                                    info.blocks_received,
                                    info.blocks_total
                                ));
                            }
                            engine.stop_session(*handle);
                        }
                        // Catch sessions that never reached the display
                        engine.stop_all();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match events.recv() {
                Ok(event) => event,
                Err(_) => break,
            },
        };

        match event {
            TransferEvent::SessionStarted {
                handle,
                peer,
                filename,
            } => {
                let bar = progress.add(ProgressBar::new(0));
                bar.set_style(style.clone());
                bar.set_prefix(format!("{} <- {}", filename, peer));
                bars.insert(handle, bar);
            }
            TransferEvent::Progress {
                handle,
                blocks_received,
                blocks_total,
            } => {
                if let Some(bar) = bars.get(&handle) {
                    bar.set_length(blocks_total as u64);
                    bar.set_position(blocks_received as u64);
                }
                if blocks_received == blocks_total {
                    completed += 1;
                }
            }
            TransferEvent::SessionEnded { handle } => {
                ended += 1;
                if let Some(bar) = bars.remove(&handle) {
                    bar.finish();
                }
            }
            TransferEvent::Log { line } => {
                let _ = progress.println(line);
            }
        }
    }

    debug!("exiting with {} session(s) still active", engine.active_sessions());

    if completed == pending {
        println!("All transfers finished.");
        Ok(())
    } else {
        Err(anyhow!(
            "{} of {} transfer(s) did not complete",
            pending - completed,
            pending
        ))
    }
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run program, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }

    // Exit success
    std::process::exit(0);
}
