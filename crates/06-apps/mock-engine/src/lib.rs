//! Stand-in engine for exercising the native backends.
//!
//! Speaks the engine's command line and both native transports. Every
//! request is echoed back, except [`PROBE_HARDWARE_CONCURRENCY`], which is
//! answered with the `HARDWARE_CONCURRENCY` the engine was started with.
//! Test crates in other packages wrap [`run`] in a binary of their own.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use runtime_native::engine::{serve_shm, serve_socket, watch_parent, Endpoint};
use runtime_native::{ShmLayout, SYNC_RING_SIZE};

pub const PROBE_HARDWARE_CONCURRENCY: &[u8] = b"?hardware-concurrency";
/// Exit code used by `--exit-after`.
pub const EXIT_AFTER_CODE: i32 = 3;

#[derive(Parser, Debug)]
#[command(author, version, about = "Echoing engine for native backend tests")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Msgpack API entry points
    Msgpack {
        #[command(subcommand)]
        command: MsgpackCommand,
    },
}

#[derive(Subcommand, Debug)]
enum MsgpackCommand {
    /// Serve requests until stopped
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// `<path>.sock` for a Unix socket, `<path>.shm` for shared memory
    #[arg(long)]
    input: PathBuf,

    /// Shared-memory client slots
    #[arg(long, default_value_t = 1)]
    max_clients: u32,

    #[arg(long, default_value_t = SYNC_RING_SIZE)]
    request_ring_size: u32,

    #[arg(long, default_value_t = SYNC_RING_SIZE)]
    response_ring_size: u32,

    /// Exit with code 3 instead of answering request number N+1
    #[arg(long)]
    exit_after: Option<usize>,
}

/// Parses the process arguments and serves until stopped.
pub fn run() -> Result<()> {
    init_tracing();
    let Cli {
        command: Command::Msgpack {
            command: MsgpackCommand::Run(args),
        },
    } = Cli::parse();

    watch_parent(|| {
        warn!("host process went away; exiting");
        std::process::exit(0);
    })?;

    let threads = std::env::var("HARDWARE_CONCURRENCY").unwrap_or_default();
    info!(input = %args.input.display(), threads = %threads, "mock engine starting");

    let mut answered = 0usize;
    let exit_after = args.exit_after;
    let mut handler = move |request: Vec<u8>| {
        if exit_after.is_some_and(|limit| answered >= limit) {
            warn!(answered, "exiting on request");
            std::process::exit(EXIT_AFTER_CODE);
        }
        answered += 1;
        if request == PROBE_HARDWARE_CONCURRENCY {
            return Some(threads.clone().into_bytes());
        }
        Some(request)
    };

    match Endpoint::parse(&args.input)? {
        Endpoint::Socket(path) => {
            serve_socket(&path, &mut handler).context("socket engine stopped")?
        }
        Endpoint::SharedMemory(path) => {
            let layout = ShmLayout::new(
                args.max_clients,
                args.request_ring_size,
                args.response_ring_size,
            )?;
            serve_shm(&path, layout, &mut handler).context("shared-memory engine stopped")?
        }
    }
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(env_filter).with_writer(std::io::stderr).try_init();
}
