use chrono::Local;
use clap::Parser;
use std::io;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use marshal_checkpoint::{CheckpointWorker, ObjectStore, default_store_root};

#[derive(Parser)]
#[command(name = "marshal-checkpoint-worker")]
#[command(about = "Serves checkpoint store/restore requests as line-delimited JSON on stdin/stdout.")]
struct Args {
    /// Root directory of the checkpoint object store
    #[arg(long, env = "MARSHAL_CHECKPOINT_ROOT")]
    store_root: Option<PathBuf>,

    /// Write logs to a timestamped file in this directory instead of stderr
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn init_tracing(args: &Args) -> io::Result<()> {
    let default_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("MARSHAL_LOG")
        .unwrap_or_else(|_| EnvFilter::new(format!("marshal={default_level}")));

    // stdout carries protocol replies, so logs go to stderr or a file.
    match &args.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_name = format!("checkpoint-worker-{}.log", Local::now().format("%Y%m%d_%H%M%S"));
            let appender = tracing_appender::rolling::never(dir, file_name);
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(appender).with_ansi(false))
                .with(filter)
                .try_init()
                .map_err(io::Error::other)
        }
        None => tracing_subscriber::registry()
            .with(fmt::layer().with_writer(io::stderr))
            .with(filter)
            .try_init()
            .map_err(io::Error::other),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(&args)?;

    let store_root = args
        .store_root
        .clone()
        .or_else(default_store_root)
        .ok_or("no --store-root given and no data directory available")?;
    std::fs::create_dir_all(&store_root)?;
    info!(target: "marshal::checkpoint", root = %store_root.display(), "checkpoint worker started");

    let worker = CheckpointWorker::new(ObjectStore::new(store_root));
    let stdin = io::stdin();
    let stdout = io::stdout();
    worker.serve(stdin.lock(), stdout.lock())?;

    info!(target: "marshal::checkpoint", "checkpoint worker exiting");
    Ok(())
}
