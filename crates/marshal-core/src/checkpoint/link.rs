use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use marshal_checkpoint::{CheckpointWorker, ObjectStore};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const EXIT_GRACE: Duration = Duration::from_secs(2);

/// Line-oriented duplex to a worker. Both ends carry one JSON document per
/// message; no memory is shared with the worker.
pub(crate) struct WorkerLink {
    pub requests: mpsc::UnboundedSender<String>,
    pub replies: mpsc::UnboundedReceiver<String>,
}

/// Runs the worker on a dedicated OS thread.
pub(crate) fn spawn_thread(store_root: PathBuf) -> io::Result<WorkerLink> {
    let (requests, mut incoming) = mpsc::unbounded_channel::<String>();
    let (outgoing, replies) = mpsc::unbounded_channel::<String>();

    std::thread::Builder::new()
        .name("marshal-checkpoint".to_string())
        .spawn(move || {
            let worker = CheckpointWorker::new(ObjectStore::new(store_root));
            while let Some(line) = incoming.blocking_recv() {
                let Some(reply) = worker.handle_line(&line) else {
                    continue;
                };
                match serde_json::to_string(&reply) {
                    Ok(encoded) => {
                        if outgoing.send(encoded).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(target: "marshal::checkpoint", error = %e, "failed to encode worker reply");
                    }
                }
            }
            debug!(target: "marshal::checkpoint", "checkpoint worker thread stopped");
        })?;

    Ok(WorkerLink { requests, replies })
}

/// Runs the worker as a child process speaking over stdin/stdout.
pub(crate) fn spawn_process(program: &Path, args: &[String]) -> io::Result<WorkerLink> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| io::Error::other("worker stdin not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("worker stdout not captured"))?;
    debug!(target: "marshal::checkpoint", pid = ?child.id(), program = %program.display(), "spawned checkpoint worker");

    let (requests, mut incoming) = mpsc::unbounded_channel::<String>();
    let (outgoing, replies) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        while let Some(line) = incoming.recv().await {
            let written = async {
                stdin.write_all(line.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await
            }
            .await;
            if let Err(e) = written {
                warn!(target: "marshal::checkpoint", error = %e, "failed to write to checkpoint worker");
                break;
            }
        }
        drop(stdin);
        // Give the worker a chance to finish on EOF; dropping the child kills it.
        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(target: "marshal::checkpoint", %status, "checkpoint worker exited");
            }
            Ok(Err(e)) => {
                warn!(target: "marshal::checkpoint", error = %e, "failed to reap checkpoint worker");
            }
            Err(_) => {
                warn!(target: "marshal::checkpoint", "checkpoint worker ignored EOF, killing it");
            }
        }
    });

    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if outgoing.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(target: "marshal::checkpoint", error = %e, "failed to read from checkpoint worker");
                    break;
                }
            }
        }
    });

    Ok(WorkerLink { requests, replies })
}
