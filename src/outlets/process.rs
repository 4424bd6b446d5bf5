//! Glue between a [`ManagedProcess`] and the stage that owns it.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tokio::task::JoinHandle;

use knive_av::{ManagedProcess, ProcessExit};
use knive_pipeline::{Fanout, FaultReporter};

const STDOUT_CHUNK: usize = 64 * 1024;

/// Report the process to the graph if it exits without being asked to.
pub(crate) fn watch_exit(process: &ManagedProcess, faults: FaultReporter) -> JoinHandle<()> {
    let mut exit = process.exit_watch();
    tokio::spawn(async move {
        let outcome = exit.wait_for(Option::is_some).await.ok().and_then(|e| e.clone());
        if let Some(ProcessExit::Faulted(fault)) = outcome {
            faults.report(fault);
        }
    })
}

/// Forward everything the process writes on stdout to `output`.
pub(crate) fn forward_stdout(mut stdout: ChildStdout, output: Arc<Fanout>, tool: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut total = 0u64;
        let mut buf = bytes::BytesMut::with_capacity(STDOUT_CHUNK);
        loop {
            buf.reserve(STDOUT_CHUNK);
            match stdout.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    total += n as u64;
                    output.send(buf.split().freeze()).await;
                }
                Err(e) => {
                    tracing::warn!("{} output stream error: {}", tool, e);
                    break;
                }
            }
        }
        tracing::debug!("{} output closed after {} bytes", tool, total);
    })
}
