//! Long-running external processes with piped stdio.
//!
//! A [`ManagedProcess`] owns one child. Input is written to its stdin, its
//! stdout can be taken by the caller, and its stderr is split into lines
//! that are handed to a caller-supplied callback. How the process ended is
//! published once as a [`ProcessExit`]; the wrapper never restarts anything.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};

use knive_core::{Error, ProcessFault, Result};

/// How long to wait for the diagnostic stream to drain after exit.
const STDERR_DRAIN: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// ProcessSpec
// ---------------------------------------------------------------------------

/// Program and arguments of a process to spawn.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append a single argument.
    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    /// Append multiple arguments.
    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Short tool name for log messages.
    pub fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }

    /// The command line as it would be typed in a shell.
    pub fn command_line(&self) -> String {
        let mut line = self.program.to_string_lossy().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

// ---------------------------------------------------------------------------
// ProcessExit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exit status zero.
    Clean,
    /// Ended after a stop was requested, whatever its status.
    Stopped,
    /// Non-zero status or killed by a signal without being asked to stop.
    Faulted(ProcessFault),
}

// ---------------------------------------------------------------------------
// LineSplitter
// ---------------------------------------------------------------------------

/// Splits a byte stream into lines on `\n` or `\r`.
///
/// ffmpeg rewrites its progress line with bare carriage returns and the
/// segmenter terminates reports with `\n\r`, so both count as terminators
/// and empty lines are skipped.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in chunk {
            if b == b'\n' || b == b'\r' {
                self.flush_into(&mut lines);
            } else {
                self.pending.push(b);
            }
        }
        lines
    }

    /// Return whatever is left after the stream ended.
    pub fn finish(&mut self) -> Option<String> {
        let mut lines = Vec::new();
        self.flush_into(&mut lines);
        lines.pop()
    }

    fn flush_into(&mut self, lines: &mut Vec<String>) {
        if self.pending.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        if !line.is_empty() {
            lines.push(line);
        }
    }
}

// ---------------------------------------------------------------------------
// ManagedProcess
// ---------------------------------------------------------------------------

/// A spawned child process.
pub struct ManagedProcess {
    tool: String,
    command_line: String,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    last_line: Arc<Mutex<Option<String>>>,
    stopping: Arc<AtomicBool>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl ManagedProcess {
    /// Spawn `spec` with all three standard streams piped.
    ///
    /// `on_line` is called for every non-empty diagnostic (stderr) line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tool`] if the process cannot be spawned.
    pub fn spawn<F>(spec: &ProcessSpec, mut on_line: F) -> Result<Self>
    where
        F: FnMut(&str) + Send + 'static,
    {
        let tool = spec.tool_name();
        let command_line = spec.command_line();

        let mut child = Command::new(spec.program())
            .args(spec.arguments())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::tool(&tool, format!("failed to spawn: {e}")))?;

        let pid = child.id();
        tracing::info!("Spawned {} (pid {:?}): {}", tool, pid, command_line);

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let last_line: Arc<Mutex<Option<String>>> = Arc::default();
        let stderr_task = stderr.map(|mut stderr| {
            let last_line = last_line.clone();
            let tool = tool.clone();
            tokio::spawn(async move {
                let mut splitter = LineSplitter::new();
                let mut buf = vec![0u8; 4096];
                loop {
                    let n = match stderr.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) => {
                            tracing::debug!("{} diagnostic stream error: {}", tool, e);
                            break;
                        }
                    };
                    for line in splitter.push(&buf[..n]) {
                        tracing::trace!("{}: {}", tool, line);
                        on_line(&line);
                        *last_line.lock() = Some(line);
                    }
                }
                if let Some(line) = splitter.finish() {
                    on_line(&line);
                    *last_line.lock() = Some(line);
                }
            })
        });

        let stopping = Arc::new(AtomicBool::new(false));
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = watch::channel(None);

        {
            let tool = tool.clone();
            let command_line = command_line.clone();
            let last_line = last_line.clone();
            let stopping = stopping.clone();
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    _ = kill_rx => {
                        if let Err(e) = child.start_kill() {
                            tracing::warn!("Failed to kill {}: {}", tool, e);
                        }
                        child.wait().await
                    }
                };

                if let Some(task) = stderr_task {
                    if tokio::time::timeout(STDERR_DRAIN, task).await.is_err() {
                        tracing::debug!("{} diagnostic stream still open after exit", tool);
                    }
                }

                let last = last_line.lock().clone();
                let exit = match status {
                    Ok(status) if status.success() => {
                        tracing::info!("{} ended", tool);
                        ProcessExit::Clean
                    }
                    _ if stopping.load(Ordering::SeqCst) => {
                        tracing::info!("{} stopped", tool);
                        ProcessExit::Stopped
                    }
                    Ok(status) => {
                        tracing::error!(
                            command = %command_line,
                            last_message = ?last,
                            "{} crashed with {}",
                            tool,
                            status
                        );
                        ProcessExit::Faulted(ProcessFault {
                            command_line,
                            exit_code: status.code(),
                            last_line: last,
                        })
                    }
                    Err(e) => {
                        tracing::error!(command = %command_line, "Failed to wait for {}: {}", tool, e);
                        ProcessExit::Faulted(ProcessFault {
                            command_line,
                            exit_code: None,
                            last_line: last,
                        })
                    }
                };
                let _ = exit_tx.send(Some(exit));
            });
        }

        Ok(Self {
            tool,
            command_line,
            pid,
            stdin,
            stdout,
            last_line,
            stopping,
            kill_tx: Some(kill_tx),
            exit_rx,
        })
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The most recent diagnostic line.
    pub fn last_line(&self) -> Option<String> {
        self.last_line.lock().clone()
    }

    /// Take the process's stdout. Returns `None` on the second call.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Receiver that resolves to `Some` once the process has exited.
    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// Write input bytes to the process.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(Error::tool(&self.tool, "input is closed"));
        };
        stdin.write_all(data).await?;
        Ok(())
    }

    /// Close stdin so the process sees end of input.
    pub async fn close_stdin(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> ProcessExit {
        match self.exit_rx.wait_for(Option::is_some).await {
            Ok(exit) => exit.clone().unwrap_or(ProcessExit::Stopped),
            Err(_) => ProcessExit::Stopped,
        }
    }

    /// Ask the process to finish: close its input, give it `grace` to exit
    /// on its own, then kill it.
    pub async fn stop(&mut self, grace: Duration) -> ProcessExit {
        self.stopping.store(true, Ordering::SeqCst);
        self.close_stdin().await;
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                tracing::warn!("{} did not exit within {:?}; killing it", self.tool, grace);
                self.kill();
                self.wait().await
            }
        }
    }

    /// Kill the process without waiting.
    pub fn kill(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("tool", &self.tool)
            .field("pid", &self.pid)
            .finish()
    }
}
