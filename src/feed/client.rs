//! Reconnecting TCPTS client.
//!
//! A [`FeedClient`] is a sink that forwards its input to a remote feed
//! listener. It connects in the background with exponential backoff and
//! forwards bytes only while authenticated; whatever arrives while it is
//! disconnected is dropped. A rejected secret ends the retry loop and is
//! reported as a fault of the stage.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use knive_core::config::RelayConfig;
use knive_core::{Backoff, Error, ProcessFault, Result};
use knive_pipeline::{FaultReporter, Stage, StageContext, StageKind};

use super::protocol::{line_codec, wire_line, ClientHandshake, ClientStep};

/// Chunks buffered between the stage and the socket.
const SEND_QUEUE_DEPTH: usize = 256;

/// How long a stopping client may spend flushing queued chunks.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    /// The server refused the secret; no further attempts are made.
    Rejected,
}

pub struct FeedClient {
    name: String,
    config: RelayConfig,
    wait_for_connection: bool,
    authenticated: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    state_tx: watch::Sender<ConnectionState>,
    tx: Option<mpsc::Sender<Bytes>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FeedClient {
    pub fn new(name: impl Into<String>, config: RelayConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Self {
            name: name.into(),
            config,
            wait_for_connection: false,
            authenticated: Arc::new(AtomicBool::new(false)),
            dropped: Arc::new(AtomicU64::new(0)),
            state_tx,
            tx: None,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Do not finish starting until the first session is authenticated.
    pub fn wait_for_connection(mut self, wait: bool) -> Self {
        self.wait_for_connection = wait;
        self
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    fn target(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }
}

#[async_trait]
impl Stage for FeedClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Sink
    }

    fn role(&self) -> &'static str {
        "relay"
    }

    async fn did_start(&mut self, ctx: &StageContext) -> Result<()> {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        self.tx = Some(tx);
        self.cancel = CancellationToken::new();
        self.state_tx.send_replace(ConnectionState::Connecting);

        let session = Session {
            stage: self.name.clone(),
            target: self.target(),
            secret: self.config.secret.clone(),
            authenticated: self.authenticated.clone(),
            state: self.state_tx.clone(),
            faults: ctx.faults(),
        };
        let mut state = self.state_tx.subscribe();
        self.task = Some(tokio::spawn(session.run(rx, self.cancel.clone())));

        if self.wait_for_connection {
            tracing::info!("Waiting for connection to {}", self.target());
            let reached = state
                .wait_for(|s| *s != ConnectionState::Connecting)
                .await
                .map(|s| *s);
            if !matches!(reached, Ok(ConnectionState::Authenticated)) {
                return Err(Error::protocol(format!(
                    "{} refused the secret",
                    self.target()
                )));
            }
        }
        Ok(())
    }

    async fn receive(&mut self, data: Bytes, _ctx: &StageContext) -> Result<()> {
        if !self.authenticated.load(Ordering::SeqCst) {
            self.dropped.fetch_add(data.len() as u64, Ordering::Relaxed);
            return Ok(());
        }
        let Some(ref tx) = self.tx else {
            return Ok(());
        };
        if tx.send(data).await.is_err() {
            tracing::debug!("Relay '{}' connection task is gone", self.name);
        }
        Ok(())
    }

    async fn will_stop(&mut self, _ctx: &StageContext) -> Result<()> {
        // Closing the queue lets a connected session flush what is left.
        self.tx = None;
        if !self.authenticated.load(Ordering::SeqCst) {
            self.cancel.cancel();
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(FLUSH_TIMEOUT, &mut task).await.is_err() {
                self.cancel.cancel();
                let _ = task.await;
            }
        }
        self.cancel.cancel();
        self.authenticated.store(false, Ordering::SeqCst);
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            tracing::info!("Relay '{}' dropped {} bytes while disconnected", self.name, dropped);
        }
        Ok(())
    }
}

struct Session {
    stage: String,
    target: String,
    secret: String,
    authenticated: Arc<AtomicBool>,
    state: watch::Sender<ConnectionState>,
    faults: FaultReporter,
}

enum SessionEnd {
    Disconnected,
    Rejected(String),
    Cancelled,
}

impl Session {
    async fn run(self, mut rx: mpsc::Receiver<Bytes>, cancel: CancellationToken) {
        let mut backoff = Backoff::reconnect();
        loop {
            let end = tokio::select! {
                end = self.connect_and_forward(&mut rx, &mut backoff) => end,
                _ = cancel.cancelled() => SessionEnd::Cancelled,
            };
            self.authenticated.store(false, Ordering::SeqCst);

            match end {
                SessionEnd::Cancelled => return,
                SessionEnd::Rejected(reply) => {
                    tracing::error!(
                        "Relay '{}': {} answered {:?}; check that the secrets match",
                        self.stage,
                        self.target,
                        reply
                    );
                    self.state.send_replace(ConnectionState::Rejected);
                    self.faults.report(ProcessFault {
                        command_line: format!("tcpts://{}", self.target),
                        exit_code: None,
                        last_line: Some(reply),
                    });
                    return;
                }
                SessionEnd::Disconnected => {
                    self.state.send_replace(ConnectionState::Connecting);
                    let delay = backoff.next_delay();
                    tracing::info!("Relay '{}': reconnecting to {} in {:?}", self.stage, self.target, delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return,
                    }
                }
            }
        }
    }

    async fn connect_and_forward(&self, rx: &mut mpsc::Receiver<Bytes>, backoff: &mut Backoff) -> SessionEnd {
        let stream = match TcpStream::connect(&self.target).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Relay '{}': connection to {} failed: {}", self.stage, self.target, e);
                return SessionEnd::Disconnected;
            }
        };
        tracing::info!("Relay '{}': connected to {}", self.stage, self.target);

        let mut framed = Framed::new(stream, line_codec());
        let mut handshake = ClientHandshake::new(self.secret.clone());
        while !handshake.is_authenticated() {
            let line = match framed.next().await {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    tracing::warn!("Relay '{}': handshake failed: {}", self.stage, e);
                    return SessionEnd::Disconnected;
                }
                None => {
                    tracing::warn!("Relay '{}': server closed during handshake", self.stage);
                    return SessionEnd::Disconnected;
                }
            };
            match handshake.on_line(&line) {
                ClientStep::Continue | ClientStep::Authenticated => {}
                ClientStep::Reply(reply) => {
                    if let Err(e) = framed.send(wire_line(&reply)).await {
                        tracing::warn!("Relay '{}': handshake failed: {}", self.stage, e);
                        return SessionEnd::Disconnected;
                    }
                }
                ClientStep::Rejected(reply) => return SessionEnd::Rejected(reply),
                ClientStep::ProtocolError(message) => {
                    tracing::error!("Relay '{}': protocol mismatch: {}", self.stage, message);
                    return SessionEnd::Disconnected;
                }
            }
        }

        tracing::info!("Relay '{}': authenticated with {}", self.stage, self.target);
        backoff.reset();
        // Anything queued before authentication is stale.
        while rx.try_recv().is_ok() {}
        self.authenticated.store(true, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Authenticated);

        let (mut reader, mut writer) = framed.into_inner().into_split();
        let mut scratch = [0u8; 512];
        loop {
            tokio::select! {
                chunk = rx.recv() => {
                    let Some(chunk) = chunk else {
                        let _ = writer.shutdown().await;
                        return SessionEnd::Cancelled;
                    };
                    if let Err(e) = writer.write_all(&chunk).await {
                        tracing::warn!("Relay '{}': write to {} failed: {}", self.stage, self.target, e);
                        return SessionEnd::Disconnected;
                    }
                }
                read = reader.read(&mut scratch) => match read {
                    Ok(0) | Err(_) => {
                        tracing::warn!("Relay '{}': {} closed the connection", self.stage, self.target);
                        return SessionEnd::Disconnected;
                    }
                    Ok(_) => {}
                },
            }
        }
    }
}
