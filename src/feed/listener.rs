//! The authenticated TCP feed listener.
//!
//! A [`FeedListener`] is the source stage of a channel. It binds once all of
//! its consumers are running, authenticates every connection with the
//! TCPTS handshake and forwards the raw bytes of authenticated sessions to
//! its consumers. Several encoders may be connected at the same time.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use knive_core::config::FeedConfig;
use knive_core::events::{EventBus, PipelineEvent};
use knive_core::{Error, Result};
use knive_pipeline::{Fanout, Stage, StageContext, StageKind};

use super::protocol::{line_codec, wire_line, ServerHandshake, ServerStep, AUTHENTICATED, WRONG_REPLY};

const READ_CHUNK: usize = 64 * 1024;

/// Address the listener is bound to, readable from outside the graph.
#[derive(Debug, Clone, Default)]
pub struct BoundAddress(Arc<Mutex<Option<SocketAddr>>>);

impl BoundAddress {
    pub fn get(&self) -> Option<SocketAddr> {
        *self.0.lock()
    }

    fn set(&self, addr: Option<SocketAddr>) {
        *self.0.lock() = addr;
    }
}

pub struct FeedListener {
    name: String,
    config: FeedConfig,
    events: Option<Arc<EventBus>>,
    address: BoundAddress,
    cancel: CancellationToken,
    accept_task: Option<JoinHandle<()>>,
}

impl FeedListener {
    pub fn new(name: impl Into<String>, config: FeedConfig) -> Self {
        Self {
            name: name.into(),
            config,
            events: None,
            address: BoundAddress::default(),
            cancel: CancellationToken::new(),
            accept_task: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn address(&self) -> BoundAddress {
        self.address.clone()
    }
}

#[async_trait]
impl Stage for FeedListener {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Source
    }

    fn role(&self) -> &'static str {
        "feed"
    }

    async fn did_start(&mut self, ctx: &StageContext) -> Result<()> {
        let bind = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| Error::Internal(format!("failed to bind feed listener on {bind}: {e}")))?;
        let local = listener.local_addr()?;
        self.address.set(Some(local));
        tracing::info!("Feed '{}' listening on {}", self.name, local);

        self.cancel = CancellationToken::new();
        let session = SessionSettings {
            stage: self.name.clone(),
            secret: self.config.secret.clone(),
            handshake_timeout: Duration::from_secs(self.config.handshake_timeout_secs),
            output: ctx.output(),
            events: self.events.clone(),
        };
        self.accept_task = Some(tokio::spawn(accept_loop(
            listener,
            Arc::new(session),
            self.cancel.clone(),
        )));
        Ok(())
    }

    async fn will_stop(&mut self, _ctx: &StageContext) -> Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Feed '{}' accept loop ended abnormally: {}", self.name, e);
            }
        }
        self.address.set(None);
        Ok(())
    }
}

struct SessionSettings {
    stage: String,
    secret: String,
    handshake_timeout: Duration,
    output: Arc<Fanout>,
    events: Option<Arc<EventBus>>,
}

impl SessionSettings {
    fn publish(&self, event: PipelineEvent) {
        if let Some(ref bus) = self.events {
            bus.publish(event);
        }
    }
}

async fn accept_loop(listener: TcpListener, settings: Arc<SessionSettings>, cancel: CancellationToken) {
    let mut sessions = Vec::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::info!("Feed '{}': connection from {}", settings.stage, peer);
                    let settings = settings.clone();
                    let cancel = cancel.child_token();
                    sessions.retain(|s: &JoinHandle<()>| !s.is_finished());
                    sessions.push(tokio::spawn(async move {
                        tokio::select! {
                            _ = serve_session(stream, peer, &settings) => {}
                            _ = cancel.cancelled() => {
                                tracing::debug!("Feed '{}': closing session with {}", settings.stage, peer);
                            }
                        }
                    }));
                }
                Err(e) => tracing::warn!("Feed '{}': accept failed: {}", settings.stage, e),
            },
            _ = cancel.cancelled() => break,
        }
    }
    for session in sessions {
        let _ = session.await;
    }
}

async fn serve_session(stream: TcpStream, peer: SocketAddr, settings: &SessionSettings) {
    let peer_name = peer.to_string();
    let mut handshake = ServerHandshake::new(&settings.secret);
    let mut framed = Framed::new(stream, line_codec());

    let outcome = tokio::time::timeout(settings.handshake_timeout, async {
        for line in handshake.greeting() {
            framed.send(wire_line(line)).await.map_err(|e| Error::protocol(e.to_string()))?;
        }
        tracing::debug!("Feed '{}': challenge {} sent to {}", settings.stage, handshake.challenge(), peer);
        let line = match framed.next().await {
            Some(Ok(line)) => line,
            Some(Err(e)) => return Err(Error::protocol(e.to_string())),
            None => return Err(Error::protocol("connection closed during handshake")),
        };
        Ok(handshake.on_line(&line))
    })
    .await;

    let step = match outcome {
        Ok(Ok(step)) => step,
        Ok(Err(e)) => {
            tracing::warn!("Feed '{}': handshake with {} failed: {}", settings.stage, peer, e);
            settings.publish(PipelineEvent::FeedRejected {
                stage: settings.stage.clone(),
                peer: peer_name,
                reason: e.to_string(),
            });
            return;
        }
        Err(_) => {
            tracing::warn!("Feed '{}': {} did not complete the handshake in time", settings.stage, peer);
            settings.publish(PipelineEvent::FeedRejected {
                stage: settings.stage.clone(),
                peer: peer_name,
                reason: "handshake timeout".into(),
            });
            return;
        }
    };

    match step {
        ServerStep::Accept => {}
        ServerStep::Reject | ServerStep::Unexpected => {
            tracing::error!(
                "Feed '{}': {} sent a wrong reply; check that the secrets match",
                settings.stage,
                peer
            );
            let _ = framed.send(wire_line(WRONG_REPLY)).await;
            settings.publish(PipelineEvent::FeedRejected {
                stage: settings.stage.clone(),
                peer: peer_name,
                reason: "wrong reply".into(),
            });
            return;
        }
    }

    if let Err(e) = framed.send(wire_line(AUTHENTICATED)).await {
        tracing::warn!("Feed '{}': lost {} after handshake: {}", settings.stage, peer, e);
        return;
    }
    tracing::info!("Feed '{}': {} authenticated", settings.stage, peer);
    settings.publish(PipelineEvent::FeedAuthenticated {
        stage: settings.stage.clone(),
        peer: peer_name.clone(),
    });

    // Anything read past the reply line is already stream data.
    let parts = framed.into_parts();
    let mut stream = parts.io;
    let mut buf = parts.read_buf;
    let mut total = buf.len() as u64;
    if !buf.is_empty() {
        settings.output.send(buf.split().freeze()).await;
    }

    loop {
        buf.reserve(READ_CHUNK);
        match stream.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                total += n as u64;
                settings.output.send(buf.split().freeze()).await;
            }
            Err(e) => {
                tracing::warn!("Feed '{}': read from {} failed: {}", settings.stage, peer, e);
                break;
            }
        }
    }

    tracing::info!("Feed '{}': {} disconnected after {} bytes", settings.stage, peer, total);
    settings.publish(PipelineEvent::FeedDisconnected {
        stage: settings.stage.clone(),
        peer: peer_name,
        bytes: total,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use knive_pipeline::PipelineGraph;
    use tokio::io::AsyncWriteExt;

    use crate::feed::protocol::{challenge_response, BANNER};
    use crate::testing::Collector;

    fn config(timeout: u64) -> FeedConfig {
        FeedConfig {
            host: "127.0.0.1".into(),
            port: 0,
            secret: "abc".into(),
            handshake_timeout_secs: timeout,
        }
    }

    async fn next_event(rx: &mut tokio::sync::broadcast::Receiver<knive_core::events::Event>) -> PipelineEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
            .payload
    }

    #[tokio::test]
    async fn bytes_after_the_reply_are_not_lost() {
        let events = Arc::new(EventBus::new(16));
        let mut rx = events.subscribe();
        let graph = PipelineGraph::new();
        let listener = FeedListener::new("feed", config(5)).with_events(events);
        let address = listener.address();
        let feed = graph.add_stage(listener);
        let (collector, received) = Collector::new("sink");
        let sink = graph.add_stage(collector);
        graph.add_consumer(feed, sink).unwrap();
        graph.start(feed).await.unwrap();

        let stream = TcpStream::connect(address.get().unwrap()).await.unwrap();
        let mut framed = Framed::new(stream, line_codec());
        assert_eq!(framed.next().await.unwrap().unwrap(), BANNER);
        let challenge = framed.next().await.unwrap().unwrap();
        let mut stream = framed.into_inner();
        // Reply and payload in a single write.
        let mut first = format!("{}\r\n", challenge_response(&challenge, "abc")).into_bytes();
        first.extend_from_slice(b"\x47payload");
        stream.write_all(&first).await.unwrap();

        let got = received.wait_for_len(8, Duration::from_secs(5)).await;
        assert_eq!(&got[..], b"\x47payload");
        assert!(matches!(next_event(&mut rx).await, PipelineEvent::FeedAuthenticated { .. }));

        drop(stream);
        assert!(matches!(
            next_event(&mut rx).await,
            PipelineEvent::FeedDisconnected { bytes: 8, .. }
        ));
        graph.stop_tree(feed).await.unwrap();
        assert!(address.get().is_none());
    }

    #[tokio::test]
    async fn silent_client_times_out() {
        let events = Arc::new(EventBus::new(16));
        let mut rx = events.subscribe();
        let graph = PipelineGraph::new();
        let listener = FeedListener::new("feed", config(1)).with_events(events);
        let address = listener.address();
        let feed = graph.add_stage(listener);
        let (collector, _) = Collector::new("sink");
        let sink = graph.add_stage(collector);
        graph.add_consumer(feed, sink).unwrap();
        graph.start(feed).await.unwrap();

        let _silent = TcpStream::connect(address.get().unwrap()).await.unwrap();
        match next_event(&mut rx).await {
            PipelineEvent::FeedRejected { reason, .. } => assert_eq!(reason, "handshake timeout"),
            other => panic!("unexpected event {other:?}"),
        }
        graph.stop_tree(feed).await.unwrap();
    }
}
