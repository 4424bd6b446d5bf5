//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which builds channels from a config rooted in a
//! temporary data directory, and small stages and clients for driving feeds.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

use knive::channel::Channel;
use knive::context::KniveContext;
use knive::feed::protocol::{challenge_response, AUTHENTICATED, BANNER};
use knive::server::{AppContext, SettingsStore};
use knive_av::ToolRegistry;
use knive_core::config::Config;
use knive_pipeline::{Stage, StageContext, StageKind};

/// Channels built from a config whose data directory is temporary.
pub struct TestHarness {
    pub ctx: AppContext,
    pub channels: Vec<Arc<Channel>>,
    pub data: TempDir,
    shutdown: CancellationToken,
}

impl TestHarness {
    /// Parse `toml`, point its data directory at a fresh temp dir and build
    /// every channel. Nothing is started.
    pub async fn new(toml: &str, tools: ToolRegistry) -> Self {
        let data = tempfile::tempdir().expect("failed to create data dir");
        let mut config: Config = toml::from_str(toml).expect("invalid test config");
        config.paths.data_dir = data.path().to_path_buf();
        knive::config::validate_config(&config).expect("test config does not validate");

        let settings = SettingsStore::new(&config, None);
        let knive = KniveContext::with_tools(config, tools);
        let mut channels = Vec::new();
        for channel in &knive.config.channels {
            channels.push(
                Channel::from_config(channel, &knive)
                    .await
                    .expect("failed to build channel"),
            );
        }

        let ctx = AppContext::new(knive, &channels, settings);
        Self {
            ctx,
            channels,
            data,
            shutdown: CancellationToken::new(),
        }
    }

    /// Start the admin API on a random port.
    pub async fn with_server(toml: &str, tools: ToolRegistry) -> (Self, SocketAddr) {
        let harness = Self::new(toml, tools).await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");

        let ctx = harness.ctx.clone();
        let shutdown = harness.shutdown.clone();
        tokio::spawn(async move {
            knive::server::serve(listener, ctx, shutdown).await.ok();
        });

        (harness, addr)
    }

    pub fn channel(&self, slug: &str) -> Arc<Channel> {
        self.ctx.channels.get(slug).expect("unknown channel").clone()
    }

    pub fn data_dir(&self) -> &Path {
        self.data.path()
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Connect to a feed and answer its challenge with `secret`.
///
/// Returns the socket positioned after the verdict, and the verdict line.
pub async fn feed_connect(addr: SocketAddr, secret: &str) -> (TcpStream, String) {
    let stream = TcpStream::connect(addr).await.expect("feed not reachable");
    let mut framed = Framed::new(stream, LinesCodec::new());

    let banner = next_line(&mut framed).await;
    assert_eq!(banner, BANNER);
    let challenge = next_line(&mut framed).await;
    framed
        .send(format!("{}\r", challenge_response(&challenge, secret)))
        .await
        .unwrap();
    let verdict = next_line(&mut framed).await;
    (framed.into_inner(), verdict)
}

/// [`feed_connect`] that insists on being accepted.
pub async fn feed_login(addr: SocketAddr, secret: &str) -> TcpStream {
    let (stream, verdict) = feed_connect(addr, secret).await;
    assert_eq!(verdict, AUTHENTICATED);
    stream
}

async fn next_line(framed: &mut Framed<TcpStream, LinesCodec>) -> String {
    tokio::time::timeout(Duration::from_secs(5), framed.next())
        .await
        .expect("timed out waiting for the feed")
        .expect("feed closed the connection")
        .expect("bad line")
        .trim_end_matches('\r')
        .to_string()
}

/// Everything a [`Collector`] received.
#[derive(Clone, Default)]
pub struct Received(Arc<Mutex<Vec<u8>>>);

impl Received {
    pub async fn wait_for_len(&self, len: usize) -> Vec<u8> {
        let data = self.0.clone();
        wait_until(Duration::from_secs(10), move || data.lock().len() >= len).await;
        self.0.lock().clone()
    }
}

/// A sink that keeps every byte.
pub struct Collector {
    name: String,
    received: Received,
}

impl Collector {
    pub fn new(name: &str) -> (Self, Received) {
        let received = Received::default();
        (
            Self {
                name: name.into(),
                received: received.clone(),
            },
            received,
        )
    }
}

#[async_trait]
impl Stage for Collector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Sink
    }

    async fn receive(&mut self, data: Bytes, _ctx: &StageContext) -> knive_core::Result<()> {
        self.received.0.lock().extend_from_slice(&data);
        Ok(())
    }
}

/// Poll `done` until it holds; panics after `timeout`.
pub async fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !done() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// An executable shell script.
#[cfg(unix)]
pub fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
