//! Stages and helpers shared by unit tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncWriteExt, DuplexStream};

use knive_core::Result;
use knive_pipeline::{Stage, StageContext, StageKind};

use crate::outlets::StdinSource;

/// Write end of a [`pusher`] source.
pub(crate) struct PushInput(tokio::sync::Mutex<Option<DuplexStream>>);

impl PushInput {
    pub async fn send(&self, data: Bytes) {
        if let Some(ref mut w) = *self.0.lock().await {
            w.write_all(&data).await.unwrap();
        }
    }

    pub async fn close(&self) {
        if let Some(mut w) = self.0.lock().await.take() {
            w.shutdown().await.unwrap();
        }
    }
}

/// A source fed from the test body.
pub(crate) fn pusher(name: &str) -> (StdinSource, PushInput) {
    let (reader, writer) = tokio::io::duplex(1 << 20);
    (
        StdinSource::from_reader(name, reader),
        PushInput(tokio::sync::Mutex::new(Some(writer))),
    )
}

/// Everything a [`Collector`] received.
#[derive(Clone, Default)]
pub(crate) struct Received(Arc<Mutex<Vec<u8>>>);

impl Received {
    pub async fn wait_for_len(&self, len: usize, timeout: Duration) -> Vec<u8> {
        let data = self.0.clone();
        wait_until(timeout, move || data.lock().len() >= len).await;
        self.0.lock().clone()
    }
}

/// A sink that keeps every byte.
pub(crate) struct Collector {
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

    async fn receive(&mut self, data: Bytes, _ctx: &StageContext) -> Result<()> {
        self.received.0.lock().extend_from_slice(&data);
        Ok(())
    }
}

/// A sink whose post-start hook takes `delay` and fails while its flag is
/// set.
pub(crate) struct Gate {
    name: String,
    delay: Duration,
    refuse: Arc<AtomicBool>,
}

impl Gate {
    pub fn new(name: &str, delay: Duration) -> (Self, Arc<AtomicBool>) {
        let refuse = Arc::new(AtomicBool::new(false));
        (
            Self {
                name: name.into(),
                delay,
                refuse: refuse.clone(),
            },
            refuse,
        )
    }
}

#[async_trait]
impl Stage for Gate {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Sink
    }

    async fn did_start(&mut self, _ctx: &StageContext) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        if self.refuse.load(Ordering::SeqCst) {
            return Err(knive_core::Error::Internal(format!("{} is closed", self.name)));
        }
        Ok(())
    }

    async fn receive(&mut self, _data: Bytes, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }
}

/// Poll `done` until it holds; panics after `timeout`.
pub(crate) async fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached within {timeout:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A shell script to be run through `sh`.
pub(crate) fn fake_tool(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    path
}
