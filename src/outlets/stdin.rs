//! A source reading the stream from a local byte stream, normally stdin.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use knive_core::{Error, Result};
use knive_pipeline::{Stage, StageContext, StageKind};

const READ_CHUNK: usize = 64 * 1024;

type Input = Box<dyn AsyncRead + Send + Unpin>;

pub struct StdinSource {
    name: String,
    input: Option<Input>,
    eof_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Option<Input>>>,
}

impl StdinSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self::from_reader(name, tokio::io::stdin())
    }

    pub fn from_reader(name: impl Into<String>, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        let (eof_tx, _) = watch::channel(false);
        Self {
            name: name.into(),
            input: Some(Box::new(reader)),
            eof_tx,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// Becomes `true` once the input is exhausted.
    pub fn end_of_input(&self) -> watch::Receiver<bool> {
        self.eof_tx.subscribe()
    }
}

#[async_trait]
impl Stage for StdinSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Source
    }

    fn role(&self) -> &'static str {
        "stdin"
    }

    async fn did_start(&mut self, ctx: &StageContext) -> Result<()> {
        let Some(mut input) = self.input.take() else {
            return Err(Error::Conflict(format!("input of '{}' is already consumed", self.name)));
        };
        self.cancel = CancellationToken::new();
        let cancel = self.cancel.clone();
        let output = ctx.output();
        let eof = self.eof_tx.clone();
        let name = self.name.clone();

        self.task = Some(tokio::spawn(async move {
            let mut buf = bytes::BytesMut::with_capacity(READ_CHUNK);
            let mut total = 0u64;
            loop {
                buf.reserve(READ_CHUNK);
                let read = tokio::select! {
                    read = input.read_buf(&mut buf) => read,
                    _ = cancel.cancelled() => return Some(input),
                };
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n as u64;
                        output.send(buf.split().freeze()).await;
                    }
                    Err(e) => {
                        tracing::error!("'{}' read failed: {}", name, e);
                        break;
                    }
                }
            }
            tracing::info!("'{}' reached end of input after {} bytes", name, total);
            eof.send_replace(true);
            None
        }));
        Ok(())
    }

    async fn will_stop(&mut self, _ctx: &StageContext) -> Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(rest) => self.input = rest,
                Err(e) => tracing::warn!("'{}' reader ended abnormally: {}", self.name, e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use knive_pipeline::PipelineGraph;

    use crate::testing::Collector;

    #[tokio::test]
    async fn forwards_reader_until_eof() {
        let graph = PipelineGraph::new();
        let source = StdinSource::from_reader("stdin", &b"\x47abc\x47def"[..]);
        let mut eof = source.end_of_input();
        let src = graph.add_stage(source);
        let (collector, received) = Collector::new("sink");
        let sink = graph.add_stage(collector);
        graph.add_consumer(src, sink).unwrap();
        graph.start(src).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), eof.wait_for(|done| *done))
            .await
            .unwrap()
            .unwrap();
        let got = received.wait_for_len(8, Duration::from_secs(5)).await;
        assert_eq!(&got[..], b"\x47abc\x47def");
        graph.stop_tree(src).await.unwrap();
    }

    #[tokio::test]
    async fn restart_after_eof_is_refused() {
        let graph = PipelineGraph::new();
        let source = StdinSource::from_reader("stdin", &b""[..]);
        let mut eof = source.end_of_input();
        let src = graph.add_stage(source);
        let (collector, _) = Collector::new("sink");
        let sink = graph.add_stage(collector);
        graph.add_consumer(src, sink).unwrap();
        graph.start(src).await.unwrap();
        eof.wait_for(|done| *done).await.unwrap();
        graph.stop(src).await.unwrap();

        assert!(graph.start(src).await.is_err());
    }
}
