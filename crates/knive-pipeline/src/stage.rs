//! The [`Stage`] trait defines a single pipeline element.
//!
//! A stage never starts or stops itself: the [`PipelineGraph`] calls its
//! hooks in protocol order and feeds it data through
//! [`receive`](Stage::receive) once it is running.
//!
//! [`PipelineGraph`]: crate::PipelineGraph

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use knive_core::{ProcessFault, Result};

use crate::context::StageContext;
use crate::graph::StageId;

/// Which side(s) of the data path a stage has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    /// Produces data only (a feed listener).
    Source,
    /// Consumes and produces (a transcoder).
    Filter,
    /// Consumes only (a segment writer, an archive).
    Sink,
}

impl StageKind {
    pub fn produces(self) -> bool {
        !matches!(self, StageKind::Sink)
    }

    pub fn consumes(self) -> bool {
        !matches!(self, StageKind::Source)
    }
}

/// What the graph should do with a stage whose process crashed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Leave the stage stopped.
    Stop,
    /// Stop it, then run the start protocol again.
    Restart,
}

/// Where an episode is being recorded.
#[derive(Debug, Clone)]
pub struct RecordingTarget {
    pub episode: String,
    pub directory: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// A stage that can additionally persist its output into an episode.
#[async_trait]
pub trait Recorder: Send {
    async fn start_recording(&mut self, target: &RecordingTarget) -> Result<()>;

    async fn stop_recording(&mut self) -> Result<()>;

    fn is_recording(&self) -> bool;
}

/// A single element of a pipeline.
#[async_trait]
pub trait Stage: Send + 'static {
    /// A short, human-readable name (e.g. "bus/live/wifi/segmenter").
    fn name(&self) -> &str;

    fn kind(&self) -> StageKind;

    /// Role tag used by ancestor lookups (e.g. "feed", "transcoder").
    fn role(&self) -> &'static str {
        "stage"
    }

    /// Pre-start hook. Runs before any consumer is started.
    async fn will_start(&mut self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }

    /// Post-start hook. Runs after every consumer has started and the stage
    /// has been marked running, but before any data is delivered to it.
    async fn did_start(&mut self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }

    /// Handle one chunk from the producer.
    ///
    /// The default forwards the chunk unchanged to every running consumer.
    async fn receive(&mut self, data: Bytes, ctx: &StageContext) -> Result<()> {
        ctx.emit(data).await;
        Ok(())
    }

    /// Pre-stop hook. Input is already detached and drained.
    async fn will_stop(&mut self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }

    /// Post-stop hook. Runs before the producer is told this stage stopped.
    async fn did_stop(&mut self, _ctx: &StageContext) -> Result<()> {
        Ok(())
    }

    async fn consumer_started(&mut self, _consumer: StageId, _ctx: &StageContext) {}

    async fn consumer_stopped(&mut self, _consumer: StageId, _ctx: &StageContext) {}

    /// Decide what happens after this stage's external process crashed.
    fn on_fault(&mut self, _fault: &ProcessFault) -> FaultAction {
        FaultAction::Stop
    }

    fn as_recorder(&mut self) -> Option<&mut dyn Recorder> {
        None
    }
}
