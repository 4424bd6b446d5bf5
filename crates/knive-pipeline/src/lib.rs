//! # knive-pipeline
//!
//! The producer/consumer graph that moves a byte stream between stages.
//!
//! This crate provides:
//!
//! - **[`Stage`]** trait: one pipeline element with pre/post start and stop
//!   hooks, a `receive` entry point, and a crash policy.
//! - **[`PipelineGraph`]**: an arena of stages plus their edges. It enforces
//!   the wiring rules and drives the barrier start / notify-upstream stop
//!   protocol.
//! - **[`StartBarrier`]**: the explicit counter a producer waits on while its
//!   consumers start.
//! - **[`Fanout`]**: delivery of a producer's output to its running
//!   consumers.

pub mod barrier;
pub mod context;
pub mod fanout;
pub mod graph;
pub mod stage;

pub use barrier::{BarrierState, StartBarrier};
pub use context::{Ancestor, FaultReporter, StageContext};
pub use fanout::Fanout;
pub use graph::{PipelineGraph, RestartPolicy, StageHandle, StageId, StageInfo, StageStatus, WiringChange, WiringRecord};
pub use stage::{FaultAction, Recorder, RecordingTarget, Stage, StageKind};
