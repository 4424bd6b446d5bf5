//! # knive-av
//!
//! External process management for the knive pipeline.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find ffmpeg and the live
//!   segmenter, honouring configured path overrides.
//! - **Long-running processes** ([`ManagedProcess`]) -- spawn a tool with
//!   piped stdio, stream its diagnostic lines, and report how it exited.
//! - **Encoder arguments** ([`arguments`]) -- translate an option map into
//!   a stable ffmpeg argument vector.
//! - **Diagnostics** ([`diagnostics`], [`segmenter`]) -- pattern matchers for
//!   ffmpeg progress lines and segmenter completion reports.

pub mod arguments;
pub mod diagnostics;
pub mod process;
pub mod segmenter;
pub mod tools;

// ---- Re-exports for convenience ----

pub use arguments::{encoder_args, target_fps, transcoder_args, EncoderOptions};
pub use diagnostics::{Diagnostic, FfmpegDiagnostics};
pub use process::{LineSplitter, ManagedProcess, ProcessExit, ProcessSpec};
pub use segmenter::{parse_report, segment_file_name, segmenter_args, SegmentReport};
pub use tools::{ToolConfig, ToolInfo, ToolRegistry, FFMPEG, SEGMENTER};
