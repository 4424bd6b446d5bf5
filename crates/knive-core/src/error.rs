//! Unified error type for knive.
//!
//! Library crates funnel their failures into [`Error`]. Graph edits that are
//! illegal surface as [`WiringError`], start/stop called out of order as
//! [`LifecycleError`], and crashed external processes as [`ProcessFault`].
//! The admin API derives an HTTP status via [`Error::http_status`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Illegal producer/consumer edits. Always rejected before any state changes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WiringError {
    /// A stage was asked to consume its own output.
    #[error("stage '{stage}' cannot be a consumer of itself")]
    SelfReference { stage: String },

    /// The stage has no input side.
    #[error("stage '{stage}' does not accept data")]
    NotAConsumer { stage: String },

    /// The stage has no output side.
    #[error("stage '{stage}' does not produce data")]
    NotAProducer { stage: String },

    /// The edge would make a stage its own ancestor.
    #[error("linking '{producer}' -> '{consumer}' would create a cycle")]
    Cycle { producer: String, consumer: String },

    /// The producer of a running stage cannot change.
    #[error("stage '{stage}' is running; its producer cannot change")]
    AlreadyRunning { stage: String },

    /// A consumer must stop before it is unlinked.
    #[error("consumer '{consumer}' is still running")]
    ConsumerStillRunning { consumer: String },
}

/// Start/stop called out of order. The stage state is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("stage '{stage}' produces data but has no consumers")]
    NoConsumers { stage: String },

    #[error("stage '{stage}' consumes data but has no producer")]
    NoProducer { stage: String },

    #[error("stage '{stage}' is already starting")]
    StartInProgress { stage: String },

    #[error("stage '{stage}' is stopping")]
    StopInProgress { stage: String },

    #[error("stage '{stage}' failed to start: consumer '{consumer}': {message}")]
    StartFailed {
        stage: String,
        consumer: String,
        message: String,
    },

    #[error("channel '{channel}' is already recording")]
    AlreadyRecording { channel: String },

    #[error("channel '{channel}' is not recording")]
    NotRecording { channel: String },
}

/// An external process exited abnormally.
///
/// Carries enough context to diagnose the failure without re-running it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessFault {
    /// The full command line that was spawned.
    pub command_line: String,
    /// Exit code, or `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// The last line the process wrote to its diagnostic stream.
    pub last_line: Option<String>,
}

impl fmt::Display for ProcessFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "`{}` exited with code {}", self.command_line, code)?,
            None => write!(f, "`{}` was terminated by a signal", self.command_line)?,
        }
        if let Some(ref line) = self.last_line {
            write!(f, " (last message: {line})")?;
        }
        Ok(())
    }
}

/// Unified error type covering all failure modes in knive.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Wiring error: {0}")]
    Wiring(#[from] WiringError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    /// Handshake mismatch or malformed line; scoped to one session.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Process fault: {0}")]
    Process(ProcessFault),

    /// An external tool could not be found or spawned.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "channel", "stage").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Wiring(_) => 400,
            Error::Lifecycle(
                LifecycleError::AlreadyRecording { .. } | LifecycleError::NotRecording { .. },
            ) => 409,
            Error::Lifecycle(_) => 500,
            Error::Protocol(_) => 400,
            Error::Process(_) => 502,
            Error::Tool { .. } => 502,
            Error::Io { .. } => 500,
            Error::NotFound { .. } => 404,
            Error::Validation(_) => 400,
            Error::Conflict(_) => 409,
            Error::Internal(_) => 500,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        use std::io::ErrorKind;
        match self {
            Error::Io { source } => matches!(
                source.kind(),
                ErrorKind::Interrupted
                    | ErrorKind::WouldBlock
                    | ErrorKind::TimedOut
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Protocol`].
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }
}

impl From<ProcessFault> for Error {
    fn from(fault: ProcessFault) -> Self {
        Error::Process(fault)
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
