//! knive-core: shared errors, configuration, backoff, and the event bus.
//!
//! Every other knive crate depends on this one. It owns the error taxonomy
//! (wiring, lifecycle, protocol, process, transient IO), the serde config
//! model, and the broadcast [`events::EventBus`] used for diagnostics.

pub mod backoff;
pub mod config;
pub mod error;
pub mod events;

pub use backoff::Backoff;
pub use error::{Error, LifecycleError, ProcessFault, Result, WiringError};
