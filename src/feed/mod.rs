//! TCPTS ingest: an authenticated, line-based handshake followed by raw
//! MPEG-TS bytes over the same TCP connection.

pub mod client;
pub mod listener;
pub mod protocol;

pub use client::{ConnectionState, FeedClient};
pub use listener::{BoundAddress, FeedListener};
pub use protocol::{challenge_response, DEFAULT_PORT};
