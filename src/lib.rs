//! Knive - live MPEG-TS pipeline engine
//!
//! This library crate exposes channels, feeds, outlets and the admin API
//! for the binary and for integration testing.

pub mod channel;
pub mod config;
pub mod context;
pub mod feed;
pub mod outlets;
pub mod server;

#[cfg(test)]
mod testing;
