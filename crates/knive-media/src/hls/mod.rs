//! HLS playlist types and generation.

pub mod generator;
pub mod types;

pub use generator::{generate_master_playlist, generate_media_playlist};
pub use types::{MasterPlaylist, MediaPlaylist, Segment, Variant, PLAYLIST_VERSION};
