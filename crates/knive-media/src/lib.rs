//! HLS playlist engine for knive.
//!
//! - [`hls`] renders master and media playlists.
//! - [`window`] keeps the sliding window of recent segments and the
//!   non-windowed playlist of a recording.
//! - [`index`] holds the segment index shared by all variants of a stream.
//! - [`publish`] replaces files atomically and moves segments into place.

pub mod hls;
pub mod index;
pub mod publish;
pub mod window;

pub use hls::{generate_master_playlist, generate_media_playlist, MasterPlaylist, MediaPlaylist, Segment, Variant};
pub use index::SharedIndex;
pub use publish::{copy_file, move_file, write_atomic};
pub use window::{PlaylistIndex, VodPlaylist, WindowSegment};
