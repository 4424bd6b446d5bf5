//! HLS playlist types.

use serde::{Deserialize, Serialize};

/// Protocol version written into every media playlist.
pub const PLAYLIST_VERSION: u8 = 3;

/// A stream variant in a master playlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    /// Peak bandwidth in bits per second.
    pub bandwidth: u64,
    /// Codec string (e.g. "avc1.42001e,mp4a.40.2"). Empty omits the attribute.
    pub codecs: String,
    /// URI to the media playlist for this variant.
    pub uri: String,
}

/// A single segment in a media playlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    /// Segment duration in seconds.
    pub duration: f64,
    pub uri: String,
    pub title: Option<String>,
    /// Emit `#EXT-X-DISCONTINUITY` before this segment.
    pub discontinuity: bool,
}

/// An HLS master playlist containing multiple stream variants.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MasterPlaylist {
    pub variants: Vec<Variant>,
}

/// An HLS media playlist describing a sequence of segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPlaylist {
    /// Maximum segment duration in integer seconds.
    pub target_duration: u32,
    /// Sequence number of the first listed segment.
    pub media_sequence: u64,
    /// `#EXT-X-ALLOW-CACHE` directive; `None` omits it.
    pub allow_cache: Option<bool>,
    pub segments: Vec<Segment>,
    /// Whether the playlist is complete (VOD). If true, `#EXT-X-ENDLIST` is emitted.
    pub ended: bool,
}
