//! Sliding window of published segments.
//!
//! [`PlaylistIndex`] is the live view: at most `max_segments` entries, the
//! most recent ones, with a media sequence derived from the highest index
//! ever published. [`VodPlaylist`] is the unbounded list written while an
//! episode is being recorded.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::hls::{MediaPlaylist, Segment};

/// A published segment as listed in a playlist.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowSegment {
    pub index: u64,
    pub filename: String,
    pub duration: f64,
    pub created_at: DateTime<Utc>,
    /// The index does not follow the previous entry's index.
    pub discontinuity: bool,
}

impl WindowSegment {
    fn to_segment(&self, title: &str, publish_url: Option<&str>) -> Segment {
        let uri = match publish_url {
            Some(base) if base.ends_with('/') => format!("{base}{}", self.filename),
            Some(base) if !base.is_empty() => format!("{base}/{}", self.filename),
            _ => self.filename.clone(),
        };
        Segment {
            duration: self.duration,
            uri,
            title: Some(title.to_string()),
            discontinuity: self.discontinuity,
        }
    }
}

/// Segment duration rounded up, as required for the target duration.
fn ceil_secs(duration: f64) -> u32 {
    if duration <= 0.0 {
        0
    } else {
        duration.ceil() as u32
    }
}

#[derive(Debug, Clone)]
pub struct PlaylistIndex {
    label: String,
    segments: VecDeque<WindowSegment>,
    max_segments: usize,
    last_index: u64,
    target_duration: u32,
    allow_cache: bool,
    publish_url: Option<String>,
}

impl PlaylistIndex {
    /// An empty window. `max_segments` is at least one.
    pub fn new(label: impl Into<String>, max_segments: usize, target_duration: u32) -> Self {
        let max_segments = max_segments.max(1);
        Self {
            label: label.into(),
            segments: VecDeque::with_capacity(max_segments),
            max_segments,
            last_index: 0,
            target_duration,
            allow_cache: false,
            publish_url: None,
        }
    }

    pub fn with_allow_cache(mut self, allow: bool) -> Self {
        self.allow_cache = allow;
        self
    }

    /// Prefix every listed filename with `url`.
    pub fn with_publish_url(mut self, url: Option<String>) -> Self {
        self.publish_url = url;
        self
    }

    /// Append a segment and drop the oldest entries beyond the window.
    pub fn push(&mut self, index: u64, filename: impl Into<String>, duration: f64) -> &WindowSegment {
        let discontinuity = self
            .segments
            .back()
            .is_some_and(|prev| prev.index.checked_add(1) != Some(index));

        self.last_index = self.last_index.max(index);
        self.target_duration = self.target_duration.max(ceil_secs(duration));

        self.segments.push_back(WindowSegment {
            index,
            filename: filename.into(),
            duration,
            created_at: Utc::now(),
            discontinuity,
        });
        while self.segments.len() > self.max_segments {
            self.segments.pop_front();
        }

        &self.segments[self.segments.len() - 1]
    }

    /// Highest index ever appended. Never decreases.
    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    /// `max(1, last_index - max_segments + 1)`.
    pub fn media_sequence(&self) -> u64 {
        (self.last_index + 1)
            .saturating_sub(self.max_segments as u64)
            .max(1)
    }

    pub fn target_duration(&self) -> u32 {
        self.target_duration
    }

    pub fn max_segments(&self) -> usize {
        self.max_segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> impl Iterator<Item = &WindowSegment> {
        self.segments.iter()
    }

    pub fn to_playlist(&self) -> MediaPlaylist {
        MediaPlaylist {
            target_duration: self.target_duration,
            media_sequence: self.media_sequence(),
            allow_cache: Some(self.allow_cache),
            segments: self
                .segments
                .iter()
                .map(|s| s.to_segment(&self.label, self.publish_url.as_deref()))
                .collect(),
            ended: false,
        }
    }

    pub fn render(&self) -> String {
        self.to_playlist().to_string()
    }
}

/// Every segment of one recording, in order.
#[derive(Debug, Clone)]
pub struct VodPlaylist {
    label: String,
    segments: Vec<WindowSegment>,
    target_duration: u32,
    ended: bool,
}

impl VodPlaylist {
    pub fn new(label: impl Into<String>, target_duration: u32) -> Self {
        Self {
            label: label.into(),
            segments: Vec::new(),
            target_duration,
            ended: false,
        }
    }

    pub fn push(&mut self, index: u64, filename: impl Into<String>, duration: f64) {
        let discontinuity = self
            .segments
            .last()
            .is_some_and(|prev| prev.index.checked_add(1) != Some(index));
        self.target_duration = self.target_duration.max(ceil_secs(duration));
        self.segments.push(WindowSegment {
            index,
            filename: filename.into(),
            duration,
            created_at: Utc::now(),
            discontinuity,
        });
    }

    /// Mark the recording complete; the playlist gains `#EXT-X-ENDLIST`.
    pub fn finish(&mut self) {
        self.ended = true;
    }

    pub fn is_finished(&self) -> bool {
        self.ended
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Total recorded duration in seconds.
    pub fn duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    pub fn render(&self) -> String {
        MediaPlaylist {
            target_duration: self.target_duration,
            media_sequence: self.segments.first().map_or(1, |s| s.index),
            allow_cache: Some(true),
            segments: self
                .segments
                .iter()
                .map(|s| s.to_segment(&self.label, None))
                .collect(),
            ended: self.ended,
        }
        .to_string()
    }
}
