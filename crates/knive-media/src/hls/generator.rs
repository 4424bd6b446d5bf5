//! HLS playlist generation functions.

use std::fmt;

use super::types::{MasterPlaylist, MediaPlaylist, PLAYLIST_VERSION};

impl fmt::Display for MasterPlaylist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "#EXTM3U")?;
        for variant in &self.variants {
            write!(f, "#EXT-X-STREAM-INF:PROGRAM-ID=1,BANDWIDTH={}", variant.bandwidth)?;
            if !variant.codecs.is_empty() {
                write!(f, ",CODECS=\"{}\"", variant.codecs)?;
            }
            writeln!(f)?;
            writeln!(f, "{}", variant.uri)?;
        }
        Ok(())
    }
}

impl fmt::Display for MediaPlaylist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "#EXTM3U")?;
        writeln!(f, "#EXT-X-VERSION:{PLAYLIST_VERSION}")?;
        writeln!(f, "#EXT-X-TARGETDURATION:{}", self.target_duration)?;
        if let Some(allow) = self.allow_cache {
            writeln!(f, "#EXT-X-ALLOW-CACHE:{}", if allow { "YES" } else { "NO" })?;
        }
        writeln!(f, "#EXT-X-MEDIA-SEQUENCE:{}", self.media_sequence)?;

        for segment in &self.segments {
            if segment.discontinuity {
                writeln!(f, "#EXT-X-DISCONTINUITY")?;
            }
            writeln!(
                f,
                "#EXTINF:{:.2},{}",
                segment.duration,
                segment.title.as_deref().unwrap_or_default()
            )?;
            writeln!(f, "{}", segment.uri)?;
        }

        if self.ended {
            writeln!(f, "#EXT-X-ENDLIST")?;
        }
        Ok(())
    }
}

/// Generate an HLS master playlist (M3U8) from a [`MasterPlaylist`].
///
/// Output includes `#EXTM3U` header and `#EXT-X-STREAM-INF` for each variant.
pub fn generate_master_playlist(playlist: &MasterPlaylist) -> String {
    playlist.to_string()
}

/// Generate an HLS media playlist (M3U8) from a [`MediaPlaylist`].
///
/// Output includes:
/// - `#EXTM3U` header and `#EXT-X-VERSION`
/// - `#EXT-X-TARGETDURATION`
/// - Optional `#EXT-X-ALLOW-CACHE`
/// - `#EXT-X-MEDIA-SEQUENCE`
/// - `#EXTINF` for each segment, preceded by `#EXT-X-DISCONTINUITY` where set
/// - Optional `#EXT-X-ENDLIST` for VOD playlists
pub fn generate_media_playlist(playlist: &MediaPlaylist) -> String {
    playlist.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::types::{Segment, Variant};

    fn segment(duration: f64, uri: &str) -> Segment {
        Segment {
            duration,
            uri: uri.to_string(),
            title: Some("live-high".to_string()),
            discontinuity: false,
        }
    }

    #[test]
    fn test_generate_master_playlist_basic() {
        let playlist = MasterPlaylist {
            variants: vec![
                Variant {
                    bandwidth: 640000,
                    codecs: "avc1.42001e,mp4a.40.2".to_string(),
                    uri: "high/stream.m3u8".to_string(),
                },
                Variant {
                    bandwidth: 64000,
                    codecs: String::new(),
                    uri: "audio/stream.m3u8".to_string(),
                },
            ],
        };

        let m3u8 = generate_master_playlist(&playlist);

        assert_eq!(
            m3u8,
            "#EXTM3U\n\
             #EXT-X-STREAM-INF:PROGRAM-ID=1,BANDWIDTH=640000,CODECS=\"avc1.42001e,mp4a.40.2\"\n\
             high/stream.m3u8\n\
             #EXT-X-STREAM-INF:PROGRAM-ID=1,BANDWIDTH=64000\n\
             audio/stream.m3u8\n"
        );
    }

    #[test]
    fn test_generate_master_playlist_empty() {
        assert_eq!(generate_master_playlist(&MasterPlaylist::default()), "#EXTM3U\n");
    }

    #[test]
    fn test_live_playlist_format_exact() {
        let playlist = MediaPlaylist {
            target_duration: 10,
            media_sequence: 1,
            allow_cache: Some(false),
            segments: vec![segment(10.0, "live-high-00000001.ts")],
            ended: false,
        };

        let expected = "\
#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:10
#EXT-X-ALLOW-CACHE:NO
#EXT-X-MEDIA-SEQUENCE:1
#EXTINF:10.00,live-high
live-high-00000001.ts
";
        assert_eq!(generate_media_playlist(&playlist), expected);
    }

    #[test]
    fn test_discontinuity_and_endlist() {
        let mut second = segment(9.52, "http://cdn.example/live-high-00000009.ts");
        second.discontinuity = true;
        let playlist = MediaPlaylist {
            target_duration: 10,
            media_sequence: 3,
            allow_cache: Some(true),
            segments: vec![segment(10.0, "http://cdn.example/live-high-00000003.ts"), second],
            ended: true,
        };

        let m3u8 = generate_media_playlist(&playlist);

        assert!(m3u8.contains("#EXT-X-ALLOW-CACHE:YES\n"));
        assert!(m3u8.contains(
            "#EXT-X-DISCONTINUITY\n#EXTINF:9.52,live-high\nhttp://cdn.example/live-high-00000009.ts\n"
        ));
        assert!(m3u8.ends_with("#EXT-X-ENDLIST\n"));
        assert_eq!(m3u8.matches("#EXT-X-DISCONTINUITY").count(), 1);
    }

    #[test]
    fn test_untitled_segment_and_no_cache_directive() {
        let playlist = MediaPlaylist {
            target_duration: 4,
            media_sequence: 100,
            allow_cache: None,
            segments: vec![Segment {
                duration: 4.0,
                uri: "seg100.ts".to_string(),
                title: None,
                discontinuity: false,
            }],
            ended: false,
        };

        let m3u8 = generate_media_playlist(&playlist);

        assert!(m3u8.contains("#EXTINF:4.00,\nseg100.ts\n"));
        assert!(!m3u8.contains("ALLOW-CACHE"));
        assert!(!m3u8.contains("#EXT-X-ENDLIST"));
    }
}
