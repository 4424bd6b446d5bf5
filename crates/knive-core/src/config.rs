//! Application configuration types.
//!
//! The top-level [`Config`] is deserialized from TOML by the binary and
//! carries the server, paths, tools, logging and channel sections. Every
//! section defaults sensibly so an empty file is valid (it just defines no
//! channels).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub tools: ToolsConfig,
    pub logging: LoggingConfig,
    pub channels: Vec<ChannelConfig>,
}

impl Config {
    /// Look up a channel section by slug.
    pub fn channel(&self, slug: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.slug == slug)
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Admin HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".into(),
            port: 8080,
        }
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of all published and recorded output.
    pub data_dir: PathBuf,
    /// Where segmenters write in-progress chunks. A private temporary
    /// directory is created per writer when unset.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("knivedata"),
            scratch_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// External tool locations and process handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub segmenter_path: Option<PathBuf>,
    /// How long a stopping process may take to exit after its input closes
    /// before it is killed.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            segmenter_path: None,
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

fn default_stop_timeout_secs() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// A `tracing` env-filter directive such as `"knive=debug"`.
    /// `RUST_LOG` takes precedence when set.
    pub level: Option<String>,
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

/// One broadcast channel: a feed and the outlets hanging off it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub slug: String,
    /// Public URL where viewers find the channel.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub outlets: Vec<OutletConfig>,
}

/// The authenticated TCP feed listener of a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub host: String,
    pub port: u16,
    pub secret: String,
    pub handshake_timeout_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: default_feed_port(),
            secret: String::new(),
            handshake_timeout_secs: 10,
        }
    }
}

fn default_feed_port() -> u16 {
    3333
}

/// A consumer attached directly to a channel's feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutletConfig {
    HttpLive(HttpLiveConfig),
    Archive(ArchiveConfig),
    Relay(RelayConfig),
}

impl OutletConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            OutletConfig::HttpLive(_) => "httplive",
            OutletConfig::Archive(_) => "archive",
            OutletConfig::Relay(_) => "relay",
        }
    }
}

/// Segmented live output with one variant per quality.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpLiveConfig {
    pub name: String,
    /// Nominal segment length in seconds.
    pub segment_duration: u32,
    /// Sliding window size of the live playlist.
    pub max_segments: usize,
    pub playlist_name: String,
    /// Prefix prepended to every segment URI in the playlist.
    pub publish_url: Option<String>,
    pub allow_cache: bool,
    /// Restart a crashed encoder or segmenter instead of leaving it stopped.
    pub restart_on_crash: bool,
    pub qualities: BTreeMap<String, QualityConfig>,
}

impl Default for HttpLiveConfig {
    fn default() -> Self {
        Self {
            name: "live".into(),
            segment_duration: 10,
            max_segments: 5,
            playlist_name: "stream.m3u8".into(),
            publish_url: None,
            allow_cache: false,
            restart_on_crash: true,
            qualities: BTreeMap::new(),
        }
    }
}

/// One variant of an HTTP live stream.
///
/// Every key other than the metadata fields is an encoder option, e.g.
/// `vcodec = "libx264"` or `an = true`. A quality without encoder options
/// passes the feed through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityConfig {
    /// Peak bandwidth advertised in the master playlist.
    #[serde(default)]
    pub bandwidth: Option<u64>,
    /// `CODECS` attribute advertised in the master playlist.
    #[serde(default)]
    pub codecstring: Option<String>,
    #[serde(flatten)]
    pub encoder: BTreeMap<String, ArgValue>,
}

/// A single encoder option value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Flag(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<ArgValue>),
}

impl std::fmt::Display for ArgValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgValue::Flag(b) => write!(f, "{b}"),
            ArgValue::Integer(i) => write!(f, "{i}"),
            ArgValue::Float(v) => write!(f, "{v}"),
            ArgValue::Text(s) => f.write_str(s),
            ArgValue::List(items) => {
                let parts: Vec<String> = items.iter().map(ToString::to_string).collect();
                f.write_str(&parts.join(","))
            }
        }
    }
}

/// Raw-file archive of the feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Output directory; defaults to `<data_dir>/<slug>/archive`.
    pub dir: Option<PathBuf>,
    pub filename: String,
    pub suffix: String,
    /// Number of rotated previous files to keep.
    pub keep_files: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            dir: None,
            filename: "stream".into(),
            suffix: "ts".into(),
            keep_files: 5,
        }
    }
}

/// Forward the feed to another knive instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub host: String,
    #[serde(default = "default_feed_port")]
    pub port: u16,
    pub secret: String,
}
