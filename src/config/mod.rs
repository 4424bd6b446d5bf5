pub mod persist;

pub use knive_core::config::*;

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Locations searched, in order, when no config file is given.
pub const DEFAULT_PATHS: [&str; 3] = [
    "./knive.toml",
    "~/.config/knive/config.toml",
    "/etc/knive/config.toml",
];

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// The first existing file of [`DEFAULT_PATHS`].
pub fn find_config() -> Option<PathBuf> {
    DEFAULT_PATHS.iter().find_map(|path_str| {
        let path = PathBuf::from(shellexpand::tilde(path_str).as_ref());
        path.exists().then_some(path)
    })
}

/// Load config from default locations or return default config.
///
/// Returns the path the config was read from, if any.
pub fn load_config_or_default(custom_path: Option<&Path>) -> Result<(Config, Option<PathBuf>)> {
    if let Some(path) = custom_path {
        return Ok((load_config(path)?, Some(path.to_path_buf())));
    }

    match find_config() {
        Some(path) => Ok((load_config(&path)?, Some(path))),
        None => {
            tracing::debug!("No config file found; using defaults");
            Ok((Config::default(), None))
        }
    }
}

/// Validate configuration
pub fn validate_config(config: &Config) -> Result<()> {
    if config.server.enabled && config.server.port == 0 {
        anyhow::bail!("Server port cannot be 0");
    }

    let mut slugs = HashSet::new();
    let mut feeds = HashSet::new();
    for channel in &config.channels {
        if channel.slug.is_empty()
            || !channel
                .slug
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            anyhow::bail!(
                "Channel '{}' has an invalid slug {:?} (use letters, digits, '-' and '_')",
                channel.name,
                channel.slug
            );
        }
        if !slugs.insert(channel.slug.as_str()) {
            anyhow::bail!("Channel slug '{}' is used more than once", channel.slug);
        }
        if channel.feed.secret.is_empty() {
            anyhow::bail!("Channel '{}' has no feed secret", channel.slug);
        }
        if channel.feed.port != 0 && !feeds.insert((channel.feed.host.as_str(), channel.feed.port)) {
            anyhow::bail!(
                "Channel '{}' feed address {}:{} is already used by another channel",
                channel.slug,
                channel.feed.host,
                channel.feed.port
            );
        }
        if channel.outlets.is_empty() {
            tracing::warn!("Channel '{}' has no outlets; its feed cannot start", channel.slug);
        }

        let mut streams = HashSet::new();
        for outlet in &channel.outlets {
            match outlet {
                OutletConfig::HttpLive(live) => {
                    if live.max_segments == 0 {
                        anyhow::bail!(
                            "Stream '{}/{}' must keep at least one segment (max_segments = 0)",
                            channel.slug,
                            live.name
                        );
                    }
                    if live.segment_duration == 0 {
                        anyhow::bail!("Stream '{}/{}' has a zero segment duration", channel.slug, live.name);
                    }
                    if live.qualities.is_empty() {
                        anyhow::bail!("Stream '{}/{}' defines no qualities", channel.slug, live.name);
                    }
                    if !streams.insert(live.name.as_str()) {
                        anyhow::bail!("Stream name '{}' is used twice in channel '{}'", live.name, channel.slug);
                    }
                }
                OutletConfig::Archive(archive) => {
                    if archive.filename.is_empty() {
                        anyhow::bail!("Archive of channel '{}' has no file name", channel.slug);
                    }
                }
                OutletConfig::Relay(relay) => {
                    if relay.secret.is_empty() {
                        anyhow::bail!("Relay {} of channel '{}' has no secret", relay.host, channel.slug);
                    }
                }
            }
        }
    }

    Ok(())
}
