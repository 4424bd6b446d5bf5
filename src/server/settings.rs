//! Runtime settings editable through the admin API.
//!
//! Only the `[server]` and `[logging]` sections are writable. Changes are
//! kept in memory and, when the process was started from a config file,
//! written back to it. They take effect on the next start.

use std::path::PathBuf;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;

use knive_core::config::{Config, LoggingConfig, ServerConfig};
use knive_core::{Error, Result};

use crate::config::persist;

/// Keys accepted by [`SettingsStore::set`], as `(section, key)`.
pub const WRITABLE_KEYS: [(&str, &str); 4] = [
    ("server", "enabled"),
    ("server", "host"),
    ("server", "port"),
    ("logging", "level"),
];

#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

pub struct SettingsStore {
    settings: RwLock<Settings>,
    config_path: Option<PathBuf>,
}

impl SettingsStore {
    pub fn new(config: &Config, config_path: Option<PathBuf>) -> Self {
        Self {
            settings: RwLock::new(Settings {
                server: config.server.clone(),
                logging: config.logging.clone(),
            }),
            config_path,
        }
    }

    pub fn snapshot(&self) -> Settings {
        self.settings.read().clone()
    }

    /// Apply `[section].key = value` and persist it.
    pub fn set(&self, section: &str, key: &str, value: &Value) -> Result<()> {
        let invalid = || Error::Validation(format!("invalid value for '{section}.{key}': {value}"));

        {
            let mut settings = self.settings.write();
            match (section, key) {
                ("server", "enabled") => settings.server.enabled = value.as_bool().ok_or_else(invalid)?,
                ("server", "host") => {
                    settings.server.host = value.as_str().filter(|s| !s.is_empty()).ok_or_else(invalid)?.to_string()
                }
                ("server", "port") => {
                    settings.server.port = value
                        .as_u64()
                        .and_then(|p| u16::try_from(p).ok())
                        .filter(|p| *p != 0)
                        .ok_or_else(invalid)?
                }
                ("logging", "level") => settings.logging.level = Some(value.as_str().ok_or_else(invalid)?.to_string()),
                _ => return Err(Error::Validation(format!("unknown setting '{section}.{key}'"))),
            }
        }

        if let Some(path) = &self.config_path {
            let toml_value = persist::json_to_toml(value).ok_or_else(invalid)?;
            persist::update_setting(path, section, key, toml_value)
                .map_err(|e| Error::Internal(format!("{e:#}")))?;
            tracing::info!("Persisted {}.{} to {:?}", section, key, path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn known_keys_update_the_snapshot() {
        let store = SettingsStore::new(&Config::default(), None);
        store.set("server", "port", &json!(9000)).unwrap();
        store.set("logging", "level", &json!("knive=debug")).unwrap();
        let settings = store.snapshot();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.logging.level.as_deref(), Some("knive=debug"));
    }

    #[test]
    fn unknown_keys_and_bad_values_are_rejected() {
        let store = SettingsStore::new(&Config::default(), None);
        assert_matches!(store.set("paths", "data_dir", &json!("/tmp")), Err(Error::Validation(_)));
        assert_matches!(store.set("server", "port", &json!(70000)), Err(Error::Validation(_)));
        assert_matches!(store.set("server", "enabled", &json!("yes")), Err(Error::Validation(_)));
        assert_eq!(store.snapshot().server.port, 8080);
    }

    #[test]
    fn changes_are_written_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knive.toml");
        std::fs::write(&path, "[server]\nport = 8080\n").unwrap();
        let store = SettingsStore::new(&Config::default(), Some(path.clone()));
        store.set("server", "host", &json!("0.0.0.0")).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("host = \"0.0.0.0\""));
        assert!(written.contains("port = 8080"));
    }
}
