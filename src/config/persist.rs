//! Configuration persistence using toml_edit to preserve formatting and comments.

use anyhow::{Context, Result};
use std::path::Path;
use toml_edit::{DocumentMut, Item, Table};

/// Set `[section].key = value` in the config file, keeping everything else as written.
pub fn update_setting(path: &Path, section: &str, key: &str, value: toml_edit::Value) -> Result<()> {
    let content = if path.exists() {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?
    } else {
        String::new()
    };

    let mut doc: DocumentMut = content
        .parse()
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    let table = doc
        .entry(section)
        .or_insert_with(|| Item::Table(Table::new()))
        .as_table_mut()
        .with_context(|| format!("[{}] is not a table in {:?}", section, path))?;
    table[key] = toml_edit::value(value);

    std::fs::write(path, doc.to_string())
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    Ok(())
}

/// Convert a JSON scalar into a TOML value.
pub fn json_to_toml(value: &serde_json::Value) -> Option<toml_edit::Value> {
    match value {
        serde_json::Value::Bool(b) => Some((*b).into()),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(toml_edit::Value::from)
            .or_else(|| n.as_f64().map(toml_edit::Value::from)),
        serde_json::Value::String(s) => Some(s.as_str().into()),
        _ => None,
    }
}
