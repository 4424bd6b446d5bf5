//! Configuration API routes.
//!
//! Reads return the effective configuration with feed and relay secrets
//! masked. The single write endpoint goes through the [`SettingsStore`].
//!
//! [`SettingsStore`]: super::settings::SettingsStore

use axum::{
    extract::{Path, State},
    routing::{get, put},
    Json, Router,
};
use serde_json::{json, Value};

use super::error::{ApiResult, AppError};
use super::settings::WRITABLE_KEYS;
use super::AppContext;

const MASK: &str = "********";

pub fn config_routes() -> Router<AppContext> {
    Router::new()
        .route("/config", get(get_config))
        .route("/config/{section}/{key}", put(set_value))
}

async fn get_config(State(ctx): State<AppContext>) -> ApiResult<Json<Value>> {
    let settings = ctx.settings.snapshot();
    let config = &ctx.knive.config;
    let mut channels = serde_json::to_value(&config.channels)
        .map_err(|e| AppError::new(axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    mask_secrets(&mut channels);

    Ok(Json(json!({
        "server": settings.server,
        "logging": settings.logging,
        "paths": config.paths,
        "tools": config.tools,
        "channels": channels,
        "writable": WRITABLE_KEYS
            .iter()
            .map(|(section, key)| format!("{section}.{key}"))
            .collect::<Vec<_>>(),
    })))
}

async fn set_value(
    State(ctx): State<AppContext>,
    Path((section, key)): Path<(String, String)>,
    Json(value): Json<Value>,
) -> ApiResult<Json<Value>> {
    ctx.settings.set(&section, &key, &value)?;
    Ok(Json(json!({
        "section": section,
        "key": key,
        "value": value,
        "restart_required": true,
    })))
}

fn mask_secrets(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map.iter_mut() {
                if key == "secret" {
                    *inner = Value::String(MASK.into());
                } else {
                    mask_secrets(inner);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(mask_secrets),
        _ => {}
    }
}
