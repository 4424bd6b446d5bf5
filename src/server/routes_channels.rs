//! Channel status and recording control.

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use knive_core::Error;

use super::error::{ApiResult, AppError};
use super::AppContext;
use crate::channel::{ChannelStatus, Episode};

pub fn channel_routes() -> Router<AppContext> {
    Router::new()
        .route("/channels", get(list_channels))
        .route("/channels/{slug}", get(get_channel))
        .route(
            "/channels/{slug}/recording",
            axum::routing::post(start_recording).delete(stop_recording),
        )
}

async fn list_channels(State(ctx): State<AppContext>) -> Json<Vec<ChannelStatus>> {
    let mut statuses = Vec::with_capacity(ctx.channels.len());
    for channel in ctx.channels.values() {
        statuses.push(channel.status().await);
    }
    Json(statuses)
}

async fn get_channel(
    State(ctx): State<AppContext>,
    Path(slug): Path<String>,
) -> ApiResult<Json<ChannelStatus>> {
    let channel = ctx.channel(&slug)?;
    Ok(Json(channel.status().await))
}

#[derive(Debug, Default, Deserialize)]
struct StartRecordingRequest {
    /// Stop the episode automatically after this many seconds.
    auto_stop_secs: Option<u64>,
}

async fn start_recording(
    State(ctx): State<AppContext>,
    Path(slug): Path<String>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Episode>)> {
    let channel = ctx.channel(&slug)?;
    let req: StartRecordingRequest = if body.iter().all(u8::is_ascii_whitespace) {
        StartRecordingRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| AppError::bad_request(format!("Invalid request body: {e}")))?
    };

    let episode = match req.auto_stop_secs {
        Some(0) => return Err(Error::Validation("auto_stop_secs must be positive".into()).into()),
        Some(secs) => channel.start_episode_for(Duration::from_secs(secs)).await?,
        None => channel.start_episode().await?,
    };
    Ok((StatusCode::CREATED, Json(episode)))
}

async fn stop_recording(
    State(ctx): State<AppContext>,
    Path(slug): Path<String>,
) -> ApiResult<Json<Episode>> {
    let channel = ctx.channel(&slug)?;
    Ok(Json(channel.stop_episode().await?))
}
