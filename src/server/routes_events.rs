//! Recent pipeline events.

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use knive_core::events::Event;

use super::AppContext;

const DEFAULT_LIMIT: usize = 50;

pub fn event_routes() -> Router<AppContext> {
    Router::new().route("/events", get(recent_events))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

async fn recent_events(
    State(ctx): State<AppContext>,
    Query(query): Query<EventsQuery>,
) -> Json<Vec<Event>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    Json(ctx.knive.events.recent_events(limit))
}
