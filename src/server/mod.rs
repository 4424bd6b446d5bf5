//! The admin HTTP API.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use knive_core::Error;

use crate::channel::Channel;
use crate::context::KniveContext;

pub mod error;
pub mod routes_channels;
pub mod routes_config;
pub mod routes_events;
pub mod settings;

pub use error::AppError;
pub use settings::SettingsStore;

/// Shared application context
#[derive(Clone)]
pub struct AppContext {
    pub knive: KniveContext,
    /// Channels by slug.
    pub channels: Arc<BTreeMap<String, Arc<Channel>>>,
    pub settings: Arc<SettingsStore>,
}

impl AppContext {
    pub fn new(knive: KniveContext, channels: &[Arc<Channel>], settings: SettingsStore) -> Self {
        Self {
            knive,
            channels: Arc::new(
                channels
                    .iter()
                    .map(|c| (c.slug().to_string(), c.clone()))
                    .collect(),
            ),
            settings: Arc::new(settings),
        }
    }

    pub fn channel(&self, slug: &str) -> Result<&Arc<Channel>, AppError> {
        self.channels
            .get(slug)
            .ok_or_else(|| Error::not_found("Channel", slug).into())
    }
}

/// Create the Axum router with all routes
pub fn create_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

fn api_routes() -> Router<AppContext> {
    routes_channels::channel_routes()
        .merge(routes_config::config_routes())
        .merge(routes_events::event_routes())
}

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// Bind the configured address and serve until `shutdown` is cancelled.
pub async fn start_server(ctx: AppContext, shutdown: CancellationToken) -> Result<()> {
    let server = ctx.settings.snapshot().server;
    let addr: SocketAddr = format!("{}:{}", server.host, server.port)
        .parse()
        .context("Invalid server address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind admin API on {addr}"))?;
    serve(listener, ctx, shutdown).await
}

/// Serve the admin API on an already bound listener.
pub async fn serve(listener: TcpListener, ctx: AppContext, shutdown: CancellationToken) -> Result<()> {
    tracing::info!("Admin API listening on {}", listener.local_addr()?);

    axum::serve(listener, create_router(ctx))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use knive_core::config::Config;
    use tower::ServiceExt;

    fn app() -> Router {
        let config = Config::default();
        let settings = SettingsStore::new(&config, None);
        let knive = KniveContext::with_tools(config, knive_av::ToolRegistry::default());
        create_router(AppContext::new(knive, &[], settings))
    }

    #[tokio::test]
    async fn health_is_ok() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_channel_is_a_json_404() {
        let response = app()
            .oneshot(Request::get("/api/v1/channels/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], 404);
        assert!(json["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn settings_write_rejects_unknown_keys() {
        let response = app()
            .oneshot(
                Request::put("/api/v1/config/paths/data_dir")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("\"/tmp\""))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
