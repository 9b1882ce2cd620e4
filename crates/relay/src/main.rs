use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    routing::{delete, get, post},
    Router,
};
use gateway::{Gateway, HttpGateway, MemoryGateway};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod broadcast;
mod config;
mod registry;
mod ws;

use app_state::AppState;
use config::{load_settings, GatewayBackend, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = load_settings();
    let gateway = build_gateway(&settings).await?;
    let state = AppState::new(gateway, settings.outbox_capacity);
    let app = build_router(Arc::new(state), settings.max_body_bytes);

    let addr: SocketAddr = settings
        .server_bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", settings.server_bind))?;
    info!(%addr, backend = ?settings.gateway_backend, "relay listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn build_gateway(settings: &Settings) -> anyhow::Result<Arc<dyn Gateway>> {
    match settings.gateway_backend {
        GatewayBackend::Memory => Ok(Arc::new(MemoryGateway::seeded().await)),
        GatewayBackend::Http => {
            let config = settings.http_gateway_config()?;
            info!(upstream = %config.base_url, "using upstream http gateway");
            Ok(Arc::new(HttpGateway::new(config)))
        }
    }
}

fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(api::status))
        .route("/me", get(api::current_user))
        .route("/groups", get(api::list_groups).post(api::create_group))
        .route(
            "/groups/:group_id/messages",
            get(api::list_messages).post(api::post_message),
        )
        .route("/groups/:group_id/members", post(api::add_member))
        .route(
            "/groups/:group_id/members/:user_id",
            delete(api::remove_member),
        )
        .route("/ws", get(ws::ws_handler))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
