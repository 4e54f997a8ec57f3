//! Relay server library.
//!
//! Provides a reusable serve function for the binary and for tests.

#![deny(missing_docs)]

mod auth;
mod health;
pub mod logger;

use std::net::SocketAddr;

use anyhow::anyhow;
use axum::{Router, middleware, routing::get};
use config::Config;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use auth::ApiKeyAuth;

/// Configuration for serving relay.
pub struct ServeConfig {
    /// The socket address the server binds to.
    pub listen_address: SocketAddr,
    /// The deserialized relay TOML configuration.
    pub config: Config,
    /// Cancellation token for graceful shutdown.
    pub shutdown_signal: CancellationToken,
    /// Log filter string, e.g. `info` or `gateway=debug`.
    pub log_filter: String,
    /// The version string logged on startup.
    pub version: String,
    /// Optional oneshot sender for the bound address (useful with port 0).
    pub bound_addr_sender: Option<tokio::sync::oneshot::Sender<SocketAddr>>,
}

/// Start and run the relay server with the provided configuration.
pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        shutdown_signal,
        log_filter,
        version,
        bound_addr_sender,
    }: ServeConfig,
) -> anyhow::Result<()> {
    logger::init(&log_filter);

    log::info!("Relay {version}");

    let gateway = gateway::build(&config).await.map_err(|e| {
        log::error!("Failed to initialize gateway: {e:?}");
        anyhow!("Failed to initialize gateway: {e}")
    })?;

    let Some(api_key) = config.server.api_key.clone() else {
        anyhow::bail!("No API key configured. Set [server].api_key in the configuration.");
    };

    let auth = ApiKeyAuth::new(&api_key);
    let auth_layer = middleware::from_fn(move |request: axum::extract::Request, next: middleware::Next| {
        let auth = auth.clone();
        async move { auth::require_api_key(auth, request, next).await }
    });

    let mut app = Router::new()
        .merge(gateway::openai_router(gateway.clone()))
        .merge(gateway::anthropic_router(gateway.clone()))
        .merge(gateway::gemini_router(gateway.clone()))
        .layer(auth_layer)
        .layer(CorsLayer::permissive());

    if config.server.health.enabled {
        app = app.route(&config.server.health.path, get(health::health));
    }

    let listener = TcpListener::bind(listen_address)
        .await
        .map_err(|e| anyhow!("Failed to bind to {listen_address}: {e}"))?;

    let bound = listener.local_addr()?;

    if let Some(sender) = bound_addr_sender {
        sender.send(bound).map_err(|_| anyhow!("Failed to send back bound address."))?;
    }

    log::info!("OpenAI endpoint: http://{bound}/v1/chat/completions");
    log::info!("Anthropic endpoint: http://{bound}/v1/messages");
    log::info!("Gemini endpoint: http://{bound}/v1beta/models");

    tokio::select! {
        result = axum::serve(listener, app.into_make_service()) => {
            result.map_err(|e| anyhow!("Failed to start HTTP server: {e}"))?;
        }
        _ = shutdown_signal.cancelled() => {
            log::info!("Received shutdown signal, shutting down gracefully...");
        }
    }

    Ok(())
}
