//! Multi-account OAuth credential pool gateway.
//!
//! Single binary that:
//! 1. Loads a TOML config describing which providers (Anthropic, OpenAI,
//!    or both) to run and where their upstream APIs live.
//! 2. Starts one `credential_pool::Engine` per configured provider.
//! 3. Serves a public proxy surface (`/anthropic/*`, `/openai/*`, `/health`)
//!    that forwards requests through the matching engine.
//! 4. Serves an admin surface (account management + `/metrics`) on a
//!    separate listener.

mod admin;
mod collaborators;
mod config;
mod error;
mod metrics;
mod proxy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use credential_pool::{Engine, NullHostClient, Provider, Refresher, RequestTransport, UsageFetcher};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::collaborators::{AnthropicCollaborator, OpenAiCollaborator};
use crate::config::{Config, HeaderInjection};

#[derive(Clone)]
struct ProxyState {
    engines: Arc<HashMap<String, ProviderRoute>>,
    started_at: Instant,
}

#[derive(Clone)]
struct ProviderRoute {
    engine: Arc<Engine>,
    upstream_url: String,
    headers: Vec<HeaderInjection>,
    timeout: Duration,
    client: reqwest::Client,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting multiauth-gateway");

    let args: Vec<String> = std::env::args().collect();
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.into())
        .unwrap_or_else(|| std::path::PathBuf::from("gateway.toml"));

    info!(path = %config_path.display(), "loading configuration");
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let host = Arc::new(NullHostClient);
    let mut engines = HashMap::new();

    if let Some(provider_config) = &config.anthropic {
        let client = proxy::upstream_client(Duration::from_secs(config.proxy.timeout_secs));
        let collaborator = Arc::new(AnthropicCollaborator::new(client.clone()));
        let engine = Engine::start(
            Provider::Anthropic,
            collaborator.clone() as Arc<dyn Refresher>,
            collaborator.clone() as Arc<dyn UsageFetcher>,
            collaborator as Arc<dyn RequestTransport>,
            host.clone(),
        )
        .await;
        info!("anthropic engine started");
        engines.insert(
            "anthropic".to_string(),
            ProviderRoute {
                engine,
                upstream_url: provider_config.upstream_url.clone(),
                headers: config.headers.clone(),
                timeout: Duration::from_secs(config.proxy.timeout_secs),
                client,
            },
        );
    }

    if let Some(provider_config) = &config.openai {
        let client = proxy::upstream_client(Duration::from_secs(config.proxy.timeout_secs));
        let collaborator = Arc::new(OpenAiCollaborator::new(client.clone()));
        let engine = Engine::start(
            Provider::OpenAi,
            collaborator.clone() as Arc<dyn Refresher>,
            collaborator.clone() as Arc<dyn UsageFetcher>,
            collaborator as Arc<dyn RequestTransport>,
            host.clone(),
        )
        .await;
        info!("openai engine started");
        engines.insert(
            "openai".to_string(),
            ProviderRoute {
                engine,
                upstream_url: provider_config.upstream_url.clone(),
                headers: config.headers.clone(),
                timeout: Duration::from_secs(config.proxy.timeout_secs),
                client,
            },
        );
    }

    let engines = Arc::new(engines);

    let metrics_handle = metrics::install_recorder();

    let proxy_state = ProxyState {
        engines: engines.clone(),
        started_at: Instant::now(),
    };

    let proxy_app = Router::new()
        .route("/health", get(health_handler))
        .route("/{provider}/{*rest}", axum::routing::any(proxy_handler))
        .with_state(proxy_state);

    let admin_engines: HashMap<String, Arc<Engine>> = engines
        .iter()
        .map(|(name, route)| (name.clone(), route.engine.clone()))
        .collect();
    let admin_state = admin::AdminState::new(admin_engines, reqwest::Client::new());
    let admin_app = admin::build_admin_router(admin_state)
        .route("/metrics", get(move || render_metrics(metrics_handle.clone())));

    let proxy_listener = TcpListener::bind(config.proxy.listen_addr)
        .await
        .with_context(|| format!("failed to bind proxy listener to {}", config.proxy.listen_addr))?;
    let admin_listener = TcpListener::bind(config.admin.listen_addr)
        .await
        .with_context(|| format!("failed to bind admin listener to {}", config.admin.listen_addr))?;

    info!(addr = %config.proxy.listen_addr, "proxy listening");
    info!(addr = %config.admin.listen_addr, "admin listening");

    let proxy_server = axum::serve(proxy_listener, proxy_app).with_graceful_shutdown(shutdown_signal());
    let admin_server = axum::serve(admin_listener, admin_app).with_graceful_shutdown(shutdown_signal());

    let (proxy_result, admin_result) = tokio::join!(proxy_server, admin_server);
    proxy_result.context("proxy server error")?;
    admin_result.context("admin server error")?;

    for route in engines.values() {
        route.engine.shutdown().await;
    }

    info!("shutdown complete");
    Ok(())
}

async fn render_metrics(handle: metrics_exporter_prometheus::PrometheusHandle) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
}

async fn health_handler(State(state): State<ProxyState>) -> impl IntoResponse {
    let uptime = state.started_at.elapsed().as_secs();
    let providers: Vec<_> = state.engines.keys().cloned().collect();

    let body = serde_json::json!({
        "status": "healthy",
        "uptime_seconds": uptime,
        "providers": providers,
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

async fn proxy_handler(
    State(state): State<ProxyState>,
    axum::extract::Path((provider, _rest)): axum::extract::Path<(String, String)>,
    request: axum::http::Request<axum::body::Body>,
) -> Response {
    let Some(route) = state.engines.get(&provider) else {
        return error::Error::UnknownProvider(provider).status_code().into_response();
    };

    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());

    match proxy::proxy_request(
        &route.engine,
        &provider,
        &request_id,
        &route.upstream_url,
        &route.headers,
        route.timeout,
        &route.client,
        request,
    )
    .await
    {
        Ok(response) => response,
        Err(e) => (e.status_code(), e.to_string()).into_response(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
