mod auth;
mod config;
mod middleware;

mod db;
mod domain;
mod error;
mod gateways;
mod hub;
mod jobs;
mod models;
mod notifications;
mod routes;

use std::sync::Arc;
use std::time::Duration;

use crate::{
    auth::JwtKeys,
    config::Config,
    domain::retry::RetryPolicy,
    gateways::{EmailGateway, MessageGateway, WhatsAppGateway},
    hub::NotificationHub,
    models::AppState,
    notifications::NotificationService,
};

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use axum::http::header;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = Arc::new(Config::from_env()?);
    let pool = db::connect(cfg.database_provider, &cfg.database_url).await?;
    if cfg.run_migrations {
        db::migrate(&pool).await?;
    }

    let jwt = JwtKeys::new(&cfg.jwt_secret, &cfg.jwt_issuer, cfg.access_token_ttl_minutes);
    let hub = NotificationHub::new();

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()?;
    let policy = RetryPolicy::new(
        cfg.gateway_max_attempts,
        Duration::from_millis(cfg.gateway_base_delay_ms),
    );
    let whatsapp = cfg.whatsapp_gateway_url.as_deref().map(|url| {
        tracing::info!(%url, "whatsapp gateway enabled");
        Arc::new(WhatsAppGateway::new(http.clone(), url, policy)) as Arc<dyn MessageGateway>
    });
    let email = cfg.email_gateway_url.as_deref().map(|url| {
        tracing::info!(%url, "email gateway enabled");
        Arc::new(EmailGateway::new(http.clone(), url, policy)) as Arc<dyn MessageGateway>
    });

    let notifier = Arc::new(NotificationService::new(pool.clone(), hub.clone(), whatsapp, email));

    jobs::spawn_reminder_job(pool.clone(), cfg.clone(), notifier.clone());
    jobs::spawn_cleanup_job(pool.clone(), cfg.clone());

    let state = AppState {
        db: pool,
        config: cfg.clone(),
        jwt,
        hub,
        notifier,
    };

    // browser clients call the API cross-origin; bearer tokens, no cookies
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
        ]);

    let app = routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on http://{}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl+C received, shutting down"),
        _ = terminate => tracing::info!("SIGTERM received, shutting down"),
    }
}
