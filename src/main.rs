//! PennyBot - Personal Finance Ingestion & Classification Engine
//! Mission: Documents in, categorized transactions out

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pennybot_backend::{api, Config};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;

    info!("🚀 PennyBot backend starting");
    info!(
        "🧠 LLM provider: {} (categorization {})",
        config.llm_provider.as_str(),
        if config.llm_categorization_enabled {
            "enabled"
        } else {
            "disabled"
        }
    );
    if config.allow_local_dev_bypass {
        info!("⚠️  Local dev auth bypass is ON - never run like this in production");
    }

    let state = api::AppState::build(&config).context("Failed to wire application state")?;

    let cors = match &config.cors_allowed_origin {
        Some(origin) => {
            let parsed = origin
                .parse()
                .with_context(|| format!("Invalid CORS_ALLOWED_ORIGIN: {origin}"))?;
            CorsLayer::new()
                .allow_origin(AllowOrigin::exact(parsed))
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any)
        }
        None => CorsLayer::permissive(),
    };

    let app = api::router(state).layer(cors).layer(axum::middleware::from_fn(
        pennybot_backend::middleware::logging::request_logging,
    ));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("🎯 API server listening on {addr}");

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
