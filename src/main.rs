use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use textgen_server::{
    api,
    config::ServerConfig,
    db::HistoryStore,
    inference::load_generator,
    service::GenerationService,
    state::AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------
    // Environment + logging
    // -----------------------------
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;
    let addr = config.bind_addr().await?;

    // -----------------------------
    // Model (blocking: downloads + mmap)
    // -----------------------------
    let model_cfg = config.model.clone();
    let generator = tokio::task::spawn_blocking(move || load_generator(&model_cfg))
        .await
        .context("model loader panicked")??;

    // -----------------------------
    // Storage
    // -----------------------------
    let store = HistoryStore::connect(&config.database).await?;
    store.initialize().await?;

    let service = GenerationService::new(
        generator,
        store.clone(),
        config.sampling,
        config.max_length_limit,
    );
    let state = AppState::new(service);
    let app = api::router(state);

    info!(%addr, "HTTP listening");
    info!("Generate at http://{addr}/generate, history at http://{addr}/history");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.close().await;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
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
    info!("shutdown signal received");
}
