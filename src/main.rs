use std::sync::Arc;

use msgbridge::api::router;
use msgbridge::config::{load_config, AppConfig};
use msgbridge::observability::init_tracing;
use msgbridge::state::AppState;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";

fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = load_config(&config_path).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration from '{config_path}': {e}");
        eprintln!("Please copy 'config.example.yaml' to 'config.yaml' and modify as needed.");
        std::process::exit(1);
    });

    init_tracing(&config.features.log_level, config.features.log_format);
    let runtime = build_runtime(&config);

    runtime.block_on(async move {
        run(config).await;
    });
}

fn build_runtime(config: &AppConfig) -> tokio::runtime::Runtime {
    let worker_threads = config.server.runtime_worker_threads;
    let mut runtime_builder = if worker_threads == Some(1) {
        tokio::runtime::Builder::new_current_thread()
    } else {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        if let Some(threads) = worker_threads {
            builder.worker_threads(threads);
        }
        builder
    };
    runtime_builder.enable_io();
    runtime_builder.enable_time();
    runtime_builder.build().unwrap_or_else(|e| {
        eprintln!("Failed to initialize Tokio runtime: {e}");
        std::process::exit(1);
    })
}

async fn run(config: AppConfig) {
    let host = config.server.host.clone();
    let port = config.server.port;

    tracing::info!(
        upstream = %config.upstream.chat_completions_url(),
        markup = %config.upstream.markup,
        model_override = config.upstream.model.as_deref().unwrap_or("-"),
        "msgbridge starting on {}:{}",
        host,
        port
    );

    let state = AppState::new(config).unwrap_or_else(|err| {
        eprintln!("Failed to initialize upstream client: {err}");
        std::process::exit(1);
    });
    let app = router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .unwrap_or_else(|err| {
            eprintln!("Failed to bind to {host}:{port}: {err}");
            std::process::exit(1);
        });

    tracing::info!("msgbridge is ready to accept connections");
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %err, "server terminated");
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
