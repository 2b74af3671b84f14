use control_plane::config::{self, Config, DEFAULT_CONFIG_PATH};
use control_plane::state::AppState;
use std::env;
use std::path::Path;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = load_config_or_exit();

    let state = match AppState::build(&config).await {
        Ok(state) => state,
        Err(e) => {
            eprintln!("failed to build runtime: {e}");
            std::process::exit(1);
        }
    };
    let shutdown = state.shutdown.clone();
    let router = control_plane::build_router(state);

    let listener = match tokio::net::TcpListener::bind(&config.server.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("failed to bind {}: {e}", config.server.bind);
            std::process::exit(1);
        }
    };
    info!(addr = config.server.bind.as_str(), "control plane listening");

    let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
        shutdown_signal().await;
        // Stop the background loops (forwarder workers flush their batches,
        // the pool drains and fails queued jobs) before the listener closes.
        shutdown.cancel();
    });
    if let Err(e) = serve.await {
        eprintln!("server error: {e}");
        std::process::exit(1);
    }
    info!("control plane shut down gracefully");
}

fn load_config_or_exit() -> Config {
    if let Ok(path) = env::var("CONFIG_PATH") {
        match config::load_config_from_path(Path::new(&path)) {
            Ok(config) => return config,
            Err(e) => {
                eprintln!("failed to load config '{path}': {e}");
                std::process::exit(1);
            }
        }
    }
    if Path::new(DEFAULT_CONFIG_PATH).exists() {
        match config::load_config() {
            Ok(config) => return config,
            Err(e) => {
                eprintln!("failed to load config '{DEFAULT_CONFIG_PATH}': {e}");
                std::process::exit(1);
            }
        }
    }
    info!("no config file found, using built-in defaults");
    Config::default()
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
