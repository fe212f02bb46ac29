use std::sync::Arc;

use controller::ControllerConfig;
use echonet_engine::Engine;
use echonet_protocol::Eoj;
use echonet_registry::Registry;
use echonet_transport::UdpTransport;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ControllerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .init();

    std::fs::create_dir_all(&config.data_dir)
        .expect("failed to create data directory");

    let transport = Arc::new(
        UdpTransport::new()
            .await
            .expect("failed to bind ECHONET Lite transport"),
    );
    info!("transport listening on port 3610");

    let registry = Arc::new(Registry::load(&config.data_dir));
    let engine = Engine::start(transport, registry.clone(), Eoj::NODE_PROFILE);

    let state = echonet_hub::HubState {
        engine,
        registry,
        auth_token: config.auth_token,
    };
    let router = echonet_hub::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind HTTP listener");
    info!(addr = %config.bind_addr, "controller listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    info!("controller shut down gracefully");
    Ok(())
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
