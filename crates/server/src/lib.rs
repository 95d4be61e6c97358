pub mod error;
pub mod mcp;
pub mod routes;
pub mod state;

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tracing::info;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;

/// Bind and serve until SIGINT/SIGTERM.
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<(), std::io::Error> {
    let app = create_router(state);
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "engram listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("engram shutting down");
    Ok(())
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
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received terminate signal, shutting down"),
    }
}
