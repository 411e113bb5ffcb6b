use crate::{
    coaching::{CoachingService, LedgerStore, PaymentProcessor},
    config::Config,
    http,
};
use axum::{extract::DefaultBodyLimit, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

/// HTTP server for a coaching service
pub struct App {
    router: Router,
    config: Config,
}

impl App {
    /// Creates an app serving the coaching routes for `service`
    pub fn new<S, P>(config: Config, service: Arc<CoachingService<S, P>>) -> Self
    where
        S: LedgerStore + Clone + 'static,
        P: PaymentProcessor + Clone + 'static,
    {
        Self {
            router: http::router(service),
            config,
        }
    }

    /// Merge additional routes into the app
    pub fn merge_router(mut self, router: Router) -> Self {
        self.router = self.router.merge(router);
        self
    }

    /// Apply the middleware stack
    ///
    /// Layers run outermost first: body limit, request ID, tracing.
    pub fn into_router(self) -> Router {
        let max_body_size = self.config.server.max_body_size;

        self.router
            // HTTP tracing, innermost
            .layer(TraceLayer::new_for_http())
            // Request ID - add request IDs for tracing
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            // Body limit - webhook payloads and JSON bodies
            .layer(DefaultBodyLimit::max(max_body_size))
    }

    /// Start the application server
    pub async fn serve(self) -> Result<(), std::io::Error> {
        let addr = self.config.server.addr().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid server address in config: {}", e),
            )
        })?;

        let listener = tokio::net::TcpListener::bind(addr).await?;

        tracing::info!("Server starting on http://{}", addr);
        tracing::info!("Health check available at http://{}/health", addr);

        axum::serve(listener, self.into_router())
            .with_graceful_shutdown(shutdown_signal())
            .await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, starting graceful shutdown");
        },
    }

    // Give connections a grace period to close
    tokio::time::sleep(Duration::from_secs(1)).await;
    tracing::info!("Shutdown complete");
}
