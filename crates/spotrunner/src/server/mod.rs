pub mod bootstrap;
pub mod http;

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use crate::reconcile::reconcile_process;
use crate::server::bootstrap::Components;
use crate::server::http::{AppState, create_router};

/// Serves the HTTP surface until SIGINT is received.
///
/// When `reconcile_interval` is set, both reconcilers also run periodically inside the server.
pub async fn start_server(
    components: Components,
    listen: &str,
    reconcile_interval: Option<Duration>,
) -> crate::Result<()> {
    let image_reconciler = Arc::new(components.image_reconciler());
    let state = Arc::new(AppState {
        intake: components.intake(),
        status: components.status_aggregator(Some(image_reconciler.clone())),
    });

    let listener = tokio::net::TcpListener::bind(listen).await?;
    log::info!(
        "Listening for deliveries on {}",
        listener.local_addr()?
    );

    let stop_check = async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            log::error!("Cannot listen for SIGINT: {error}");
            return;
        }
        log::info!("Received SIGINT, attempting to stop");
    };

    let reconcile = async move {
        match reconcile_interval {
            Some(interval) => {
                reconcile_process(
                    Arc::new(components.job_reconciler()),
                    Some(image_reconciler),
                    interval,
                )
                .await
            }
            None => {
                log::info!("Background reconciliation is disabled");
                std::future::pending().await
            }
        }
    };

    let server = axum::serve(listener, create_router(state))
        .with_graceful_shutdown(stop_check)
        .into_future();
    tokio::select! {
        result = server => {
            result?;
        }
        _ = reconcile => {}
    }
    log::info!("Server stopped");
    Ok(())
}
