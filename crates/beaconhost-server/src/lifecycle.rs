use std::future::{Future, IntoFuture};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use beaconhost_core::HostConfig;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("received shutdown signal, no longer accepting connections");
}

/// Serves `app` until `shutdown` resolves, then lets in-flight connections
/// finish for at most `grace`. Connections still open after that are
/// abandoned; their tasks die with the runtime.
pub async fn serve_with_grace<F>(
    listener: TcpListener,
    app: Router,
    shutdown: F,
    grace: Duration,
) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (signalled, deadline_armed) = oneshot::channel::<()>();
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        let _ = signalled.send(());
    });

    let deadline = async move {
        if deadline_armed.await.is_err() {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server.into_future() => result,
        () = deadline => {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "connections still open after shutdown grace period, closing them"
            );
            Ok(())
        }
    }
}

/// Logs the startup banner an operator needs: where we listen and whether the
/// download route will currently serve anything.
pub async fn announce(config: &HostConfig) {
    info!(
        addr = %config.socket_addr(),
        log = %config.log_path.display(),
        "serving beacon host"
    );
    match &config.download_path {
        Some(path) => {
            let exists = tokio::fs::metadata(path)
                .await
                .is_ok_and(|metadata| metadata.is_file());
            info!(
                route = %config.route,
                file = %path.display(),
                exists,
                "download route configured"
            )
        }
        None => info!(route = %config.route, "download route disabled"),
    }
}
