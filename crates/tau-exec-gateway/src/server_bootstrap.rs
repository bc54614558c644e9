//! Listener bootstrap and graceful shutdown for the exec gateway.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tau_exec::ProcessShutdownReport;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::exec_routes::ExecGateway;
use crate::gateway_config::ExecGatewayConfig;

/// Binds the configured address and serves until ctrl-c or SIGTERM.
pub async fn run_exec_gateway_server(config: ExecGatewayConfig) -> Result<()> {
    let gateway = ExecGateway::from_config(&config)?;
    let bind_addr = config.bind_addr()?;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind exec gateway on {bind_addr}"))?;
    serve_exec_gateway(
        listener,
        gateway,
        config.shutdown_grace(),
        wait_for_shutdown_signal(),
    )
    .await?;
    Ok(())
}

/// Serves `gateway` on `listener` until `shutdown` resolves.
///
/// Live runs are cancelled as soon as shutdown is requested so in-flight
/// responses can complete before axum finishes draining connections.
pub async fn serve_exec_gateway<F>(
    listener: TcpListener,
    gateway: ExecGateway,
    grace: Duration,
    shutdown: F,
) -> Result<ProcessShutdownReport>
where
    F: Future<Output = ()> + Send + 'static,
{
    let local_addr = listener
        .local_addr()
        .context("failed to resolve exec gateway bound address")?;
    let route_paths = gateway
        .routes()
        .iter()
        .map(|route| route.path.as_str())
        .collect::<Vec<_>>()
        .join(",");
    println!(
        "exec gateway listening: addr={} routes={} shutdown_grace_ms={}",
        local_addr,
        route_paths,
        grace.as_millis()
    );

    let registry = gateway.registry().clone();
    let app = gateway.router();
    let (report_tx, report_rx) = oneshot::channel();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        info!(
            active_runs = registry.active_count(),
            "exec gateway shutdown requested"
        );
        let _ = report_tx.send(registry.shutdown(grace).await);
    })
    .await
    .context("exec gateway server exited unexpectedly")?;

    let report = report_rx.await.unwrap_or_default();
    println!(
        "exec gateway stopped: cancelled_runs={} remaining_runs={}",
        report.cancelled_runs, report.remaining_runs
    );
    Ok(report)
}

/// Resolves on ctrl-c, or SIGTERM on unix.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(error = %error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "failed to listen for SIGTERM");
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
}
