use std::{future::IntoFuture, sync::Arc};

use anyhow::{Context as _, Result};
use clap::Parser;
use kube::Client;
use site_operator::{
    config::{Cli, OperatorConfig},
    controller::{self, Context},
    index::SiteIndex,
    logging::init_logging,
    reconciler::Reconciler,
    revision::{HttpRevisionClient, RevisionClient},
    store::KubeStore,
    telemetry,
    watcher::RevisionWatcher,
    Error,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "shutdown.signal.ctrl_c_failed");
            std::future::pending::<()>().await;
        }
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => { sig.recv().await; }
            Err(e) => {
                error!(error = %e, "shutdown.signal.sigterm_failed");
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
    info!("shutdown.signal");
}

fn stopped(mut rx: watch::Receiver<bool>) -> impl std::future::Future<Output = ()> + Send + 'static {
    async move { let _ = rx.wait_for(|stop| *stop).await; }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format)?;
    let cfg = OperatorConfig::load(&cli).context("loading configuration")?;
    info!(namespace = %cfg.operator_namespace, serve_image = %cfg.serve_image, repo_checker_image = %cfg.repo_checker_image, "operator.config");
    telemetry::register_all();

    let client = Client::try_default().await.context("building kubernetes client")?;
    let revisions: Arc<dyn RevisionClient> = Arc::new(HttpRevisionClient::new(&cfg.cluster_domain, cfg.probe_timeout)?);
    let index = SiteIndex::new();
    let reconciler = Reconciler::new(Arc::new(KubeStore::new(client.clone())), revisions.clone(), index.clone(), cfg.reconciler_settings());
    let ctx = Arc::new(Context { reconciler, error_requeue: cfg.error_requeue });

    let (stop_tx, stop_rx) = watch::channel(false);
    let (controller_stop_tx, controller_stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
        let _ = controller_stop_tx.send(());
    });

    let (ready_tx, ready_rx) = watch::channel(false);
    let listener = tokio::net::TcpListener::bind(cfg.metrics_addr).await
        .with_context(|| format!("binding metrics address {}", cfg.metrics_addr))?;
    info!(addr = %cfg.metrics_addr, "metrics.listening");
    let metrics = axum::serve(listener, telemetry::router(ready_rx))
        .with_graceful_shutdown(stopped(stop_rx.clone()))
        .into_future();

    let (trigger_tx, trigger_rx) = mpsc::channel(cfg.trigger_buffer);
    let site_controller = controller::site_controller(client.clone());
    let watcher = RevisionWatcher::new(index, site_controller.store(), revisions, trigger_tx, cfg.watch_interval);
    let watcher_task = watcher.run(stopped(stop_rx));

    let _ = ready_tx.send(true);
    let controller_task = controller::run(client, site_controller, ctx, trigger_rx, async move { let _ = controller_stop_rx.await; });

    let (metrics_res, watcher_res, ()) = tokio::join!(metrics, watcher_task, controller_task);
    metrics_res.context("metrics server")?;
    match watcher_res {
        Ok(()) | Err(Error::Cancelled) => {}
        Err(e) => warn!(error = %e, "watcher.exited"),
    }
    info!("operator.stopped");
    Ok(())
}
