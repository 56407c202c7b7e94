use std::{future::IntoFuture, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use repo_checker::{router, RepoChecker};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "repo-checker", version, about = "Serve the latest commit hash of a git branch")]
struct Cli {
    /// Repository to clone and poll
    #[arg(long, env = "REPO_URL")]
    repo_url: String,
    #[arg(long, env = "REPO_BRANCH", default_value = "main")]
    repo_branch: String,
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:9090")]
    listen_addr: SocketAddr,
    /// Directory the repository is cloned into
    #[arg(long, env = "WORK_DIR", default_value = "/tmp/repos")]
    work_dir: PathBuf,
    /// Seconds between `git ls-remote` calls
    #[arg(long, env = "CHECK_INTERVAL_SECS", default_value_t = 600)]
    interval_secs: u64,
    #[arg(long, default_value = "info")]
    log_level: String,
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let base = fmt::layer().with_target(false).with_writer(std::io::stderr);
    match format {
        LogFormat::Json => tracing_subscriber::registry().with(env).with(base.json()).try_init()?,
        LogFormat::Text => tracing_subscriber::registry().with(env).with(base.compact()).try_init()?,
    }
    Ok(())
}

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

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format)?;

    tokio::fs::create_dir_all(&cli.work_dir).await
        .with_context(|| format!("creating work dir {}", cli.work_dir.display()))?;
    let checker = Arc::new(RepoChecker::new(&cli.repo_url, &cli.repo_branch, &cli.work_dir));
    checker.clone_repository().await.context("initial clone")?;

    let listener = tokio::net::TcpListener::bind(cli.listen_addr).await
        .with_context(|| format!("binding {}", cli.listen_addr))?;
    info!(addr = %cli.listen_addr, repo = %checker.repo_name(), branch = %checker.branch(), "repo_checker.listening");

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let wait_stop = |mut rx: tokio::sync::watch::Receiver<bool>| async move { let _ = rx.wait_for(|v| *v).await; };
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    let server = axum::serve(listener, router(checker.clone()))
        .with_graceful_shutdown(wait_stop(stop_rx.clone()))
        .into_future();
    let refresher = checker.run(Duration::from_secs(cli.interval_secs.max(1)), wait_stop(stop_rx));

    tokio::select! {
        res = server => res.context("http server")?,
        res = refresher => res.context("refresh loop")?,
    }
    info!("repo_checker.stopped");
    Ok(())
}
