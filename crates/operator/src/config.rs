use std::{fs, net::SocketAddr, path::{Path, PathBuf}, time::Duration};

use clap::Parser;
use serde::Deserialize;
use tracing::debug;

use crate::error::Error;
use crate::logging::LogFormat;
use crate::reconciler::ReconcilerSettings;

/// Command line of the operator. Every flag can also come from the environment, and
/// anything left unset falls back to the `--config` file, then to built-in defaults.
#[derive(Parser, Debug, Default)]
#[command(name = "site-operator", version, about = "Build and serve static sites from git repositories")]
pub struct Cli {
    /// TOML file with defaults for the options below
    #[arg(long, env = "SITE_OPERATOR_CONFIG")]
    pub config: Option<PathBuf>,
    /// Image of the container serving built content
    #[arg(long, env = "SERVE_IMAGE")]
    pub serve_image: Option<String>,
    #[arg(long, env = "REPO_CHECKER_IMAGE")]
    pub repo_checker_image: Option<String>,
    /// Namespace for ConfigMap references that do not name one
    #[arg(long, env = "POD_NAMESPACE")]
    pub operator_namespace: Option<String>,
    #[arg(long, env = "WATCH_INTERVAL_SECS")]
    pub watch_interval_secs: Option<u64>,
    #[arg(long, env = "JOB_REQUEUE_SECS")]
    pub job_requeue_secs: Option<u64>,
    #[arg(long, env = "ERROR_REQUEUE_SECS")]
    pub error_requeue_secs: Option<u64>,
    #[arg(long, env = "PROBE_TIMEOUT_SECS")]
    pub probe_timeout_secs: Option<u64>,
    #[arg(long, env = "CLUSTER_DOMAIN")]
    pub cluster_domain: Option<String>,
    #[arg(long, env = "METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
    #[arg(long, env = "TRIGGER_BUFFER")]
    pub trigger_buffer: Option<usize>,
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileConfig {
    pub serve_image: Option<String>,
    pub repo_checker_image: Option<String>,
    pub operator_namespace: Option<String>,
    pub watch_interval_secs: Option<u64>,
    pub job_requeue_secs: Option<u64>,
    pub error_requeue_secs: Option<u64>,
    pub probe_timeout_secs: Option<u64>,
    pub cluster_domain: Option<String>,
    pub metrics_addr: Option<SocketAddr>,
    pub trigger_buffer: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    pub serve_image: String,
    pub repo_checker_image: String,
    pub operator_namespace: String,
    pub watch_interval: Duration,
    pub job_requeue: Duration,
    pub error_requeue: Duration,
    pub probe_timeout: Duration,
    pub cluster_domain: String,
    pub metrics_addr: SocketAddr,
    pub trigger_buffer: usize,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        let settings = ReconcilerSettings::default();
        Self {
            serve_image: settings.serve_image,
            repo_checker_image: settings.repo_checker_image,
            operator_namespace: settings.operator_namespace,
            watch_interval: Duration::from_secs(60),
            job_requeue: settings.job_requeue,
            error_requeue: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            cluster_domain: "cluster.local".into(),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            trigger_buffer: 128,
        }
    }
}

pub fn read_file_config(path: &Path) -> Result<FileConfig, Error> {
    debug!(path = ?path, "config.load.attempt");
    let content = fs::read_to_string(path).map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
    let cfg = toml::from_str(&content).map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))?;
    debug!("config.parse.success");
    Ok(cfg)
}

impl OperatorConfig {
    pub fn load(cli: &Cli) -> Result<Self, Error> {
        let file = match &cli.config {
            Some(path) => read_file_config(path)?,
            None => FileConfig::default(),
        };
        let d = Self::default();
        let secs = |flag: Option<u64>, file: Option<u64>, default: Duration| flag.or(file).map(Duration::from_secs).unwrap_or(default);
        let cfg = Self {
            serve_image: cli.serve_image.clone().or(file.serve_image).unwrap_or(d.serve_image),
            repo_checker_image: cli.repo_checker_image.clone().or(file.repo_checker_image).unwrap_or(d.repo_checker_image),
            operator_namespace: cli.operator_namespace.clone().or(file.operator_namespace).unwrap_or(d.operator_namespace),
            watch_interval: secs(cli.watch_interval_secs, file.watch_interval_secs, d.watch_interval),
            job_requeue: secs(cli.job_requeue_secs, file.job_requeue_secs, d.job_requeue),
            error_requeue: secs(cli.error_requeue_secs, file.error_requeue_secs, d.error_requeue),
            probe_timeout: secs(cli.probe_timeout_secs, file.probe_timeout_secs, d.probe_timeout),
            cluster_domain: cli.cluster_domain.clone().or(file.cluster_domain).unwrap_or(d.cluster_domain),
            metrics_addr: cli.metrics_addr.or(file.metrics_addr).unwrap_or(d.metrics_addr),
            trigger_buffer: cli.trigger_buffer.or(file.trigger_buffer).unwrap_or(d.trigger_buffer),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.watch_interval.is_zero() {
            return Err(Error::Config("watch-interval-secs must be positive".into()));
        }
        if self.trigger_buffer == 0 {
            return Err(Error::Config("trigger-buffer must be positive".into()));
        }
        if self.operator_namespace.is_empty() {
            return Err(Error::Config("operator-namespace must not be empty".into()));
        }
        Ok(())
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            serve_image: self.serve_image.clone(),
            repo_checker_image: self.repo_checker_image.clone(),
            operator_namespace: self.operator_namespace.clone(),
            job_requeue: self.job_requeue,
            ..ReconcilerSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("site-operator").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_without_flags_or_file() {
        let cfg = OperatorConfig::load(&Cli::default()).unwrap();
        assert_eq!(cfg, OperatorConfig::default());
        assert_eq!(cfg.watch_interval, Duration::from_secs(60));
        assert_eq!(cfg.reconciler_settings().job_requeue, Duration::from_secs(10));
    }

    #[test]
    fn flag_beats_file_beats_default() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "serve-image = \"nginx:file\"\nwatch-interval-secs = 5\ncluster-domain = \"corp.internal\"").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let parsed = Cli {
            config: Some(path.into()),
            serve_image: Some("nginx:flag".into()),
            ..Cli::default()
        };
        let cfg = OperatorConfig::load(&parsed).unwrap();
        assert_eq!(cfg.serve_image, "nginx:flag");
        assert_eq!(cfg.watch_interval, Duration::from_secs(5));
        assert_eq!(cfg.cluster_domain, "corp.internal");
        assert_eq!(cfg.error_requeue, Duration::from_secs(30));
    }

    #[test]
    fn malformed_file_names_the_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "watch-interval-secs = \"soon\"").unwrap();
        let err = OperatorConfig::load(&Cli { config: Some(file.path().into()), ..Cli::default() }).unwrap_err();
        assert!(err.to_string().contains(&file.path().display().to_string()));
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "serve_image = \"typo\"").unwrap();
        assert!(OperatorConfig::load(&Cli { config: Some(file.path().into()), ..Cli::default() }).is_err());
    }

    #[test]
    #[serial_test::serial]
    fn environment_fills_unset_flags() {
        std::env::set_var("SERVE_IMAGE", "nginx:env");
        std::env::set_var("POD_NAMESPACE", "sites-system");
        let parsed = cli(&["--serve-image", "nginx:flag"]);
        std::env::remove_var("SERVE_IMAGE");
        std::env::remove_var("POD_NAMESPACE");
        let cfg = OperatorConfig::load(&parsed).unwrap();
        assert_eq!(cfg.serve_image, "nginx:flag");
        assert_eq!(cfg.operator_namespace, "sites-system");
    }

    #[test]
    #[serial_test::serial]
    fn zero_interval_is_rejected() {
        let c = cli(&["--watch-interval-secs", "0"]);
        assert!(matches!(OperatorConfig::load(&c), Err(Error::Config(_))));
    }
}
