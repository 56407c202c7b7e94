use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::error::Error;

pub const REPO_CHECKER_SUFFIX: &str = "-repo-checker";

/// Asks a site's repo-checker for the tip of its branch. `Ok(None)` means the checker
/// is up but has not completed its first poll.
#[async_trait]
pub trait RevisionClient: Send + Sync + 'static {
    async fn latest_revision(&self, namespace: &str, name: &str) -> Result<Option<String>, Error>;
}

/// Talks to `http://<site>-repo-checker.<namespace>.svc.<cluster-domain>/`.
#[derive(Debug, Clone)]
pub struct HttpRevisionClient {
    http: reqwest::Client,
    target: Target,
}

#[derive(Debug, Clone)]
enum Target {
    ClusterDns { domain: String },
    Fixed { base: String },
}

impl HttpRevisionClient {
    pub fn new(cluster_domain: impl Into<String>, timeout: Duration) -> Result<Self, Error> {
        Ok(Self { http: build_client(timeout)?, target: Target::ClusterDns { domain: cluster_domain.into() } })
    }

    /// Sends every request to `base` regardless of site. Used when the operator runs
    /// outside the cluster behind a port-forward, and in tests.
    pub fn with_base_url(base: impl Into<String>, timeout: Duration) -> Result<Self, Error> {
        Ok(Self { http: build_client(timeout)?, target: Target::Fixed { base: base.into() } })
    }

    pub fn url_for(&self, namespace: &str, name: &str) -> String {
        match &self.target {
            Target::ClusterDns { domain } => format!("http://{name}{REPO_CHECKER_SUFFIX}.{namespace}.svc.{domain}/"),
            Target::Fixed { base } => format!("{}/", base.trim_end_matches('/')),
        }
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|source| Error::ProbeTransport { url: String::new(), source })
}

#[async_trait]
impl RevisionClient for HttpRevisionClient {
    async fn latest_revision(&self, namespace: &str, name: &str) -> Result<Option<String>, Error> {
        let url = self.url_for(namespace, name);
        let transport = |source| Error::ProbeTransport { url: url.clone(), source };
        let res = self.http.get(&url).send().await.map_err(transport)?;
        match res.status() {
            StatusCode::OK => {
                let body = res.text().await.map_err(transport)?;
                let revision = body.trim();
                debug!(%url, %revision, "revision.fetch.ok");
                Ok((!revision.is_empty()).then(|| revision.to_string()))
            }
            StatusCode::NOT_FOUND => {
                debug!(%url, "revision.fetch.not_ready");
                Ok(None)
            }
            other => Err(Error::ProbeStatus { url, status: other.as_u16() }),
        }
    }
}
