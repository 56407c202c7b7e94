use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::process::Command;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::CheckerError;

/// Tracks the tip of `refs/heads/<branch>` on one remote.
///
/// The refresh loop is the only writer of the stored hash and the HTTP handler the
/// only reader; both go through the same mutex. The hash stays empty until the first
/// successful refresh and is never overwritten with an empty value afterwards.
#[derive(Debug)]
pub struct RepoChecker {
    latest: Mutex<String>,
    repo_url: String,
    branch: String,
    repo_name: String,
    work_dir: PathBuf,
}

impl RepoChecker {
    pub fn new(repo_url: impl Into<String>, branch: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        let repo_url = repo_url.into();
        let repo_name = repo_name_from_url(&repo_url);
        Self { latest: Mutex::new(String::new()), repo_url, branch: branch.into(), repo_name, work_dir: work_dir.into() }
    }

    pub fn repo_name(&self) -> &str { &self.repo_name }
    pub fn branch(&self) -> &str { &self.branch }
    pub fn checkout_dir(&self) -> PathBuf { self.work_dir.join(&self.repo_name) }

    /// Clones the branch into the work directory. There is nothing to resume from a
    /// failed clone, so callers treat an error here as fatal.
    pub async fn clone_repository(&self) -> Result<(), CheckerError> {
        info!(repo = %self.repo_url, branch = %self.branch, dir = ?self.work_dir, "checker.clone.start");
        git(&self.work_dir, &["clone", "--branch", &self.branch, &self.repo_url]).await?;
        info!(repo = %self.repo_url, "checker.clone.done");
        Ok(())
    }

    /// Lists the remote refs once and stores the branch hash if present.
    pub async fn refresh(&self) -> Result<String, CheckerError> {
        let listing = git(&self.checkout_dir(), &["ls-remote", "origin"]).await?;
        let hash = find_branch_hash(&listing, &self.branch)
            .ok_or_else(|| CheckerError::RefNotFound { branch: self.branch.clone() })?;
        self.store_revision(&hash);
        Ok(hash)
    }

    /// Last hash seen, empty before the first successful refresh.
    pub fn current_revision(&self) -> String {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn store_revision(&self, hash: &str) {
        let mut latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        if *latest != hash {
            debug!(old = %latest, new = %hash, "checker.revision.updated");
            *latest = hash.to_string();
        }
    }

    /// Refreshes immediately and then once per `interval` until `shutdown` resolves.
    /// A missing branch ref is logged and retried; a failing remote ends the loop.
    pub async fn run<F>(&self, interval: Duration, shutdown: F) -> Result<(), CheckerError>
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => return Ok(()),
                _ = ticker.tick() => {}
            }
            match self.refresh().await {
                Ok(hash) => debug!(%hash, "checker.refresh.ok"),
                Err(e) if e.is_retryable() => warn!(error = %e, "checker.refresh.miss"),
                Err(e) => return Err(e),
            }
        }
    }
}

/// `https://host/org/site.git` and `git@host:org/site.git` both yield `site`.
pub fn repo_name_from_url(url: &str) -> String {
    let last = url.trim_end_matches('/').rsplit(['/', ':']).next().unwrap_or(url);
    last.strip_suffix(".git").unwrap_or(last).to_string()
}

/// Scans `git ls-remote` output (`<hash>\t<ref>` per line) for `refs/heads/<branch>`.
pub fn find_branch_hash(listing: &str, branch: &str) -> Option<String> {
    let wanted = format!("refs/heads/{branch}");
    listing.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next(), fields.next()) {
            (Some(hash), Some(reference), None) if reference == wanted => Some(hash.to_string()),
            _ => None,
        }
    })
}

async fn git(dir: &Path, args: &[&str]) -> Result<String, CheckerError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_TERMINAL_PROMPT", "0")
        .kill_on_drop(true)
        .output()
        .await?;
    if !output.status.success() {
        return Err(CheckerError::Git {
            command: args.first().copied().unwrap_or_default().to_string(),
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
