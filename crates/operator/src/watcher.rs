use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kube_runtime::reflector::{ObjectRef, Store};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::crd::Site;
use crate::error::Error;
use crate::index::SiteIndex;
use crate::revision::RevisionClient;
use crate::telemetry::{REVISION_CHECK_FAILURES, REVISION_TRIGGERS};

/// Turns repo-checker polling into reconcile triggers.
///
/// Each tick walks the ready sites one by one and sends the site's reference down
/// `triggers` when its checker reports a hash other than the applied one. Sites missing
/// from `sites` (the controller's cache) are dropped from the index first. The watcher
/// never touches child resources.
pub struct RevisionWatcher {
    index: SiteIndex,
    sites: Store<Site>,
    client: Arc<dyn RevisionClient>,
    triggers: mpsc::Sender<ObjectRef<Site>>,
    interval: Duration,
}

impl RevisionWatcher {
    pub fn new(
        index: SiteIndex,
        sites: Store<Site>,
        client: Arc<dyn RevisionClient>,
        triggers: mpsc::Sender<ObjectRef<Site>>,
        interval: Duration,
    ) -> Self {
        Self { index, sites, client, triggers, interval }
    }

    /// One pass over the ready sites. Returns how many triggers were sent.
    ///
    /// A site whose checker fails or has no revision yet is logged and skipped.
    /// Only a closed trigger channel fails the pass.
    pub async fn check_once(&self) -> Result<usize, Error> {
        for gone in self.index.retain(|site| self.sites.get(site).is_some()) {
            debug!(site = %gone.name, namespace = ?gone.namespace, "watcher.site.gone");
        }
        let mut sent = 0;
        for tracked in self.index.ready() {
            let namespace = tracked.site.namespace.as_deref().unwrap_or_default();
            let name = tracked.site.name.as_str();
            let latest = match self.client.latest_revision(namespace, name).await {
                Ok(Some(rev)) => rev,
                Ok(None) => {
                    debug!(site = %name, %namespace, "watcher.revision.not_ready");
                    continue;
                }
                Err(e) => {
                    REVISION_CHECK_FAILURES.inc();
                    warn!(site = %name, %namespace, error = %e, "watcher.revision.check_failed");
                    continue;
                }
            };
            if latest == tracked.revision {
                continue;
            }
            info!(site = %name, %namespace, from = %tracked.revision, to = %latest, "watcher.revision.changed");
            self.triggers.send(tracked.site.clone()).await.map_err(|_| Error::TriggerChannelClosed)?;
            REVISION_TRIGGERS.inc();
            sent += 1;
        }
        Ok(sent)
    }

    /// Runs [`check_once`](Self::check_once) every interval, starting one interval from
    /// now. Never returns `Ok`: shutdown ends it with [`Error::Cancelled`].
    pub async fn run<F>(&self, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        tokio::pin!(shutdown);
        info!(interval_secs = self.interval.as_secs(), "watcher.start");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = &mut shutdown => break,
                res = self.check_once() => {
                    let sent = res?;
                    debug!(sent, "watcher.tick");
                }
            }
        }
        info!("watcher.stop");
        Err(Error::Cancelled)
    }
}
