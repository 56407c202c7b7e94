use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::ResourceExt;
use kube_runtime::reflector::ObjectRef;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::crd::{Readiness, Site, SiteStatus};
use crate::datasource::DataSource;
use crate::derivative::is_derivative;
use crate::error::{Error, Halt};
use crate::extra;
use crate::index::SiteIndex;
use crate::resources::{self, Script};
use crate::revision::RevisionClient;
use crate::store::{self, ObjectStore};
use crate::sync::{create_or_replace_dynamic, create_or_update, set_controller_reference, Operation};
use crate::telemetry::{RECONCILE_DURATION, RECONCILE_TOTAL};

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub serve_image: String,
    pub repo_checker_image: String,
    /// Namespace used for ConfigMap references that do not name one.
    pub operator_namespace: String,
    pub not_ready_requeue: Duration,
    pub job_requeue: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            serve_image: "ghcr.io/nginxinc/nginx-unprivileged:stable".into(),
            repo_checker_image: "ghcr.io/site-operator/repo-checker:latest".into(),
            operator_namespace: "site-operator-system".into(),
            not_ready_requeue: Duration::from_secs(1),
            job_requeue: Duration::from_secs(10),
        }
    }
}

/// Result of one pass that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The Site is gone or being deleted; its children are left to garbage collection.
    Gone,
    Converged { changed: bool, revision: String },
    /// The repo-checker has not finished its first poll.
    RevisionNotReady,
    /// A post-build Job is running and must not be disturbed.
    JobActive,
}

impl ReconcileOutcome {
    pub fn requeue_after(&self, settings: &ReconcilerSettings) -> Option<Duration> {
        match self {
            Self::Gone | Self::Converged { .. } => None,
            Self::RevisionNotReady => Some(settings.not_ready_requeue),
            Self::JobActive => Some(settings.job_requeue),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Gone => "gone",
            Self::Converged { changed: true, .. } => "changed",
            Self::Converged { changed: false, .. } => "unchanged",
            Self::RevisionNotReady => "revision_not_ready",
            Self::JobActive => "job_active",
        }
    }
}

/// Accumulated across the steps of one pass.
#[derive(Debug, Default)]
struct Progress {
    changed: bool,
    /// Set once the serving Deployment is known to carry this revision.
    applied_revision: Option<String>,
}

impl Progress {
    fn record(&mut self, op: Operation) {
        self.changed |= op.changed();
    }
}

fn step_failed<'a>(site: &'a Site, step: &'static str) -> impl FnOnce(Error) -> Halt + 'a {
    move |e| {
        warn!(site = %site.name_any(), namespace = ?site.namespace(), step, error = %e, "reconcile.step.failed");
        Halt::Failed(e)
    }
}

fn to_json<T: Serialize>(v: &T) -> Result<serde_json::Value, Error> {
    Ok(serde_json::to_value(v)?)
}

pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    revisions: Arc<dyn RevisionClient>,
    index: SiteIndex,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ObjectStore>, revisions: Arc<dyn RevisionClient>, index: SiteIndex, settings: ReconcilerSettings) -> Self {
        Self { store, revisions, index, settings }
    }

    pub fn settings(&self) -> &ReconcilerSettings { &self.settings }
    pub fn index(&self) -> &SiteIndex { &self.index }

    /// Brings every child of `namespace/name` in line with the Site's spec and records
    /// the result in its status.
    ///
    /// Waiting conditions come back as `Ok` outcomes with their own requeue delay. Any
    /// other failure marks the Site not ready, keeps its last applied revision, and is
    /// returned for the controller's error backoff.
    #[tracing::instrument(level = "info", skip_all, fields(site = %name, namespace = %namespace))]
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome, Error> {
        let started = Instant::now();
        let res = self.reconcile_site(namespace, name).await;
        RECONCILE_DURATION.observe(started.elapsed().as_secs_f64());
        let label = match &res {
            Ok(outcome) => outcome.label(),
            Err(_) => "error",
        };
        RECONCILE_TOTAL.with_label_values(&[label]).inc();
        debug!(outcome = label, elapsed_ms = started.elapsed().as_millis() as u64, "reconcile.done");
        res
    }

    async fn reconcile_site(&self, namespace: &str, name: &str) -> Result<ReconcileOutcome, Error> {
        let site_ref = ObjectRef::<Site>::new(name).within(namespace);
        let site = match store::get_typed::<Site>(&*self.store, namespace, name).await? {
            Some(site) if site.metadata.deletion_timestamp.is_none() => site,
            Some(_) => {
                debug!("reconcile.site.deleting");
                self.index.forget(&site_ref);
                return Ok(ReconcileOutcome::Gone);
            }
            None => {
                debug!("reconcile.site.not_found");
                self.index.forget(&site_ref);
                return Ok(ReconcileOutcome::Gone);
            }
        };
        self.index.observe(&site);

        let mut progress = Progress::default();
        match self.converge(&site, &mut progress).await {
            Ok(revision) => {
                let changed = progress.changed;
                if changed || site.readiness() != Readiness::True || site.applied_revision() != revision {
                    self.write_status(&site, Readiness::True, &revision).await?;
                }
                Ok(ReconcileOutcome::Converged { changed, revision })
            }
            Err(Halt::RevisionNotReady) => {
                info!("reconcile.revision.not_ready");
                Ok(ReconcileOutcome::RevisionNotReady)
            }
            Err(Halt::JobActive) => {
                info!("reconcile.job.active");
                Ok(ReconcileOutcome::JobActive)
            }
            Err(Halt::Failed(e)) => {
                let revision = progress.applied_revision.unwrap_or_else(|| site.applied_revision().to_string());
                if site.readiness() != Readiness::False || site.applied_revision() != revision {
                    if let Err(status_err) = self.write_status(&site, Readiness::False, &revision).await {
                        warn!(error = %status_err, "reconcile.status.write_failed");
                    }
                }
                Err(e)
            }
        }
    }

    async fn write_status(&self, site: &Site, ready: Readiness, revision: &str) -> Result<(), Error> {
        let namespace = site.namespace().ok_or(Error::MissingMetadata("namespace"))?;
        let status = SiteStatus { revision: revision.to_string(), ready: Some(ready) };
        self.store
            .patch_status(&store::api_resource::<Site>(), &namespace, &site.name_any(), &to_json(&status)?)
            .await?;
        self.index.record(ObjectRef::from_obj(site), ready, revision.to_string());
        info!(ready = ?ready, %revision, "reconcile.status.updated");
        Ok(())
    }

    /// The fixed step sequence. Later steps consume values produced by earlier ones
    /// (script hashes, the fetched revision), so the order is not arbitrary.
    async fn converge(&self, site: &Site, p: &mut Progress) -> Result<String, Halt> {
        let name = site.name_any();
        let namespace = site.namespace().ok_or(Error::MissingMetadata("namespace"))?;

        let build_hash = self
            .sync_script(site, Script::Build, &site.spec.build_script, p)
            .await
            .map_err(step_failed(site, "build-script"))?;

        let post_build_hash = match &site.spec.post_build_script {
            Some(ds) => Some(
                self.sync_script(site, Script::PostBuild, ds, p)
                    .await
                    .map_err(step_failed(site, "post-build-script"))?,
            ),
            None => None,
        };

        let checker = resources::repo_checker_name(&name);
        let image = self.settings.repo_checker_image.as_str();
        let op = create_or_update::<Deployment, _>(&*self.store, site, &checker, |dep| {
            resources::apply_repo_checker_deployment(dep, site, image);
            Ok(())
        })
        .await
        .map_err(step_failed(site, "repo-checker-deployment"))?;
        p.record(op);
        let op = create_or_update::<Service, _>(&*self.store, site, &checker, |svc| {
            resources::apply_repo_checker_service(svc, site);
            Ok(())
        })
        .await
        .map_err(step_failed(site, "repo-checker-service"))?;
        p.record(op);

        let revision = self
            .revisions
            .latest_revision(&namespace, &name)
            .await
            .map_err(step_failed(site, "revision"))?
            .ok_or(Halt::RevisionNotReady)?;

        let image = self.settings.serve_image.as_str();
        let op = create_or_update::<Deployment, _>(&*self.store, site, &name, |dep| {
            resources::apply_serving_deployment(dep, site, image, &revision, &build_hash);
            Ok(())
        })
        .await
        .map_err(step_failed(site, "serving-deployment"))?;
        p.record(op);
        p.applied_revision = Some(revision.clone());

        let op = create_or_update::<Service, _>(&*self.store, site, &name, |svc| {
            resources::apply_serving_service(svc, site);
            Ok(())
        })
        .await
        .map_err(step_failed(site, "serving-service"))?;
        p.record(op);

        for (i, ds) in site.spec.extra_resources.iter().enumerate() {
            let op = self.sync_extra_resource(site, i, ds).await.map_err(step_failed(site, "extra-resources"))?;
            p.record(op);
        }

        if let Some(hash) = post_build_hash {
            let op = self.sync_post_build_job(site, &revision, &hash).await?;
            p.record(op);
        }
        Ok(revision)
    }

    /// Resolves the script, writes its ConfigMap and returns the content hash.
    async fn sync_script(&self, site: &Site, script: Script, source: &DataSource, p: &mut Progress) -> Result<String, Error> {
        let content = source.resolve(&*self.store, &self.settings.operator_namespace, script.field()).await?;
        let hash = resources::checksum(&content);
        let op = create_or_update::<ConfigMap, _>(&*self.store, site, &script.config_map_name(&site.name_any()), |cm| {
            resources::apply_script_config_map(cm, script, &content, &hash);
            Ok(())
        })
        .await?;
        p.record(op);
        Ok(hash)
    }

    async fn sync_extra_resource(&self, site: &Site, index: usize, source: &DataSource) -> Result<Operation, Error> {
        let field = format!("extraResources[{index}]");
        let template = source.resolve(&*self.store, &self.settings.operator_namespace, &field).await?;
        let (gvk, obj) = extra::render(site, index, &template)?;
        let ar = self.store.resolve(&gvk).await?;
        create_or_replace_dynamic(&*self.store, site, &ar, obj).await
    }

    /// Leaves a running Job alone, keeps a finished one whose template still matches,
    /// and otherwise replaces it with a fresh Job.
    async fn sync_post_build_job(&self, site: &Site, revision: &str, hash: &str) -> Result<Operation, Halt> {
        let name = site.name_any();
        let namespace = site.namespace().ok_or(Error::MissingMetadata("namespace"))?;
        let ar = store::api_resource::<Job>();
        let desired = resources::post_build_pod_template(site, revision, hash);
        let failed = |e| step_failed(site, "post-build-job")(e);

        let existing = store::get_typed::<Job>(&*self.store, &namespace, &name).await.map_err(failed)?;
        if let Some(job) = existing {
            if job.status.as_ref().and_then(|s| s.active).unwrap_or(0) != 0 {
                return Err(Halt::JobActive);
            }
            let live = job.spec.map(|s| s.template).unwrap_or_default();
            if is_derivative(&to_json(&desired).map_err(failed)?, &to_json(&live).map_err(failed)?) {
                return Ok(Operation::Unchanged);
            }
            info!(job = %name, "reconcile.job.replace");
            self.store.delete(&ar, &namespace, &name).await.map_err(failed)?;
        }

        let mut job = Job::default();
        job.metadata.name = Some(name.clone());
        job.metadata.namespace = Some(namespace.clone());
        job.spec = Some(JobSpec { template: desired, ..Default::default() });
        set_controller_reference(site, &mut job.metadata, "Job").map_err(failed)?;
        self.store.create(&ar, &namespace, &store::to_dynamic(&job).map_err(failed)?).await.map_err(failed)?;
        info!(job = %name, %revision, "reconcile.job.created");
        Ok(Operation::Created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemoryStore, ScriptedRevisionClient, SiteBuilder};

    fn reconciler(store: &Arc<MemoryStore>, revisions: &Arc<ScriptedRevisionClient>) -> Reconciler {
        Reconciler::new(store.clone(), revisions.clone(), SiteIndex::new(), ReconcilerSettings::default())
    }

    #[tokio::test]
    async fn missing_site_is_gone() {
        let store = Arc::new(MemoryStore::new());
        let revisions = Arc::new(ScriptedRevisionClient::new());
        let r = reconciler(&store, &revisions);
        assert_eq!(r.reconcile("ns", "nope").await.unwrap(), ReconcileOutcome::Gone);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn deleting_site_is_left_alone() {
        let store = Arc::new(MemoryStore::new());
        let revisions = Arc::new(ScriptedRevisionClient::new());
        store.insert_site(SiteBuilder::new("docs", "ns").build());
        store.mark_deleting("ns", "docs");
        let r = reconciler(&store, &revisions);
        assert_eq!(r.reconcile("ns", "docs").await.unwrap(), ReconcileOutcome::Gone);
        assert_eq!(store.writes(), 0);
    }

    #[test]
    fn requeue_policy() {
        let s = ReconcilerSettings::default();
        assert_eq!(ReconcileOutcome::JobActive.requeue_after(&s), Some(Duration::from_secs(10)));
        assert_eq!(ReconcileOutcome::RevisionNotReady.requeue_after(&s), Some(Duration::from_secs(1)));
        assert_eq!(ReconcileOutcome::Gone.requeue_after(&s), None);
        assert_eq!(ReconcileOutcome::Converged { changed: true, revision: "a".into() }.requeue_after(&s), None);
    }
}
