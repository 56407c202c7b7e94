use std::sync::Arc;

use k8s_openapi::api::batch::v1::Job;
use site_operator::index::SiteIndex;
use site_operator::reconciler::ReconcilerSettings;
use site_operator::resources::{checksum, CHECKSUM_ANNOTATION};
use site_operator::store::api_resource;
use site_operator::test_support::{MemoryStore, ScriptedRevisionClient, SiteBuilder};
use site_operator::{DataSource, ReconcileOutcome, Reconciler};

fn job_revision(job: &Job) -> Option<String> {
    let spec = job.spec.as_ref()?.template.spec.as_ref()?;
    let env = spec.containers[0].env.as_ref()?;
    env.iter().find(|e| e.name == "REVISION")?.value.clone()
}

fn setup() -> (Arc<MemoryStore>, Arc<ScriptedRevisionClient>, Reconciler) {
    let store = Arc::new(MemoryStore::new());
    let revisions = Arc::new(ScriptedRevisionClient::new());
    let reconciler = Reconciler::new(store.clone(), revisions.clone(), SiteIndex::new(), ReconcilerSettings::default());
    store.insert_site(SiteBuilder::new("docs", "web").post_build_script(DataSource::raw("./publish.sh")).build());
    (store, revisions, reconciler)
}

#[tokio::test]
async fn running_job_is_left_alone() {
    let (store, revisions, reconciler) = setup();
    revisions.set("web", "docs", Some("abc123"));
    reconciler.reconcile("web", "docs").await.unwrap();
    let first = store.typed::<Job>("web", "docs").unwrap();
    store.set_job_active("web", "docs", 1);

    revisions.set("web", "docs", Some("def456"));
    let outcome = reconciler.reconcile("web", "docs").await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::JobActive);
    assert_eq!(outcome.requeue_after(reconciler.settings()), Some(reconciler.settings().job_requeue));

    let job = store.typed::<Job>("web", "docs").unwrap();
    assert_eq!(job.metadata.uid, first.metadata.uid);
    assert_eq!(job_revision(&job).as_deref(), Some("abc123"));
    assert_eq!(store.count(&api_resource::<Job>()), 1);
}

#[tokio::test]
async fn finished_job_with_stale_template_is_replaced() {
    let (store, revisions, reconciler) = setup();
    revisions.set("web", "docs", Some("abc123"));
    reconciler.reconcile("web", "docs").await.unwrap();
    let first = store.typed::<Job>("web", "docs").unwrap();
    store.set_job_active("web", "docs", 0);

    revisions.set("web", "docs", Some("def456"));
    let outcome = reconciler.reconcile("web", "docs").await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Converged { changed: true, revision: "def456".into() });

    let job = store.typed::<Job>("web", "docs").unwrap();
    assert_ne!(job.metadata.uid, first.metadata.uid);
    assert_eq!(job_revision(&job).as_deref(), Some("def456"));
    assert_eq!(store.count(&api_resource::<Job>()), 1);
}

#[tokio::test]
async fn finished_job_with_current_template_is_kept() {
    let (store, revisions, reconciler) = setup();
    revisions.set("web", "docs", Some("abc123"));
    reconciler.reconcile("web", "docs").await.unwrap();
    let first = store.typed::<Job>("web", "docs").unwrap();
    store.set_job_active("web", "docs", 0);

    let outcome = reconciler.reconcile("web", "docs").await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Converged { changed: false, revision: "abc123".into() });
    assert_eq!(store.typed::<Job>("web", "docs").unwrap().metadata.uid, first.metadata.uid);
}

#[tokio::test]
async fn no_post_build_script_means_no_job() {
    let store = Arc::new(MemoryStore::new());
    let revisions = Arc::new(ScriptedRevisionClient::new());
    let reconciler = Reconciler::new(store.clone(), revisions.clone(), SiteIndex::new(), ReconcilerSettings::default());
    store.insert_site(SiteBuilder::new("docs", "web").build());
    revisions.set("web", "docs", Some("abc123"));

    reconciler.reconcile("web", "docs").await.unwrap();
    assert_eq!(store.count(&api_resource::<Job>()), 0);
}

#[tokio::test]
async fn post_build_script_edit_replaces_a_finished_job() {
    let (store, revisions, reconciler) = setup();
    revisions.set("web", "docs", Some("abc123"));
    reconciler.reconcile("web", "docs").await.unwrap();
    let first = store.typed::<Job>("web", "docs").unwrap();
    store.set_job_active("web", "docs", 0);

    let mut site = store.site("web", "docs").unwrap();
    site.spec.post_build_script = Some(DataSource::raw("./publish.sh --purge-cdn"));
    store.insert_site(site);

    let outcome = reconciler.reconcile("web", "docs").await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Converged { changed: true, revision: "abc123".into() });
    let job = store.typed::<Job>("web", "docs").unwrap();
    assert_ne!(job.metadata.uid, first.metadata.uid);
    let annotations = job.spec.unwrap().template.metadata.unwrap().annotations.unwrap();
    assert_eq!(annotations[CHECKSUM_ANNOTATION], checksum("./publish.sh --purge-cdn"));
    assert_eq!(store.count(&api_resource::<Job>()), 1);
}
