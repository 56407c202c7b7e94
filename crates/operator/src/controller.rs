use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::{Api, Client, ResourceExt};
use kube_runtime::{
    controller::{Action, Controller},
    reflector::ObjectRef,
    watcher,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::crd::Site;
use crate::error::Error;
use crate::reconciler::Reconciler;

pub struct Context {
    pub reconciler: Reconciler,
    pub error_requeue: Duration,
}

async fn reconcile(site: Arc<Site>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = site.namespace().ok_or(Error::MissingMetadata("namespace"))?;
    let outcome = ctx.reconciler.reconcile(&namespace, &site.name_any()).await?;
    Ok(match outcome.requeue_after(ctx.reconciler.settings()) {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    })
}

fn error_policy(site: Arc<Site>, err: &Error, ctx: Arc<Context>) -> Action {
    warn!(site = %site.name_any(), namespace = ?site.namespace(), error = %err, kind = err.kind(), "reconcile.failed");
    Action::requeue(ctx.error_requeue)
}

/// Sites a ConfigMap change should wake: its controlling Site, plus every Site whose
/// build or post-build script is read from it.
pub fn sites_for_config_map(sites: &[Arc<Site>], operator_namespace: &str, cm: &ConfigMap) -> Vec<ObjectRef<Site>> {
    let namespace = cm.namespace().unwrap_or_default();
    let name = cm.name_any();
    let mut refs: Vec<ObjectRef<Site>> = cm
        .owner_references()
        .iter()
        .filter(|o| o.controller == Some(true))
        .filter_map(|o| ObjectRef::from_owner_ref(Some(namespace.as_str()), o, ()))
        .collect();
    for site in sites {
        let scripts = std::iter::once(&site.spec.build_script).chain(site.spec.post_build_script.as_ref());
        if scripts.into_iter().any(|ds| ds.references(operator_namespace, &namespace, &name)) {
            let r = ObjectRef::from_obj(site.as_ref());
            if !refs.contains(&r) {
                refs.push(r);
            }
        }
    }
    refs
}

/// Adapts the watcher's channel into the stream the controller consumes.
fn trigger_stream(rx: mpsc::Receiver<ObjectRef<Site>>) -> impl futures_util::Stream<Item = ObjectRef<Site>> + Send + 'static {
    futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|site| (site, rx)) })
}

/// The Site controller before any relations are attached. Its `store()` is the Site
/// cache the revision watcher checks for deleted sites.
pub fn site_controller(client: Client) -> Controller<Site> {
    Controller::new(Api::<Site>::all(client), watcher::Config::default())
}

/// Runs `controller` until `shutdown` resolves.
///
/// Reconciles are triggered by Site changes, changes to owned children, changes to
/// script ConfigMaps, and references arriving on `triggers`.
pub async fn run<F>(
    client: Client,
    controller: Controller<Site>,
    ctx: Arc<Context>,
    triggers: mpsc::Receiver<ObjectRef<Site>>,
    shutdown: F,
) where
    F: Future<Output = ()> + Send + Sync + 'static,
{
    let operator_namespace = ctx.reconciler.settings().operator_namespace.clone();
    let sites = controller.store();

    info!("controller.start");
    controller
        .owns(Api::<Deployment>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Service>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Job>::all(client.clone()), watcher::Config::default())
        .watches(Api::<ConfigMap>::all(client), watcher::Config::default(), move |cm| {
            sites_for_config_map(&sites.state(), &operator_namespace, &cm)
        })
        .reconcile_on(trigger_stream(triggers))
        .graceful_shutdown_on(shutdown)
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((site, _)) => debug!(site = %site.name, namespace = ?site.namespace, "controller.reconciled"),
                Err(e) => debug!(error = %e, "controller.dispatch_error"),
            }
        })
        .await;
    info!("controller.stop");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::DataSource;
    use crate::test_support::SiteBuilder;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn cm(ns: &str, name: &str) -> ConfigMap {
        let mut cm = ConfigMap::default();
        cm.metadata.namespace = Some(ns.into());
        cm.metadata.name = Some(name.into());
        cm
    }

    #[test]
    fn finds_sites_reading_the_configmap() {
        let sites = vec![
            Arc::new(SiteBuilder::new("a", "web").build_script(DataSource::config_map("scripts", None, "build.sh")).build()),
            Arc::new(
                SiteBuilder::new("b", "web")
                    .post_build_script(DataSource::config_map("scripts", Some("ops"), "post.sh"))
                    .build(),
            ),
            Arc::new(SiteBuilder::new("c", "web").build_script(DataSource::config_map("other", None, "build.sh")).build()),
            Arc::new(SiteBuilder::new("d", "web").build()),
        ];
        let hits = sites_for_config_map(&sites, "ops", &cm("ops", "scripts"));
        let names: Vec<_> = hits.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert!(sites_for_config_map(&sites, "ops", &cm("web", "scripts")).is_empty());
    }

    #[test]
    fn owned_configmap_maps_to_owner() {
        let mut owned = cm("web", "docs-build-script");
        owned.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "site-operator.dev/v1".into(),
            kind: "Site".into(),
            name: "docs".into(),
            uid: "u".into(),
            controller: Some(true),
            ..Default::default()
        }]);
        let hits = sites_for_config_map(&[], "ops", &owned);
        assert_eq!(hits, vec![ObjectRef::new("docs").within("web")]);
    }

    #[tokio::test]
    async fn trigger_stream_ends_with_channel() {
        let (tx, rx) = mpsc::channel(2);
        tx.send(ObjectRef::new("a").within("ns")).await.unwrap();
        drop(tx);
        let got: Vec<_> = trigger_stream(rx).collect().await;
        assert_eq!(got.len(), 1);
    }
}
