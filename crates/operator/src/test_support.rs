//! In-memory stand-ins for the Kubernetes API and the repo-checker, shared by unit and
//! integration tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, LocalObjectReference, Volume};
use kube::{
    api::DynamicObject,
    core::{ApiResource, GroupVersionKind},
    error::ErrorResponse,
    Resource,
};
use kube_runtime::{
    reflector::{self, store::Writer, Store},
    watcher,
};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::crd::{OverlayMetadata, Readiness, SecretKey, Site, SiteSpec, SiteStatus, TemplateOverlay};
use crate::datasource::DataSource;
use crate::error::Error;
use crate::revision::RevisionClient;
use crate::store::{self, ObjectStore};

type Key = (String, String, String);

/// Object store backed by a map. Assigns UIDs and resourceVersions the way the API
/// server does and enforces optimistic concurrency on replace.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<Key, DynamicObject>>,
    writes: AtomicUsize,
    next_version: AtomicUsize,
}

fn key(ar: &ApiResource, namespace: &str, name: &str) -> Key {
    (format!("{}/{}", ar.api_version, ar.kind), namespace.to_string(), name.to_string())
}

fn api_error(code: u16, reason: &str, message: String) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse { status: "Failure".into(), message, reason: reason.into(), code }))
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<Key, DynamicObject>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) -> String {
        (self.next_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Mutating calls (create, replace, delete, status patch) made through the trait.
    pub fn writes(&self) -> usize { self.writes.load(Ordering::SeqCst) }
    pub fn reset_writes(&self) { self.writes.store(0, Ordering::SeqCst) }

    /// Seeds an object without counting a write.
    pub fn seed(&self, ar: &ApiResource, mut obj: DynamicObject) -> DynamicObject {
        let namespace = obj.metadata.namespace.clone().unwrap_or_default();
        let name = obj.metadata.name.clone().unwrap_or_default();
        obj.metadata.uid.get_or_insert_with(|| uuid::Uuid::new_v4().to_string());
        obj.metadata.resource_version = Some(self.bump());
        self.lock().insert(key(ar, &namespace, &name), obj.clone());
        obj
    }

    pub fn insert_site(&self, site: Site) -> Site {
        let ar = store::api_resource::<Site>();
        let stored = self.seed(&ar, store::to_dynamic(&site).unwrap_or_else(|e| panic!("site to dynamic: {e}")));
        store::from_dynamic(stored).unwrap_or_else(|e| panic!("site from dynamic: {e}"))
    }

    pub fn site(&self, namespace: &str, name: &str) -> Option<Site> { self.typed(namespace, name) }

    pub fn typed<K: Resource<DynamicType = ()> + DeserializeOwned>(&self, namespace: &str, name: &str) -> Option<K> {
        let obj = self.lock().get(&key(&store::api_resource::<K>(), namespace, name)).cloned()?;
        Some(store::from_dynamic(obj).unwrap_or_else(|e| panic!("decode {namespace}/{name}: {e}")))
    }

    pub fn dynamic(&self, ar: &ApiResource, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.lock().get(&key(ar, namespace, name)).cloned()
    }

    pub fn put_config_map<'a>(&self, namespace: &str, name: &str, data: impl IntoIterator<Item = (&'a str, &'a str)>) {
        let mut cm = ConfigMap::default();
        cm.metadata.namespace = Some(namespace.into());
        cm.metadata.name = Some(name.into());
        cm.data = Some(data.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect());
        let obj = store::to_dynamic(&cm).unwrap_or_else(|e| panic!("configmap to dynamic: {e}"));
        self.seed(&store::api_resource::<ConfigMap>(), obj);
    }

    /// Overwrites `status.active` of a stored Job, as the job controller would.
    pub fn set_job_active(&self, namespace: &str, name: &str, active: i32) {
        let ar = store::api_resource::<k8s_openapi::api::batch::v1::Job>();
        let mut objects = self.lock();
        let job = objects.get_mut(&key(&ar, namespace, name)).unwrap_or_else(|| panic!("no job {namespace}/{name}"));
        merge_patch(&mut job.data, &serde_json::json!({ "status": { "active": active } }));
    }

    /// Sets `metadata.deletionTimestamp` on a stored Site.
    pub fn mark_deleting(&self, namespace: &str, name: &str) {
        let ar = store::api_resource::<Site>();
        let mut objects = self.lock();
        let site = objects.get_mut(&key(&ar, namespace, name)).unwrap_or_else(|| panic!("no site {namespace}/{name}"));
        site.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            k8s_openapi::chrono::Utc::now(),
        ));
    }

    pub fn count(&self, ar: &ApiResource) -> usize {
        let prefix = format!("{}/{}", ar.api_version, ar.kind);
        self.lock().keys().filter(|(k, _, _)| *k == prefix).count()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ApiResource, Error> {
        if gvk.kind == "Namespace" || gvk.kind == "ClusterRole" {
            return Err(Error::NotNamespaced { kind: gvk.kind.clone() });
        }
        Ok(ApiResource::from_gvk(gvk))
    }

    async fn get(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<Option<DynamicObject>, Error> {
        Ok(self.dynamic(ar, namespace, name))
    }

    async fn create(&self, ar: &ApiResource, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        let name = obj.metadata.name.clone().ok_or(Error::MissingMetadata("name"))?;
        let k = key(ar, namespace, &name);
        let mut objects = self.lock();
        if objects.contains_key(&k) {
            return Err(api_error(409, "AlreadyExists", format!("{} {namespace}/{name} already exists", ar.kind)));
        }
        let mut stored = obj.clone();
        stored.metadata.namespace = Some(namespace.into());
        stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        stored.metadata.resource_version = Some(self.bump());
        objects.insert(k, stored.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn replace(&self, ar: &ApiResource, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        let name = obj.metadata.name.clone().ok_or(Error::MissingMetadata("name"))?;
        let mut objects = self.lock();
        let live = objects
            .get_mut(&key(ar, namespace, &name))
            .ok_or_else(|| api_error(404, "NotFound", format!("{} {namespace}/{name} not found", ar.kind)))?;
        if obj.metadata.resource_version.is_some() && obj.metadata.resource_version != live.metadata.resource_version {
            return Err(api_error(409, "Conflict", format!("{} {namespace}/{name} was modified", ar.kind)));
        }
        let mut stored = obj.clone();
        stored.metadata.namespace = Some(namespace.into());
        stored.metadata.uid = live.metadata.uid.clone();
        stored.metadata.resource_version = Some(self.bump());
        // Status is a subresource and survives a main-resource replace.
        if let Some(status) = live.data.get("status").cloned() {
            if let Value::Object(map) = &mut stored.data {
                map.insert("status".into(), status);
            }
        }
        *live = stored.clone();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }

    async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<(), Error> {
        if self.lock().remove(&key(ar, namespace, name)).is_some() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn patch_status(&self, ar: &ApiResource, namespace: &str, name: &str, status: &Value) -> Result<(), Error> {
        let mut objects = self.lock();
        let live = objects
            .get_mut(&key(ar, namespace, name))
            .ok_or_else(|| api_error(404, "NotFound", format!("{} {namespace}/{name} not found", ar.kind)))?;
        merge_patch(&mut live.data, &serde_json::json!({ "status": status }));
        live.metadata.resource_version = Some(self.bump());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// JSON merge patch (RFC 7386).
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Default::default());
    }
    if let Value::Object(map) = target {
        for (k, v) in patch {
            if v.is_null() {
                map.remove(k);
            } else {
                merge_patch(map.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

/// Revision client answering from a table. Unknown sites answer "not ready".
#[derive(Default)]
pub struct ScriptedRevisionClient {
    answers: Mutex<HashMap<(String, String), Result<Option<String>, u16>>>,
    calls: AtomicUsize,
}

impl ScriptedRevisionClient {
    pub fn new() -> Self { Self::default() }

    pub fn set(&self, namespace: &str, name: &str, revision: Option<&str>) {
        self.answers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((namespace.into(), name.into()), Ok(revision.map(Into::into)));
    }

    /// Makes the site's checker answer with HTTP `status`.
    pub fn fail(&self, namespace: &str, name: &str, status: u16) {
        self.answers.lock().unwrap_or_else(PoisonError::into_inner).insert((namespace.into(), name.into()), Err(status));
    }

    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

#[async_trait]
impl RevisionClient for ScriptedRevisionClient {
    async fn latest_revision(&self, namespace: &str, name: &str) -> Result<Option<String>, Error> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = self.answers.lock().unwrap_or_else(PoisonError::into_inner).get(&(namespace.into(), name.into())).cloned();
        match answer {
            Some(Ok(rev)) => Ok(rev),
            Some(Err(status)) => Err(Error::ProbeStatus { url: format!("scripted://{namespace}/{name}"), status }),
            None => Ok(None),
        }
    }
}

/// A controller-style Site cache holding `sites`. Keep the writer to delete from it.
pub fn site_cache(sites: impl IntoIterator<Item = Site>) -> (Store<Site>, Writer<Site>) {
    let (store, mut writer) = reflector::store();
    writer.apply_watcher_event(&watcher::Event::Restarted(sites.into_iter().collect()));
    (store, writer)
}

/// Builds a [`Site`] with usable defaults.
pub struct SiteBuilder {
    site: Site,
}

impl SiteBuilder {
    pub fn new(name: &str, namespace: &str) -> Self {
        let spec = SiteSpec {
            repo_url: "https://github.com/example/docs.git".into(),
            branch: "main".into(),
            build_image: "ghcr.io/example/builder:latest".into(),
            build_script: DataSource::raw("#!/bin/bash\nmake html\n"),
            post_build_script: None,
            build_secrets: Vec::new(),
            image_pull_secrets: Vec::new(),
            deploy_key_secret_name: None,
            extra_resources: Vec::new(),
            replicas: 1,
            pod_template: None,
            service_template: None,
            volume_templates: Vec::new(),
        };
        let mut site = Site::new(name, spec);
        site.metadata.namespace = Some(namespace.into());
        Self { site }
    }

    pub fn uid(mut self, uid: &str) -> Self { self.site.metadata.uid = Some(uid.into()); self }
    pub fn repo(mut self, url: &str, branch: &str) -> Self {
        self.site.spec.repo_url = url.into();
        self.site.spec.branch = branch.into();
        self
    }
    pub fn build_script(mut self, ds: DataSource) -> Self { self.site.spec.build_script = ds; self }
    pub fn post_build_script(mut self, ds: DataSource) -> Self { self.site.spec.post_build_script = Some(ds); self }
    pub fn extra_resource(mut self, ds: DataSource) -> Self { self.site.spec.extra_resources.push(ds); self }
    pub fn deploy_key(mut self, secret: &str) -> Self { self.site.spec.deploy_key_secret_name = Some(secret.into()); self }
    pub fn build_secret(mut self, name: &str, key: &str) -> Self {
        self.site.spec.build_secrets.push(SecretKey { name: name.into(), key: key.into() });
        self
    }
    pub fn image_pull_secret(mut self, name: &str) -> Self {
        self.site.spec.image_pull_secrets.push(LocalObjectReference { name: Some(name.into()) });
        self
    }
    pub fn replicas(mut self, n: i32) -> Self { self.site.spec.replicas = n; self }
    pub fn pod_label(mut self, k: &str, v: &str) -> Self {
        overlay(&mut self.site.spec.pod_template).labels.insert(k.into(), v.into());
        self
    }
    pub fn pod_annotation(mut self, k: &str, v: &str) -> Self {
        overlay(&mut self.site.spec.pod_template).annotations.insert(k.into(), v.into());
        self
    }
    pub fn service_label(mut self, k: &str, v: &str) -> Self {
        overlay(&mut self.site.spec.service_template).labels.insert(k.into(), v.into());
        self
    }
    pub fn service_annotation(mut self, k: &str, v: &str) -> Self {
        overlay(&mut self.site.spec.service_template).annotations.insert(k.into(), v.into());
        self
    }
    pub fn volume(mut self, v: Volume) -> Self { self.site.spec.volume_templates.push(v); self }
    pub fn status(mut self, ready: Readiness, revision: &str) -> Self {
        self.site.status = Some(SiteStatus { revision: revision.into(), ready: Some(ready) });
        self
    }
    pub fn build(self) -> Site { self.site }
}

fn overlay(slot: &mut Option<TemplateOverlay>) -> &mut OverlayMetadata {
    &mut slot.get_or_insert_with(TemplateOverlay::default).metadata
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_patch_follows_rfc7386() {
        let mut doc = json!({"a": 1, "b": {"c": 2, "d": 3}});
        merge_patch(&mut doc, &json!({"b": {"c": null, "e": 4}, "f": "x"}));
        assert_eq!(doc, json!({"a": 1, "b": {"d": 3, "e": 4}, "f": "x"}));
    }

    #[tokio::test]
    async fn replace_enforces_resource_version() {
        let store = MemoryStore::new();
        let ar = store::api_resource::<ConfigMap>();
        store.put_config_map("ns", "cm", [("k", "v")]);
        let mut stale = store.dynamic(&ar, "ns", "cm").unwrap();
        let fresh = store.replace(&ar, "ns", &stale).await.unwrap();
        assert_ne!(fresh.metadata.resource_version, stale.metadata.resource_version);
        assert_eq!(fresh.metadata.uid, stale.metadata.uid);
        stale.data["data"]["k"] = json!("w");
        let err = store.replace(&ar, "ns", &stale).await.unwrap_err();
        assert!(matches!(err, Error::Kube(kube::Error::Api(ref ae)) if ae.code == 409));
    }

    #[tokio::test]
    async fn scripted_client_defaults_to_not_ready() {
        let c = ScriptedRevisionClient::new();
        assert_eq!(c.latest_revision("ns", "a").await.unwrap(), None);
        c.set("ns", "a", Some("abc"));
        assert_eq!(c.latest_revision("ns", "a").await.unwrap().as_deref(), Some("abc"));
        c.fail("ns", "a", 500);
        assert!(c.latest_revision("ns", "a").await.is_err());
        assert_eq!(c.calls(), 3);
    }
}
