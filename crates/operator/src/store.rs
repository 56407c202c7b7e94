use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams},
    core::{ApiResource, GroupVersionKind},
    discovery::{self, Scope},
    Client, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::error::{is_not_found, Error};

/// The slice of the Kubernetes API the reconciler needs.
///
/// Objects travel as [`DynamicObject`] so that typed children and user-supplied extra
/// resources share one code path. A missing object is `Ok(None)`, never an error.
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Looks up the API resource (plural, scope) serving `gvk`. Fails for cluster scoped kinds.
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ApiResource, Error>;
    async fn get(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<Option<DynamicObject>, Error>;
    async fn create(&self, ar: &ApiResource, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject, Error>;
    /// Full update guarded by `metadata.resourceVersion`.
    async fn replace(&self, ar: &ApiResource, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject, Error>;
    /// Background-propagation delete. Deleting something already gone succeeds.
    async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<(), Error>;
    /// Merge-patches the status subresource with `{"status": status}`.
    async fn patch_status(&self, ar: &ApiResource, namespace: &str, name: &str, status: &serde_json::Value) -> Result<(), Error>;
}

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    fn api(&self, ar: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, ar)
    }
}

const FIELD_MANAGER: &str = "site-operator";

#[async_trait]
impl ObjectStore for KubeStore {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ApiResource, Error> {
        let (ar, caps) = discovery::pinned_kind(&self.client, gvk).await?;
        if matches!(caps.scope, Scope::Cluster) {
            return Err(Error::NotNamespaced { kind: gvk.kind.clone() });
        }
        Ok(ar)
    }

    async fn get(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<Option<DynamicObject>, Error> {
        Ok(self.api(ar, namespace).get_opt(name).await?)
    }

    async fn create(&self, ar: &ApiResource, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        let pp = PostParams { field_manager: Some(FIELD_MANAGER.into()), ..Default::default() };
        Ok(self.api(ar, namespace).create(&pp, obj).await?)
    }

    async fn replace(&self, ar: &ApiResource, namespace: &str, obj: &DynamicObject) -> Result<DynamicObject, Error> {
        let name = obj.metadata.name.as_deref().ok_or(Error::MissingMetadata("name"))?;
        let pp = PostParams { field_manager: Some(FIELD_MANAGER.into()), ..Default::default() };
        Ok(self.api(ar, namespace).replace(name, &pp, obj).await?)
    }

    async fn delete(&self, ar: &ApiResource, namespace: &str, name: &str) -> Result<(), Error> {
        match self.api(ar, namespace).delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(kind = %ar.kind, %namespace, %name, "store.delete.already_gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(&self, ar: &ApiResource, namespace: &str, name: &str, status: &serde_json::Value) -> Result<(), Error> {
        let patch = serde_json::json!({ "status": status });
        self.api(ar, namespace)
            .patch_status(name, &PatchParams { field_manager: Some(FIELD_MANAGER.into()), ..Default::default() }, &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

pub fn api_resource<K: Resource<DynamicType = ()>>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject, Error> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

pub fn from_dynamic<K: DeserializeOwned>(obj: DynamicObject) -> Result<K, Error> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

pub async fn get_typed<K>(store: &dyn ObjectStore, namespace: &str, name: &str) -> Result<Option<K>, Error>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    match store.get(&api_resource::<K>(), namespace, name).await? {
        Some(obj) => Ok(Some(from_dynamic(obj)?)),
        None => Ok(None),
    }
}
