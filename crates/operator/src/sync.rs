use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{api::DynamicObject, core::ApiResource, Resource, ResourceExt};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

use crate::crd::Site;
use crate::derivative::is_derivative;
use crate::error::Error;
use crate::store::{self, ObjectStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Created,
    Updated,
    Unchanged,
}

impl Operation {
    pub fn changed(self) -> bool { self != Self::Unchanged }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Fetches `owner.namespace/name` (or starts from `K::default()`), applies `mutate`,
/// stamps the controller reference and writes the result if it differs from what is live.
///
/// The write is skipped when the mutated object is a derivative of the live one, so
/// fields filled in by the API server never count as drift.
pub async fn create_or_update<K, F>(store: &dyn ObjectStore, owner: &Site, name: &str, mutate: F) -> Result<Operation, Error>
where
    K: Resource<DynamicType = ()> + Default + Serialize + DeserializeOwned,
    F: FnOnce(&mut K) -> Result<(), Error>,
{
    let namespace = owner.namespace().ok_or(Error::MissingMetadata("namespace"))?;
    let ar = store::api_resource::<K>();
    let live = store.get(&ar, &namespace, name).await?;

    let (mut obj, before) = match live {
        Some(live) => {
            let before = serde_json::to_value(&live)?;
            (store::from_dynamic::<K>(live)?, Some(before))
        }
        None => (K::default(), None),
    };
    obj.meta_mut().name = Some(name.to_string());
    obj.meta_mut().namespace = Some(namespace.clone());
    mutate(&mut obj)?;
    set_controller_reference(owner, obj.meta_mut(), &ar.kind)?;

    let desired = store::to_dynamic(&obj)?;
    let op = match before {
        None => {
            store.create(&ar, &namespace, &desired).await?;
            Operation::Created
        }
        Some(before) if is_derivative(&serde_json::to_value(&desired)?, &before) => Operation::Unchanged,
        Some(_) => {
            store.replace(&ar, &namespace, &desired).await?;
            Operation::Updated
        }
    };
    log_operation(&ar, &namespace, name, op);
    Ok(op)
}

/// Untyped counterpart of [`create_or_update`] for objects whose kind is only known at
/// runtime. `desired` replaces the live object wholesale unless it is already a
/// derivative of it.
pub async fn create_or_replace_dynamic(
    store: &dyn ObjectStore,
    owner: &Site,
    ar: &ApiResource,
    mut desired: DynamicObject,
) -> Result<Operation, Error> {
    let namespace = desired.metadata.namespace.clone().ok_or(Error::MissingMetadata("namespace"))?;
    let name = desired.metadata.name.clone().ok_or(Error::MissingMetadata("name"))?;
    set_controller_reference(owner, &mut desired.metadata, &ar.kind)?;

    let op = match store.get(ar, &namespace, &name).await? {
        None => {
            store.create(ar, &namespace, &desired).await?;
            Operation::Created
        }
        Some(live) if is_derivative(&serde_json::to_value(&desired)?, &serde_json::to_value(&live)?) => Operation::Unchanged,
        Some(live) => {
            desired.metadata.resource_version = live.metadata.resource_version;
            desired.metadata.uid = live.metadata.uid;
            store.replace(ar, &namespace, &desired).await?;
            Operation::Updated
        }
    };
    log_operation(ar, &namespace, &name, op);
    Ok(op)
}

/// Makes `owner` the controlling owner of `meta`, keeping any unrelated non-controller refs.
pub fn set_controller_reference(owner: &Site, meta: &mut ObjectMeta, kind: &str) -> Result<(), Error> {
    let owner_ref = owner.controller_owner_ref(&()).ok_or(Error::MissingMetadata("uid"))?;
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    if let Some(other) = refs.iter().find(|r| r.controller == Some(true) && r.uid != owner_ref.uid) {
        return Err(Error::ForeignController {
            kind: kind.to_string(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
            owner: format!("{}/{}", other.kind, other.name),
        });
    }
    match refs.iter_mut().find(|r| r.uid == owner_ref.uid) {
        Some(existing) => *existing = owner_ref,
        None => refs.push(owner_ref),
    }
    Ok(())
}

fn log_operation(ar: &ApiResource, namespace: &str, name: &str, op: Operation) {
    if op.changed() {
        info!(kind = %ar.kind, %namespace, %name, op = op.as_str(), "sync.applied");
    } else {
        debug!(kind = %ar.kind, %namespace, %name, "sync.unchanged");
    }
}
