use k8s_openapi::api::core::v1::ConfigMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;
use crate::store::{self, ObjectStore};

/// Text that comes either inline or from one key of a ConfigMap. Exactly one must be set.
#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
pub struct ConfigMapSource {
    pub name: String,
    /// Defaults to the operator's own namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Source<'a> {
    Raw(&'a str),
    ConfigMap(&'a ConfigMapSource),
}

impl DataSource {
    pub fn raw(data: impl Into<String>) -> Self {
        Self { raw_data: Some(data.into()), config_map: None }
    }

    pub fn config_map(name: impl Into<String>, namespace: Option<&str>, key: impl Into<String>) -> Self {
        Self {
            config_map: Some(ConfigMapSource { name: name.into(), namespace: namespace.map(Into::into), key: key.into() }),
            raw_data: None,
        }
    }

    /// The one variant that is set. `field` names the spec path in the error.
    pub fn source(&self, field: &str) -> Result<Source<'_>, Error> {
        match (&self.raw_data, &self.config_map) {
            (Some(raw), None) => Ok(Source::Raw(raw)),
            (None, Some(cm)) => Ok(Source::ConfigMap(cm)),
            (None, None) => Err(Error::EmptyDataSource { field: field.into() }),
            (Some(_), Some(_)) => Err(Error::AmbiguousDataSource { field: field.into() }),
        }
    }

    /// Whether this source reads `namespace/name`.
    pub fn references(&self, default_namespace: &str, namespace: &str, name: &str) -> bool {
        self.config_map
            .as_ref()
            .is_some_and(|cm| cm.name == name && cm.effective_namespace(default_namespace) == namespace)
    }

    pub async fn resolve(&self, store: &dyn ObjectStore, default_namespace: &str, field: &str) -> Result<String, Error> {
        match self.source(field)? {
            Source::Raw(raw) => Ok(raw.to_string()),
            Source::ConfigMap(cm) => cm.read(store, default_namespace).await,
        }
    }
}

impl ConfigMapSource {
    pub fn effective_namespace<'a>(&'a self, default_namespace: &'a str) -> &'a str {
        self.namespace.as_deref().filter(|ns| !ns.is_empty()).unwrap_or(default_namespace)
    }

    async fn read(&self, store: &dyn ObjectStore, default_namespace: &str) -> Result<String, Error> {
        let namespace = self.effective_namespace(default_namespace);
        debug!(%namespace, name = %self.name, key = %self.key, "datasource.configmap.read");
        let cm: ConfigMap = store::get_typed(store, namespace, &self.name)
            .await?
            .ok_or_else(|| Error::ConfigMapNotFound { namespace: namespace.into(), name: self.name.clone() })?;
        cm.data
            .and_then(|mut data| data.remove(&self.key))
            .ok_or_else(|| Error::MissingKey { namespace: namespace.into(), name: self.name.clone(), key: self.key.clone() })
    }
}
