use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{LocalObjectReference, Volume};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::datasource::DataSource;

fn default_branch() -> String { "main".into() }
fn default_replicas() -> i32 { 1 }

/// A static site built from `repoURL`@`branch` and served by an nginx Deployment.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq)]
#[kube(
    group = "site-operator.dev",
    version = "v1",
    kind = "Site",
    namespaced,
    status = "SiteStatus",
    printcolumn = r#"{"name":"READY","type":"string","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"REVISION","type":"string","jsonPath":".status.revision"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SiteSpec {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Image that runs the build and post-build scripts.
    pub build_image: String,
    pub build_script: DataSource,
    /// Runs once per revision as a Job after the build script changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_build_script: Option<DataSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub build_secrets: Vec<SecretKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalObjectReference>,
    /// Secret holding an ssh key pair for private repositories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_key_secret_name: Option<String>,
    /// Object templates rendered with `{{ResourceName}}` and `{{ResourceNamespace}}`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_resources: Vec<DataSource>,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<TemplateOverlay>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_template: Option<TemplateOverlay>,
    /// Replaces the default emptyDir of the same name (`data`, `log`, `cache`, `tmp`, `home`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_templates: Vec<Volume>,
}

/// Secret key exposed to build containers as an environment variable named `key`.
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq)]
pub struct SecretKey {
    pub name: String,
    pub key: String,
}

/// Labels and annotations merged into generated metadata. Nothing else is overridable.
#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
pub struct TemplateOverlay {
    #[serde(default)]
    pub metadata: OverlayMetadata,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
pub struct OverlayMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, JsonSchema, PartialEq, Eq, Hash)]
pub enum Readiness {
    True,
    False,
    #[default]
    Unknown,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, JsonSchema, PartialEq)]
pub struct SiteStatus {
    /// Commit baked into the serving Deployment by the last successful pass.
    #[serde(default)]
    pub revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<Readiness>,
}

impl Site {
    pub fn readiness(&self) -> Readiness {
        self.status.as_ref().and_then(|s| s.ready).unwrap_or_default()
    }

    pub fn applied_revision(&self) -> &str {
        self.status.as_ref().map(|s| s.revision.as_str()).unwrap_or_default()
    }

    /// `REPO_NAME` handed to containers: last path segment without `.git`.
    pub fn repo_name(&self) -> &str {
        let last = self.spec.repo_url.trim_end_matches('/').rsplit('/').next().unwrap_or_default();
        last.strip_suffix(".git").unwrap_or(last)
    }
}
