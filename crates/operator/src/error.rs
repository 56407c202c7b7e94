use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{field}: neither rawData nor configMap is set")]
    EmptyDataSource { field: String },
    #[error("{field}: rawData and configMap are mutually exclusive")]
    AmbiguousDataSource { field: String },
    #[error("configmap {namespace}/{name} not found")]
    ConfigMapNotFound { namespace: String, name: String },
    #[error("configmap {namespace}/{name} does not have key {key}")]
    MissingKey { namespace: String, name: String, key: String },

    #[error("extraResources[{index}]: render failed: {source}")]
    Render { index: usize, #[source] source: tera::Error },
    #[error("extraResources[{index}]: not a valid object: {source}")]
    Manifest { index: usize, #[source] source: serde_yaml::Error },
    #[error("extraResources[{index}]: {reason}")]
    InvalidManifest { index: usize, reason: String },
    #[error("{kind} is cluster scoped and cannot be owned by a Site")]
    NotNamespaced { kind: String },

    #[error("{kind} {namespace}/{name} is already controlled by {owner}")]
    ForeignController { kind: String, namespace: String, name: String, owner: String },
    #[error("object is missing metadata.{0}")]
    MissingMetadata(&'static str),

    #[error("repo-checker {url} answered {status}")]
    ProbeStatus { url: String, status: u16 },
    #[error("repo-checker {url} unreachable: {source}")]
    ProbeTransport { url: String, #[source] source: reqwest::Error },

    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("reconcile trigger channel closed")]
    TriggerChannelClosed,
    #[error("cancelled")]
    Cancelled,
    #[error("config: {0}")]
    Config(String),
}

impl Error {
    /// Short stable label for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmptyDataSource { .. } | Self::AmbiguousDataSource { .. } => "datasource",
            Self::ConfigMapNotFound { .. } | Self::MissingKey { .. } => "configmap",
            Self::Render { .. } | Self::Manifest { .. } | Self::InvalidManifest { .. } | Self::NotNamespaced { .. } => "extra_resource",
            Self::ForeignController { .. } | Self::MissingMetadata(_) => "ownership",
            Self::ProbeStatus { .. } | Self::ProbeTransport { .. } => "probe",
            Self::Kube(_) => "kube",
            Self::Serialization(_) => "serialization",
            Self::TriggerChannelClosed | Self::Cancelled => "shutdown",
            Self::Config(_) => "config",
        }
    }
}

/// Why a convergence pass stopped early.
///
/// The first two are expected waits with their own requeue policy and never mark the
/// site as failed.
#[derive(Debug, Error)]
pub enum Halt {
    #[error("repo-checker has no revision yet")]
    RevisionNotReady,
    #[error("post-build job is still running")]
    JobActive,
    #[error(transparent)]
    Failed(#[from] Error),
}

pub(crate) fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}
