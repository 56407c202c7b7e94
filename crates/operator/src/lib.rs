//! Kubernetes operator that builds static sites from git repositories and keeps them
//! serving the latest commit of a branch.
//!
//! The reconciler converges a fixed set of child resources per [`Site`]; the
//! [`watcher::RevisionWatcher`] polls each site's repo-checker and pushes a reconcile
//! trigger when the branch tip moves.

pub mod config;
pub mod controller;
pub mod crd;
pub mod datasource;
pub mod derivative;
pub mod error;
pub mod extra;
pub mod index;
pub mod logging;
pub mod reconciler;
pub mod resources;
pub mod revision;
pub mod store;
pub mod sync;
pub mod telemetry;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod watcher;

pub use crd::{Readiness, Site, SiteSpec, SiteStatus};
pub use datasource::{ConfigMapSource, DataSource};
pub use error::{Error, Halt};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use sync::Operation;
