use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use kube_runtime::reflector::ObjectRef;

use crate::crd::{Readiness, Site};

/// What the watcher needs to know about one site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedSite {
    pub site: ObjectRef<Site>,
    pub revision: String,
}

#[derive(Default)]
struct Buckets {
    by_readiness: HashMap<Readiness, HashMap<ObjectRef<Site>, String>>,
    readiness_of: HashMap<ObjectRef<Site>, Readiness>,
}

/// Sites bucketed by `status.ready`, so the watcher can fetch the ready set without
/// scanning every Site. Kept current by the reconciler from the objects it reads and
/// the statuses it writes.
#[derive(Clone, Default)]
pub struct SiteIndex {
    inner: Arc<RwLock<Buckets>>,
}

impl SiteIndex {
    pub fn new() -> Self { Self::default() }

    /// Records the readiness and applied revision found on `site`.
    pub fn observe(&self, site: &Site) {
        let status = site.status.clone().unwrap_or_default();
        self.record(ObjectRef::from_obj(site), status.ready.unwrap_or_default(), status.revision);
    }

    pub fn record(&self, site: ObjectRef<Site>, readiness: Readiness, revision: String) {
        let mut b = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(prev) = b.readiness_of.insert(site.clone(), readiness) {
            if prev != readiness {
                if let Some(bucket) = b.by_readiness.get_mut(&prev) {
                    bucket.remove(&site);
                }
            }
        }
        b.by_readiness.entry(readiness).or_default().insert(site, revision);
    }

    pub fn forget(&self, site: &ObjectRef<Site>) {
        let mut b = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(prev) = b.readiness_of.remove(site) {
            if let Some(bucket) = b.by_readiness.get_mut(&prev) {
                bucket.remove(site);
            }
        }
    }

    /// Drops every site `keep` rejects and returns the dropped references.
    pub fn retain(&self, keep: impl Fn(&ObjectRef<Site>) -> bool) -> Vec<ObjectRef<Site>> {
        let mut b = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let gone: Vec<ObjectRef<Site>> = b.readiness_of.keys().filter(|site| !keep(site)).cloned().collect();
        for site in &gone {
            if let Some(prev) = b.readiness_of.remove(site) {
                if let Some(bucket) = b.by_readiness.get_mut(&prev) {
                    bucket.remove(site);
                }
            }
        }
        gone
    }

    /// Snapshot of one bucket, ordered by namespace and name.
    pub fn with_readiness(&self, readiness: Readiness) -> Vec<TrackedSite> {
        let b = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut sites: Vec<TrackedSite> = b
            .by_readiness
            .get(&readiness)
            .map(|bucket| bucket.iter().map(|(site, revision)| TrackedSite { site: site.clone(), revision: revision.clone() }).collect())
            .unwrap_or_default();
        sites.sort_by(|a, b| (&a.site.namespace, &a.site.name).cmp(&(&b.site.namespace, &b.site.name)));
        sites
    }

    pub fn ready(&self) -> Vec<TrackedSite> { self.with_readiness(Readiness::True) }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).readiness_of.len()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site_ref(ns: &str, name: &str) -> ObjectRef<Site> { ObjectRef::new(name).within(ns) }

    #[test]
    fn moves_between_buckets() {
        let index = SiteIndex::new();
        let a = site_ref("ns", "a");
        index.record(a.clone(), Readiness::Unknown, String::new());
        assert!(index.ready().is_empty());

        index.record(a.clone(), Readiness::True, "abc".into());
        assert_eq!(index.ready(), vec![TrackedSite { site: a.clone(), revision: "abc".into() }]);
        assert!(index.with_readiness(Readiness::Unknown).is_empty());

        index.record(a.clone(), Readiness::False, "abc".into());
        assert!(index.ready().is_empty());
        assert_eq!(index.len(), 1);

        index.forget(&a);
        assert!(index.is_empty());
        assert!(index.with_readiness(Readiness::False).is_empty());
    }

    #[test]
    fn retain_drops_rejected_sites() {
        let index = SiteIndex::new();
        index.record(site_ref("ns", "kept"), Readiness::True, "abc".into());
        index.record(site_ref("ns", "gone"), Readiness::True, "abc".into());
        index.record(site_ref("ns", "failed"), Readiness::False, "abc".into());

        let dropped = index.retain(|site| site.name == "kept");
        assert_eq!(dropped.len(), 2);
        assert_eq!(index.len(), 1);
        assert_eq!(index.ready(), vec![TrackedSite { site: site_ref("ns", "kept"), revision: "abc".into() }]);
        assert!(index.with_readiness(Readiness::False).is_empty());
    }

    #[test]
    fn ready_is_sorted() {
        let index = SiteIndex::new();
        for (ns, name) in [("b", "x"), ("a", "z"), ("a", "y")] {
            index.record(site_ref(ns, name), Readiness::True, "r".into());
        }
        let names: Vec<_> = index.ready().into_iter().map(|t| format!("{}/{}", t.site.namespace.unwrap(), t.site.name)).collect();
        assert_eq!(names, ["a/y", "a/z", "b/x"]);
    }

    #[test]
    fn observe_reads_status() {
        use crate::test_support::SiteBuilder;
        let index = SiteIndex::new();
        index.observe(&SiteBuilder::new("docs", "web").status(Readiness::True, "abc").build());
        index.observe(&SiteBuilder::new("blog", "web").build());
        assert_eq!(index.ready().len(), 1);
        assert_eq!(index.ready()[0].revision, "abc");
        assert_eq!(index.with_readiness(Readiness::Unknown).len(), 1);
    }
}
