use site_operator::{DataSource, Readiness, Site, SiteSpec, SiteStatus};
use kube::CustomResourceExt;
use serde_json::json;

#[test]
fn spec_uses_wire_field_names() {
    let spec: SiteSpec = serde_json::from_value(json!({
        "repoURL": "https://github.com/example/docs.git",
        "buildImage": "ghcr.io/example/builder:latest",
        "buildScript": { "rawData": "make html" },
        "postBuildScript": { "configMap": { "name": "scripts", "key": "post.sh" } },
        "extraResources": [{ "rawData": "kind: ConfigMap" }]
    }))
    .unwrap();
    assert_eq!(spec.branch, "main");
    assert_eq!(spec.replicas, 1);
    assert_eq!(spec.build_script, DataSource::raw("make html"));
    assert_eq!(spec.post_build_script, Some(DataSource::config_map("scripts", None, "post.sh")));

    let back = serde_json::to_value(&spec).unwrap();
    assert_eq!(back["repoURL"], "https://github.com/example/docs.git");
    assert!(back.get("repoUrl").is_none());
    let again: SiteSpec = serde_json::from_value(back).unwrap();
    assert_eq!(again, spec);
}

#[test]
fn status_readiness_is_a_string_enum() {
    let status = SiteStatus { revision: "abc123".into(), ready: Some(Readiness::False) };
    assert_eq!(serde_json::to_value(&status).unwrap(), json!({ "revision": "abc123", "ready": "False" }));
    let parsed: SiteStatus = serde_json::from_value(json!({ "ready": "True" })).unwrap();
    assert_eq!(parsed.ready, Some(Readiness::True));
    assert_eq!(parsed.revision, "");
}

#[test]
fn crd_has_group_and_columns() {
    let crd = Site::crd();
    assert_eq!(crd.spec.group, "site-operator.dev");
    assert_eq!(crd.spec.names.kind, "Site");
    assert_eq!(crd.spec.scope, "Namespaced");
    let version = &crd.spec.versions[0];
    assert!(version.subresources.as_ref().and_then(|s| s.status.as_ref()).is_some());
    let columns: Vec<_> = version.additional_printer_columns.iter().flatten().map(|c| c.name.as_str()).collect();
    assert_eq!(columns, ["READY", "REVISION"]);
}
