use kube::{api::DynamicObject, core::GroupVersionKind, ResourceExt};
use tera::{Context, Tera};

use crate::crd::Site;
use crate::error::Error;

/// Renders one extra-resource template for `site` and parses it into an object that
/// always lives in the Site's namespace.
///
/// Templates see `ResourceName` and `ResourceNamespace`, nothing else.
pub fn render(site: &Site, index: usize, template: &str) -> Result<(GroupVersionKind, DynamicObject), Error> {
    let namespace = site.namespace().ok_or(Error::MissingMetadata("namespace"))?;
    let mut ctx = Context::new();
    ctx.insert("ResourceName", &site.name_any());
    ctx.insert("ResourceNamespace", &namespace);
    let rendered = Tera::one_off(template, &ctx, false).map_err(|source| Error::Render { index, source })?;

    let mut obj: DynamicObject = serde_yaml::from_str(&rendered).map_err(|source| Error::Manifest { index, source })?;
    let invalid = |reason: &str| Error::InvalidManifest { index, reason: reason.into() };
    let types = obj.types.clone().ok_or_else(|| invalid("apiVersion and kind are required"))?;
    if types.kind.is_empty() || types.api_version.is_empty() {
        return Err(invalid("apiVersion and kind are required"));
    }
    if obj.metadata.name.as_deref().map_or(true, str::is_empty) {
        return Err(invalid("metadata.name is required"));
    }
    obj.metadata.namespace = Some(namespace);

    let (group, version) = match types.api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), types.api_version.clone()),
    };
    Ok((GroupVersionKind::gvk(&group, &version, &types.kind), obj))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::SiteBuilder;

    const UBUNTU: &str = r#"
apiVersion: v1
kind: Pod
metadata:
  name: {{ResourceName}}-ubuntu
  namespace: somewhere-else
  labels:
    site-namespace: {{ResourceNamespace}}
spec:
  containers:
    - name: ubuntu
      image: ubuntu:22.04
"#;

    #[test]
    fn substitutes_and_forces_namespace() {
        let site = SiteBuilder::new("mysite", "ns").build();
        let (gvk, obj) = render(&site, 0, UBUNTU).unwrap();
        assert_eq!(gvk, GroupVersionKind::gvk("", "v1", "Pod"));
        assert_eq!(obj.metadata.name.as_deref(), Some("mysite-ubuntu"));
        assert_eq!(obj.metadata.namespace.as_deref(), Some("ns"));
        assert_eq!(obj.metadata.labels.unwrap()["site-namespace"], "ns");
        assert_eq!(obj.data["spec"]["containers"][0]["image"], "ubuntu:22.04");
    }

    #[test]
    fn grouped_api_version() {
        let site = SiteBuilder::new("mysite", "ns").build();
        let tpl = "apiVersion: networking.k8s.io/v1\nkind: Ingress\nmetadata:\n  name: {{ResourceName}}\n";
        let (gvk, _) = render(&site, 0, tpl).unwrap();
        assert_eq!((gvk.group.as_str(), gvk.version.as_str(), gvk.kind.as_str()), ("networking.k8s.io", "v1", "Ingress"));
    }

    #[test]
    fn broken_template_is_render_error() {
        let site = SiteBuilder::new("mysite", "ns").build();
        let err = render(&site, 2, "name: {{ ResourceName").unwrap_err();
        assert!(matches!(err, Error::Render { index: 2, .. }));
        assert!(err.to_string().starts_with("extraResources[2]"));
    }

    #[test]
    fn unknown_variable_is_render_error() {
        let site = SiteBuilder::new("mysite", "ns").build();
        assert!(matches!(render(&site, 0, "name: {{ Missing }}"), Err(Error::Render { .. })));
    }

    #[test]
    fn missing_identity_is_rejected() {
        let site = SiteBuilder::new("mysite", "ns").build();
        assert!(matches!(render(&site, 0, "metadata:\n  name: x\n"), Err(Error::Manifest { .. } | Error::InvalidManifest { .. })));
        assert!(matches!(render(&site, 0, "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n"), Err(Error::InvalidManifest { .. })));
        assert!(matches!(render(&site, 0, "- not\n- a map\n"), Err(Error::Manifest { .. })));
    }
}
