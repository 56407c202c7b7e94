//! Desired shapes of the children every Site owns.
//!
//! The `apply_*` functions write only the fields this operator manages into an object
//! that may already carry server-populated fields, so they can run against a freshly
//! defaulted object or a live one.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    HTTPGetAction, PodSecurityContext, PodSpec, PodTemplateSpec, Probe, SecretKeySelector, SecretVolumeSource,
    SecurityContext, Service, ServicePort, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use sha2::{Digest, Sha256};

use crate::crd::{Site, TemplateOverlay};
use crate::revision::REPO_CHECKER_SUFFIX;

pub const OPERATOR_NAME: &str = "site-operator";
pub const MANAGED_BY_KEY: &str = "app.kubernetes.io/managed-by";
pub const NAME_KEY: &str = "app.kubernetes.io/name";
pub const INSTANCE_KEY: &str = "app.kubernetes.io/instance";
pub const CHECKSUM_ANNOTATION: &str = "checksum/config";

pub const REPO_CHECKER_PORT: i32 = 9090;
pub const NGINX_PORT: i32 = 8080;
const BUILD_UID: i64 = 10000;
const NGINX_UID: i64 = 33;
const HOME: &str = "/home/ubuntu";
const DEPLOY_KEY_VOLUME: &str = "deploy-key";

const COMPONENT_REPO_CHECKER: &str = "repo-checker";
const COMPONENT_NGINX: &str = "nginx";
const COMPONENT_POST_BUILD: &str = "post-build";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    Build,
    PostBuild,
}

impl Script {
    fn stem(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::PostBuild => "post-build",
        }
    }

    /// Spec field the script comes from, for error messages.
    pub fn field(self) -> &'static str {
        match self {
            Self::Build => "buildScript",
            Self::PostBuild => "postBuildScript",
        }
    }

    pub fn config_map_name(self, site_name: &str) -> String { format!("{site_name}-{}-script", self.stem()) }
    pub fn data_key(self) -> String { format!("{}.sh", self.stem()) }
    fn volume_name(self) -> String { format!("{}-script", self.stem()) }
    fn mount_path(self) -> String { format!("/{}", self.stem()) }
    fn command(self) -> Vec<String> {
        vec!["/bin/bash".into(), "-c".into(), format!("{}/{}", self.mount_path(), self.data_key())]
    }
}

pub fn repo_checker_name(site_name: &str) -> String { format!("{site_name}{REPO_CHECKER_SUFFIX}") }

/// Hex sha256 of the script. Stamped on pod templates so that editing a script rolls pods.
pub fn checksum(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn standard_labels(component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_KEY.to_string(), OPERATOR_NAME.to_string()),
        (NAME_KEY.to_string(), component.to_string()),
    ])
}

fn selector_labels(component: &str, instance: &str) -> BTreeMap<String, String> {
    let mut labels = standard_labels(component);
    labels.insert(INSTANCE_KEY.into(), instance.into());
    labels
}

/// Adds overlay labels first, then `base`, so managed keys win on collision.
fn merge_labels(meta: &mut ObjectMeta, overlay: Option<&TemplateOverlay>, base: BTreeMap<String, String>) {
    let labels = meta.labels.get_or_insert_with(BTreeMap::new);
    if let Some(o) = overlay {
        labels.extend(o.metadata.labels.clone());
    }
    labels.extend(base);
}

fn merge_annotations(meta: &mut ObjectMeta, overlay: Option<&TemplateOverlay>) {
    if let Some(o) = overlay.filter(|o| !o.metadata.annotations.is_empty()) {
        meta.annotations.get_or_insert_with(BTreeMap::new).extend(o.metadata.annotations.clone());
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar { name: name.into(), value: Some(value.into()), ..Default::default() }
}

fn common_env(site: &Site) -> Vec<EnvVar> {
    vec![
        env("RESOURCE_NAMESPACE", site.metadata.namespace.clone().unwrap_or_default()),
        env("RESOURCE_NAME", site.metadata.name.clone().unwrap_or_default()),
        env("REPO_URL", &site.spec.repo_url),
        env("REPO_NAME", site.repo_name()),
        env("REPO_BRANCH", &site.spec.branch),
    ]
}

fn secret_env(site: &Site) -> impl Iterator<Item = EnvVar> + '_ {
    site.spec.build_secrets.iter().map(|s| EnvVar {
        name: s.key.clone(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector { name: Some(s.name.clone()), key: s.key.clone(), optional: None }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount { name: name.into(), mount_path: path.into(), ..Default::default() }
}

/// The user's volume template of that name, or an emptyDir.
fn volume_or_empty_dir(site: &Site, name: &str) -> Volume {
    site.spec
        .volume_templates
        .iter()
        .find(|v| v.name == name)
        .cloned()
        .unwrap_or_else(|| Volume { name: name.into(), empty_dir: Some(EmptyDirVolumeSource::default()), ..Default::default() })
}

fn script_volume(site_name: &str, script: Script) -> Volume {
    Volume {
        name: script.volume_name(),
        config_map: Some(ConfigMapVolumeSource {
            name: Some(script.config_map_name(site_name)),
            default_mode: Some(0o755),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn deploy_key_volume(secret: &str) -> Volume {
    Volume {
        name: DEPLOY_KEY_VOLUME.into(),
        secret: Some(SecretVolumeSource { secret_name: Some(secret.into()), default_mode: Some(0o600), ..Default::default() }),
        ..Default::default()
    }
}

fn deploy_key_mount() -> VolumeMount {
    VolumeMount { read_only: Some(true), ..mount(DEPLOY_KEY_VOLUME, &format!("{HOME}/.ssh")) }
}

fn image_pull_secrets(site: &Site) -> Option<Vec<k8s_openapi::api::core::v1::LocalObjectReference>> {
    (!site.spec.image_pull_secrets.is_empty()).then(|| site.spec.image_pull_secrets.clone())
}

fn run_as(uid: i64) -> Option<SecurityContext> {
    Some(SecurityContext { run_as_user: Some(uid), ..Default::default() })
}

fn site_name(site: &Site) -> &str { site.metadata.name.as_deref().unwrap_or_default() }

pub fn apply_script_config_map(cm: &mut ConfigMap, script: Script, content: &str, hash: &str) {
    merge_labels(&mut cm.metadata, None, standard_labels(&script.volume_name()));
    cm.metadata.annotations.get_or_insert_with(BTreeMap::new).insert(CHECKSUM_ANNOTATION.into(), hash.into());
    cm.data = Some(BTreeMap::from([(script.data_key(), content.to_string())]));
}

fn set_deployment(dep: &mut Deployment, component: &str, instance: &str, replicas: i32, template: PodTemplateSpec) {
    merge_labels(&mut dep.metadata, None, standard_labels(component));
    let spec = dep.spec.get_or_insert_with(Default::default);
    spec.replicas = Some(replicas);
    spec.selector = LabelSelector { match_labels: Some(selector_labels(component, instance)), match_expressions: None };
    spec.template = template;
}

fn set_service(svc: &mut Service, component: &str, instance: &str, port: ServicePort) {
    let spec = svc.spec.get_or_insert_with(Default::default);
    spec.ports = Some(vec![port]);
    spec.selector = Some(selector_labels(component, instance));
}

fn tcp_port(name: &str, port: i32, target: i32) -> ServicePort {
    ServicePort {
        name: Some(name.into()),
        protocol: Some("TCP".into()),
        port,
        target_port: Some(IntOrString::Int(target)),
        ..Default::default()
    }
}

pub fn repo_checker_pod_template(site: &Site, image: &str) -> PodTemplateSpec {
    let instance = repo_checker_name(site_name(site));
    let overlay = site.spec.pod_template.as_ref();
    let mut meta = ObjectMeta::default();
    merge_labels(&mut meta, overlay, selector_labels(COMPONENT_REPO_CHECKER, &instance));
    merge_annotations(&mut meta, overlay);

    let mut env_vars = common_env(site);
    env_vars.push(env("HOME", HOME));
    let mut container = Container {
        name: "repo-checker".into(),
        image: Some(image.into()),
        command: Some(vec![
            "/repo-checker".into(),
            format!("--repo-url={}", site.spec.repo_url),
            format!("--repo-branch={}", site.spec.branch),
            format!("--listen-addr=0.0.0.0:{REPO_CHECKER_PORT}"),
        ]),
        env: Some(env_vars),
        ports: Some(vec![ContainerPort { name: Some("http".into()), container_port: REPO_CHECKER_PORT, ..Default::default() }]),
        ..Default::default()
    };
    let mut volumes = Vec::new();
    if let Some(secret) = &site.spec.deploy_key_secret_name {
        volumes.push(deploy_key_volume(secret));
        container.volume_mounts = Some(vec![deploy_key_mount()]);
    }

    PodTemplateSpec {
        metadata: Some(meta),
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: (!volumes.is_empty()).then_some(volumes),
            image_pull_secrets: image_pull_secrets(site),
            security_context: Some(PodSecurityContext {
                run_as_user: Some(BUILD_UID),
                fs_group: Some(BUILD_UID),
                ..Default::default()
            }),
            ..Default::default()
        }),
    }
}

pub fn apply_repo_checker_deployment(dep: &mut Deployment, site: &Site, image: &str) {
    let instance = repo_checker_name(site_name(site));
    set_deployment(dep, COMPONENT_REPO_CHECKER, &instance, 1, repo_checker_pod_template(site, image));
}

pub fn apply_repo_checker_service(svc: &mut Service, site: &Site) {
    let instance = repo_checker_name(site_name(site));
    merge_labels(&mut svc.metadata, None, standard_labels(COMPONENT_REPO_CHECKER));
    set_service(svc, COMPONENT_REPO_CHECKER, &instance, tcp_port("repo-checker", 80, REPO_CHECKER_PORT));
}

/// nginx serving `/data`, filled by a `build` init container that runs the build script
/// against `revision`.
pub fn serving_pod_template(site: &Site, image: &str, revision: &str, hash: &str) -> PodTemplateSpec {
    let name = site_name(site);
    let overlay = site.spec.pod_template.as_ref();
    let mut meta = ObjectMeta::default();
    merge_labels(&mut meta, overlay, selector_labels(COMPONENT_NGINX, name));
    merge_annotations(&mut meta, overlay);
    meta.annotations.get_or_insert_with(BTreeMap::new).insert(CHECKSUM_ANNOTATION.into(), hash.into());

    let mut volumes: Vec<Volume> = ["data", "log", "cache", "tmp", "home"].iter().map(|v| volume_or_empty_dir(site, v)).collect();
    volumes.push(script_volume(name, Script::Build));

    let nginx = Container {
        name: "nginx".into(),
        image: Some(image.into()),
        ports: Some(vec![ContainerPort { name: Some("http".into()), container_port: NGINX_PORT, ..Default::default() }]),
        volume_mounts: Some(vec![
            mount("data", "/data"),
            mount("log", "/var/log/nginx"),
            mount("cache", "/var/cache/nginx"),
            mount("tmp", "/tmp"),
        ]),
        security_context: run_as(NGINX_UID),
        readiness_probe: Some(Probe {
            http_get: Some(HTTPGetAction { path: Some("/".into()), port: IntOrString::Int(NGINX_PORT), ..Default::default() }),
            timeout_seconds: Some(1),
            period_seconds: Some(10),
            success_threshold: Some(1),
            failure_threshold: Some(3),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut build_env = common_env(site);
    build_env.extend([env("HOME", HOME), env("REVISION", revision), env("OUTPUT", "/data")]);
    build_env.extend(secret_env(site));
    let mut build_mounts = vec![
        mount("home", HOME),
        mount(&Script::Build.volume_name(), &Script::Build.mount_path()),
        mount("data", "/data"),
        mount("tmp", "/tmp"),
    ];
    if let Some(secret) = &site.spec.deploy_key_secret_name {
        volumes.push(deploy_key_volume(secret));
        build_mounts.push(deploy_key_mount());
    }
    let build = Container {
        name: "build".into(),
        image: Some(site.spec.build_image.clone()),
        command: Some(Script::Build.command()),
        env: Some(build_env),
        volume_mounts: Some(build_mounts),
        security_context: run_as(BUILD_UID),
        ..Default::default()
    };

    PodTemplateSpec {
        metadata: Some(meta),
        spec: Some(PodSpec {
            init_containers: Some(vec![build]),
            containers: vec![nginx],
            volumes: Some(volumes),
            image_pull_secrets: image_pull_secrets(site),
            security_context: Some(PodSecurityContext { fs_group: Some(BUILD_UID), ..Default::default() }),
            ..Default::default()
        }),
    }
}

pub fn apply_serving_deployment(dep: &mut Deployment, site: &Site, image: &str, revision: &str, hash: &str) {
    let template = serving_pod_template(site, image, revision, hash);
    set_deployment(dep, COMPONENT_NGINX, site_name(site), site.spec.replicas, template);
}

pub fn apply_serving_service(svc: &mut Service, site: &Site) {
    let overlay = site.spec.service_template.as_ref();
    merge_labels(&mut svc.metadata, overlay, standard_labels(COMPONENT_NGINX));
    merge_annotations(&mut svc.metadata, overlay);
    set_service(svc, COMPONENT_NGINX, site_name(site), tcp_port("nginx", NGINX_PORT, NGINX_PORT));
}

/// Pod template of the post-build Job. Never restarts; a failed run is visible on the Job.
pub fn post_build_pod_template(site: &Site, revision: &str, hash: &str) -> PodTemplateSpec {
    let name = site_name(site);
    let mut meta = ObjectMeta::default();
    merge_labels(&mut meta, None, selector_labels(COMPONENT_POST_BUILD, name));
    meta.annotations = Some(BTreeMap::from([(CHECKSUM_ANNOTATION.to_string(), hash.to_string())]));

    let mut volumes: Vec<Volume> = ["log", "cache", "tmp"].iter().map(|v| volume_or_empty_dir(site, v)).collect();
    volumes.push(script_volume(name, Script::PostBuild));

    let mut job_env = common_env(site);
    job_env.extend([env("HOME", HOME), env("REVISION", revision)]);
    job_env.extend(secret_env(site));
    let mut mounts = vec![mount(&Script::PostBuild.volume_name(), &Script::PostBuild.mount_path()), mount("tmp", "/tmp")];
    if let Some(secret) = &site.spec.deploy_key_secret_name {
        volumes.push(deploy_key_volume(secret));
        mounts.push(deploy_key_mount());
    }

    PodTemplateSpec {
        metadata: Some(meta),
        spec: Some(PodSpec {
            restart_policy: Some("Never".into()),
            containers: vec![Container {
                name: "job".into(),
                image: Some(site.spec.build_image.clone()),
                command: Some(Script::PostBuild.command()),
                env: Some(job_env),
                volume_mounts: Some(mounts),
                security_context: run_as(BUILD_UID),
                ..Default::default()
            }],
            volumes: Some(volumes),
            image_pull_secrets: image_pull_secrets(site),
            security_context: Some(PodSecurityContext { fs_group: Some(BUILD_UID), ..Default::default() }),
            ..Default::default()
        }),
    }
}
