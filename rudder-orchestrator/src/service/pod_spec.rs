//! Job Pod templates
//!
//! Build Pod:
//! - init `pre-process`: sidecar `clone` into the shared work volume
//! - `main`: the build tool, run against the work volume
//! - `post-process`: sidecar `wait`, ships the primary artifact
//!
//! Diff-run Pod: the same clone init container plus a single `main`
//! container running the rule's tool.

use k8s_openapi::api::core::v1::Pod;
use rudder_core::domain::event::EventContext;
use rudder_core::domain::job::{JobId, LABEL_JOB_ID, dns_label, pod_name};
use rudder_core::domain::rule::{BuildRule, DiffRunRule, RuleError};
use serde_json::{Value, json};

use crate::config::{Config, HostAlias};
use crate::service::watcher::JobSpec;

pub const CONTAINER_CLONE: &str = "pre-process";
pub const CONTAINER_MAIN: &str = "main";
pub const CONTAINER_WAIT: &str = "post-process";

/// Label naming the kind of job a Pod belongs to
pub const LABEL_JOB_KIND: &str = "rudder/job-kind";

const WORK_DIR: &str = "/work";
const OUT_DIR: &str = "/out";
const VOLUME_WORK: &str = "workdir";
const VOLUME_OUT: &str = "outdir";
const VOLUME_DOCKER_CONFIG: &str = "docker-config";
const DOCKER_CONFIG_DIR: &str = "/home/bazel/.docker";

#[derive(Debug, thiserror::Error)]
pub enum PodSpecError {
    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error("invalid pod spec: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Sub-command handed to the diff-run tool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffRunCommand {
    /// Apply the change (pushes to the default branch)
    Push,
    /// Side-effect-free preview (pull requests)
    Preview,
}

impl DiffRunCommand {
    pub fn as_arg(&self) -> &'static str {
        match self {
            DiffRunCommand::Push => "push",
            DiffRunCommand::Preview => "preview",
        }
    }
}

/// Cluster-wide settings shared by every job Pod
#[derive(Debug, Clone)]
pub struct PodTemplate {
    pub namespace: String,
    pub service_account: String,
    pub sidecar_image: String,
    pub build_image: String,
    pub diff_run_image: String,
    pub storage_host: String,
    pub artifact_bucket: String,
    pub storage_token_secret: String,
    pub docker_config_secret: Option<String>,
    pub host_aliases: Vec<HostAlias>,
}

impl PodTemplate {
    pub fn from_config(config: &Config) -> Self {
        Self {
            namespace: config.build_namespace.clone(),
            service_account: config.service_account.clone(),
            sidecar_image: config.sidecar_image.clone(),
            build_image: config.build_image.clone(),
            diff_run_image: config.diff_run.default_image.clone(),
            storage_host: config.storage_host.clone(),
            artifact_bucket: config.artifact_bucket.clone(),
            storage_token_secret: config.storage_token_secret_name.clone(),
            docker_config_secret: config.docker_config_secret.clone(),
            host_aliases: config.host_aliases.clone(),
        }
    }

    /// Three-container build Pod for one run of `rule`
    pub fn build_job(
        &self,
        rule: &BuildRule,
        job_id: &JobId,
        commit: Option<&str>,
    ) -> Result<JobSpec, PodSpecError> {
        let name = pod_name(&rule.name, job_id);
        let image = match &rule.bazel_version {
            Some(version) => image_with_tag(&self.build_image, version),
            None => self.build_image.clone(),
        };

        let mut main_env = Vec::new();
        let mut main_mounts = vec![mount(VOLUME_WORK, WORK_DIR), mount(VOLUME_OUT, OUT_DIR)];
        let mut volumes = vec![empty_dir(VOLUME_WORK), empty_dir(VOLUME_OUT)];
        if let Some(secret) = &self.docker_config_secret {
            main_env.push(json!({ "name": "DOCKER_CONFIG", "value": DOCKER_CONFIG_DIR }));
            main_mounts.push(json!({
                "name": VOLUME_DOCKER_CONFIG,
                "mountPath": format!("{}/config.json", DOCKER_CONFIG_DIR),
                "subPath": ".dockerconfigjson",
            }));
            volumes.push(json!({
                "name": VOLUME_DOCKER_CONFIG,
                "secret": { "secretName": secret },
            }));
        }

        let mut wait_args = vec![
            "--action=wait".to_string(),
            format!("--artifact-host={}", self.storage_host),
            format!("--artifact-bucket={}", self.artifact_bucket),
        ];
        if let Some(artifact) = rule.primary_artifact() {
            wait_args.push(format!("--artifact-path={}", artifact));
        }
        wait_args.push(format!("--self-image={}", self.sidecar_image));

        let pod = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": self.namespace,
                "labels": { LABEL_JOB_ID: job_id.as_str(), LABEL_JOB_KIND: "build" },
            },
            "spec": {
                "serviceAccountName": self.service_account,
                "restartPolicy": "Never",
                "hostAliases": self.host_aliases_json(),
                "initContainers": [self.clone_container(&rule.clone_url()?, commit)],
                "containers": [
                    {
                        "name": CONTAINER_MAIN,
                        "image": image,
                        "args": ["--output_user_root=/out", "run", rule.build_target],
                        "workingDir": WORK_DIR,
                        "env": main_env,
                        "volumeMounts": main_mounts,
                    },
                    {
                        "name": CONTAINER_WAIT,
                        "image": self.sidecar_image,
                        "args": wait_args,
                        "workingDir": WORK_DIR,
                        "env": [
                            field_env("POD_NAME", "metadata.name"),
                            field_env("POD_NAMESPACE", "metadata.namespace"),
                            secret_env("AWS_ACCESS_KEY_ID", &self.storage_token_secret, "accesskey"),
                            secret_env("AWS_SECRET_ACCESS_KEY", &self.storage_token_secret, "secretkey"),
                            { "name": "JOB_NAME", "value": rule.name },
                            { "name": "JOB_ID", "value": job_id.as_str() },
                        ],
                        "volumeMounts": [mount(VOLUME_WORK, WORK_DIR), mount(VOLUME_OUT, OUT_DIR)],
                    },
                ],
                "volumes": volumes,
            },
        });

        Ok(JobSpec {
            pod: serde_json::from_value::<Pod>(pod)?,
            main_container: CONTAINER_MAIN.to_string(),
        })
    }

    /// Single-container Pod running the diff-run tool at the event's commit
    pub fn diff_run_job(
        &self,
        ctx: &EventContext,
        rule: &DiffRunRule,
        job_id: &JobId,
        command: DiffRunCommand,
    ) -> Result<JobSpec, PodSpecError> {
        let name = format!(
            "{}-{}-{}",
            dns_label(ctx.repository.owner()),
            dns_label(ctx.repository.name()),
            job_id
        );
        let image = rule.image.as_deref().unwrap_or(&self.diff_run_image);
        let dir = rule.dir.trim_matches('/');
        let working_dir = if dir.is_empty() {
            WORK_DIR.to_string()
        } else {
            format!("{}/{}", WORK_DIR, dir)
        };
        let env: Vec<Value> = rule
            .secret
            .iter()
            .map(|secret| secret_env(&secret.env_name, &secret.name, &secret.key))
            .collect();

        let pod = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": self.namespace,
                "labels": { LABEL_JOB_ID: job_id.as_str(), LABEL_JOB_KIND: "diff-run" },
            },
            "spec": {
                "serviceAccountName": self.service_account,
                "restartPolicy": "Never",
                "hostAliases": self.host_aliases_json(),
                "initContainers": [self.clone_container(&ctx.clone_url(), Some(&ctx.commit))],
                "containers": [{
                    "name": CONTAINER_MAIN,
                    "image": image,
                    "args": [command.as_arg()],
                    "workingDir": working_dir,
                    "env": env,
                    "volumeMounts": [mount(VOLUME_WORK, WORK_DIR)],
                }],
                "volumes": [empty_dir(VOLUME_WORK)],
            },
        });

        Ok(JobSpec {
            pod: serde_json::from_value::<Pod>(pod)?,
            main_container: CONTAINER_MAIN.to_string(),
        })
    }

    fn clone_container(&self, url: &str, commit: Option<&str>) -> Value {
        let mut args = vec![
            "--action=clone".to_string(),
            format!("--work-dir={}", WORK_DIR),
            format!("--url={}", url),
        ];
        if let Some(commit) = commit.filter(|c| !c.is_empty()) {
            args.push(format!("--commit={}", commit));
        }
        json!({
            "name": CONTAINER_CLONE,
            "image": self.sidecar_image,
            "args": args,
            "volumeMounts": [mount(VOLUME_WORK, WORK_DIR)],
        })
    }

    fn host_aliases_json(&self) -> Vec<Value> {
        self.host_aliases
            .iter()
            .map(|alias| json!({ "ip": alias.ip, "hostnames": alias.hostnames }))
            .collect()
    }
}

/// Replaces the tag (or digest) of an image reference
pub fn image_with_tag(image: &str, tag: &str) -> String {
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    let repository = match image[name_start..].find([':', '@']) {
        Some(i) => &image[..name_start + i],
        None => image,
    };
    format!("{}:{}", repository, tag)
}

fn mount(volume: &str, path: &str) -> Value {
    json!({ "name": volume, "mountPath": path })
}

fn empty_dir(volume: &str) -> Value {
    json!({ "name": volume, "emptyDir": {} })
}

fn field_env(name: &str, field_path: &str) -> Value {
    json!({ "name": name, "valueFrom": { "fieldRef": { "fieldPath": field_path } } })
}

fn secret_env(name: &str, secret: &str, key: &str) -> Value {
    json!({ "name": name, "valueFrom": { "secretKeyRef": { "name": secret, "key": key } } })
}
