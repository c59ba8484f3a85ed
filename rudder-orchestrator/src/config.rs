//! Orchestrator configuration
//!
//! Loaded once at startup from a YAML file. A few values fall back to the
//! process environment (`POD_NAMESPACE`, `GITHUB_TOKEN`) so the orchestrator
//! can run with an almost empty file inside the cluster.

use anyhow::Context;
use rudder_client::StorageConfig;
use rudder_client::object_store::DEFAULT_REGION;
use rudder_client::github::GITHUB_API_URL;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Orchestrator configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the webhook listener binds to
    pub webhook_listener: String,

    /// Namespace job Pods are created in
    pub build_namespace: String,

    pub github_api_url: String,

    /// File holding the GitHub token (falls back to `GITHUB_TOKEN`)
    pub github_token_file: Option<PathBuf>,

    /// User name sent with the token for git transport
    pub git_username: String,

    /// Artifact store endpoint (`host:port` or URL)
    pub storage_host: String,
    pub storage_region: String,
    pub artifact_bucket: String,

    /// Secret with `accesskey`/`secretkey` for the artifact store
    pub storage_token_secret_name: String,

    pub sidecar_image: String,

    /// Build tool image; a rule's `bazel_version` replaces its tag
    pub build_image: String,

    pub service_account: String,

    /// Secret holding `.dockerconfigjson` for the build container
    pub docker_config_secret: Option<String>,

    pub host_aliases: Vec<HostAlias>,

    pub commit_author: String,
    pub commit_email: String,

    /// Upper bound on one job's wait for its Pod
    pub job_timeout_secs: u64,

    /// Concurrent jobs per subscription
    pub max_parallel_jobs: usize,

    /// Jobs per subscription allowed to wait for a free slot; later events are dropped
    pub max_queued_jobs: usize,

    pub diff_run: DiffRunConfig,

    #[serde(skip)]
    pub github_token: String,
}

/// Static host entry injected into every job Pod
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostAlias {
    pub hostnames: Vec<String>,
    pub ip: String,
}

/// Diff-triggered jobs for configuration-as-code repositories
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiffRunConfig {
    pub enabled: bool,
    /// Rule file path inside the triggering repository
    pub rule_file: String,
    /// Image used when the rule file names none
    pub default_image: String,
}

impl Default for DiffRunConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rule_file: ".bot/dnscontrol.yaml".to_string(),
            default_image: "registry.f110.dev/dnscontrol/dnscontrol".to_string(),
        }
    }
}

impl Config {
    /// Reads, completes and validates the configuration file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_yaml(&contents)?;
        config.apply_env(|key| std::env::var(key).ok());
        config.read_token_file()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).context("Failed to parse config file")
    }

    /// Fills unset values from environment lookups
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.build_namespace.is_empty() {
            self.build_namespace = lookup("POD_NAMESPACE").unwrap_or_default();
        }
        if self.github_token.is_empty() {
            self.github_token = lookup("GITHUB_TOKEN").unwrap_or_default().trim().to_string();
        }
    }

    fn read_token_file(&mut self) -> anyhow::Result<()> {
        if let Some(path) = &self.github_token_file {
            let token = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read token file {}", path.display()))?;
            self.github_token = token.trim().to_string();
        }
        Ok(())
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.build_namespace.is_empty() {
            anyhow::bail!("build_namespace is mandatory (or set POD_NAMESPACE)");
        }

        if self.webhook_listener.is_empty() {
            anyhow::bail!("webhook_listener cannot be empty");
        }

        if !self.github_api_url.starts_with("http://")
            && !self.github_api_url.starts_with("https://")
        {
            anyhow::bail!("github_api_url must start with http:// or https://");
        }

        if self.storage_host.is_empty() || self.artifact_bucket.is_empty() {
            anyhow::bail!("storage_host and artifact_bucket cannot be empty");
        }

        if self.sidecar_image.is_empty() || self.build_image.is_empty() {
            anyhow::bail!("sidecar_image and build_image cannot be empty");
        }

        if self.job_timeout_secs == 0 {
            anyhow::bail!("job_timeout_secs must be greater than 0");
        }

        if self.max_parallel_jobs == 0 {
            anyhow::bail!("max_parallel_jobs must be greater than 0");
        }

        if self.diff_run.enabled && self.diff_run.rule_file.is_empty() {
            anyhow::bail!("diff_run.rule_file cannot be empty");
        }

        Ok(())
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn storage(&self) -> StorageConfig {
        StorageConfig {
            host: self.storage_host.clone(),
            bucket: self.artifact_bucket.clone(),
            region: self.storage_region.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            webhook_listener: "0.0.0.0:8080".to_string(),
            build_namespace: String::new(),
            github_api_url: GITHUB_API_URL.to_string(),
            github_token_file: None,
            git_username: "x-access-token".to_string(),
            storage_host: "storage-hl-svc.default.svc.cluster.local:9000".to_string(),
            storage_region: DEFAULT_REGION.to_string(),
            artifact_bucket: "build-artifacts".to_string(),
            storage_token_secret_name: "storage-token".to_string(),
            sidecar_image: "ghcr.io/rudder-ci/rudder-sidecar:latest".to_string(),
            build_image: "l.gcr.io/google/bazel:2.0.0".to_string(),
            service_account: "build".to_string(),
            docker_config_secret: Some("docker-config".to_string()),
            host_aliases: Vec::new(),
            commit_author: "rudder-bot".to_string(),
            commit_email: "rudder-bot@users.noreply.github.com".to_string(),
            job_timeout_secs: 3600,
            max_parallel_jobs: 2,
            max_queued_jobs: 32,
            diff_run: DiffRunConfig::default(),
            github_token: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            build_namespace: "build".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn test_default_config() {
        let config = valid();
        assert_eq!(config.job_timeout(), Duration::from_secs(3600));
        assert_eq!(config.max_parallel_jobs, 2);
        assert_eq!(config.max_queued_jobs, 32);
        assert!(config.validate().is_ok());

        // Namespace has no default
        assert!(Config::default().validate().is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = valid();

        config.github_api_url = "api.github.com".to_string();
        assert!(config.validate().is_err());
        config.github_api_url = GITHUB_API_URL.to_string();

        config.job_timeout_secs = 0;
        assert!(config.validate().is_err());
        config.job_timeout_secs = 60;

        config.max_parallel_jobs = 0;
        assert!(config.validate().is_err());
        config.max_parallel_jobs = 1;

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let config = Config::from_yaml(
            r#"
webhook_listener: ":9000"
build_namespace: ci
artifact_bucket: artifacts
docker_config_secret: null
host_aliases:
  - hostnames: [registry.example.com]
    ip: 10.0.0.5
diff_run:
  enabled: true
"#,
        )
        .unwrap();

        assert_eq!(config.webhook_listener, ":9000");
        assert_eq!(config.build_namespace, "ci");
        assert_eq!(config.artifact_bucket, "artifacts");
        assert_eq!(config.docker_config_secret, None);
        assert_eq!(config.host_aliases[0].ip, "10.0.0.5");
        assert!(config.diff_run.enabled);
        assert_eq!(config.diff_run.rule_file, ".bot/dnscontrol.yaml");
        assert_eq!(config.storage().bucket, "artifacts");
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::from_yaml("").unwrap();
        assert_eq!(config.artifact_bucket, "build-artifacts");
    }

    #[test]
    fn test_apply_env() {
        let mut config = Config::default();
        config.apply_env(|key| match key {
            "POD_NAMESPACE" => Some("from-env".to_string()),
            "GITHUB_TOKEN" => Some("tok\n".to_string()),
            _ => None,
        });
        assert_eq!(config.build_namespace, "from-env");
        assert_eq!(config.github_token, "tok");

        // Explicit values win
        let mut config = valid();
        config.apply_env(|_| Some("other".to_string()));
        assert_eq!(config.build_namespace, "build");
    }

    #[test]
    fn test_load_reads_token_file() {
        let dir = tempfile::tempdir().unwrap();
        let token = dir.path().join("token");
        std::fs::write(&token, "ghs_abc\n").unwrap();
        let conf = dir.path().join("config.yaml");
        std::fs::write(
            &conf,
            format!(
                "build_namespace: ci\ngithub_token_file: {}\n",
                token.display()
            ),
        )
        .unwrap();

        let config = Config::load(&conf).unwrap();
        assert_eq!(config.github_token, "ghs_abc");
    }
}
