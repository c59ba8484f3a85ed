//! Sidecar configuration
//!
//! The sidecar learns who it is from the environment the job Pod sets up.
//! Every variable an action needs is checked before the action starts, so a
//! misconfigured Pod fails with one clear message instead of halfway through.

use anyhow::bail;
use clap::ValueEnum;
use rudder_core::domain::job::ArtifactKey;

pub const ENV_POD_NAME: &str = "POD_NAME";
pub const ENV_POD_NAMESPACE: &str = "POD_NAMESPACE";
pub const ENV_JOB_NAME: &str = "JOB_NAME";
pub const ENV_JOB_ID: &str = "JOB_ID";

/// What the sidecar was started to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Action {
    /// Fetch the source tree into the work volume
    Clone,
    /// Wait for the main container, ship its artifact, reap stragglers
    Wait,
    /// Fetch a stored artifact into a directory
    DownloadArtifacts,
}

/// Pod and job identity taken from the environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SidecarEnv {
    pub pod_name: String,
    pub pod_namespace: String,
    pub job_name: String,
    pub job_id: String,
}

impl SidecarEnv {
    pub fn from_env(action: Action, ships_artifact: bool) -> anyhow::Result<Self> {
        Self::from_lookup(action, ships_artifact, |key| std::env::var(key).ok())
    }

    /// Reads the variables `action` depends on, failing on the first gap.
    ///
    /// `wait` always needs the Pod identity and needs the job identity only
    /// when it ships an artifact; `download-artifacts` needs the job identity.
    pub fn from_lookup(
        action: Action,
        ships_artifact: bool,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let mut required = Vec::new();
        match action {
            Action::Clone => {}
            Action::Wait => {
                required.extend([ENV_POD_NAME, ENV_POD_NAMESPACE]);
                if ships_artifact {
                    required.extend([ENV_JOB_NAME, ENV_JOB_ID]);
                }
            }
            Action::DownloadArtifacts => required.extend([ENV_JOB_NAME, ENV_JOB_ID]),
        }

        let value = |key: &str| lookup(key).map(|v| v.trim().to_string()).unwrap_or_default();
        let env = Self {
            pod_name: value(ENV_POD_NAME),
            pod_namespace: value(ENV_POD_NAMESPACE),
            job_name: value(ENV_JOB_NAME),
            job_id: value(ENV_JOB_ID),
        };

        let missing: Vec<&str> = required
            .into_iter()
            .filter(|key| env.get(key).is_empty())
            .collect();
        if !missing.is_empty() {
            bail!("missing environment variable(s): {}", missing.join(", "));
        }
        Ok(env)
    }

    fn get(&self, key: &str) -> &str {
        match key {
            ENV_POD_NAME => &self.pod_name,
            ENV_POD_NAMESPACE => &self.pod_namespace,
            ENV_JOB_NAME => &self.job_name,
            ENV_JOB_ID => &self.job_id,
            _ => "",
        }
    }

    pub fn artifact_key(&self) -> ArtifactKey {
        ArtifactKey::new(self.job_name.as_str(), self.job_id.as_str())
    }
}
