//! `wait` action
//!
//! Runs next to the main container of a build Pod. Once the main container
//! completes it ships the artifact, then deletes its own Pod if a helper
//! container (a docker daemon, say) would otherwise keep it running forever.

use anyhow::{Context, Result, bail};
use k8s_openapi::api::core::v1::Pod;
use rudder_client::archive::wrap_file;
use rudder_client::pods::{container_statuses, is_running, resource_version, terminated_reason};
use rudder_client::{ObjectStore, PodApi, PodEvent};
use std::path::Path;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::config::SidecarEnv;

pub const MAIN_CONTAINER: &str = "main";

/// Name of the container running this action
pub const WAIT_CONTAINER: &str = "post-process";

/// Reason Kubernetes reports for a container that exited 0
const REASON_COMPLETED: &str = "Completed";

/// What the wait action did after the main container completed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WaitReport {
    /// Object key the artifact was uploaded under
    pub uploaded: Option<String>,
    /// Containers still running when the main one finished
    pub stragglers: Vec<String>,
}

pub struct Waiter {
    pods: Arc<dyn PodApi>,
    store: Option<Arc<dyn ObjectStore>>,
    env: SidecarEnv,
    self_image: Option<String>,
}

impl Waiter {
    pub fn new(pods: Arc<dyn PodApi>, env: SidecarEnv) -> Self {
        Self {
            pods,
            store: None,
            env,
            self_image: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Image of the sidecar itself; containers running it are never stragglers
    pub fn with_self_image(mut self, image: impl Into<String>) -> Self {
        self.self_image = Some(image.into()).filter(|i: &String| !i.is_empty());
        self
    }

    pub async fn run(&self, artifact_path: Option<&Path>) -> Result<WaitReport> {
        self.wait_for_main().await?;
        info!("Main container of {} completed", self.env.pod_name);

        let uploaded = match artifact_path {
            Some(path) => self.ship(path).await?,
            None => None,
        };

        let pod = self
            .pods
            .get(&self.env.pod_name)
            .await
            .with_context(|| format!("Failed to read pod {}", self.env.pod_name))?;
        let stragglers = stragglers(&pod, self.self_image.as_deref());
        if !stragglers.is_empty() {
            info!(
                "Force shutdown of {}: {} still running",
                self.env.pod_name,
                stragglers.join(", ")
            );
            self.pods
                .delete(&self.env.pod_name)
                .await
                .with_context(|| format!("Failed to delete pod {}", self.env.pod_name))?;
        }

        Ok(WaitReport { uploaded, stragglers })
    }

    /// Follows the own Pod until the main container terminates
    async fn wait_for_main(&self) -> Result<()> {
        let name = &self.env.pod_name;
        let mut version = "0".to_string();

        loop {
            let mut events = self
                .pods
                .watch(name, &version)
                .await
                .with_context(|| format!("Failed to watch pod {}", name))?;

            while let Some(event) = events.next().await {
                match event {
                    PodEvent::Applied(pod) => {
                        if let Some(v) = resource_version(&pod) {
                            version = v.to_string();
                        }
                        match main_terminated(&pod) {
                            Some(REASON_COMPLETED) => return Ok(()),
                            Some(reason) => {
                                bail!("main container terminated by unexpected reason: {:?}", reason)
                            }
                            None => {}
                        }
                    }
                    PodEvent::Deleted(_) => bail!("pod {} was deleted while waiting", name),
                    PodEvent::Error(reason) => bail!("watch on pod {} failed: {}", name, reason),
                }
            }

            debug!("Watch on pod {} ended, resuming from version {}", name, version);
        }
    }

    async fn ship(&self, path: &Path) -> Result<Option<String>> {
        let Some(archive) = wrap_file(path)
            .with_context(|| format!("Failed to read artifact {}", path.display()))?
        else {
            warn!("Artifact {} is a directory; nothing shipped", path.display());
            return Ok(None);
        };
        let Some(store) = &self.store else {
            bail!("no artifact store configured for {}", path.display());
        };

        let key = self.env.artifact_key().archive();
        store
            .put(&key, archive)
            .await
            .with_context(|| format!("Failed to upload {}", key))?;
        info!("Uploaded {} as {}", path.display(), key);
        Ok(Some(key))
    }
}

fn main_terminated(pod: &Pod) -> Option<&str> {
    container_statuses(pod)
        .iter()
        .find(|status| status.name == MAIN_CONTAINER)
        .and_then(terminated_reason)
}

/// Running containers other than `main`, this one, and any running the
/// sidecar image
fn stragglers(pod: &Pod, self_image: Option<&str>) -> Vec<String> {
    let own = self_image.map(image_repository);
    container_statuses(pod)
        .iter()
        .filter(|status| status.name != MAIN_CONTAINER && status.name != WAIT_CONTAINER)
        .filter(|status| own != Some(image_repository(&status.image)))
        .filter(|status| is_running(status))
        .map(|status| status.name.clone())
        .collect()
}

/// Image reference without its tag or digest
fn image_repository(image: &str) -> &str {
    let image = image.split('@').next().unwrap_or(image);
    match image.rfind(':') {
        Some(colon) if !image[colon..].contains('/') => &image[..colon],
        _ => image,
    }
}
