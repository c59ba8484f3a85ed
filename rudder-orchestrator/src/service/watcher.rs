//! Job Watcher
//!
//! Creates a job Pod and follows it through the watch API until it reaches a
//! terminal phase. Deleting the Pod afterwards is the caller's business, so
//! logs can still be read once the watch reports completion.

use k8s_openapi::api::core::v1::Pod;
use rudder_client::pods::{container_statuses, pod_phase, resource_version, terminated_reason};
use rudder_client::{PodApi, PodApiError, PodEvent};
use rudder_core::domain::job::JobId;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// Watch version that replays the current state first
const INITIAL_VERSION: &str = "0";

/// A Pod to run plus the container whose exit decides the outcome
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub pod: Pod,
    pub main_container: String,
}

impl JobSpec {
    pub fn name(&self) -> Option<&str> {
        self.pod.metadata.name.as_deref()
    }
}

/// How a job that ran to the end finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    /// The job ran and reported failure
    Failed,
}

/// Infrastructure errors: the job's fate is unknown
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("pod spec has no name")]
    Unnamed,

    #[error("failed to create pod {pod}: {source}")]
    Create {
        pod: String,
        #[source]
        source: PodApiError,
    },

    #[error("failed to watch pod {pod}: {source}")]
    Watch {
        pod: String,
        #[source]
        source: PodApiError,
    },

    #[error("lost track of pod {pod}: {reason}")]
    WatchLost { pod: String, reason: String },

    #[error("pod {pod} did not finish within {timeout:?}")]
    TimedOut { pod: String, timeout: Duration },
}

/// Runs job Pods to completion
pub struct JobWatcher {
    pods: Arc<dyn PodApi>,
    timeout: Duration,
}

impl JobWatcher {
    pub fn new(pods: Arc<dyn PodApi>, timeout: Duration) -> Self {
        Self { pods, timeout }
    }

    pub fn pods(&self) -> &Arc<dyn PodApi> {
        &self.pods
    }

    /// Creates the Pod and waits for it to reach `Succeeded` or `Failed`
    pub async fn run_and_wait(&self, spec: &JobSpec) -> Result<JobOutcome, JobError> {
        let name = spec.name().ok_or(JobError::Unnamed)?.to_string();

        self.pods
            .create(&spec.pod)
            .await
            .map_err(|source| JobError::Create {
                pod: name.clone(),
                source,
            })?;
        info!("Created pod {}", name);

        match tokio::time::timeout(self.timeout, self.wait(&name, &spec.main_container)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(JobError::TimedOut {
                pod: name,
                timeout: self.timeout,
            }),
        }
    }

    async fn wait(&self, name: &str, main_container: &str) -> Result<JobOutcome, JobError> {
        let mut version = INITIAL_VERSION.to_string();

        loop {
            let mut events = self
                .pods
                .watch(name, &version)
                .await
                .map_err(|source| JobError::Watch {
                    pod: name.to_string(),
                    source,
                })?;

            while let Some(event) = events.next().await {
                match event {
                    PodEvent::Applied(pod) => {
                        if let Some(v) = resource_version(&pod) {
                            version = v.to_string();
                        }
                        if let Some(outcome) = terminal_phase(&pod) {
                            info!("Pod {} finished: {:?}", name, outcome);
                            return Ok(outcome);
                        }
                    }
                    PodEvent::Deleted(pod) => {
                        return deleted_outcome(&pod, main_container).ok_or_else(|| {
                            JobError::WatchLost {
                                pod: name.to_string(),
                                reason: "pod was deleted before it finished".to_string(),
                            }
                        });
                    }
                    PodEvent::Error(reason) => {
                        warn!("Watch on pod {} failed: {}", name, reason);
                        return Err(JobError::WatchLost {
                            pod: name.to_string(),
                            reason,
                        });
                    }
                }
            }

            // The server ends every watch after a while; resume where it stopped.
            debug!("Watch on pod {} ended, resuming from version {}", name, version);
        }
    }

    /// Deletes every Pod labelled with the job id. Errors are logged only.
    pub async fn cleanup(&self, job_id: &JobId) {
        let names = match self.pods.list_names(&job_id.label_selector()).await {
            Ok(names) => names,
            Err(e) => {
                warn!("Failed to list pods of job {}: {}", job_id, e);
                return;
            }
        };

        for name in names {
            match self.pods.delete(&name).await {
                Ok(()) => debug!("Deleted pod {}", name),
                Err(e) => warn!("Failed to delete pod {} of job {}: {}", name, job_id, e),
            }
        }
    }
}

fn terminal_phase(pod: &Pod) -> Option<JobOutcome> {
    match pod_phase(pod)? {
        "Succeeded" => Some(JobOutcome::Succeeded),
        "Failed" => Some(JobOutcome::Failed),
        _ => None,
    }
}

/// Outcome of a Pod deleted under the watch, decided by its main container.
///
/// The sidecar deletes its own Pod when helper containers outlive the main
/// one, so a deletion after the main container ended is a normal finish.
fn deleted_outcome(pod: &Pod, main_container: &str) -> Option<JobOutcome> {
    if let Some(outcome) = terminal_phase(pod) {
        return Some(outcome);
    }
    let status = container_statuses(pod)
        .iter()
        .find(|status| status.name == main_container)?;
    match terminated_reason(status)? {
        "Completed" => Some(JobOutcome::Succeeded),
        _ => Some(JobOutcome::Failed),
    }
}
