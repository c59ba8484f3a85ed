//! Kubernetes Pod API
//!
//! The orchestrator and the sidecar only ever need a handful of Pod
//! operations inside one namespace. [`PodApi`] is that surface; [`KubePodApi`]
//! implements it with `kube`.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::api::{DeleteParams, ListParams, LogParams, PostParams, WatchEvent, WatchParams};
use kube::{Api, Client};
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

/// Server-side lifetime of one watch request, in seconds
const WATCH_TIMEOUT_SECS: u32 = 290;

#[derive(Debug, thiserror::Error)]
pub enum PodApiError {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("kubernetes api unavailable: {0}")]
    Unavailable(String),
}

/// One observation of a watched Pod
#[derive(Debug, Clone)]
pub enum PodEvent {
    /// Pod was added or modified; carries its latest state
    Applied(Pod),
    /// Pod was deleted
    Deleted(Pod),
    /// The API server or transport reported an error on the stream
    Error(String),
}

/// Stream of events for one Pod. Ends when the server closes the watch.
pub type PodEventStream = Pin<Box<dyn Stream<Item = PodEvent> + Send>>;

/// Namespaced Pod operations
#[async_trait]
pub trait PodApi: Send + Sync {
    async fn create(&self, pod: &Pod) -> Result<(), PodApiError>;

    async fn get(&self, name: &str) -> Result<Pod, PodApiError>;

    /// Watches a single Pod by name, starting after `resource_version`
    /// (`"0"` replays the current state first)
    async fn watch(&self, name: &str, resource_version: &str) -> Result<PodEventStream, PodApiError>;

    /// Names of the Pods matching a label selector
    async fn list_names(&self, label_selector: &str) -> Result<Vec<String>, PodApiError>;

    /// Deletes a Pod; deleting a Pod that is already gone succeeds
    async fn delete(&self, name: &str) -> Result<(), PodApiError>;

    async fn logs(&self, name: &str, container: &str) -> Result<String, PodApiError>;
}

/// [`PodApi`] backed by the cluster API server
#[derive(Clone)]
pub struct KubePodApi {
    api: Api<Pod>,
    namespace: String,
}

impl KubePodApi {
    /// Connects using in-cluster configuration, falling back to kubeconfig
    pub async fn connect(namespace: &str) -> Result<Self, PodApiError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, namespace))
    }

    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[async_trait]
impl PodApi for KubePodApi {
    async fn create(&self, pod: &Pod) -> Result<(), PodApiError> {
        self.api.create(&PostParams::default(), pod).await?;
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Pod, PodApiError> {
        Ok(self.api.get(name).await?)
    }

    async fn watch(&self, name: &str, resource_version: &str) -> Result<PodEventStream, PodApiError> {
        let api = self.api.clone();
        let params = WatchParams::default()
            .fields(&format!("metadata.name={}", name))
            .timeout(WATCH_TIMEOUT_SECS);
        let version = resource_version.to_string();
        let (tx, rx) = mpsc::channel(16);
        let (opened_tx, opened_rx) = oneshot::channel();

        // The watch lives in its own task; dropping the returned stream closes
        // the channel, which ends the task and with it the HTTP connection.
        tokio::spawn(async move {
            let stream = match api.watch(&params, &version).await {
                Ok(stream) => {
                    let _ = opened_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = opened_tx.send(Err(e));
                    return;
                }
            };
            let mut stream = std::pin::pin!(stream);

            while let Some(item) = stream.next().await {
                let event = match item {
                    Ok(WatchEvent::Added(pod)) | Ok(WatchEvent::Modified(pod)) => {
                        PodEvent::Applied(pod)
                    }
                    Ok(WatchEvent::Deleted(pod)) => PodEvent::Deleted(pod),
                    Ok(WatchEvent::Bookmark(_)) => continue,
                    Ok(WatchEvent::Error(e)) => PodEvent::Error(e.to_string()),
                    Err(e) => PodEvent::Error(e.to_string()),
                };
                if tx.send(event).await.is_err() {
                    debug!("Watch receiver dropped, closing watch");
                    break;
                }
            }
        });

        match opened_rx.await {
            Ok(Ok(())) => Ok(Box::pin(ReceiverStream::new(rx))),
            Ok(Err(e)) => Err(PodApiError::Kube(e)),
            Err(_) => Err(PodApiError::Unavailable("watch task ended before opening".to_string())),
        }
    }

    async fn list_names(&self, label_selector: &str) -> Result<Vec<String>, PodApiError> {
        let pods = self
            .api
            .list(&ListParams::default().labels(label_selector))
            .await?;
        Ok(pods
            .items
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<(), PodApiError> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                warn!("Pod {} already deleted", name);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn logs(&self, name: &str, container: &str) -> Result<String, PodApiError> {
        let params = LogParams {
            container: Some(container.to_string()),
            ..LogParams::default()
        };
        Ok(self.api.logs(name, &params).await?)
    }
}

/// `status.phase` of a Pod
pub fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

/// `status.containerStatuses` of a Pod, empty when not reported yet
pub fn container_statuses(pod: &Pod) -> &[ContainerStatus] {
    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_deref())
        .unwrap_or_default()
}

/// `metadata.resourceVersion`, used to resume a watch
pub fn resource_version(pod: &Pod) -> Option<&str> {
    pod.metadata.resource_version.as_deref()
}

/// Terminated reason of a container, if it has terminated
pub fn terminated_reason(status: &ContainerStatus) -> Option<&str> {
    let terminated = status.state.as_ref()?.terminated.as_ref()?;
    Some(terminated.reason.as_deref().unwrap_or(""))
}

/// Whether a container is currently running
pub fn is_running(status: &ContainerStatus) -> bool {
    status
        .state
        .as_ref()
        .is_some_and(|state| state.running.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateTerminated, PodStatus,
    };

    fn status(name: &str, state: ContainerState) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            image: "img".to_string(),
            state: Some(state),
            ..ContainerStatus::default()
        }
    }

    #[test]
    fn test_status_helpers() {
        let mut pod = Pod::default();
        assert_eq!(pod_phase(&pod), None);
        assert!(container_statuses(&pod).is_empty());

        pod.status = Some(PodStatus {
            phase: Some("Running".to_string()),
            container_statuses: Some(vec![
                status(
                    "main",
                    ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            reason: Some("Completed".to_string()),
                            ..ContainerStateTerminated::default()
                        }),
                        ..ContainerState::default()
                    },
                ),
                status(
                    "dind",
                    ContainerState {
                        running: Some(ContainerStateRunning::default()),
                        ..ContainerState::default()
                    },
                ),
            ]),
            ..PodStatus::default()
        });

        assert_eq!(pod_phase(&pod), Some("Running"));
        let statuses = container_statuses(&pod);
        assert_eq!(terminated_reason(&statuses[0]), Some("Completed"));
        assert!(!is_running(&statuses[0]));
        assert_eq!(terminated_reason(&statuses[1]), None);
        assert!(is_running(&statuses[1]));
    }
}
