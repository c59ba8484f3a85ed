//! In-memory stand-ins for the cluster, GitHub and git, shared by the
//! service tests.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStatus, Pod, PodStatus,
};
use rudder_client::git::GitError;
use rudder_client::{
    ClientError, NewPullRequest, PodApi, PodApiError, PodEvent, PodEventStream, SourceControl,
};
use rudder_core::domain::event::{
    CommitRef, HeadCommit, PullRequest, PullRequestEvent, PushEvent, Repository,
};
use rudder_core::domain::job::{JobId, LABEL_JOB_ID, SequenceJobIds};
use rudder_core::domain::rule::RepositorySlug;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use crate::service::promoter::{GitProvider, GitWorkspace, PromoteError};
use crate::service::{JobRuntime, JobWatcher, PodTemplate};

pub const BEFORE_SHA: &str = "1111111111111111111111111111111111111111";
pub const AFTER_SHA: &str = "2222222222222222222222222222222222222222";

// =============================================================================
// Pods
// =============================================================================

enum WatchScript {
    Events(Vec<PodEvent>),
    Pending,
}

#[derive(Default)]
struct PodState {
    created: Vec<Pod>,
    /// (pod name, job id) of Pods that exist without having been created here
    labelled: Vec<(String, String)>,
    deleted: Vec<String>,
    watches: VecDeque<WatchScript>,
    watch_versions: Vec<String>,
    logs: HashMap<String, String>,
    fail_create: bool,
}

/// Scripted [`PodApi`]: every `watch` call consumes the next queued batch
#[derive(Default)]
pub struct FakePods {
    state: Mutex<PodState>,
}

impl FakePods {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_watch(&self, events: Vec<PodEvent>) {
        self.state.lock().unwrap().watches.push_back(WatchScript::Events(events));
    }

    /// Queues a watch that never yields
    pub fn push_pending_watch(&self) {
        self.state.lock().unwrap().watches.push_back(WatchScript::Pending);
    }

    pub fn fail_create(&self) {
        self.state.lock().unwrap().fail_create = true;
    }

    pub fn insert_labelled(&self, name: &str, job_id: &JobId) {
        self.state
            .lock()
            .unwrap()
            .labelled
            .push((name.to_string(), job_id.as_str().to_string()));
    }

    pub fn set_logs(&self, pod: &str, text: &str) {
        self.state
            .lock()
            .unwrap()
            .logs
            .insert(pod.to_string(), text.to_string());
    }

    pub fn created(&self) -> Vec<Pod> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn created_names(&self) -> Vec<String> {
        self.created()
            .iter()
            .filter_map(|pod| pod.metadata.name.clone())
            .collect()
    }

    pub fn watch_versions(&self) -> Vec<String> {
        self.state.lock().unwrap().watch_versions.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }
}

fn job_label(pod: &Pod) -> Option<&str> {
    pod.metadata.labels.as_ref()?.get(LABEL_JOB_ID).map(String::as_str)
}

#[async_trait]
impl PodApi for FakePods {
    async fn create(&self, pod: &Pod) -> Result<(), PodApiError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_create {
            return Err(PodApiError::Unavailable("create refused".to_string()));
        }
        state.created.push(pod.clone());
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Pod, PodApiError> {
        self.state
            .lock()
            .unwrap()
            .created
            .iter()
            .find(|pod| pod.metadata.name.as_deref() == Some(name))
            .cloned()
            .ok_or_else(|| PodApiError::Unavailable(format!("pod {} not found", name)))
    }

    async fn watch(&self, _name: &str, resource_version: &str) -> Result<PodEventStream, PodApiError> {
        let mut state = self.state.lock().unwrap();
        state.watch_versions.push(resource_version.to_string());
        match state.watches.pop_front() {
            Some(WatchScript::Events(events)) => Ok(Box::pin(tokio_stream::iter(events))),
            Some(WatchScript::Pending) => Ok(Box::pin(tokio_stream::pending::<PodEvent>())),
            None => Err(PodApiError::Unavailable("no watch scripted".to_string())),
        }
    }

    async fn list_names(&self, label_selector: &str) -> Result<Vec<String>, PodApiError> {
        let wanted = label_selector
            .strip_prefix(&format!("{}=", LABEL_JOB_ID))
            .unwrap_or_default();
        let state = self.state.lock().unwrap();

        let created = state
            .created
            .iter()
            .filter(|pod| job_label(pod) == Some(wanted))
            .filter_map(|pod| pod.metadata.name.clone());
        let labelled = state
            .labelled
            .iter()
            .filter(|(_, id)| id == wanted)
            .map(|(name, _)| name.clone());

        Ok(created
            .chain(labelled)
            .filter(|name| !state.deleted.contains(name))
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<(), PodApiError> {
        self.state.lock().unwrap().deleted.push(name.to_string());
        Ok(())
    }

    async fn logs(&self, name: &str, _container: &str) -> Result<String, PodApiError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .logs
            .get(name)
            .cloned()
            .unwrap_or_default())
    }
}

/// Pod reporting `phase` at `resource_version`
pub fn pod_in_phase(phase: &str, resource_version: &str) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.resource_version = Some(resource_version.to_string());
    pod.status = Some(PodStatus {
        phase: Some(phase.to_string()),
        ..PodStatus::default()
    });
    pod
}

/// Pod without a phase whose `main` container terminated with `reason`
pub fn pod_with_main(reason: &str) -> Pod {
    let mut pod = Pod::default();
    pod.status = Some(PodStatus {
        container_statuses: Some(vec![ContainerStatus {
            name: "main".to_string(),
            image: "build".to_string(),
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    reason: Some(reason.to_string()),
                    ..ContainerStateTerminated::default()
                }),
                ..ContainerState::default()
            }),
            ..ContainerStatus::default()
        }]),
        ..PodStatus::default()
    });
    pod
}

/// Job runtime over `pods` with sequential ids (`job00000`, ...)
pub fn runtime(pods: Arc<FakePods>) -> JobRuntime {
    let template = PodTemplate {
        namespace: "builds".to_string(),
        service_account: "build".to_string(),
        sidecar_image: "sidecar:test".to_string(),
        build_image: "bazel:2.0.0".to_string(),
        diff_run_image: "dnscontrol:test".to_string(),
        storage_host: "minio:9000".to_string(),
        artifact_bucket: "artifacts".to_string(),
        storage_token_secret: "storage-token".to_string(),
        docker_config_secret: None,
        host_aliases: Vec::new(),
    };
    JobRuntime {
        template: Arc::new(template),
        watcher: Arc::new(JobWatcher::new(pods, Duration::from_secs(5))),
        ids: Arc::new(SequenceJobIds::new("job")),
    }
}

// =============================================================================
// Source control
// =============================================================================

#[derive(Default)]
struct ScmState {
    files: HashMap<(String, String), String>,
    compare_diff: String,
    pull_request_diff: String,
    pull_requests: Vec<(RepositorySlug, NewPullRequest)>,
    comments: Vec<(RepositorySlug, u64, String)>,
}

/// Recording [`SourceControl`]; unknown files are `NotFound`
#[derive(Default)]
pub struct FakeSourceControl {
    state: Mutex<ScmState>,
}

impl FakeSourceControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, commit: &str, path: &str, contents: &str) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert((commit.to_string(), path.to_string()), contents.to_string());
    }

    pub fn set_compare_diff(&self, diff: &str) {
        self.state.lock().unwrap().compare_diff = diff.to_string();
    }

    pub fn set_pull_request_diff(&self, diff: &str) {
        self.state.lock().unwrap().pull_request_diff = diff.to_string();
    }

    pub fn pull_requests(&self) -> Vec<(RepositorySlug, NewPullRequest)> {
        self.state.lock().unwrap().pull_requests.clone()
    }

    pub fn comments(&self) -> Vec<(RepositorySlug, u64, String)> {
        self.state.lock().unwrap().comments.clone()
    }
}

#[async_trait]
impl SourceControl for FakeSourceControl {
    async fn file_at_commit(
        &self,
        _repo: &RepositorySlug,
        commit: &str,
        path: &str,
    ) -> rudder_client::Result<String> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(&(commit.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| ClientError::NotFound(path.to_string()))
    }

    async fn compare_diff(
        &self,
        _repo: &RepositorySlug,
        _base: &str,
        _head: &str,
    ) -> rudder_client::Result<String> {
        Ok(self.state.lock().unwrap().compare_diff.clone())
    }

    async fn pull_request_diff(&self, _repo: &RepositorySlug, _number: u64) -> rudder_client::Result<String> {
        Ok(self.state.lock().unwrap().pull_request_diff.clone())
    }

    async fn create_pull_request(
        &self,
        repo: &RepositorySlug,
        pr: &NewPullRequest,
    ) -> rudder_client::Result<u64> {
        let mut state = self.state.lock().unwrap();
        state.pull_requests.push((repo.clone(), pr.clone()));
        Ok(state.pull_requests.len() as u64)
    }

    async fn create_comment(
        &self,
        repo: &RepositorySlug,
        number: u64,
        body: &str,
    ) -> rudder_client::Result<()> {
        self.state
            .lock()
            .unwrap()
            .comments
            .push((repo.clone(), number, body.to_string()));
        Ok(())
    }
}

// =============================================================================
// Git
// =============================================================================

#[derive(Default)]
struct GitState {
    seeded: BTreeMap<String, String>,
    commits: Vec<String>,
    committed: HashMap<String, String>,
    pushed: Vec<String>,
    dirs: Vec<PathBuf>,
}

/// [`GitProvider`] whose clones are temp dirs filled with seeded files
pub struct FakeGit {
    default_branch: String,
    state: Arc<Mutex<GitState>>,
}

impl FakeGit {
    pub fn new(default_branch: &str) -> Self {
        Self {
            default_branch: default_branch.to_string(),
            state: Arc::default(),
        }
    }

    pub fn seed(&self, path: &str, contents: &str) {
        self.state
            .lock()
            .unwrap()
            .seeded
            .insert(path.to_string(), contents.to_string());
    }

    /// Commit messages, oldest first
    pub fn commits(&self) -> Vec<String> {
        self.state.lock().unwrap().commits.clone()
    }

    pub fn pushed(&self) -> Vec<String> {
        self.state.lock().unwrap().pushed.clone()
    }

    /// Last committed contents of `path`
    pub fn file(&self, path: &str) -> String {
        self.state
            .lock()
            .unwrap()
            .committed
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clones(&self) -> usize {
        self.state.lock().unwrap().dirs.len()
    }

    /// Whether every clone directory has been removed
    pub fn is_cleaned_up(&self) -> bool {
        self.state.lock().unwrap().dirs.iter().all(|dir| !dir.exists())
    }
}

#[async_trait]
impl GitProvider for FakeGit {
    async fn clone_repo(&self, _repo: &RepositorySlug) -> Result<Box<dyn GitWorkspace>, PromoteError> {
        let dir = TempDir::new().map_err(PromoteError::Workspace)?;
        let mut state = self.state.lock().unwrap();
        for (path, contents) in &state.seeded {
            let file = dir.path().join(path);
            if let Some(parent) = file.parent() {
                std::fs::create_dir_all(parent).map_err(PromoteError::Workspace)?;
            }
            std::fs::write(&file, contents).map_err(PromoteError::Workspace)?;
        }
        state.dirs.push(dir.path().to_path_buf());

        Ok(Box::new(FakeWorkspace {
            base: state.seeded.clone(),
            dir,
            default_branch: self.default_branch.clone(),
            state: self.state.clone(),
        }))
    }
}

struct FakeWorkspace {
    /// Contents as of the last commit, per path
    base: BTreeMap<String, String>,
    dir: TempDir,
    default_branch: String,
    state: Arc<Mutex<GitState>>,
}

#[async_trait]
impl GitWorkspace for FakeWorkspace {
    fn root(&self) -> &Path {
        self.dir.path()
    }

    async fn default_branch(&mut self) -> Result<String, GitError> {
        Ok(self.default_branch.clone())
    }

    async fn create_branch(&mut self, _name: &str) -> Result<(), GitError> {
        Ok(())
    }

    async fn commit_file(&mut self, path: &str, message: &str) -> Result<bool, GitError> {
        let contents = std::fs::read_to_string(self.dir.path().join(path)).map_err(GitError::Spawn)?;
        if self.base.get(path) == Some(&contents) {
            return Ok(false);
        }
        self.base.insert(path.to_string(), contents.clone());

        let mut state = self.state.lock().unwrap();
        state.commits.push(message.to_string());
        state.committed.insert(path.to_string(), contents);
        Ok(true)
    }

    async fn push(&mut self, branch: &str) -> Result<(), GitError> {
        self.state.lock().unwrap().pushed.push(branch.to_string());
        Ok(())
    }
}

// =============================================================================
// Events
// =============================================================================

pub fn push_event(repo: &str, git_ref: &str, message: &str) -> PushEvent {
    PushEvent {
        git_ref: git_ref.to_string(),
        before: BEFORE_SHA.to_string(),
        after: AFTER_SHA.to_string(),
        deleted: false,
        repository: Repository {
            full_name: repo.to_string(),
        },
        head_commit: Some(HeadCommit {
            id: AFTER_SHA.to_string(),
            message: message.to_string(),
        }),
    }
}

pub fn pull_request_event(repo: &str, action: &str, number: u64) -> PullRequestEvent {
    PullRequestEvent {
        action: action.to_string(),
        number,
        pull_request: PullRequest {
            number,
            head: CommitRef {
                sha: "3333333333333333333333333333333333333333".to_string(),
                git_ref: "topic".to_string(),
            },
            base: CommitRef {
                sha: BEFORE_SHA.to_string(),
                git_ref: "main".to_string(),
            },
        },
        repository: Repository {
            full_name: repo.to_string(),
        },
    }
}
