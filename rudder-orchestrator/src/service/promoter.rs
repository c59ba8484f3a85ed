//! GitOps Promoter
//!
//! Writes a freshly built image digest into downstream manifests and
//! proposes the change as a pull request. One commit per changed manifest;
//! when nothing changes, nothing is pushed and no pull request is opened.

use async_trait::async_trait;
use rudder_client::git::{Git, GitError};
use rudder_client::{ClientError, NewPullRequest, SourceControl, TokenProvider};
use rudder_core::domain::rule::{PostProcess, RepositorySlug, RuleError};
use rudder_core::manifest::{ManifestError, parse_digest, patch_images};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tracing::{debug, info};

const BRANCH_PREFIX: &str = "update-kustomization-";

#[derive(Debug, thiserror::Error)]
pub enum PromoteError {
    #[error("content error: {0}")]
    Content(#[from] ManifestError),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to prepare workspace: {0}")]
    Workspace(#[source] io::Error),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    SourceControl(#[from] ClientError),

    #[error(transparent)]
    Rule(#[from] RuleError),
}

impl PromoteError {
    /// Whether the inputs were bad, as opposed to an unreachable collaborator
    pub fn is_content_error(&self) -> bool {
        matches!(self, PromoteError::Content(_) | PromoteError::Read { .. })
    }
}

/// Terminal state of a successful promotion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionOutcome {
    /// Every manifest already carried the digest, or none named the image
    NoChange,
    Proposed {
        branch: String,
        pull_request: u64,
        paths: Vec<String>,
    },
}

/// A local clone of the target repository.
///
/// Implementations remove their working directory when dropped.
#[async_trait]
pub trait GitWorkspace: Send {
    fn root(&self) -> &Path;

    /// Branch checked out by the clone
    async fn default_branch(&mut self) -> Result<String, GitError>;

    /// Creates and checks out `name` at the current tip
    async fn create_branch(&mut self, name: &str) -> Result<(), GitError>;

    /// Stages `path` and commits it alone; `false` when staging found no delta
    async fn commit_file(&mut self, path: &str, message: &str) -> Result<bool, GitError>;

    async fn push(&mut self, branch: &str) -> Result<(), GitError>;
}

#[async_trait]
pub trait GitProvider: Send + Sync {
    /// Shallow-clones `repo` into a fresh temporary directory
    async fn clone_repo(&self, repo: &RepositorySlug) -> Result<Box<dyn GitWorkspace>, PromoteError>;
}

/// [`GitProvider`] driving the `git` binary with token basic auth
pub struct CliGitProvider {
    tokens: Arc<dyn TokenProvider>,
    username: String,
    author: String,
    email: String,
}

impl CliGitProvider {
    pub fn new(
        tokens: Arc<dyn TokenProvider>,
        username: impl Into<String>,
        author: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            tokens,
            username: username.into(),
            author: author.into(),
            email: email.into(),
        }
    }
}

#[async_trait]
impl GitProvider for CliGitProvider {
    async fn clone_repo(&self, repo: &RepositorySlug) -> Result<Box<dyn GitWorkspace>, PromoteError> {
        let token = self.tokens.token().await?;
        let dir = TempDir::new().map_err(PromoteError::Workspace)?;

        info!("Cloning {} into {}", repo, dir.path().display());
        Git::new()
            .with_basic_auth(&self.username, &token)
            .clone_shallow(&repo.https_url(), dir.path(), None)
            .await?;

        let git = Git::in_dir(dir.path())
            .with_basic_auth(&self.username, &token)
            .with_config("user.name", self.author.as_str())
            .with_config("user.email", self.email.as_str());
        Ok(Box::new(CliWorkspace { dir, git }))
    }
}

struct CliWorkspace {
    dir: TempDir,
    git: Git,
}

#[async_trait]
impl GitWorkspace for CliWorkspace {
    fn root(&self) -> &Path {
        self.dir.path()
    }

    async fn default_branch(&mut self) -> Result<String, GitError> {
        self.git.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    async fn create_branch(&mut self, name: &str) -> Result<(), GitError> {
        self.git.run(&["checkout", "-b", name]).await?;
        Ok(())
    }

    async fn commit_file(&mut self, path: &str, message: &str) -> Result<bool, GitError> {
        self.git.run(&["add", "--", path]).await?;
        if self.git.check(&["diff", "--cached", "--quiet"]).await? {
            return Ok(false);
        }
        self.git.run(&["commit", "--quiet", "-m", message]).await?;
        Ok(true)
    }

    async fn push(&mut self, branch: &str) -> Result<(), GitError> {
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
        self.git.run(&["push", "origin", &refspec]).await?;
        Ok(())
    }
}

/// Per-target-repository mutual exclusion.
///
/// The guarded value is the last branch timestamp handed out for that
/// repository, so branch names stay unique even within one second.
#[derive(Default)]
pub struct RepoLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<i64>>>>,
}

impl RepoLocks {
    fn lock_for(&self, repo: &RepositorySlug) -> Arc<tokio::sync::Mutex<i64>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(repo.full_name()).or_default().clone()
    }
}

/// Promotes artifacts into downstream repositories
pub struct Promoter {
    git: Arc<dyn GitProvider>,
    scm: Arc<dyn SourceControl>,
    locks: RepoLocks,
    clock: fn() -> i64,
}

impl Promoter {
    pub fn new(git: Arc<dyn GitProvider>, scm: Arc<dyn SourceControl>) -> Self {
        Self {
            git,
            scm,
            locks: RepoLocks::default(),
            clock: unix_now,
        }
    }

    /// Replaces the wall clock used for branch names
    pub fn with_clock(mut self, clock: fn() -> i64) -> Self {
        self.clock = clock;
        self
    }

    /// Writes the digest held in `artifact` into every manifest of `post`
    ///
    /// # Arguments
    /// * `rule_name` - Build rule the artifact came from, used in the PR title
    /// * `post` - Target repository, image name and manifest paths
    /// * `artifact` - Local file holding a `sha256:` digest reference
    pub async fn promote(
        &self,
        rule_name: &str,
        post: &PostProcess,
        artifact: &Path,
    ) -> Result<PromotionOutcome, PromoteError> {
        let contents = tokio::fs::read(artifact)
            .await
            .map_err(|source| PromoteError::Read {
                path: artifact.to_path_buf(),
                source,
            })?;
        let digest = parse_digest(&contents)?;
        let target = post.target()?;
        let paths = post.relative_manifest_paths()?;

        let lock = self.locks.lock_for(&target);
        let mut last_stamp = lock.lock().await;

        let mut workspace = self.git.clone_repo(&target).await?;
        let base = workspace.default_branch().await?;

        let stamp = (self.clock)().max(*last_stamp + 1);
        *last_stamp = stamp;
        let branch = format!("{}{}", BRANCH_PREFIX, stamp);
        workspace.create_branch(&branch).await?;

        let mut changed = Vec::new();
        for path in paths {
            let file = workspace.root().join(path);
            let text = tokio::fs::read_to_string(&file)
                .await
                .map_err(|source| PromoteError::Read {
                    path: PathBuf::from(path),
                    source,
                })?;

            let patch = patch_images(&text, &post.image_name, post.field, &digest)?;
            debug!("{}: {} entries named {}", path, patch.matched, post.image_name);
            let Some(updated) = patch.updated else {
                continue;
            };

            tokio::fs::write(&file, updated)
                .await
                .map_err(|source| PromoteError::Write {
                    path: PathBuf::from(path),
                    source,
                })?;
            if workspace.commit_file(path, &format!("Update {}", path)).await? {
                info!("Committed {} on {}", path, branch);
                changed.push(path.to_string());
            } else {
                info!("No change to commit in {}", path);
            }
        }

        if changed.is_empty() {
            info!("Nothing to promote into {}", target);
            return Ok(PromotionOutcome::NoChange);
        }

        workspace.push(&branch).await?;
        info!("Pushed {} to {}", branch, target);

        let pr = NewPullRequest {
            title: format!("Update {}", rule_name),
            body: pull_request_body(&changed),
            head: branch.clone(),
            base,
        };
        let number = self.scm.create_pull_request(&target, &pr).await?;
        info!("Opened pull request {}#{}", target, number);

        Ok(PromotionOutcome::Proposed {
            branch,
            pull_request: number,
            paths: changed,
        })
    }
}

fn pull_request_body(paths: &[String]) -> String {
    let mut body = String::from("Change file(s):\n");
    for path in paths {
        body.push_str(path);
        body.push('\n');
    }
    body
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
