//! Rudder infrastructure clients
//!
//! Thin, trait-based clients for every external system a job run touches,
//! shared by the orchestrator and the in-pod sidecar:
//! - Object store holding job artifacts (S3-compatible)
//! - Tar archives wrapping a single artifact file
//! - Kubernetes Pod API (create, watch, logs, delete)
//! - GitHub REST API (contents, diffs, pull requests, comments)
//! - The `git` command line
//!
//! Every client sits behind a trait so the orchestration logic can be
//! exercised against in-memory fakes.

pub mod archive;
pub mod error;
pub mod git;
pub mod github;
pub mod object_store;
pub mod pods;

// Re-export commonly used types
pub use archive::ArtifactDir;
pub use error::{ClientError, Result};
pub use github::{GitHubClient, NewPullRequest, SourceControl, StaticToken, TokenProvider};
pub use object_store::{MemoryObjectStore, ObjectStore, ObjectStoreError, S3ObjectStore, StorageConfig};
pub use pods::{KubePodApi, PodApi, PodApiError, PodEvent, PodEventStream};
