//! Job services
//!
//! Everything that turns a trigger event into Pods and their side effects.

pub mod build;
pub mod diff_run;
pub mod pod_spec;
pub mod promoter;
pub mod watcher;

use rudder_core::domain::job::JobIdSource;
use std::sync::Arc;

pub use build::BuildConsumer;
pub use diff_run::DiffRunConsumer;
pub use pod_spec::PodTemplate;
pub use promoter::{CliGitProvider, Promoter};
pub use watcher::JobWatcher;

/// Shared machinery every job consumer starts and reaps Pods with
#[derive(Clone)]
pub struct JobRuntime {
    pub template: Arc<PodTemplate>,
    pub watcher: Arc<JobWatcher>,
    pub ids: Arc<dyn JobIdSource>,
}
