//! Build Orchestrator
//!
//! Owns one build run end to end: Pod creation, waiting, artifact retrieval,
//! promotion and, whatever happened before, deletion of the job's Pods.

use async_trait::async_trait;
use rudder_client::ObjectStore;
use rudder_client::archive::{ArchiveError, ArtifactDir};
use rudder_core::domain::event::{EventContext, PushEvent};
use rudder_core::domain::job::{ArtifactKey, JobId};
use rudder_core::domain::rule::{BuildRule, RuleError};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::dispatch::EventConsumer;
use crate::service::JobRuntime;
use crate::service::pod_spec::PodSpecError;
use crate::service::promoter::{PromoteError, Promoter, PromotionOutcome};
use crate::service::watcher::{JobError, JobOutcome};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    PodSpec(#[from] PodSpecError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("failed to retrieve artifact: {0}")]
    Artifact(#[from] ArchiveError),

    #[error("artifact {0} is missing from the archive")]
    MissingArtifact(String),

    #[error("promotion failed: {0}")]
    Promote(#[from] PromoteError),
}

/// How a build run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildReport {
    /// The job reported failure; nothing was promoted
    Failed,
    /// The job succeeded and the rule has nothing to promote
    Built,
    Promoted(PromotionOutcome),
}

/// Runs one build rule for every push to its repository
pub struct BuildConsumer {
    rule: BuildRule,
    runtime: JobRuntime,
    store: Arc<dyn ObjectStore>,
    promoter: Arc<Promoter>,
}

impl BuildConsumer {
    pub fn new(
        rule: BuildRule,
        runtime: JobRuntime,
        store: Arc<dyn ObjectStore>,
        promoter: Arc<Promoter>,
    ) -> Self {
        Self {
            rule,
            runtime,
            store,
            promoter,
        }
    }

    /// Fire-and-forget entry point: every error ends up in the log
    pub async fn run(&self, event: &PushEvent) {
        if event.deleted {
            info!("[{}] Skipping deletion of {}", self.rule.name, event.git_ref);
            return;
        }

        let ctx = match EventContext::from_push(event) {
            Ok(ctx) => ctx,
            Err(e) => {
                error!("[{}] Invalid push event: {}", self.rule.name, e);
                return;
            }
        };

        let job_id = self.runtime.ids.next_id();
        match self.execute(&job_id, Some(&ctx.commit)).await {
            Ok(report) => info!("[{}] Job {} done: {:?}", self.rule.name, job_id, report),
            Err(BuildError::Promote(e)) if e.is_content_error() => error!(
                "[{}] Job {} produced an unusable artifact or manifest: {:#}",
                self.rule.name, job_id, e
            ),
            Err(e) => error!("[{}] Job {} failed: {:#}", self.rule.name, job_id, e),
        }
    }

    /// Runs the job, then deletes its Pods regardless of the result
    pub async fn execute(
        &self,
        job_id: &JobId,
        commit: Option<&str>,
    ) -> Result<BuildReport, BuildError> {
        let result = self.build_and_promote(job_id, commit).await;
        self.runtime.watcher.cleanup(job_id).await;
        result
    }

    async fn build_and_promote(
        &self,
        job_id: &JobId,
        commit: Option<&str>,
    ) -> Result<BuildReport, BuildError> {
        let spec = self.runtime.template.build_job(&self.rule, job_id, commit)?;
        info!("[{}] Starting job {}", self.rule.name, job_id);

        match self.runtime.watcher.run_and_wait(&spec).await? {
            JobOutcome::Failed => {
                warn!("[{}] Build {} failed", self.rule.name, job_id);
                return Ok(BuildReport::Failed);
            }
            JobOutcome::Succeeded => {}
        }

        let Some(post) = &self.rule.post_process else {
            return Ok(BuildReport::Built);
        };
        let primary = self
            .rule
            .primary_artifact()
            .ok_or_else(|| RuleError::MissingArtifact(self.rule.name.clone()))?;

        let key = ArtifactKey::new(&self.rule.name, job_id.as_str()).archive();
        let artifacts = ArtifactDir::fetch(self.store.as_ref(), &key).await?;
        let file = artifacts
            .file_for(primary)
            .filter(|path| path.is_file())
            .ok_or_else(|| BuildError::MissingArtifact(primary.to_string()))?;

        let outcome = self.promoter.promote(&self.rule.name, post, &file).await?;
        Ok(BuildReport::Promoted(outcome))
    }
}

#[async_trait]
impl EventConsumer for BuildConsumer {
    fn name(&self) -> &str {
        &self.rule.name
    }

    async fn handle_push(&self, event: &PushEvent) {
        self.run(event).await;
    }
}
