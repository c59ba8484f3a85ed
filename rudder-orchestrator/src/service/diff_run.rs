//! Diff-triggered jobs
//!
//! For configuration-as-code repositories: a rule file committed in the
//! repository names a directory. Merges touching it run the tool's `push`
//! command and report back on the merged pull request; pull requests get a
//! `preview` run posted as a comment.

use async_trait::async_trait;
use rudder_client::{ClientError, PodApiError, SourceControl};
use rudder_core::diff::{changed_files, merged_pull_request_number};
use rudder_core::domain::event::{EventContext, PullRequestEvent, PushEvent};
use rudder_core::domain::rule::{DiffRunRule, RuleError};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::dispatch::EventConsumer;
use crate::service::JobRuntime;
use crate::service::pod_spec::{DiffRunCommand, PodSpecError};
use crate::service::watcher::{JobError, JobOutcome};

/// Pull request actions that trigger a preview
const PREVIEW_ACTIONS: &[&str] = &["opened", "synchronize", "synchronized"];

#[derive(Debug, thiserror::Error)]
pub enum DiffRunError {
    #[error("invalid rule file: {0}")]
    Rule(#[from] RuleError),

    #[error(transparent)]
    SourceControl(#[from] ClientError),

    #[error(transparent)]
    PodSpec(#[from] PodSpecError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("failed to read job logs: {0}")]
    Logs(#[from] PodApiError),

    #[error("could not extract a pull request number from {0:?}")]
    NoPullRequest(String),
}

/// How one diff-run event was handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffRunReport {
    Skipped(String),
    Commented { pull_request: u64 },
}

pub struct DiffRunConsumer {
    runtime: JobRuntime,
    scm: Arc<dyn SourceControl>,
    rule_file: String,
}

impl DiffRunConsumer {
    pub fn new(runtime: JobRuntime, scm: Arc<dyn SourceControl>, rule_file: impl Into<String>) -> Self {
        Self {
            runtime,
            scm,
            rule_file: rule_file.into(),
        }
    }

    async fn fetch_rule(&self, ctx: &EventContext) -> Result<DiffRunRule, DiffRunError> {
        let contents = self
            .scm
            .file_at_commit(&ctx.repository, &ctx.commit, &self.rule_file)
            .await?;
        let rule = DiffRunRule::from_yaml(&contents)?;
        info!("{}: rule {:?}", ctx.repository, rule);
        Ok(rule)
    }

    /// Runs `push` for merges into the rule's default branch
    pub async fn on_push(&self, event: &PushEvent) -> Result<DiffRunReport, DiffRunError> {
        let ctx = EventContext::from_push(event)?;
        let rule = match self.fetch_rule(&ctx).await {
            Ok(rule) => rule,
            Err(DiffRunError::SourceControl(e)) if e.is_not_found() => {
                return Ok(DiffRunReport::Skipped(format!("no {}", self.rule_file)));
            }
            Err(e) => return Err(e),
        };

        if event.branch() != Some(rule.default_branch.as_str()) {
            return Ok(DiffRunReport::Skipped(format!("{} is not {}", event.git_ref, rule.default_branch)));
        }
        let Some(head) = &event.head_commit else {
            return Ok(DiffRunReport::Skipped("push has no head commit".to_string()));
        };
        let number = merged_pull_request_number(&head.message)
            .ok_or_else(|| DiffRunError::NoPullRequest(head.message.clone()))?;

        let diff = self
            .scm
            .compare_diff(&ctx.repository, &event.before, &event.after)
            .await?;
        let changed = changed_files(&diff);
        if !rule.is_affected_by(&changed) {
            return Ok(DiffRunReport::Skipped(format!("nothing changed under {}", rule.dir)));
        }

        let output = self.run_job(&ctx, &rule, DiffRunCommand::Push).await?;
        let comment = format!("Applied:\n```\n{}\n```\n", output);
        self.scm.create_comment(&ctx.repository, number, &comment).await?;
        Ok(DiffRunReport::Commented { pull_request: number })
    }

    /// Runs `preview` for opened or updated pull requests
    pub async fn on_pull_request(
        &self,
        event: &PullRequestEvent,
    ) -> Result<DiffRunReport, DiffRunError> {
        if !PREVIEW_ACTIONS.contains(&event.action.as_str()) {
            return Ok(DiffRunReport::Skipped(format!("action {}", event.action)));
        }

        let ctx = EventContext::from_pull_request(event)?;
        let rule = match self.fetch_rule(&ctx).await {
            Ok(rule) => rule,
            Err(DiffRunError::SourceControl(e)) if e.is_not_found() => {
                return Ok(DiffRunReport::Skipped(format!("no {}", self.rule_file)));
            }
            Err(e) => return Err(e),
        };
        let number = event.pull_request.number;

        let diff = self.scm.pull_request_diff(&ctx.repository, number).await?;
        let changed = changed_files(&diff);
        info!("{}#{} changes {:?}", ctx.repository, number, changed);

        let output = self.run_job(&ctx, &rule, DiffRunCommand::Preview).await?;
        let comment = format!("Preview:\n```\n{}\n```\n", output);
        self.scm.create_comment(&ctx.repository, number, &comment).await?;
        Ok(DiffRunReport::Commented { pull_request: number })
    }

    /// Runs the single-container job and returns its log, deleting its Pods
    /// afterwards
    async fn run_job(
        &self,
        ctx: &EventContext,
        rule: &DiffRunRule,
        command: DiffRunCommand,
    ) -> Result<String, DiffRunError> {
        let job_id = self.runtime.ids.next_id();
        let result = async {
            let spec = self.runtime.template.diff_run_job(ctx, rule, &job_id, command)?;
            let name = spec.name().unwrap_or_default().to_string();

            if self.runtime.watcher.run_and_wait(&spec).await? == JobOutcome::Failed {
                warn!("{} job {} failed, posting its log anyway", command.as_arg(), job_id);
            }
            let logs = self
                .runtime
                .watcher
                .pods()
                .logs(&name, &spec.main_container)
                .await?;
            Ok::<_, DiffRunError>(logs)
        }
        .await;

        self.runtime.watcher.cleanup(&job_id).await;
        result
    }
}

#[async_trait]
impl EventConsumer for DiffRunConsumer {
    fn name(&self) -> &str {
        "diff-run"
    }

    async fn handle_push(&self, event: &PushEvent) {
        match self.on_push(event).await {
            Ok(report) => info!("[diff-run] {}: {:?}", event.repository.full_name, report),
            Err(e) => error!("[diff-run] {}: {:#}", event.repository.full_name, e),
        }
    }

    async fn handle_pull_request(&self, event: &PullRequestEvent) {
        match self.on_pull_request(event).await {
            Ok(report) => info!("[diff-run] {}: {:?}", event.repository.full_name, report),
            Err(e) => error!("[diff-run] {}: {:#}", event.repository.full_name, e),
        }
    }
}
