//! Rudder Orchestrator
//!
//! Receives GitHub webhooks and turns them into job Pods.
//!
//! Architecture:
//! - API: webhook receiver, acknowledges before any job work starts
//! - Dispatch: subscription registry with per-subscription admission control
//! - Services: job watcher, build orchestrator, GitOps promoter and the
//!   diff-triggered runner
//!
//! Every job run owns its Pods from creation to deletion; failures are
//! reported in the log, never to the webhook caller.

mod api;
mod config;
mod dispatch;
mod service;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::Parser;
use rudder_client::{
    GitHubClient, KubePodApi, ObjectStore, PodApi, S3ObjectStore, SourceControl, StaticToken,
    TokenProvider,
};
use rudder_core::domain::job::RandomJobIds;
use rudder_core::domain::rule::BuildRuleSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::AppState;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::service::{
    BuildConsumer, CliGitProvider, DiffRunConsumer, JobRuntime, JobWatcher, PodTemplate, Promoter,
};

#[derive(Parser)]
#[command(name = "rudder-orchestrator")]
#[command(about = "Webhook-driven build and promotion orchestrator", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short = 'c', long = "conf", env = "RUDDER_CONFIG")]
    conf: PathBuf,

    /// Build rules file
    #[arg(long, env = "RUDDER_BUILD_RULE")]
    build_rule: Option<PathBuf>,

    /// Overrides `webhook_listener` from the configuration file
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rudder_orchestrator=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    info!("Starting Rudder Orchestrator");

    let mut config = Config::load(&cli.conf)?;
    if let Some(listen) = cli.listen {
        config.webhook_listener = listen;
    }
    info!(
        "Loaded configuration: namespace={}, bucket={}",
        config.build_namespace, config.artifact_bucket
    );
    if config.github_token.is_empty() {
        warn!("No GitHub token configured; API calls and pushes will fail");
    }

    let pods: Arc<dyn PodApi> = Arc::new(
        KubePodApi::connect(&config.build_namespace)
            .await
            .context("Failed to connect to the Kubernetes API")?,
    );
    let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::connect(&config.storage()).await);
    let tokens: Arc<dyn TokenProvider> = Arc::new(StaticToken::new(config.github_token.clone()));
    let scm: Arc<dyn SourceControl> =
        Arc::new(GitHubClient::new(config.github_api_url.clone(), tokens.clone()));
    let git = Arc::new(CliGitProvider::new(
        tokens,
        config.git_username.clone(),
        config.commit_author.clone(),
        config.commit_email.clone(),
    ));
    let promoter = Arc::new(Promoter::new(git, scm.clone()));

    let runtime = JobRuntime {
        template: Arc::new(PodTemplate::from_config(&config)),
        watcher: Arc::new(JobWatcher::new(pods, config.job_timeout())),
        ids: Arc::new(RandomJobIds::new()),
    };

    let mut dispatcher = Dispatcher::new(config.max_parallel_jobs, config.max_queued_jobs);

    if let Some(path) = &cli.build_rule {
        let rules = load_build_rules(path)?;
        info!("Loaded {} build rule(s)", rules.rules.len());
        for rule in rules.rules {
            let repository = rule.slug()?;
            info!("  - {} on {}", rule.name, repository);
            let consumer = BuildConsumer::new(rule, runtime.clone(), store.clone(), promoter.clone());
            dispatcher.subscribe_push(Some(repository), Arc::new(consumer));
        }
    }

    if config.diff_run.enabled {
        info!("Diff-run enabled with rule file {}", config.diff_run.rule_file);
        let consumer = Arc::new(DiffRunConsumer::new(
            runtime.clone(),
            scm.clone(),
            config.diff_run.rule_file.clone(),
        ));
        dispatcher.subscribe_push(None, consumer.clone());
        dispatcher.subscribe_pull_request(None, consumer);
    }

    if dispatcher.subscription_count() == 0 {
        warn!("No consumer subscribed; webhooks will be acknowledged and dropped");
    }

    let app = api::create_router(AppState::new(dispatcher));

    info!("Listening on {}", config.webhook_listener);
    let listener = tokio::net::TcpListener::bind(&config.webhook_listener)
        .await
        .with_context(|| format!("Failed to bind to {}", config.webhook_listener))?;

    axum::serve(listener, app)
        .await
        .context("Webhook listener failed")?;

    Ok(())
}

fn load_build_rules(path: &Path) -> Result<BuildRuleSet> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read build rules {}", path.display()))?;
    BuildRuleSet::from_yaml(&contents)
        .with_context(|| format!("Invalid build rules in {}", path.display()))
}
