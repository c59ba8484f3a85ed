//! Event dispatch
//!
//! Consumers subscribe to push or pull-request events, optionally for one
//! repository. Every matching event runs in its own task, but each
//! subscription only lets `max_parallel_jobs` of them work at a time and
//! `max_queued_jobs` more wait for a permit. Events beyond that are dropped
//! with a warning.

use async_trait::async_trait;
use rudder_core::domain::event::{PullRequestEvent, PushEvent, TriggerEvent};
use rudder_core::domain::rule::RepositorySlug;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Something that reacts to trigger events.
///
/// Both handlers default to doing nothing, so a consumer only implements the
/// event kinds it cares about. Handlers own their error reporting.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    fn name(&self) -> &str;

    async fn handle_push(&self, _event: &PushEvent) {}

    async fn handle_pull_request(&self, _event: &PullRequestEvent) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Push,
    PullRequest,
}

impl EventKind {
    fn of(event: &TriggerEvent) -> Self {
        match event {
            TriggerEvent::Push(_) => EventKind::Push,
            TriggerEvent::PullRequest(_) => EventKind::PullRequest,
        }
    }
}

struct Subscription {
    kind: EventKind,
    /// `None` matches every repository
    repository: Option<RepositorySlug>,
    consumer: Arc<dyn EventConsumer>,
    /// Running jobs
    permits: Arc<Semaphore>,
    /// Running plus waiting jobs
    admission: Arc<Semaphore>,
}

impl Subscription {
    fn matches(&self, kind: EventKind, repository: &str) -> bool {
        if self.kind != kind {
            return false;
        }
        match &self.repository {
            None => true,
            Some(slug) => slug.full_name().eq_ignore_ascii_case(repository),
        }
    }
}

/// Routes trigger events to subscribed consumers
pub struct Dispatcher {
    subscriptions: Vec<Subscription>,
    max_parallel_jobs: usize,
    max_queued_jobs: usize,
}

impl Dispatcher {
    pub fn new(max_parallel_jobs: usize, max_queued_jobs: usize) -> Self {
        Self {
            subscriptions: Vec::new(),
            max_parallel_jobs: max_parallel_jobs.max(1),
            max_queued_jobs,
        }
    }

    pub fn subscribe_push(&mut self, repository: Option<RepositorySlug>, consumer: Arc<dyn EventConsumer>) {
        self.subscribe(EventKind::Push, repository, consumer);
    }

    pub fn subscribe_pull_request(
        &mut self,
        repository: Option<RepositorySlug>,
        consumer: Arc<dyn EventConsumer>,
    ) {
        self.subscribe(EventKind::PullRequest, repository, consumer);
    }

    fn subscribe(
        &mut self,
        kind: EventKind,
        repository: Option<RepositorySlug>,
        consumer: Arc<dyn EventConsumer>,
    ) {
        debug!("Subscribing {} to {:?} events of {:?}", consumer.name(), kind, repository);
        self.subscriptions.push(Subscription {
            kind,
            repository,
            consumer,
            permits: Arc::new(Semaphore::new(self.max_parallel_jobs)),
            admission: Arc::new(Semaphore::new(self.max_parallel_jobs + self.max_queued_jobs)),
        });
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Starts one task per matching subscription and returns their handles
    pub fn dispatch(&self, event: TriggerEvent) -> Vec<JoinHandle<()>> {
        let kind = EventKind::of(&event);
        let event = Arc::new(event);
        let mut handles = Vec::new();

        for subscription in self
            .subscriptions
            .iter()
            .filter(|s| s.matches(kind, event.repository()))
        {
            let consumer = subscription.consumer.clone();
            let Ok(admitted) = subscription.admission.clone().try_acquire_owned() else {
                warn!(
                    "Dropping {} of {} for {}: {} jobs already running or queued",
                    event.kind(),
                    event.repository(),
                    consumer.name(),
                    self.max_parallel_jobs + self.max_queued_jobs
                );
                continue;
            };
            let permits = subscription.permits.clone();
            let event = event.clone();
            info!(
                "Dispatching {} of {} to {}",
                event.kind(),
                event.repository(),
                consumer.name()
            );

            handles.push(tokio::spawn(async move {
                let _admitted = admitted;
                let Ok(_permit) = permits.acquire_owned().await else {
                    warn!("Subscription of {} is closed", consumer.name());
                    return;
                };
                match event.as_ref() {
                    TriggerEvent::Push(push) => consumer.handle_push(push).await,
                    TriggerEvent::PullRequest(pr) => consumer.handle_pull_request(pr).await,
                }
            }));
        }

        if handles.is_empty() {
            debug!("No subscriber for {} of {}", event.kind(), event.repository());
        }
        handles
    }
}
