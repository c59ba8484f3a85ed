//! Trigger event types
//!
//! Only the subset of the GitHub webhook payloads the orchestrator reads is
//! modelled here. Unknown fields are ignored by serde.

use serde::{Deserialize, Serialize};

use crate::domain::rule::{RepositorySlug, RuleError};

/// Commit id GitHub reports for a deleted ref
pub const NULL_COMMIT: &str = "0000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub full_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadCommit {
    pub id: String,
    #[serde(default)]
    pub message: String,
}

/// `push` webhook payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub before: String,
    pub after: String,
    #[serde(default)]
    pub deleted: bool,
    pub repository: Repository,
    #[serde(default)]
    pub head_commit: Option<HeadCommit>,
}

impl PushEvent {
    /// Branch name for `refs/heads/<branch>` refs
    pub fn branch(&self) -> Option<&str> {
        self.git_ref.strip_prefix("refs/heads/")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub sha: String,
    #[serde(rename = "ref", default)]
    pub git_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub head: CommitRef,
    pub base: CommitRef,
}

/// `pull_request` webhook payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub number: u64,
    pub pull_request: PullRequest,
    pub repository: Repository,
}

/// The finite set of events that can start a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerEvent {
    Push(PushEvent),
    PullRequest(PullRequestEvent),
}

impl TriggerEvent {
    /// Parses a webhook body given the `X-GitHub-Event` type.
    ///
    /// Returns `Ok(None)` for event types no consumer handles.
    pub fn from_webhook(event_type: &str, body: &[u8]) -> Result<Option<Self>, serde_json::Error> {
        match event_type {
            "push" => Ok(Some(TriggerEvent::Push(serde_json::from_slice(body)?))),
            "pull_request" => Ok(Some(TriggerEvent::PullRequest(serde_json::from_slice(body)?))),
            _ => Ok(None),
        }
    }

    pub fn repository(&self) -> &str {
        match self {
            TriggerEvent::Push(e) => &e.repository.full_name,
            TriggerEvent::PullRequest(e) => &e.repository.full_name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TriggerEvent::Push(_) => "push",
            TriggerEvent::PullRequest(_) => "pull_request",
        }
    }
}

/// Repository coordinates and commit a job runs against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    pub repository: RepositorySlug,
    pub commit: String,
    pub pull_request: Option<u64>,
}

impl EventContext {
    /// Uses `after`, or `before` when the push deleted the ref
    pub fn from_push(event: &PushEvent) -> Result<Self, RuleError> {
        let commit = if event.after == NULL_COMMIT {
            event.before.clone()
        } else {
            event.after.clone()
        };
        Ok(Self {
            repository: RepositorySlug::parse(&event.repository.full_name)?,
            commit,
            pull_request: None,
        })
    }

    pub fn from_pull_request(event: &PullRequestEvent) -> Result<Self, RuleError> {
        Ok(Self {
            repository: RepositorySlug::parse(&event.repository.full_name)?,
            commit: event.pull_request.head.sha.clone(),
            pull_request: Some(event.pull_request.number),
        })
    }

    pub fn clone_url(&self) -> String {
        self.repository.https_url()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUSH: &str = r#"{
        "ref": "refs/heads/master",
        "before": "1111111111111111111111111111111111111111",
        "after": "2222222222222222222222222222222222222222",
        "repository": {"full_name": "o/dns", "private": false},
        "head_commit": {"id": "2222222222222222222222222222222222222222",
                        "message": "Merge pull request #12 from o/branch\n\nbody"},
        "pusher": {"name": "octocat"}
    }"#;

    #[test]
    fn test_parse_push() {
        let event = TriggerEvent::from_webhook("push", PUSH.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(event.kind(), "push");
        assert_eq!(event.repository(), "o/dns");
        let TriggerEvent::Push(push) = event else {
            panic!("expected push");
        };
        assert_eq!(push.branch(), Some("master"));
        let ctx = EventContext::from_push(&push).unwrap();
        assert_eq!(ctx.commit, "2222222222222222222222222222222222222222");
        assert_eq!(ctx.clone_url(), "https://github.com/o/dns.git");
    }

    #[test]
    fn test_push_deleting_ref_uses_before() {
        let mut push: PushEvent = serde_json::from_str(PUSH).unwrap();
        push.after = NULL_COMMIT.to_string();
        let ctx = EventContext::from_push(&push).unwrap();
        assert_eq!(ctx.commit, "1111111111111111111111111111111111111111");
    }

    #[test]
    fn test_parse_pull_request() {
        let body = r#"{
            "action": "opened",
            "number": 7,
            "pull_request": {
                "number": 7,
                "head": {"sha": "abc", "ref": "feature"},
                "base": {"sha": "def", "ref": "master"}
            },
            "repository": {"full_name": "o/dns"}
        }"#;
        let event = TriggerEvent::from_webhook("pull_request", body.as_bytes())
            .unwrap()
            .unwrap();
        let TriggerEvent::PullRequest(pr) = event else {
            panic!("expected pull request");
        };
        let ctx = EventContext::from_pull_request(&pr).unwrap();
        assert_eq!(ctx.commit, "abc");
        assert_eq!(ctx.pull_request, Some(7));
    }

    #[test]
    fn test_unknown_event_is_ignored() {
        assert!(TriggerEvent::from_webhook("issues", b"{}").unwrap().is_none());
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        assert!(TriggerEvent::from_webhook("push", b"{\"ref\": 1}").is_err());
    }
}
