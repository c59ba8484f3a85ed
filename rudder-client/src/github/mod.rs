//! GitHub REST client
//!
//! A small, type-safe client for the handful of GitHub endpoints the
//! orchestrator uses. Endpoint groups live in submodules as `impl` blocks:
//! - `git_data`: trees and blobs (reading a file at a commit)
//! - `pulls`: diffs, pull requests and issue comments

mod git_data;
mod pulls;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use rudder_core::domain::rule::RepositorySlug;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::error::{ClientError, Result};

/// Default API endpoint
pub const GITHUB_API_URL: &str = "https://api.github.com";

const MEDIA_JSON: &str = "application/vnd.github+json";
const MEDIA_DIFF: &str = "application/vnd.github.diff";
const AGENT: &str = concat!("rudder/", env!("CARGO_PKG_VERSION"));

/// Produces the credential used for API calls and git transport
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// A fixed token (personal access token or pre-minted installation token)
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into().trim().to_string())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String> {
        if self.0.is_empty() {
            return Err(ClientError::TokenUnavailable("token is empty".to_string()));
        }
        Ok(self.0.clone())
    }
}

/// Pull request to open
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewPullRequest {
    pub title: String,
    pub body: String,
    /// Branch holding the changes
    pub head: String,
    /// Branch the changes are proposed against
    pub base: String,
}

/// Source-control operations the orchestrator depends on
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Contents of `path` in the tree of `commit`
    async fn file_at_commit(&self, repo: &RepositorySlug, commit: &str, path: &str) -> Result<String>;

    /// Unified diff between two commits
    async fn compare_diff(&self, repo: &RepositorySlug, base: &str, head: &str) -> Result<String>;

    /// Unified diff of a pull request
    async fn pull_request_diff(&self, repo: &RepositorySlug, number: u64) -> Result<String>;

    /// Opens a pull request, returning its number
    async fn create_pull_request(&self, repo: &RepositorySlug, pr: &NewPullRequest) -> Result<u64>;

    /// Comments on an issue or pull request
    async fn create_comment(&self, repo: &RepositorySlug, number: u64, body: &str) -> Result<()>;
}

/// HTTP client for the GitHub REST API
#[derive(Clone)]
pub struct GitHubClient {
    /// Base URL of the API (e.g., "https://api.github.com")
    base_url: String,
    /// HTTP client instance
    client: Client,
    tokens: Arc<dyn TokenProvider>,
}

impl GitHubClient {
    /// Create a new GitHub client
    ///
    /// # Arguments
    /// * `base_url` - API root, trailing slashes are ignored
    /// * `tokens` - Credential source for every request
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self::with_client(base_url, tokens, Client::new())
    }

    /// Create a new GitHub client with a custom HTTP client
    pub fn with_client(
        base_url: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
        client: Client,
    ) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            tokens,
        }
    }

    /// Get the base URL of the API
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn repo_url(&self, repo: &RepositorySlug, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.base_url,
            repo.owner(),
            repo.name(),
            path.trim_start_matches('/')
        )
    }

    // =============================================================================
    // Request Helpers
    // =============================================================================

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        let token = self.tokens.token().await?;
        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .header(ACCEPT, MEDIA_JSON)
            .header(USER_AGENT, AGENT)
            .send()
            .await?;

        self.handle_response(response).await
    }

    async fn get_diff(&self, url: &str) -> Result<String> {
        let token = self.tokens.token().await?;
        let response = self
            .client
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .header(ACCEPT, MEDIA_DIFF)
            .header(USER_AGENT, AGENT)
            .send()
            .await?;

        let response = self.check_status(response).await?;
        Ok(response.text().await?)
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T> {
        let token = self.tokens.token().await?;
        let response = self
            .client
            .post(url)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .header(ACCEPT, MEDIA_JSON)
            .header(USER_AGENT, AGENT)
            .json(body)
            .send()
            .await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let response = self.check_status(response).await?;

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Turn a non-success status into an error carrying the response body
    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::from_response(status.as_u16(), &body));
        }

        Ok(response)
    }
}

#[async_trait]
impl SourceControl for GitHubClient {
    async fn file_at_commit(&self, repo: &RepositorySlug, commit: &str, path: &str) -> Result<String> {
        self.read_file_at(repo, commit, path).await
    }

    async fn compare_diff(&self, repo: &RepositorySlug, base: &str, head: &str) -> Result<String> {
        self.diff_between(repo, base, head).await
    }

    async fn pull_request_diff(&self, repo: &RepositorySlug, number: u64) -> Result<String> {
        self.diff_of_pull_request(repo, number).await
    }

    async fn create_pull_request(&self, repo: &RepositorySlug, pr: &NewPullRequest) -> Result<u64> {
        self.open_pull_request(repo, pr).await
    }

    async fn create_comment(&self, repo: &RepositorySlug, number: u64, body: &str) -> Result<()> {
        self.comment_on_issue(repo, number, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: &str) -> GitHubClient {
        GitHubClient::new(url, Arc::new(StaticToken::new("t0ken")))
    }

    #[test]
    fn test_client_trims_trailing_slash() {
        assert_eq!(client("https://api.github.com/").base_url(), GITHUB_API_URL);
    }

    #[test]
    fn test_repo_url() {
        let repo = RepositorySlug::new("o", "infra");
        assert_eq!(
            client(GITHUB_API_URL).repo_url(&repo, "/pulls"),
            "https://api.github.com/repos/o/infra/pulls"
        );
    }

    #[tokio::test]
    async fn test_static_token() {
        assert_eq!(StaticToken::new("abc\n").token().await.unwrap(), "abc");
        assert!(matches!(
            StaticToken::new("  ").token().await,
            Err(ClientError::TokenUnavailable(_))
        ));
    }
}
