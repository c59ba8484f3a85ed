//! Diff, pull request and comment endpoints

use rudder_core::domain::rule::RepositorySlug;
use serde::{Deserialize, Serialize};

use crate::GitHubClient;
use crate::error::Result;
use crate::github::NewPullRequest;

#[derive(Debug, Deserialize)]
struct CreatedPullRequest {
    number: u64,
}

#[derive(Debug, Serialize)]
struct NewComment<'a> {
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreatedComment {
    #[allow(dead_code)]
    id: u64,
}

impl GitHubClient {
    // =============================================================================
    // Diffs
    // =============================================================================

    /// Unified diff of `base...head`
    pub(crate) async fn diff_between(
        &self,
        repo: &RepositorySlug,
        base: &str,
        head: &str,
    ) -> Result<String> {
        let url = self.repo_url(repo, &format!("compare/{}...{}", base, head));
        self.get_diff(&url).await
    }

    /// Unified diff of a pull request
    pub(crate) async fn diff_of_pull_request(
        &self,
        repo: &RepositorySlug,
        number: u64,
    ) -> Result<String> {
        let url = self.repo_url(repo, &format!("pulls/{}", number));
        self.get_diff(&url).await
    }

    // =============================================================================
    // Pull Requests & Comments
    // =============================================================================

    /// Open a pull request
    ///
    /// # Returns
    /// The number of the new pull request
    pub(crate) async fn open_pull_request(
        &self,
        repo: &RepositorySlug,
        pr: &NewPullRequest,
    ) -> Result<u64> {
        let url = self.repo_url(repo, "pulls");
        let created: CreatedPullRequest = self.post_json(&url, pr).await?;
        Ok(created.number)
    }

    /// Comment on an issue or pull request
    pub(crate) async fn comment_on_issue(
        &self,
        repo: &RepositorySlug,
        number: u64,
        body: &str,
    ) -> Result<()> {
        let url = self.repo_url(repo, &format!("issues/{}/comments", number));
        let _: CreatedComment = self.post_json(&url, &NewComment { body }).await?;
        Ok(())
    }
}
