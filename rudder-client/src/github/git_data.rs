//! Git data endpoints (trees and blobs)

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rudder_core::domain::rule::RepositorySlug;
use serde::Deserialize;
use tracing::debug;

use crate::GitHubClient;
use crate::error::{ClientError, Result};

#[derive(Debug, Deserialize)]
struct Tree {
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct Blob {
    content: String,
    #[serde(default)]
    encoding: String,
}

impl GitHubClient {
    // =============================================================================
    // Git Data
    // =============================================================================

    /// Reads a file out of the recursive tree of `commit`
    pub(crate) async fn read_file_at(
        &self,
        repo: &RepositorySlug,
        commit: &str,
        path: &str,
    ) -> Result<String> {
        let url = self.repo_url(repo, &format!("git/trees/{}?recursive=1", commit));
        let tree: Tree = self.get_json(&url).await?;
        if tree.truncated {
            debug!("Tree of {}@{} is truncated", repo, commit);
        }

        let path = path.trim_start_matches('/');
        let sha = tree
            .tree
            .into_iter()
            .find(|entry| entry.path == path)
            .map(|entry| entry.sha)
            .ok_or_else(|| ClientError::NotFound(format!("{} in {}@{}", path, repo, commit)))?;

        let url = self.repo_url(repo, &format!("git/blobs/{}", sha));
        let blob: Blob = self.get_json(&url).await?;
        decode_blob(&blob)
    }
}

fn decode_blob(blob: &Blob) -> Result<String> {
    if blob.encoding != "base64" {
        return Ok(blob.content.clone());
    }
    let packed: String = blob.content.split_whitespace().collect();
    let bytes = STANDARD
        .decode(packed)
        .map_err(|e| ClientError::ParseError(format!("invalid blob encoding: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| ClientError::ParseError(format!("blob is not utf-8: {}", e)))
}
