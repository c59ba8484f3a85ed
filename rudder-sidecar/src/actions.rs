//! `clone` and `download-artifacts` actions

use anyhow::{Context, Result};
use rudder_client::ObjectStore;
use rudder_client::archive::download_into;
use rudder_client::git::Git;
use std::path::{Path, PathBuf};
use tracing::info;

/// Shallow-clones `url` into `work_dir`, pinned to `commit` when given
pub async fn clone(work_dir: &Path, url: &str, commit: Option<&str>) -> Result<()> {
    info!("Cloning {} into {}", url, work_dir.display());
    Git::new()
        .clone_shallow(url, work_dir, commit)
        .await
        .with_context(|| format!("Failed to clone {}", url))?;
    if let Some(commit) = commit {
        info!("Checked out {}", commit);
    }
    Ok(())
}

/// Fetches the archive stored under `key` and unpacks it into `dir`
pub async fn download_artifacts(
    store: &dyn ObjectStore,
    key: &str,
    dir: &Path,
) -> Result<Vec<PathBuf>> {
    let files = download_into(store, key, dir)
        .await
        .with_context(|| format!("Failed to download {}", key))?;
    info!("Unpacked {} file(s) of {} into {}", files.len(), key, dir.display());
    Ok(files)
}
