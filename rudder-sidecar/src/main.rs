//! Rudder Sidecar
//!
//! One binary, three roles inside a job Pod:
//! - `clone`: init container fetching the source into the work volume
//! - `wait`: companion of the main container, ships its artifact and reaps
//!   helper containers that would keep the Pod alive
//! - `download-artifacts`: fetches a stored artifact into a directory

mod actions;
mod config;
mod wait;

use anyhow::{Context, Result, bail};
use clap::Parser;
use rudder_client::{KubePodApi, ObjectStore, S3ObjectStore, StorageConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Action, SidecarEnv};
use crate::wait::Waiter;

#[derive(Parser, Debug)]
#[command(name = "rudder-sidecar")]
#[command(about = "Job Pod sidecar for rudder builds", long_about = None)]
struct Cli {
    #[arg(short = 'a', long, value_enum)]
    action: Action,

    /// Directory the repository is cloned into
    #[arg(short = 'w', long)]
    work_dir: Option<PathBuf>,

    /// Repository URL (e.g. https://github.com/octocat/example.git)
    #[arg(long)]
    url: Option<String>,

    /// Commit to check out after cloning
    #[arg(short = 'b', long)]
    commit: Option<String>,

    /// Artifact storage endpoint
    #[arg(long, env = "ARTIFACT_HOST")]
    artifact_host: Option<String>,

    #[arg(long, env = "ARTIFACT_BUCKET")]
    artifact_bucket: Option<String>,

    /// File to ship (`wait`) or directory to unpack into (`download-artifacts`)
    #[arg(long)]
    artifact_path: Option<PathBuf>,

    /// Image of this sidecar, excluded from the straggler check
    #[arg(long, env = "SIDECAR_IMAGE")]
    self_image: Option<String>,
}

impl Cli {
    fn validate(&self) -> Result<()> {
        match self.action {
            Action::Clone => {
                if self.work_dir.is_none() || self.url.as_deref().is_none_or(str::is_empty) {
                    bail!("clone needs --work-dir and --url");
                }
            }
            Action::Wait => {
                if self.artifact_path.is_some() && self.storage().is_none() {
                    bail!("shipping an artifact needs --artifact-host and --artifact-bucket");
                }
            }
            Action::DownloadArtifacts => {
                if self.artifact_path.is_none() || self.storage().is_none() {
                    bail!(
                        "download-artifacts needs --artifact-host, --artifact-bucket and --artifact-path"
                    );
                }
            }
        }
        Ok(())
    }

    fn storage(&self) -> Option<StorageConfig> {
        let host = self.artifact_host.as_deref().filter(|h| !h.is_empty())?;
        let bucket = self.artifact_bucket.as_deref().filter(|b| !b.is_empty())?;
        Some(StorageConfig::new(host, bucket))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rudder_sidecar=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    cli.validate()?;
    let env = SidecarEnv::from_env(cli.action, cli.artifact_path.is_some())?;
    info!("Running {:?}", cli.action);

    match cli.action {
        Action::Clone => {
            let (Some(work_dir), Some(url)) = (&cli.work_dir, &cli.url) else {
                bail!("clone needs --work-dir and --url");
            };
            actions::clone(work_dir, url, cli.commit.as_deref()).await
        }
        Action::Wait => {
            let pods = KubePodApi::connect(&env.pod_namespace)
                .await
                .context("Failed to connect to the Kubernetes API")?;
            let mut waiter = Waiter::new(Arc::new(pods), env);
            if let Some(storage) = cli.storage() {
                waiter = waiter.with_store(Arc::new(S3ObjectStore::connect(&storage).await));
            }
            if let Some(image) = &cli.self_image {
                waiter = waiter.with_self_image(image.as_str());
            }
            let report = waiter.run(cli.artifact_path.as_deref()).await?;
            info!("Wait finished: {:?}", report);
            Ok(())
        }
        Action::DownloadArtifacts => {
            let (Some(dir), Some(storage)) = (&cli.artifact_path, cli.storage()) else {
                bail!("download-artifacts needs an artifact store and --artifact-path");
            };
            let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::connect(&storage).await);
            actions::download_artifacts(store.as_ref(), &env.artifact_key().bare(), dir).await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["rudder-sidecar"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_parse_wait_flags() {
        let cli = parse(&[
            "--action=wait",
            "--artifact-host=minio:9000",
            "--artifact-bucket=artifacts",
            "--artifact-path=/out/digest",
            "--self-image=ghcr.io/rudder-ci/rudder-sidecar:latest",
        ]);
        assert_eq!(cli.action, Action::Wait);
        assert!(cli.validate().is_ok());
        assert_eq!(cli.storage().unwrap().endpoint_url(), "http://minio:9000");
    }

    #[test]
    fn test_parse_download_action_name() {
        let cli = parse(&["--action", "download-artifacts", "--artifact-path", "/out"]);
        assert_eq!(cli.action, Action::DownloadArtifacts);
    }

    #[test]
    fn test_clone_requires_url() {
        let cli = parse(&["--action=clone", "--work-dir=/work"]);
        assert!(cli.validate().is_err());

        let cli = parse(&["--action=clone", "--work-dir=/work", "--url=https://github.com/o/r.git"]);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn test_wait_without_artifact_needs_no_store() {
        let cli = parse(&["--action=wait"]);
        assert!(cli.validate().is_ok());

        let cli = parse(&["--action=wait", "--artifact-path=/out/digest"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        assert!(Cli::try_parse_from(["rudder-sidecar", "--action=build"]).is_err());
    }
}
