//! Artifact archives
//!
//! An artifact travels as a tar archive holding a single file. The sidecar
//! wraps it after a successful build, the orchestrator fetches and unpacks it
//! into a temporary directory that disappears when [`ArtifactDir`] is dropped.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::{NamedTempFile, TempDir};
use tracing::debug;

use crate::object_store::{ObjectStore, ObjectStoreError};

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("artifact io error: {0}")]
    Io(#[from] io::Error),

    #[error("artifact path has no file name: {0}")]
    NoFileName(PathBuf),

    #[error(transparent)]
    Store(#[from] ObjectStoreError),
}

/// Wraps a single file into a tar archive under its base name.
///
/// Returns `Ok(None)` for directories, which are not shipped.
pub fn wrap_file(path: &Path) -> Result<Option<Vec<u8>>, ArchiveError> {
    let metadata = fs::metadata(path)?;
    if metadata.is_dir() {
        return Ok(None);
    }
    let name = path
        .file_name()
        .ok_or_else(|| ArchiveError::NoFileName(path.to_path_buf()))?;

    let mut contents = Vec::with_capacity(metadata.len() as usize);
    File::open(path)?.read_to_end(&mut contents)?;

    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, name, contents.as_slice())?;
    Ok(Some(builder.into_inner()?))
}

/// Unpacks an archive into `dir`, returning the relative paths written
pub fn unpack_into<R: Read>(reader: R, dir: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    fs::create_dir_all(dir)?;
    let mut archive = tar::Archive::new(reader);
    let mut written = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let relative = entry.path()?.into_owned();
        if entry.unpack_in(dir)? {
            debug!("Unpacked {}", relative.display());
            written.push(relative);
        }
    }

    Ok(written)
}

/// Downloads `key` into a temporary file and unpacks it into `dir`
pub async fn download_into(
    store: &dyn ObjectStore,
    key: &str,
    dir: &Path,
) -> Result<Vec<PathBuf>, ArchiveError> {
    let body = store.get(key).await?;

    let mut staged = NamedTempFile::new()?;
    staged.write_all(&body)?;
    staged.as_file_mut().seek(SeekFrom::Start(0))?;

    unpack_into(staged.as_file(), dir)
}

/// A fetched artifact living in a fresh temporary directory
///
/// The directory is removed when this value is dropped.
#[derive(Debug)]
pub struct ArtifactDir {
    dir: TempDir,
    files: Vec<PathBuf>,
}

impl ArtifactDir {
    /// Fetches and unpacks the archive stored under `key`
    pub async fn fetch(store: &dyn ObjectStore, key: &str) -> Result<Self, ArchiveError> {
        let dir = TempDir::new()?;
        let files = download_into(store, key, dir.path()).await?;
        Ok(Self { dir, files })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Relative paths of the unpacked files
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Location of an artifact inside the directory, by the base name of the
    /// path it had inside the job
    pub fn file_for(&self, artifact_path: &str) -> Option<PathBuf> {
        let name = Path::new(artifact_path).file_name()?;
        Some(self.dir.path().join(name))
    }
}
