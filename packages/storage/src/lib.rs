//! Artifact storage for rendered outputs.
//!
//! Finished renders live flat in one output directory as `<job_id>.<ext>`.
//! Each job also gets a scratch directory under `.work/<job_id>/` which the
//! renderer removes when it is done. Reads go through `object_store`'s local
//! filesystem backend so callers get bytes plus a content type.

use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use object_store::ObjectStore;
use object_store::ObjectStoreExt;
use object_store::local::LocalFileSystem;
use object_store::path::Path;
use render_core::{JobId, OutputFormat};

const WORK_DIR: &str = ".work";
const DEFAULT_OUTPUT_DIR: &str = "./data/renders";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid storage config: {0}")]
    InvalidConfig(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object_store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactStoreConfig {
    pub output_dir: PathBuf,
}

impl Default for ArtifactStoreConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
        }
    }
}

impl ArtifactStoreConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Build a config from environment variables.
    ///
    /// - `RENDER_OUTPUT_DIR` (default: `./data/renders`)
    pub fn from_env() -> Result<Self, StorageError> {
        let output_dir = match std::env::var("RENDER_OUTPUT_DIR") {
            Ok(v) => non_empty(v).map(PathBuf::from),
            Err(std::env::VarError::NotPresent) => None,
            Err(e) => {
                return Err(StorageError::InvalidConfig(format!(
                    "failed reading RENDER_OUTPUT_DIR: {e}"
                )));
            }
        };

        Ok(output_dir.map(Self::new).unwrap_or_default())
    }
}

/// A finished artifact read back from the store.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub file_name: String,
    pub content_type: &'static str,
    pub bytes: Bytes,
}

#[derive(Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    store: Arc<dyn ObjectStore>,
}

impl std::fmt::Debug for ArtifactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactStore")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl ArtifactStore {
    /// Open (and create if needed) the output directory.
    pub fn new(cfg: ArtifactStoreConfig) -> Result<Self, StorageError> {
        let root = cfg.output_dir;
        std::fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        let fs = LocalFileSystem::new_with_prefix(&root)?;

        Ok(Self {
            root,
            store: Arc::new(fs),
        })
    }

    pub fn from_env() -> Result<Self, StorageError> {
        Self::new(ArtifactStoreConfig::from_env()?)
    }

    pub fn root(&self) -> &FsPath {
        &self.root
    }

    /// Final location of a job's artifact.
    pub fn output_path(&self, job_id: JobId, format: OutputFormat) -> PathBuf {
        self.root
            .join(format!("{}.{}", job_id, format.extension()))
    }

    /// Scratch directory for a job. Not created here.
    pub fn work_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join(WORK_DIR).join(job_id.to_string())
    }

    /// Create a fresh, empty scratch directory for a job.
    pub async fn prepare_work_dir(&self, job_id: JobId) -> Result<PathBuf, StorageError> {
        let dir = self.work_dir(job_id);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Remove a job's scratch directory. Missing directories are fine.
    pub async fn discard_work_dir(&self, job_id: JobId) {
        let dir = self.work_dir(job_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove work dir {}: {}", dir.display(), e),
        }
    }

    /// Move a finished temporary file into its final place.
    ///
    /// Both paths must be on the same filesystem so the rename is atomic and
    /// readers never observe a partial artifact.
    pub async fn promote(&self, tmp: &FsPath, dest: &FsPath) -> Result<(), StorageError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(tmp, dest).await?;
        Ok(())
    }

    /// Delete a finished artifact. Missing files are fine.
    pub async fn remove(&self, path: &FsPath) -> Result<(), StorageError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read an artifact by its file name (e.g. `01J...X.mp4`).
    pub async fn open(&self, file_name: &str) -> Result<Artifact, StorageError> {
        let path = to_path(file_name)?;
        let content_type = FsPath::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .and_then(OutputFormat::from_extension)
            .map(|f| f.content_type())
            .unwrap_or("application/octet-stream");

        let res = match self.store.get(&path).await {
            Ok(res) => res,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(StorageError::NotFound(file_name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Artifact {
            file_name: file_name.to_string(),
            content_type,
            bytes: res.bytes().await?,
        })
    }
}

/// Artifacts are addressed by bare file name; anything that could escape the
/// output directory or reach the scratch area is treated as missing.
fn to_path(file_name: &str) -> Result<Path, StorageError> {
    let not_found = || StorageError::NotFound(file_name.to_string());
    if file_name.is_empty()
        || file_name.starts_with('.')
        || file_name.contains(['/', '\\'])
        || file_name.contains("..")
    {
        return Err(not_found());
    }
    Path::parse(file_name).map_err(|_| not_found())
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;

    #[tokio::test]
    async fn promoted_artifact_can_be_opened() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let store = ArtifactStore::new(ArtifactStoreConfig::new(dir.path().join("renders")))?;
        let job_id = JobId::new();

        let work = store.prepare_work_dir(job_id).await?;
        let tmp = work.join("output.webm");
        tokio::fs::write(&tmp, b"webm-bytes").await?;

        let dest = store.output_path(job_id, OutputFormat::Webm);
        store.promote(&tmp, &dest).await?;
        store.discard_work_dir(job_id).await;

        assert!(!work.exists());
        let file_name = format!("{job_id}.webm");
        assert_eq!(dest.file_name().and_then(|n| n.to_str()), Some(file_name.as_str()));

        let artifact = store.open(&file_name).await?;
        assert_eq!(artifact.content_type, "video/webm");
        assert_eq!(artifact.bytes, Bytes::from_static(b"webm-bytes"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_and_escaping_names_are_not_found() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let store = ArtifactStore::new(ArtifactStoreConfig::new(dir.path()))?;
        std::fs::write(dir.path().join("secret.txt"), b"x")?;

        for name in ["nope.mp4", "../secret.txt", ".work", "a/b.mp4", ""] {
            assert!(
                matches!(store.open(name).await, Err(StorageError::NotFound(_))),
                "{name:?} should be not found"
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn prepare_work_dir_starts_empty() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let store = ArtifactStore::new(ArtifactStoreConfig::new(dir.path()))?;
        let job_id = JobId::new();

        let work = store.prepare_work_dir(job_id).await?;
        std::fs::write(work.join("leftover"), b"x")?;
        let work = store.prepare_work_dir(job_id).await?;
        assert_eq!(std::fs::read_dir(&work)?.count(), 0);

        store.discard_work_dir(job_id).await;
        store.discard_work_dir(job_id).await;
        Ok(())
    }

    #[tokio::test]
    async fn remove_ignores_missing_files() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let store = ArtifactStore::new(ArtifactStoreConfig::new(dir.path()))?;
        store.remove(&dir.path().join("gone.mp4")).await?;
        Ok(())
    }
}
