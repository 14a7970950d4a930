//! Artifact storage for intermediate and final schedule files.
//!
//! Keys are slash-separated relative paths (`jobs/<id>/pass-2/master_schedule.csv`);
//! each backend returns a location string that `get` can read back.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use tokio::sync::RwLock;
use tracing::instrument;

use timetable_core::ArtifactRef;

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("invalid artifact key: {0}")]
    InvalidKey(String),
    #[error("artifact not found: {0}")]
    NotFound(String),
    #[error("artifact io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync + 'static {
    /// Store `contents` under `key`, replacing any previous value.
    async fn put(&self, key: &str, contents: &str) -> Result<ArtifactRef, ArtifactError>;

    /// Read back an artifact by the location returned from `put`.
    async fn get(&self, location: &str) -> Result<String, ArtifactError>;
}

/// Name of the artifact: the last key segment.
fn artifact_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Keys must be relative and stay inside the store root.
fn validate_key(key: &str) -> Result<(), ArtifactError> {
    let path = Path::new(key);
    let ok = !key.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(())
    } else {
        Err(ArtifactError::InvalidKey(key.to_string()))
    }
}

const MEM_SCHEME: &str = "mem://";
const FILE_SCHEME: &str = "file://";

/// In-memory artifact store for tests/dev. Locations are `mem://<key>`.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    objects: RwLock<HashMap<String, String>>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Keys under `prefix`, sorted.
    pub async fn keys(&self, prefix: &str) -> Vec<String> {
        let objects = self.objects.read().await;
        let mut keys: Vec<_> = objects
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait::async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, key: &str, contents: &str) -> Result<ArtifactRef, ArtifactError> {
        validate_key(key)?;
        self.objects
            .write()
            .await
            .insert(key.to_string(), contents.to_string());
        Ok(ArtifactRef::new(
            artifact_name(key),
            format!("{MEM_SCHEME}{key}"),
            contents.len() as u64,
        ))
    }

    async fn get(&self, location: &str) -> Result<String, ArtifactError> {
        let key = location
            .strip_prefix(MEM_SCHEME)
            .ok_or_else(|| ArtifactError::NotFound(location.to_string()))?;
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| ArtifactError::NotFound(location.to_string()))
    }
}

/// Filesystem-backed artifact store. Locations are `file://<absolute path>`.
#[derive(Debug, Clone)]
pub struct DirectoryArtifactStore {
    root: PathBuf,
}

impl DirectoryArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, location: &str) -> Result<PathBuf, ArtifactError> {
        let path = PathBuf::from(
            location
                .strip_prefix(FILE_SCHEME)
                .ok_or_else(|| ArtifactError::NotFound(location.to_string()))?,
        );
        let escapes = path.components().any(|c| matches!(c, Component::ParentDir));
        if escapes || !path.starts_with(&self.root) {
            return Err(ArtifactError::NotFound(location.to_string()));
        }
        Ok(path)
    }
}

#[async_trait::async_trait]
impl ArtifactStore for DirectoryArtifactStore {
    #[instrument(skip(self, contents), fields(bytes = contents.len()), err)]
    async fn put(&self, key: &str, contents: &str) -> Result<ArtifactRef, ArtifactError> {
        validate_key(key)?;
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so readers never observe a partial file.
        let tmp = path.with_file_name(format!("{}.partial", artifact_name(key)));
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &path).await?;

        Ok(ArtifactRef::new(
            artifact_name(key),
            format!("{FILE_SCHEME}{}", path.display()),
            contents.len() as u64,
        ))
    }

    #[instrument(skip(self), err)]
    async fn get(&self, location: &str) -> Result<String, ArtifactError> {
        let path = self.resolve(location)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(location.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
