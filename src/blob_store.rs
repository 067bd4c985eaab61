//! Blob storage collaborator used by activities.
//!
//! `put` overwrites, so an activity that runs twice (at-least-once delivery)
//! leaves the same bytes behind.
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobError {
    NotFound(String),
    /// Names must be a single path segment.
    InvalidName(String),
    /// I/O failure; worth retrying.
    Io { name: String, message: String },
}

impl BlobError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BlobError::Io { .. })
    }
}

impl std::fmt::Display for BlobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobError::NotFound(name) => write!(f, "blob not found: {name}"),
            BlobError::InvalidName(name) => write!(f, "invalid blob name: {name:?}"),
            BlobError::Io { name, message } => write!(f, "blob i/o error on {name}: {message}"),
        }
    }
}

impl std::error::Error for BlobError {}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `bytes` under `name`, replacing any previous content.
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<(), BlobError>;

    async fn get(&self, name: &str) -> Result<Vec<u8>, BlobError>;

    /// Blob names, sorted.
    async fn list(&self) -> Result<Vec<String>, BlobError>;
}

fn validate_name(name: &str) -> Result<(), BlobError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.starts_with(".tmp-");
    if bad {
        Err(BlobError::InvalidName(name.to_string()))
    } else {
        Ok(())
    }
}

/// Where blobs live: `<root>/<container>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BlobStoreConfig {
    pub root: PathBuf,
    pub container: String,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/blobs"),
            container: "durable".to_string(),
        }
    }
}

impl BlobStoreConfig {
    pub fn container_dir(&self) -> PathBuf {
        self.root.join(&self.container)
    }
}

/// Directory-backed store. Writes go to a temp file that is renamed into
/// place, so readers never observe a partial blob.
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    pub fn new(config: &BlobStoreConfig) -> Self {
        Self {
            dir: config.container_dir(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn io_err(name: &str, e: std::io::Error) -> BlobError {
        BlobError::Io {
            name: name.to_string(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<(), BlobError> {
        validate_name(name)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Self::io_err(name, e))?;
        let tmp = self.dir.join(format!(".tmp-{}-{}", uuid::Uuid::new_v4().simple(), name));
        tokio::fs::write(&tmp, bytes).await.map_err(|e| Self::io_err(name, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, self.dir.join(name)).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Self::io_err(name, e));
        }
        tracing::debug!(target: "duratask::blob_store", blob = %name, bytes = bytes.len(), "Blob written");
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, BlobError> {
        validate_name(name)?;
        match tokio::fs::read(self.dir.join(name)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BlobError::NotFound(name.to_string())),
            Err(e) => Err(Self::io_err(name, e)),
        }
    }

    async fn list(&self) -> Result<Vec<String>, BlobError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_err("<list>", e)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| Self::io_err("<list>", e))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(".tmp-") {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<(), BlobError> {
        validate_name(name)?;
        self.blobs.lock().await.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(name.to_string()))
    }

    async fn list(&self) -> Result<Vec<String>, BlobError> {
        let mut names: Vec<String> = self.blobs.lock().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
