//! Content-addressed storage for snapshot and diff bodies.
//!
//! The relational store only ever holds the relative path returned here.

use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("refusing to read blob outside the store: {0}")]
    OutsideRoot(String),
}

fn io_error(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> BlobError {
    let path = path.to_path_buf();
    move |source| BlobError::Io {
        action,
        path,
        source,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    State,
    Diff,
}

impl BlobKind {
    fn dir_name(self) -> &'static str {
        match self {
            Self::State => "state",
            Self::Diff => "diff",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub content_hash: String,
    /// Slash-separated path relative to the store root; this is what gets persisted.
    pub path: String,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn blob_relative_path(kind: BlobKind, search_id: &str, content_hash: &str) -> String {
        let search_dir: String = search_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("{}/{}/{}.json", kind.dir_name(), search_dir, content_hash)
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    pub async fn put(
        &self,
        kind: BlobKind,
        search_id: &str,
        bytes: &[u8],
    ) -> Result<StoredBlob, BlobError> {
        let content_hash = Self::sha256_hex(bytes);
        let path = Self::blob_relative_path(kind, search_id, &content_hash);
        let absolute_path = self.root.join(&path);
        let stored = |deduplicated| StoredBlob {
            content_hash: content_hash.clone(),
            path: path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .map_err(io_error("creating blob directory", &parent))?;

        if fs::try_exists(&absolute_path)
            .await
            .map_err(io_error("checking blob path", &absolute_path))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_error("opening temp blob file", &temp_path))?;
        file.write_all(bytes)
            .await
            .map_err(io_error("writing temp blob file", &temp_path))?;
        file.flush()
            .await
            .map_err(io_error("flushing temp blob file", &temp_path))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(io_error("renaming temp blob into place", &absolute_path)(err))
            }
        }
    }

    pub async fn get(&self, path: &str) -> Result<Vec<u8>, BlobError> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(BlobError::OutsideRoot(path.to_string()));
        }
        let absolute = self.root.join(relative);
        fs::read(&absolute)
            .await
            .map_err(io_error("reading blob", &absolute))
    }

    /// Whether the blob is missing, as opposed to unreadable.
    pub fn is_not_found(err: &BlobError) -> bool {
        matches!(err, BlobError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn blob_hashing_is_stable() {
        let hash = BlobStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn search_ids_are_sanitized_in_paths() {
        let path = BlobStore::blob_relative_path(BlobKind::Diff, "../etc", "abc");
        assert_eq!(path, "diff/___etc/abc.json");
    }

    #[tokio::test]
    async fn atomic_writes_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = BlobStore::new(dir.path());

        let first = store
            .put(BlobKind::State, "search-1", b"{\"features\":{}}")
            .await
            .expect("first put");
        let second = store
            .put(BlobKind::State, "search-1", b"{\"features\":{}}")
            .await
            .expect("second put");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.path, second.path);
        assert_eq!(
            store.get(&first.path).await.expect("get"),
            b"{\"features\":{}}".to_vec()
        );
    }

    #[tokio::test]
    async fn reads_outside_the_root_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = BlobStore::new(dir.path());
        assert!(matches!(
            store.get("../secret").await,
            Err(BlobError::OutsideRoot(_))
        ));
        assert!(store.get("/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn missing_blobs_are_distinguishable() {
        let dir = tempdir().expect("tempdir");
        let store = BlobStore::new(dir.path());
        let err = store.get("state/s1/missing.json").await.unwrap_err();
        assert!(BlobStore::is_not_found(&err));
    }
}
