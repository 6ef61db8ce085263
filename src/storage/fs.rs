//! Local-filesystem [`StorageBackend`].
//!
//! Keys map to paths under a root directory; `/` in a key becomes a nested
//! directory. This is a reference adapter for the embeddable-library use
//! case (single process, local disk); object-storage adapters follow the
//! same trait but live outside the core per spec §1.

use super::StorageBackend;
use crate::error::{DbError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// A `StorageBackend` rooted at a directory on the local filesystem.
#[derive(Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Open (creating if absent) a backend rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(DbError::storage_fail)?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut p = self.root.clone();
        for segment in key.split('/') {
            p.push(segment);
        }
        p
    }
}

#[async_trait]
impl StorageBackend for FsBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DbError::storage_fail(e)),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(DbError::storage_fail)?;
        }
        tokio::fs::write(path, value)
            .await
            .map_err(DbError::storage_fail)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(DbError::storage_fail(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        collect_keys(&self.root, &self.root.join(prefix), &mut out).await?;
        out.sort();
        Ok(out)
    }
}

/// Recursively collect keys (paths relative to `root`, using `/` separators)
/// rooted at `dir`, skipping missing directories.
async fn collect_keys(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(DbError::storage_fail(e)),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(DbError::storage_fail)?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(DbError::storage_fail)?;
            if file_type.is_dir() {
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(root) {
                let key = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
                out.push(key);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_nested_keys() {
        let dir = tempfile::tempdir().unwrap();
        let be = FsBackend::open(dir.path()).await.unwrap();
        be.put("nouns/abc", b"hello".to_vec()).await.unwrap();
        assert_eq!(be.get("nouns/abc").await.unwrap(), Some(b"hello".to_vec()));
        let listed = be.list("nouns/").await.unwrap();
        assert_eq!(listed, vec!["nouns/abc".to_string()]);
        assert!(be.delete("nouns/abc").await.unwrap());
        assert_eq!(be.get("nouns/abc").await.unwrap(), None);
    }
}
