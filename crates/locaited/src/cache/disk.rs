//! On-disk backing for the cache store
//!
//! One JSON file per entry under `<root>/<namespace>/<digest>.json`. Entries
//! are written to a staging file and renamed into place, so a reader never
//! sees a partial entry.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use super::{CacheKey, CachedValue, Namespace};

#[derive(Debug, Clone)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Open (and create if needed) the directory tree under `root`
    pub async fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        for namespace in Namespace::ALL {
            tokio::fs::create_dir_all(root.join(namespace.as_str())).await?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(key.namespace().as_str())
            .join(format!("{}.json", key.digest()))
    }

    pub async fn write(&self, key: &CacheKey, value: &CachedValue) -> io::Result<()> {
        let path = self.path_for(key);
        let staging = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        let body = serde_json::to_vec(value)?;
        tokio::fs::write(&staging, body).await?;
        if let Err(err) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(err);
        }
        Ok(())
    }

    /// Every entry younger than `ttl`. Expired and unreadable files are deleted.
    pub async fn load(&self, ttl: Duration) -> io::Result<Vec<(CacheKey, CachedValue)>> {
        let (live, _) = self.scan(ttl).await?;
        Ok(live)
    }

    /// Delete expired and unreadable files, returning how many were removed
    pub async fn purge_expired(&self, ttl: Duration) -> io::Result<usize> {
        let (_, removed) = self.scan(ttl).await?;
        Ok(removed)
    }

    /// Remove every stored entry
    pub async fn clear(&self) -> io::Result<()> {
        for namespace in Namespace::ALL {
            let dir = self.root.join(namespace.as_str());
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    async fn scan(&self, ttl: Duration) -> io::Result<(Vec<(CacheKey, CachedValue)>, usize)> {
        let mut live = Vec::new();
        let mut removed = 0;

        for namespace in Namespace::ALL {
            let dir = self.root.join(namespace.as_str());
            if !dir.exists() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                    continue;
                }
                let Some(digest) = path.file_stem().and_then(|stem| stem.to_str()) else {
                    continue;
                };
                let key = CacheKey::from_digest(namespace, digest.to_string());

                match read_entry(&path).await {
                    Some(value) if !value.remaining_ttl(ttl).is_zero() => live.push((key, value)),
                    _ => {
                        if tokio::fs::remove_file(&path).await.is_ok() {
                            removed += 1;
                        }
                    }
                }
            }
        }

        Ok((live, removed))
    }
}

async fn read_entry(path: &Path) -> Option<CachedValue> {
    let bytes = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!("[CACHE] Discarding unreadable entry {}: {}", path.display(), err);
            None
        }
    }
}
