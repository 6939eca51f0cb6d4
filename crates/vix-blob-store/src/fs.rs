use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::{validate_key, BlobStore, BlobStoreError};

/// Filesystem-backed blob store. Keys map to paths under a root directory;
/// prefix operations are string-prefix on the `/`-joined relative path.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, BlobStoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn collect_keys(root: &Path) -> Result<Vec<String>, std::io::Error> {
        let mut out = Vec::new();
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err),
            };
            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    stack.push(path);
                } else if let Ok(rel) = path.strip_prefix(root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    out.push(key);
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), BlobStoreError> {
        let path = self.path_for(key)?;
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| BlobStoreError::Runtime(format!("blob write task failed: {e}")))??;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobStoreError> {
        let path = self.path_for(key)?;
        let key = key.to_string();
        tokio::task::spawn_blocking(move || match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobStoreError::NotFound(key))
            }
            Err(err) => Err(BlobStoreError::Io(err)),
        })
        .await
        .map_err(|e| BlobStoreError::Runtime(format!("blob read task failed: {e}")))?
    }

    async fn list_with_prefix(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || {
            let keys = Self::collect_keys(&root)?;
            Ok(keys
                .into_iter()
                .filter(|k| k.starts_with(&prefix))
                .collect())
        })
        .await
        .map_err(|e| BlobStoreError::Runtime(format!("blob list task failed: {e}")))?
    }

    async fn remove_with_prefix(&self, prefix: &str) -> Result<(), BlobStoreError> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        tokio::task::spawn_blocking(move || -> Result<(), BlobStoreError> {
            for key in Self::collect_keys(&root)?
                .into_iter()
                .filter(|k| k.starts_with(&prefix))
            {
                let path = root.join(&key);
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(BlobStoreError::Io(err)),
                }
                // Prune directories the delete emptied out.
                let mut dir = path.parent();
                while let Some(d) = dir {
                    if d == root || std::fs::remove_dir(d).is_err() {
                        break;
                    }
                    dir = d.parent();
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| BlobStoreError::Runtime(format!("blob remove task failed: {e}")))?
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), BlobStoreError> {
    use std::io::Write;

    let parent = path
        .parent()
        .ok_or_else(|| BlobStoreError::InvalidKey(path.display().to_string()))?;
    std::fs::create_dir_all(parent)?;

    let mut tmp = path.to_path_buf();
    let suffix = format!(
        "tmp.{}.{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    );
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| BlobStoreError::InvalidKey(path.display().to_string()))?;
    tmp.set_file_name(format!("{file_name}.{suffix}"));

    {
        let mut f = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }

    std::fs::rename(tmp, path)?;
    Ok(())
}
