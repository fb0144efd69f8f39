//! Local filesystem storage.
//!
//! Objects are stored as plain files under a root directory; the key is
//! the relative path.  Writes go to a temp file under `.tmp/`, are
//! fsynced, then renamed into place.

use bytes::Bytes;
use futures::StreamExt;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;

use super::backend::{ByteStream, ObjectStorage, StorageFuture};
use crate::errors::{StorageError, StorageResult};

const TMP_DIR: &str = ".tmp";

fn io_error(context: &str, key: &str, err: std::io::Error) -> StorageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StorageError::not_found(key)
    } else {
        StorageError::Internal(anyhow::anyhow!("{context} {key}: {err}"))
    }
}

/// Stores objects on the local filesystem.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Create a `LocalStorage` rooted at `root`, creating the directory
    /// if needed.
    pub fn new(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(TMP_DIR))?;
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of `key`.  Keys that would escape the root are
    /// rejected.
    pub fn full_path(&self, key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(key);
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(StorageError::invalid(format!(
                        "key escapes storage root: {key}"
                    )))
                }
            }
        }
        Ok(self.root.join(relative))
    }

    fn temp_path(&self) -> PathBuf {
        self.root
            .join(TMP_DIR)
            .join(format!("tmp-{}", uuid::Uuid::new_v4()))
    }

    fn prepare_parent(path: &Path, key: &str) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_error("mkdir", key, e))?;
        }
        Ok(())
    }
}

impl ObjectStorage for LocalStorage {
    fn save(&self, key: &str, data: Bytes) -> StorageFuture<'_, String> {
        let key = key.to_string();
        Box::pin(async move {
            let final_path = self.full_path(&key)?;
            Self::prepare_parent(&final_path, &key)?;

            let tmp_path = self.temp_path();
            let write = || -> std::io::Result<()> {
                let mut file = std::fs::File::create(&tmp_path)?;
                file.write_all(&data)?;
                file.sync_all()?;
                std::fs::rename(&tmp_path, &final_path)
            };
            if let Err(e) = write() {
                let _ = std::fs::remove_file(&tmp_path);
                return Err(io_error("write", &key, e));
            }

            Ok(final_path.to_string_lossy().into_owned())
        })
    }

    fn save_by_stream(&self, key: &str, mut stream: ByteStream) -> StorageFuture<'_, String> {
        let key = key.to_string();
        Box::pin(async move {
            let final_path = self.full_path(&key)?;
            Self::prepare_parent(&final_path, &key)?;

            let tmp_path = self.temp_path();
            let result: std::io::Result<()> = async {
                let mut file = tokio::fs::File::create(&tmp_path).await?;
                while let Some(chunk) = stream.next().await {
                    file.write_all(&chunk?).await?;
                }
                file.sync_all().await?;
                drop(file);
                tokio::fs::rename(&tmp_path, &final_path).await
            }
            .await;

            if let Err(e) = result {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(io_error("write", &key, e));
            }

            Ok(final_path.to_string_lossy().into_owned())
        })
    }

    fn get(&self, key: &str) -> StorageFuture<'_, Bytes> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.full_path(&key)?;
            if path.is_dir() {
                return Err(StorageError::not_found(key));
            }
            let data = tokio::fs::read(&path)
                .await
                .map_err(|e| io_error("read", &key, e))?;
            Ok(Bytes::from(data))
        })
    }

    fn delete(&self, key: &str) -> StorageFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.full_path(&key)?;
            if !path.is_file() {
                return Err(StorageError::not_found(key));
            }
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| io_error("delete", &key, e))
        })
    }

    fn exists(&self, key: &str) -> StorageFuture<'_, bool> {
        let key = key.to_string();
        Box::pin(async move {
            let path = self.full_path(&key)?;
            match tokio::fs::metadata(&path).await {
                Ok(meta) => Ok(meta.is_file()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(io_error("stat", &key, e)),
            }
        })
    }

    /// Non-recursive listing of the directory `prefix`.  Subdirectories are
    /// reported with a trailing `/`, unlike the bucket-backed clients which
    /// never return such entries.  A missing directory lists as empty.
    fn list(&self, prefix: &str) -> StorageFuture<'_, Vec<String>> {
        let prefix = prefix.to_string();
        Box::pin(async move {
            let dir = self.full_path(&prefix)?;
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(io_error("list", &prefix, e)),
            };

            let mut names = Vec::new();
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error("list", &prefix, e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name == TMP_DIR {
                    continue;
                }
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| io_error("list", &prefix, e))?;
                if file_type.is_dir() {
                    names.push(format!("{prefix}{name}/"));
                } else {
                    names.push(format!("{prefix}{name}"));
                }
            }
            names.sort();
            Ok(names)
        })
    }
}

// -- Tests -------------------------------------------------------------------
