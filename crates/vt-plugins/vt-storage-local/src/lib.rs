//! # vt-storage-local
//! virtual-tourist/crates/vt-plugins/vt-storage-local/src/lib.rs
//! Local filesystem implementation of `ContentStore`.
//! Features: one file per key, directory sharding, atomic writes and a
//! size-bounded in-memory tier in front of the disk.

use async_trait::async_trait;
use bytes::Bytes;
use mini_moka::sync::Cache;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use vt_core::error::{AppError, Result};
use vt_core::traits::ContentStore;

const TEMP_EXTENSION: &str = "tmp";
const LOCK_STRIPES: usize = 16;

pub struct LocalContentStore {
    /// Root directory for all cached images (e.g., "./data/images")
    root_path: PathBuf,
    /// Recently used payloads. Eviction here never touches the disk copy.
    memory: Cache<String, Bytes>,
    /// Orders disk-to-memory promotion against writes and deletes of the same
    /// key, so the memory tier never holds bytes the disk no longer has.
    stripes: Vec<RwLock<()>>,
}

impl LocalContentStore {
    /// `memory_capacity` bounds the in-memory tier in bytes.
    pub async fn new(root: PathBuf, memory_capacity: u64) -> Result<Self> {
        fs::create_dir_all(&root).await.map_err(|e| {
            AppError::Initialization(format!("cache directory {}: {e}", root.display()))
        })?;

        let memory = Cache::builder()
            .weigher(|_key: &String, value: &Bytes| -> u32 {
                value.len().try_into().unwrap_or(u32::MAX)
            })
            .max_capacity(memory_capacity)
            .build();

        Ok(Self {
            root_path: root,
            memory,
            stripes: (0..LOCK_STRIPES).map(|_| RwLock::new(())).collect(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root_path
    }

    /// Generates a sharded path: "ab/abcdef...". One-character keys get a
    /// padded shard ("a_/a") so every entry lives one level below the root.
    fn get_sharded_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        let mut path = self.root_path.clone();
        path.push(format!("{:_<2}", &key[..key.len().min(2)]));
        path.push(key);
        Ok(path)
    }

    fn stripe(&self, key: &str) -> &RwLock<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[hasher.finish() as usize % self.stripes.len()]
    }

    /// Lists files under every shard directory, split into (entries, temp files).
    async fn scan(&self) -> Result<(Vec<String>, Vec<PathBuf>)> {
        let mut entries = Vec::new();
        let mut temps = Vec::new();

        let mut shards = fs::read_dir(&self.root_path).await?;
        while let Some(shard) = shards.next_entry().await? {
            let shard_path = shard.path();
            if !shard.file_type().await?.is_dir() {
                continue;
            }

            let mut files = fs::read_dir(&shard_path).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().is_some_and(|ext| ext == TEMP_EXTENSION) {
                    temps.push(path);
                } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    entries.push(name.to_string());
                }
            }
        }

        Ok((entries, temps))
    }
}

/// Keys become file names, so anything that could escape the root is refused.
fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(AppError::Persistence(format!("invalid content key {key:?}")))
    }
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let cache_key = key.to_string();
        if let Some(bytes) = self.memory.get(&cache_key) {
            debug!(key, "memory hit");
            return Ok(Some(bytes));
        }

        let path = self.get_sharded_path(key)?;
        let _guard = self.stripe(key).read().await;
        match fs::read(&path).await {
            Ok(data) => {
                debug!(key, size = data.len(), "disk hit");
                let bytes = Bytes::from(data);
                self.memory.insert(cache_key, bytes.clone());
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes to a uniquely named temp file and renames it into place.
    async fn put(&self, key: &str, bytes: Bytes) -> Result<()> {
        let target_path = self.get_sharded_path(key)?;
        if let Some(parent) = target_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp_path =
            target_path.with_extension(format!("{}.{TEMP_EXTENSION}", uuid::Uuid::new_v4().simple()));

        let _guard = self.stripe(key).write().await;

        let mut file = fs::File::create(&temp_path).await?;
        let written = match file.write_all(&bytes).await {
            Ok(()) => file.sync_all().await,
            Err(e) => Err(e),
        };
        drop(file);

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&temp_path, &target_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        debug!(key, size = bytes.len(), "stored");
        self.memory.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.get_sharded_path(key)?;
        let _guard = self.stripe(key).write().await;

        self.memory.invalidate(&key.to_string());
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key, "deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.scan().await?.0)
    }

    async fn cleanup_temp_files(&self) -> Result<usize> {
        let (_, temps) = self.scan().await?;
        let mut cleaned = 0;
        for path in temps {
            match fs::remove_file(&path).await {
                Ok(()) => cleaned += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "temp file not removed"),
            }
        }
        Ok(cleaned)
    }
}
