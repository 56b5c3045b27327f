//! Append-only JSON-lines store.
//!
//! One file per cache name under the configured directory. Records are only
//! ever appended; a reader gets every record that parses, in write order.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::pools::PoolCacheRecord;

/// Durable store of verified pool identities.
#[async_trait]
pub trait PoolStore: Send + Sync {
    async fn add(&self, record: PoolCacheRecord) -> Result<()>;
    async fn get_all_records(&self) -> Result<Vec<PoolCacheRecord>>;
}

pub struct PermanentCache<T> {
    path: PathBuf,
    // keeps concurrent appends from interleaving within a line
    write_lock: Mutex<()>,
    _record: PhantomData<fn() -> T>,
}

impl<T> PermanentCache<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(dir: impl AsRef<Path>, name: &str) -> Self {
        Self {
            path: dir.as_ref().join(format!("{}.jsonl", name)),
            write_lock: Mutex::new(()),
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn add(&self, record: &T) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating cache dir {}", parent.display()))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("appending to {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }

    /// A missing file is an empty cache. Lines that do not parse are skipped.
    pub async fn get_all_records(&self) -> Result<Vec<T>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Cache {} does not exist yet", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()));
            }
        };

        let mut records = Vec::new();
        for (n, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(line) {
                Ok(r) => records.push(r),
                Err(e) => warn!(
                    "⚠️ Skipping malformed line {} in {}: {}",
                    n + 1,
                    self.path.display(),
                    e
                ),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl PoolStore for PermanentCache<PoolCacheRecord> {
    async fn add(&self, record: PoolCacheRecord) -> Result<()> {
        PermanentCache::add(self, &record).await
    }

    async fn get_all_records(&self) -> Result<Vec<PoolCacheRecord>> {
        PermanentCache::get_all_records(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Address;

    fn record(fee: u32) -> PoolCacheRecord {
        PoolCacheRecord {
            address: Some(Address::random()),
            token0: Address::random(),
            token1: Address::random(),
            fee: Some(fee),
            factory: Address::random(),
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache: PermanentCache<PoolCacheRecord> = PermanentCache::new(dir.path(), "uniV3Pools-1");
        assert!(cache.get_all_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_records_survive_reopen_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = record(500);
        let second = record(3_000);
        {
            let cache = PermanentCache::new(dir.path().join("nested"), "uniV3Pools-1");
            cache.add(&first).await.unwrap();
            cache.add(&second).await.unwrap();
        }
        let reopened: PermanentCache<PoolCacheRecord> =
            PermanentCache::new(dir.path().join("nested"), "uniV3Pools-1");
        assert_eq!(reopened.get_all_records().await.unwrap(), vec![first, second]);
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cache: PermanentCache<PoolCacheRecord> = PermanentCache::new(dir.path(), "uniV3Pools-1");
        let good = record(100);
        cache.add(&good).await.unwrap();
        let mut raw = tokio::fs::read_to_string(cache.path()).await.unwrap();
        raw.push_str("{\"token0\": truncated\n\n");
        tokio::fs::write(cache.path(), raw).await.unwrap();

        assert_eq!(cache.get_all_records().await.unwrap(), vec![good]);
    }
}
