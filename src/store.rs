use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use rkyv::AlignedVec;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

use crate::config::Config;
use crate::request::{Request, UrlHash};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("Database creation error: {0}")]
    RedbCreate(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),
}

/// Persisted keyed table holding serialized [`Request`] rows, keyed by the
/// fixed-length URL hash. One instance backs either a single host shard or
/// the whole frontier, depending on the balancer design.
pub struct RequestStore {
    db: Database,
    path: PathBuf,
}

impl RequestStore {
    const REQUESTS: TableDefinition<'_, &[u8], &[u8]> = TableDefinition::new("requests");

    /// Open or create the backing file. A failed open is retried once with a
    /// minimal cache configuration before giving up, so memory exhaustion on
    /// first open does not immediately kill the scheduler instance.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = match Database::builder()
            .set_cache_size(Config::STORE_CACHE_BYTES)
            .create(&path)
        {
            Ok(db) => db,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "store open failed, retrying with minimal cache"
                );
                Database::builder()
                    .set_cache_size(Config::STORE_CACHE_FALLBACK_BYTES)
                    .create(&path)?
            }
        };

        // Open the table once so the file always contains it.
        let write_txn = db.begin_write()?;
        {
            let _table = write_txn.open_table(Self::REQUESTS)?;
        }
        write_txn.commit()?;

        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn put(&self, request: &Request) -> Result<(), StoreError> {
        let serialized = encode(request)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(Self::REQUESTS)?;
            table.insert(request.url_hash.as_bytes(), serialized.as_ref())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn get(&self, hash: &UrlHash) -> Result<Option<Request>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(Self::REQUESTS)?;
        match table.get(hash.as_bytes())? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    pub fn has(&self, hash: &UrlHash) -> Result<bool, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(Self::REQUESTS)?;
        Ok(table.get(hash.as_bytes())?.is_some())
    }

    /// Remove one entry, returning whether it was present.
    pub fn remove(&self, hash: &UrlHash) -> Result<bool, StoreError> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(Self::REQUESTS)?;
            // bound to a local so the access guard drops before the table
            let present = table.remove(hash.as_bytes())?.is_some();
            present
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Remove one entry and return its decoded row, if it was present.
    pub fn take(&self, hash: &UrlHash) -> Result<Option<Request>, StoreError> {
        let write_txn = self.db.begin_write()?;
        let value = {
            let mut table = write_txn.open_table(Self::REQUESTS)?;
            // bound to a local so the access guard drops before the table
            let bytes = table.remove(hash.as_bytes())?.map(|g| g.value().to_vec());
            bytes
        };
        write_txn.commit()?;
        match value {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove an arbitrary entry. Rows that fail to decode are dropped and
    /// skipped so one corrupt row cannot stall the frontier.
    pub fn take_any(&self) -> Result<Option<Request>, StoreError> {
        loop {
            let write_txn = self.db.begin_write()?;
            let value = {
                let mut table = write_txn.open_table(Self::REQUESTS)?;
                let first_key: Option<Vec<u8>> = {
                    let mut iter = table.iter()?;
                    match iter.next() {
                        Some(entry) => Some(entry?.0.value().to_vec()),
                        None => None,
                    }
                };
                match first_key {
                    Some(key) => table.remove(key.as_slice())?.map(|g| g.value().to_vec()),
                    None => {
                        drop(table);
                        write_txn.abort()?;
                        return Ok(None);
                    }
                }
            };
            write_txn.commit()?;
            match value.map(|bytes| decode(&bytes)) {
                Some(Ok(request)) => return Ok(Some(request)),
                Some(Err(e)) => {
                    warn!(path = %self.path.display(), error = %e, "dropping undecodable row");
                    continue;
                }
                None => continue,
            }
        }
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(Self::REQUESTS)?;
        Ok(table.len()? as usize)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Visit rows in key order until the callback returns `false` or `limit`
    /// rows were seen. Undecodable rows are reported to the callback as
    /// `None` together with their key so callers can decide to delete them.
    pub fn scan<F>(&self, limit: usize, mut visit: F) -> Result<(), StoreError>
    where
        F: FnMut(UrlHash, Option<Request>) -> bool,
    {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(Self::REQUESTS)?;
        let mut seen = 0usize;
        for entry in table.iter()? {
            let (key_guard, value_guard) = entry?;
            let key_bytes = key_guard.value();
            let mut key = [0u8; crate::request::URL_HASH_LEN];
            if key_bytes.len() != key.len() {
                continue;
            }
            key.copy_from_slice(key_bytes);
            let request = decode(value_guard.value()).ok();
            if !visit(UrlHash(key), request) {
                break;
            }
            seen += 1;
            if seen >= limit {
                break;
            }
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            write_txn.delete_table(Self::REQUESTS)?;
            let _table = write_txn.open_table(Self::REQUESTS)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Close the store and delete its backing file. Used by host queues that
    /// drained completely, to avoid file-count growth for long-tail hosts.
    pub fn delete(self) -> Result<(), StoreError> {
        let path = self.path.clone();
        drop(self.db);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}

fn encode(request: &Request) -> Result<AlignedVec, StoreError> {
    rkyv::to_bytes::<_, 512>(request)
        .map_err(|e| StoreError::Serialization(format!("serialize failed: {}", e)))
}

fn decode(bytes: &[u8]) -> Result<Request, StoreError> {
    let mut aligned = AlignedVec::new();
    aligned.extend_from_slice(bytes);
    unsafe { rkyv::from_bytes_unchecked::<Request>(&aligned) }
        .map_err(|e| StoreError::Serialization(format!("deserialize failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use url::Url;

    fn req(url: &str) -> Request {
        Request::new(Url::parse(url).unwrap(), 1, "p".to_string(), None, None)
    }

    fn open_store(dir: &TempDir) -> RequestStore {
        RequestStore::open(dir.path().join("test.stack")).unwrap()
    }

    #[test]
    fn test_put_get_remove() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let r = req("http://a.example/1");

        store.put(&r).unwrap();
        assert!(store.has(&r.url_hash).unwrap());
        assert_eq!(store.len().unwrap(), 1);

        let loaded = store.get(&r.url_hash).unwrap().unwrap();
        assert_eq!(loaded.url, r.url);
        assert_eq!(loaded.depth, r.depth);
        assert_eq!(loaded.url_hash, r.url_hash);

        assert!(store.remove(&r.url_hash).unwrap());
        assert!(!store.has(&r.url_hash).unwrap());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_take_returns_removed_row() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let r = req("http://a.example/1");
        store.put(&r).unwrap();

        let taken = store.take(&r.url_hash).unwrap().unwrap();
        assert_eq!(taken.url_hash, r.url_hash);
        assert_eq!(taken.url, r.url);
        assert!(store.take(&r.url_hash).unwrap().is_none());
        assert!(!store.remove(&r.url_hash).unwrap());
    }

    #[test]
    fn test_take_any_drains_everything() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        for i in 0..5 {
            store.put(&req(&format!("http://a.example/{}", i))).unwrap();
        }
        let mut seen = std::collections::HashSet::new();
        while let Some(r) = store.take_any().unwrap() {
            seen.insert(r.url_hash);
        }
        assert_eq!(seen.len(), 5);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_scan_limit() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        for i in 0..10 {
            store.put(&req(&format!("http://a.example/{}", i))).unwrap();
        }
        let mut count = 0;
        store.scan(4, |_, _| {
            count += 1;
            true
        }).unwrap();
        assert_eq!(count, 4);
    }

    #[test]
    fn test_delete_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.stack");
        let store = RequestStore::open(&path).unwrap();
        store.put(&req("http://a.example/1")).unwrap();
        store.delete().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_reopen_preserves_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("persist.stack");
        let r = req("http://a.example/1");
        {
            let store = RequestStore::open(&path).unwrap();
            store.put(&r).unwrap();
        }
        let store = RequestStore::open(&path).unwrap();
        assert!(store.has(&r.url_hash).unwrap());
    }
}
