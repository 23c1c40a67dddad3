//! Storage engine: in-memory map plus WAL.
//!
//! Writes append to the WAL, then update the map under an exclusive
//! lock; reads take the shared lock and run in parallel. Version order
//! is last-writer-wins on the timestamp, with ties treated as stale.

use crate::wal::{Wal, WalError, WalOp};
use keyspace_common::{Timestamp, VersionedValue};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Thread-safe engine; share as `Arc<StorageEngine>`.
#[derive(Debug)]
pub struct StorageEngine {
    map: RwLock<HashMap<String, VersionedValue>>,
    wal: Wal,
    data_dir: PathBuf,
}

impl StorageEngine {
    /// Open or create an engine rooted at `data_dir`. The WAL lives at
    /// `<data_dir>/wal.log`. Call [`recover`] before serving traffic.
    ///
    /// [`recover`]: Self::recover
    pub fn open(data_dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir)?;
        let wal = Wal::open(&data_dir.join("wal.log"))?;
        Ok(Self {
            map: RwLock::new(HashMap::new()),
            wal,
            data_dir: data_dir.to_path_buf(),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Store `value` under `key` unless a same-or-newer version exists.
    ///
    /// The WAL record is flushed before the map is touched, even for
    /// writes that turn out stale; replay re-applies the same ordering
    /// rule, so stale records are harmless.
    pub fn put(
        &self,
        key: &str,
        value: &[u8],
        timestamp: Timestamp,
        origin: &str,
    ) -> Result<bool, StorageError> {
        self.wal.append(WalOp::Put, key, value, timestamp, origin)?;

        let mut map = self.map.write().expect("storage map lock");
        if let Some(existing) = map.get(key) {
            if existing.timestamp >= timestamp {
                return Ok(false);
            }
        }
        map.insert(key.to_string(), VersionedValue::new(value, timestamp, origin));
        Ok(true)
    }

    pub fn get(&self, key: &str) -> Option<VersionedValue> {
        self.map.read().expect("storage map lock").get(key).cloned()
    }

    /// Remove `key` if it exists with an older version.
    pub fn delete(&self, key: &str, timestamp: Timestamp) -> Result<bool, StorageError> {
        self.wal.append(WalOp::Delete, key, b"", timestamp, "")?;

        let mut map = self.map.write().expect("storage map lock");
        match map.get(key) {
            None => Ok(false),
            Some(existing) if existing.timestamp >= timestamp => Ok(false),
            Some(_) => {
                map.remove(key);
                Ok(true)
            }
        }
    }

    /// [`put`] taking a full [`VersionedValue`]; the replication path uses
    /// this for peer writes and read repair, which makes retries idempotent.
    ///
    /// [`put`]: Self::put
    pub fn conditional_put(&self, key: &str, vv: &VersionedValue) -> Result<bool, StorageError> {
        self.put(key, &vv.value, vv.timestamp, &vv.origin)
    }

    /// Apply a batch under the monotonic rule, logging each accepted entry.
    pub fn bulk_put(&self, entries: &[(String, VersionedValue)]) -> Result<(), StorageError> {
        for (key, vv) in entries {
            self.conditional_put(key, vv)?;
        }
        Ok(())
    }

    /// Unconditional removal, bypassing version checks. Administrative
    /// use only; not logged.
    pub fn remove_keys(&self, keys: &[String]) {
        let mut map = self.map.write().expect("storage map lock");
        for key in keys {
            map.remove(key);
        }
    }

    /// Snapshot of every (key, value) pair, sorted by key.
    pub fn all_data(&self) -> Vec<(String, VersionedValue)> {
        let map = self.map.read().expect("storage map lock");
        let mut entries: Vec<_> = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.map.read().expect("storage map lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild the map from the WAL.
    ///
    /// Entries apply in file order under the same monotonic rule as live
    /// traffic, so replay is idempotent with respect to log order.
    /// Returns the number of entries that changed the map.
    pub fn recover(&self) -> Result<usize, StorageError> {
        let entries = self.wal.replay()?;
        let total = entries.len();
        let mut applied = 0usize;

        let mut map = self.map.write().expect("storage map lock");
        for entry in entries {
            match entry.op {
                WalOp::Put => {
                    let newer = map
                        .get(&entry.key)
                        .map_or(true, |existing| existing.timestamp < entry.timestamp);
                    if newer {
                        map.insert(
                            entry.key,
                            VersionedValue::new(entry.value, entry.timestamp, entry.origin),
                        );
                        applied += 1;
                    }
                }
                WalOp::Delete => {
                    let newer = map
                        .get(&entry.key)
                        .is_some_and(|existing| existing.timestamp < entry.timestamp);
                    if newer {
                        map.remove(&entry.key);
                        applied += 1;
                    }
                }
            }
        }

        tracing::info!(
            entries = total,
            applied,
            keys = map.len(),
            "WAL recovery complete"
        );
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::Rng;
    use tempfile::TempDir;

    fn open_engine(dir: &TempDir) -> StorageEngine {
        StorageEngine::open(dir.path()).unwrap()
    }

    #[test]
    fn test_basic_put_get() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);

        assert!(engine.put("user:1001", b"{\"name\":\"N\"}", 100, "n1").unwrap());
        let vv = engine.get("user:1001").unwrap();
        assert_eq!(vv.value, b"{\"name\":\"N\"}");
        assert_eq!(vv.timestamp, 100);
        assert_eq!(vv.origin, "n1");
    }

    #[test]
    fn test_stale_write_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);

        assert!(engine.put("k", b"new", 200, "n1").unwrap());
        assert!(!engine.put("k", b"old", 100, "n1").unwrap());

        let vv = engine.get("k").unwrap();
        assert_eq!(vv.value, b"new");
        assert_eq!(vv.timestamp, 200);
    }

    #[test]
    fn test_equal_timestamp_is_stale() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);

        assert!(engine.put("k", b"first", 100, "n1").unwrap());
        assert!(!engine.put("k", b"second", 100, "n2").unwrap());
        assert_eq!(engine.get("k").unwrap().value, b"first");
    }

    #[test]
    fn test_delete_semantics() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);

        // Delete on a missing key is a no-op.
        assert!(!engine.delete("k", 100).unwrap());

        engine.put("k", b"v", 100, "n1").unwrap();
        // Stale and tied deletes are rejected.
        assert!(!engine.delete("k", 50).unwrap());
        assert!(!engine.delete("k", 100).unwrap());
        assert!(engine.get("k").is_some());

        assert!(engine.delete("k", 150).unwrap());
        assert!(engine.get("k").is_none());
    }

    #[test]
    fn test_crash_recovery() {
        let dir = TempDir::new().unwrap();
        {
            let engine = open_engine(&dir);
            engine.put("k1", b"v1", 100, "n1").unwrap();
            engine.put("k2", b"v2", 200, "n1").unwrap();
            engine.delete("k1", 300).unwrap();
        }

        let engine = open_engine(&dir);
        engine.recover().unwrap();
        assert!(engine.get("k1").is_none());
        assert_eq!(engine.get("k2").unwrap().value, b"v2");
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_recovery_applies_monotonic_rule() {
        let dir = TempDir::new().unwrap();
        {
            let engine = open_engine(&dir);
            // The stale write hits the WAL too; replay must not resurrect it.
            engine.put("k", b"new", 200, "n1").unwrap();
            engine.put("k", b"old", 100, "n1").unwrap();
        }

        let engine = open_engine(&dir);
        engine.recover().unwrap();
        let vv = engine.get("k").unwrap();
        assert_eq!(vv.value, b"new");
        assert_eq!(vv.timestamp, 200);
    }

    #[test]
    fn test_recovered_origin_survives() {
        let dir = TempDir::new().unwrap();
        {
            let engine = open_engine(&dir);
            engine.put("k", b"v", 100, "node7").unwrap();
        }
        let engine = open_engine(&dir);
        engine.recover().unwrap();
        assert_eq!(engine.get("k").unwrap().origin, "node7");
    }

    #[test]
    fn test_conditional_put_idempotent() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);

        let vv = VersionedValue::new("v", 100, "n1");
        assert!(engine.conditional_put("k", &vv).unwrap());
        // Replaying the identical write is a rejected tie, state unchanged.
        assert!(!engine.conditional_put("k", &vv).unwrap());
        assert_eq!(engine.get("k").unwrap(), vv);
    }

    #[test]
    fn test_bulk_put_and_all_data() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);

        engine.put("b", b"old", 10, "n1").unwrap();
        let batch = vec![
            ("a".to_string(), VersionedValue::new("1", 5, "n2")),
            ("b".to_string(), VersionedValue::new("new", 20, "n2")),
            ("b".to_string(), VersionedValue::new("stale", 15, "n3")),
        ];
        engine.bulk_put(&batch).unwrap();

        let all = engine.all_data();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, "a");
        assert_eq!(all[1].0, "b");
        assert_eq!(all[1].1.value, b"new");
    }

    #[test]
    fn test_remove_keys_unconditional() {
        let dir = TempDir::new().unwrap();
        let engine = open_engine(&dir);

        engine.put("k1", b"v", 100, "n1").unwrap();
        engine.put("k2", b"v", 100, "n1").unwrap();
        engine.remove_keys(&["k1".to_string(), "missing".to_string()]);
        assert!(engine.get("k1").is_none());
        assert!(engine.get("k2").is_some());
    }

    #[test]
    fn test_parallel_reads_and_writes() {
        let dir = TempDir::new().unwrap();
        let engine = std::sync::Arc::new(open_engine(&dir));

        let mut handles = Vec::new();
        for t in 0..4u64 {
            let engine = engine.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50u64 {
                    let ts = t * 1000 + i;
                    engine.put("shared", b"x", ts, "n").unwrap();
                    let _ = engine.get("shared");
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // Highest timestamp wins regardless of interleaving.
        assert_eq!(engine.get("shared").unwrap().timestamp, 3 * 1000 + 49);
    }

    /// Applied in timestamp order, the surviving value for a key is the
    /// newest PUT unless a newer DELETE follows every PUT.
    #[test]
    fn test_lww_over_random_histories() {
        let mut rng = rand::thread_rng();

        for _ in 0..20 {
            let dir = TempDir::new().unwrap();
            let engine = open_engine(&dir);

            let mut ts_pool: Vec<u64> = (1..=30).collect();
            ts_pool.shuffle(&mut rng);
            let n_ops = rng.gen_range(5..=15);

            let mut ops: Vec<(bool, u64)> = ts_pool[..n_ops]
                .iter()
                .map(|&ts| (rng.gen_bool(0.7), ts))
                .collect();
            ops.sort_by_key(|&(_, ts)| ts);

            for &(is_put, ts) in &ops {
                if is_put {
                    engine.put("k", format!("v{ts}").as_bytes(), ts, "n").unwrap();
                } else {
                    let _ = engine.delete("k", ts).unwrap();
                }
            }

            let max_put = ops.iter().filter(|o| o.0).map(|o| o.1).max();
            let max_del = ops.iter().filter(|o| !o.0).map(|o| o.1).max();
            let expected = match (max_put, max_del) {
                (Some(p), Some(d)) if d > p => None,
                (Some(p), _) => Some(p),
                (None, _) => None,
            };

            match expected {
                Some(ts) => {
                    let vv = engine.get("k").expect("key should survive");
                    assert_eq!(vv.timestamp, ts);
                    assert_eq!(vv.value, format!("v{ts}").as_bytes());
                }
                None => assert!(engine.get("k").is_none()),
            }

            // And recovery reproduces the same final state.
            let recovered = open_engine(&dir);
            recovered.recover().unwrap();
            assert_eq!(recovered.get("k"), engine.get("k"));
        }
    }
}
