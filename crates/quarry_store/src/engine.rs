//! Ordered key-value engine abstraction.
//!
//! The MVCC layer and replica storage sit on top of this trait pair:
//! `EngineReader` for read views (engines, snapshots, and write batches
//! alike) and `Engine` for the durable store itself. Write batches
//! accumulate mutations and read through to their base so logic like
//! conditional puts sees its own buffered writes.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use crate::data::StoreCapacity;

/// Read access to an ordered byte keyspace.
pub trait EngineReader: Send + Sync {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;

    /// Visit `[lo, hi)` in key order (descending when `reverse`). The
    /// callback returns true to stop early.
    fn iterate(
        &self,
        lo: &[u8],
        hi: &[u8],
        reverse: bool,
        f: &mut dyn FnMut(&[u8], &[u8]) -> anyhow::Result<bool>,
    ) -> anyhow::Result<()>;

    /// First `max` pairs in `[lo, hi)`; `max == 0` means unlimited.
    fn scan(&self, lo: &[u8], hi: &[u8], max: usize) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        self.iterate(lo, hi, false, &mut |k, v| {
            out.push((k.to_vec(), v.to_vec()));
            Ok(max > 0 && out.len() >= max)
        })?;
        Ok(out)
    }
}

/// The durable engine. Single-key writes are durable when they return;
/// multi-key atomicity goes through `apply_batch`.
pub trait Engine: EngineReader {
    fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()>;

    fn delete(&self, key: &[u8]) -> anyhow::Result<()>;

    /// Apply a set of writes atomically. `None` values are deletions.
    fn apply_batch(&self, writes: Vec<(Vec<u8>, Option<Vec<u8>>)>) -> anyhow::Result<()>;

    /// A consistent read-only view of the engine as of now.
    fn new_snapshot(&self) -> anyhow::Result<Box<dyn EngineReader>>;

    fn capacity(&self) -> anyhow::Result<StoreCapacity>;

    /// GC hints for the engine's compactions: transaction records and
    /// response cache entries older than these walltimes are garbage.
    fn set_gc_timeouts(&self, min_txn_ts: i64, min_response_cache_ts: i64);

    fn gc_timeouts(&self) -> (i64, i64);
}

/// Scoped write accumulator over an engine. Reads merge the buffered
/// writes over the base; `commit` applies them atomically; dropping the
/// batch discards them.
pub struct Batch<'a> {
    base: &'a dyn Engine,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a> Batch<'a> {
    pub fn new(base: &'a dyn Engine) -> Self {
        Self {
            base,
            writes: BTreeMap::new(),
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.writes.insert(key.to_vec(), Some(value.to_vec()));
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.writes.insert(key.to_vec(), None);
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn commit(self) -> anyhow::Result<()> {
        if self.writes.is_empty() {
            return Ok(());
        }
        self.base.apply_batch(self.writes.into_iter().collect())
    }
}

impl EngineReader for Batch<'_> {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        if let Some(buffered) = self.writes.get(key) {
            return Ok(buffered.clone());
        }
        self.base.get(key)
    }

    fn iterate(
        &self,
        lo: &[u8],
        hi: &[u8],
        reverse: bool,
        f: &mut dyn FnMut(&[u8], &[u8]) -> anyhow::Result<bool>,
    ) -> anyhow::Result<()> {
        // Merge the buffered writes with the base view. The base portion
        // is materialized first; real batches stay small relative to the
        // spans they touch.
        let mut base_rows: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        self.base.iterate(lo, hi, false, &mut |k, v| {
            base_rows.push((k.to_vec(), v.to_vec()));
            Ok(false)
        })?;
        let buffered: Vec<(&Vec<u8>, &Option<Vec<u8>>)> = self
            .writes
            .range::<[u8], _>((Bound::Included(lo), Bound::Excluded(hi)))
            .collect();

        let mut merged: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(base_rows.len());
        let mut bi = 0usize;
        for (key, maybe_val) in buffered {
            while bi < base_rows.len() && base_rows[bi].0 < *key {
                let (k, v) = std::mem::take(&mut base_rows[bi]);
                merged.push((k, v));
                bi += 1;
            }
            if bi < base_rows.len() && base_rows[bi].0 == *key {
                bi += 1;
            }
            if let Some(val) = maybe_val {
                merged.push((key.clone(), val.clone()));
            }
        }
        while bi < base_rows.len() {
            let (k, v) = std::mem::take(&mut base_rows[bi]);
            merged.push((k, v));
            bi += 1;
        }

        if reverse {
            for (k, v) in merged.iter().rev() {
                if f(k, v)? {
                    return Ok(());
                }
            }
        } else {
            for (k, v) in &merged {
                if f(k, v)? {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

// ---- in-memory engine ----

/// BTreeMap-backed engine used by tests and simulations.
pub struct MemEngine {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    min_txn_ts: AtomicI64,
    min_rcache_ts: AtomicI64,
}

impl MemEngine {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BTreeMap::new()),
            min_txn_ts: AtomicI64::new(0),
            min_rcache_ts: AtomicI64::new(0),
        }
    }

    fn snapshot_range(&self, lo: &[u8], hi: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let inner = self.inner.read().expect("mem engine lock");
        inner
            .range::<[u8], _>((Bound::Included(lo), Bound::Excluded(hi)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Default for MemEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineReader for MemEngine {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.inner.read().expect("mem engine lock").get(key).cloned())
    }

    fn iterate(
        &self,
        lo: &[u8],
        hi: &[u8],
        reverse: bool,
        f: &mut dyn FnMut(&[u8], &[u8]) -> anyhow::Result<bool>,
    ) -> anyhow::Result<()> {
        // Materialize the range before invoking callbacks so a callback
        // may issue nested reads without re-entering the lock.
        let rows = self.snapshot_range(lo, hi);
        if reverse {
            for (k, v) in rows.iter().rev() {
                if f(k, v)? {
                    return Ok(());
                }
            }
        } else {
            for (k, v) in &rows {
                if f(k, v)? {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

impl Engine for MemEngine {
    fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.inner
            .write()
            .expect("mem engine lock")
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        self.inner.write().expect("mem engine lock").remove(key);
        Ok(())
    }

    fn apply_batch(&self, writes: Vec<(Vec<u8>, Option<Vec<u8>>)>) -> anyhow::Result<()> {
        let mut inner = self.inner.write().expect("mem engine lock");
        for (key, value) in writes {
            match value {
                Some(v) => {
                    inner.insert(key, v);
                }
                None => {
                    inner.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn new_snapshot(&self) -> anyhow::Result<Box<dyn EngineReader>> {
        let copy = self.inner.read().expect("mem engine lock").clone();
        Ok(Box::new(MemSnapshot { inner: copy }))
    }

    fn capacity(&self) -> anyhow::Result<StoreCapacity> {
        let used: u64 = self
            .inner
            .read()
            .expect("mem engine lock")
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum();
        let capacity = 1 << 30;
        Ok(StoreCapacity {
            capacity,
            available: capacity.saturating_sub(used),
        })
    }

    fn set_gc_timeouts(&self, min_txn_ts: i64, min_response_cache_ts: i64) {
        self.min_txn_ts.store(min_txn_ts, Ordering::SeqCst);
        self.min_rcache_ts
            .store(min_response_cache_ts, Ordering::SeqCst);
    }

    fn gc_timeouts(&self) -> (i64, i64) {
        (
            self.min_txn_ts.load(Ordering::SeqCst),
            self.min_rcache_ts.load(Ordering::SeqCst),
        )
    }
}

struct MemSnapshot {
    inner: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl EngineReader for MemSnapshot {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.inner.get(key).cloned())
    }

    fn iterate(
        &self,
        lo: &[u8],
        hi: &[u8],
        reverse: bool,
        f: &mut dyn FnMut(&[u8], &[u8]) -> anyhow::Result<bool>,
    ) -> anyhow::Result<()> {
        let range = self
            .inner
            .range::<[u8], _>((Bound::Included(lo), Bound::Excluded(hi)));
        if reverse {
            for (k, v) in range.rev() {
                if f(k, v)? {
                    return Ok(());
                }
            }
        } else {
            for (k, v) in range {
                if f(k, v)? {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

// ---- fjall engine ----

/// On-disk engine over a fjall keyspace with a single ordered partition.
pub struct FjallEngine {
    keyspace: Arc<fjall::Keyspace>,
    kv: fjall::PartitionHandle,
    min_txn_ts: AtomicI64,
    min_rcache_ts: AtomicI64,
}

impl FjallEngine {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let keyspace = Arc::new(fjall::Config::new(path).open()?);
        let kv = keyspace.open_partition("kv", fjall::PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            kv,
            min_txn_ts: AtomicI64::new(0),
            min_rcache_ts: AtomicI64::new(0),
        })
    }
}

impl EngineReader for FjallEngine {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.kv.get(key)?.map(|v| v.to_vec()))
    }

    fn iterate(
        &self,
        lo: &[u8],
        hi: &[u8],
        reverse: bool,
        f: &mut dyn FnMut(&[u8], &[u8]) -> anyhow::Result<bool>,
    ) -> anyhow::Result<()> {
        let range = (
            Bound::Included(lo.to_vec()),
            Bound::Excluded(hi.to_vec()),
        );
        if reverse {
            for item in self.kv.range(range).rev() {
                let (k, v) = item?;
                if f(k.as_ref(), v.as_ref())? {
                    return Ok(());
                }
            }
        } else {
            for item in self.kv.range(range) {
                let (k, v) = item?;
                if f(k.as_ref(), v.as_ref())? {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

impl Engine for FjallEngine {
    fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.kv.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        self.kv.remove(key)?;
        Ok(())
    }

    fn apply_batch(&self, writes: Vec<(Vec<u8>, Option<Vec<u8>>)>) -> anyhow::Result<()> {
        let mut batch = self.keyspace.batch();
        for (key, value) in writes {
            match value {
                Some(v) => batch.insert(&self.kv, key, v),
                None => batch.remove(&self.kv, key),
            }
        }
        batch.commit()?;
        Ok(())
    }

    fn new_snapshot(&self) -> anyhow::Result<Box<dyn EngineReader>> {
        Ok(Box::new(FjallSnapshot {
            snapshot: self.kv.snapshot(),
        }))
    }

    fn capacity(&self) -> anyhow::Result<StoreCapacity> {
        let used = self.keyspace.disk_space();
        let capacity = used.saturating_mul(4).max(1 << 30);
        Ok(StoreCapacity {
            capacity,
            available: capacity.saturating_sub(used),
        })
    }

    fn set_gc_timeouts(&self, min_txn_ts: i64, min_response_cache_ts: i64) {
        self.min_txn_ts.store(min_txn_ts, Ordering::SeqCst);
        self.min_rcache_ts
            .store(min_response_cache_ts, Ordering::SeqCst);
    }

    fn gc_timeouts(&self) -> (i64, i64) {
        (
            self.min_txn_ts.load(Ordering::SeqCst),
            self.min_rcache_ts.load(Ordering::SeqCst),
        )
    }
}

struct FjallSnapshot {
    snapshot: fjall::Snapshot,
}

impl EngineReader for FjallSnapshot {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.snapshot.get(key)?.map(|v| v.to_vec()))
    }

    fn iterate(
        &self,
        lo: &[u8],
        hi: &[u8],
        reverse: bool,
        f: &mut dyn FnMut(&[u8], &[u8]) -> anyhow::Result<bool>,
    ) -> anyhow::Result<()> {
        let range = (
            Bound::Included(lo.to_vec()),
            Bound::Excluded(hi.to_vec()),
        );
        if reverse {
            for item in self.snapshot.range(range).rev() {
                let (k, v) = item?;
                if f(k.as_ref(), v.as_ref())? {
                    return Ok(());
                }
            }
        } else {
            for item in self.snapshot.range(range) {
                let (k, v) = item?;
                if f(k.as_ref(), v.as_ref())? {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_reads_through_to_buffered_writes() {
        let eng = MemEngine::new();
        eng.put(b"a", b"base").expect("put");
        eng.put(b"b", b"keep").expect("put");

        let mut batch = Batch::new(&eng);
        batch.put(b"a", b"buffered");
        batch.delete(b"b");
        batch.put(b"c", b"new");

        assert_eq!(batch.get(b"a").expect("get"), Some(b"buffered".to_vec()));
        assert_eq!(batch.get(b"b").expect("get"), None);
        assert_eq!(batch.get(b"c").expect("get"), Some(b"new".to_vec()));
        // Base engine unchanged until commit.
        assert_eq!(eng.get(b"a").expect("get"), Some(b"base".to_vec()));

        batch.commit().expect("commit");
        assert_eq!(eng.get(b"a").expect("get"), Some(b"buffered".to_vec()));
        assert_eq!(eng.get(b"b").expect("get"), None);
        assert_eq!(eng.get(b"c").expect("get"), Some(b"new".to_vec()));
    }

    #[test]
    fn dropped_batch_discards_writes() {
        let eng = MemEngine::new();
        {
            let mut batch = Batch::new(&eng);
            batch.put(b"x", b"y");
        }
        assert_eq!(eng.get(b"x").expect("get"), None);
    }

    #[test]
    fn batch_iteration_merges_and_orders() {
        let eng = MemEngine::new();
        eng.put(b"a", b"1").expect("put");
        eng.put(b"c", b"3").expect("put");
        eng.put(b"e", b"5").expect("put");

        let mut batch = Batch::new(&eng);
        batch.put(b"b", b"2");
        batch.delete(b"c");
        batch.put(b"e", b"five");

        let rows = batch.scan(b"a", b"z", 0).expect("scan");
        let keys: Vec<&[u8]> = rows.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![&b"a"[..], b"b", b"e"]);
        assert_eq!(rows[2].1, b"five".to_vec());

        // Reverse order.
        let mut seen = Vec::new();
        batch
            .iterate(b"a", b"z", true, &mut |k, _| {
                seen.push(k.to_vec());
                Ok(false)
            })
            .expect("iterate");
        assert_eq!(seen, vec![b"e".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn snapshot_is_immune_to_later_writes() {
        let eng = MemEngine::new();
        eng.put(b"k", b"old").expect("put");
        let snap = eng.new_snapshot().expect("snapshot");
        eng.put(b"k", b"new").expect("put");
        assert_eq!(snap.get(b"k").expect("get"), Some(b"old".to_vec()));
    }

    #[test]
    fn iterate_stops_when_asked() {
        let eng = MemEngine::new();
        for i in 0..10u8 {
            eng.put(&[i], b"v").expect("put");
        }
        let mut count = 0;
        eng.iterate(&[0], &[10], false, &mut |_, _| {
            count += 1;
            Ok(count == 3)
        })
        .expect("iterate");
        assert_eq!(count, 3);
    }

    #[test]
    fn fjall_engine_basic_ops() {
        let dir = tempfile::tempdir().expect("tempdir");
        let eng = FjallEngine::open(dir.path()).expect("open");
        eng.put(b"a", b"1").expect("put");
        eng.put(b"b", b"2").expect("put");
        eng.apply_batch(vec![
            (b"c".to_vec(), Some(b"3".to_vec())),
            (b"a".to_vec(), None),
        ])
        .expect("batch");
        assert_eq!(eng.get(b"a").expect("get"), None);
        let rows = eng.scan(b"a", b"z", 0).expect("scan");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, b"b".to_vec());
    }
}
