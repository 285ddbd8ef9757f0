//! Durable per-range response cache.
//!
//! Replayed mutating commands must not re-execute, so every applied
//! command writes its response (or error) under its client command ID in
//! the same engine batch as its effects. Entries expire after a TTL and
//! are copied to the new range on splits.

use serde::{Deserialize, Serialize};

use crate::batch::{BatchResponse, ClientCmdId};
use crate::clock::Timestamp;
use crate::data::RangeId;
use crate::engine::{Batch, EngineReader};
use crate::error::Error;
use crate::keys;
use crate::mvcc::{self, MvccMetadata};
use crate::value::Value;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CachedResponse {
    timestamp: Timestamp,
    result: Result<BatchResponse, Error>,
}

pub struct ResponseCache {
    range_id: RangeId,
}

impl ResponseCache {
    pub fn new(range_id: RangeId) -> Self {
        Self { range_id }
    }

    fn key(&self, cmd_id: ClientCmdId) -> Vec<u8> {
        keys::response_cache_key(self.range_id, cmd_id.wall_time, cmd_id.random)
    }

    /// The cached outcome for a command ID, if one was recorded.
    pub fn lookup<R: EngineReader + ?Sized>(
        &self,
        eng: &R,
        cmd_id: ClientCmdId,
    ) -> anyhow::Result<Option<Result<BatchResponse, Error>>> {
        let Some(value) = mvcc::mvcc_get_inline(eng, &self.key(cmd_id))? else {
            return Ok(None);
        };
        let cached: CachedResponse = bincode::deserialize(value.as_bytes())?;
        Ok(Some(cached.result))
    }

    /// Record the outcome of a command in the same batch as its effects.
    pub fn put_response(
        &self,
        batch: &mut Batch<'_>,
        cmd_id: ClientCmdId,
        timestamp: Timestamp,
        result: &Result<BatchResponse, Error>,
    ) -> anyhow::Result<()> {
        let cached = CachedResponse {
            timestamp,
            result: result.clone(),
        };
        let value = Value::from_bytes(bincode::serialize(&cached)?);
        mvcc::mvcc_put_inline(batch, &self.key(cmd_id), value)
    }

    /// Copy every entry into `dest_range_id`'s cache; used by splits so
    /// retries routed to either half stay idempotent.
    pub fn copy_into<R: EngineReader + ?Sized>(
        &self,
        eng: &R,
        batch: &mut Batch<'_>,
        dest_range_id: RangeId,
    ) -> anyhow::Result<usize> {
        let (lo, hi) = keys::response_cache_span(self.range_id);
        let (dest_lo, _) = keys::response_cache_span(dest_range_id);
        let enc_lo = mvcc::mvcc_encode_meta_key(&lo);
        let enc_hi = mvcc::mvcc_encode_meta_key(&hi);
        let mut copied = 0usize;
        let mut rows: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        eng.iterate(&enc_lo, &enc_hi, false, &mut |k, v| {
            rows.push((k.to_vec(), v.to_vec()));
            Ok(false)
        })?;
        for (k, v) in rows {
            let (ukey, _) = mvcc::mvcc_decode_key(&k)?;
            // Rewrite the range-id prefix, keeping the command id suffix.
            let suffix = &ukey[lo.len()..];
            let mut dest_key = dest_lo.clone();
            dest_key.extend_from_slice(suffix);
            batch.put(&mvcc::mvcc_encode_meta_key(&dest_key), &v);
            copied += 1;
        }
        Ok(copied)
    }

    /// Delete entries recorded before `min_timestamp`. Returns how many
    /// were removed.
    pub fn gc<R: EngineReader + ?Sized>(
        &self,
        eng: &R,
        batch: &mut Batch<'_>,
        min_timestamp: Timestamp,
    ) -> anyhow::Result<usize> {
        let (lo, hi) = keys::response_cache_span(self.range_id);
        let enc_lo = mvcc::mvcc_encode_meta_key(&lo);
        let enc_hi = mvcc::mvcc_encode_meta_key(&hi);
        let mut removed = 0usize;
        let mut victims: Vec<Vec<u8>> = Vec::new();
        eng.iterate(&enc_lo, &enc_hi, false, &mut |k, v| {
            let meta: MvccMetadata = bincode::deserialize(v)?;
            if let Some(value) = meta.inline_value {
                let cached: CachedResponse = bincode::deserialize(value.as_bytes())?;
                if cached.timestamp < min_timestamp {
                    victims.push(k.to_vec());
                }
            }
            Ok(false)
        })?;
        for key in victims {
            batch.delete(&key);
            removed += 1;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Response;
    use crate::engine::{Engine, MemEngine};

    fn response_with_value(n: i64) -> Result<BatchResponse, Error> {
        let mut br = BatchResponse::default();
        br.add(Response::Increment { new_value: n });
        Ok(br)
    }

    #[test]
    fn hit_returns_the_recorded_response() {
        let eng = MemEngine::new();
        let cache = ResponseCache::new(7);
        let id = ClientCmdId::random(100);

        assert!(cache.lookup(&eng, id).expect("lookup").is_none());

        let mut batch = Batch::new(&eng);
        cache
            .put_response(&mut batch, id, Timestamp::new(100, 0), &response_with_value(3))
            .expect("put");
        batch.commit().expect("commit");

        let hit = cache.lookup(&eng, id).expect("lookup").expect("hit");
        let br = hit.expect("ok response");
        assert_eq!(br.responses[0], Response::Increment { new_value: 3 });
    }

    #[test]
    fn errors_are_cached_too() {
        let eng = MemEngine::new();
        let cache = ResponseCache::new(7);
        let id = ClientCmdId::random(100);

        let stored: Result<BatchResponse, Error> = Err(Error::ConditionFailed {
            actual: None,
            index: Some(0),
        });
        let mut batch = Batch::new(&eng);
        cache
            .put_response(&mut batch, id, Timestamp::new(100, 0), &stored)
            .expect("put");
        batch.commit().expect("commit");

        let hit = cache.lookup(&eng, id).expect("lookup").expect("hit");
        assert_eq!(hit, stored);
    }

    #[test]
    fn copy_into_makes_entries_visible_under_new_range() {
        let eng = MemEngine::new();
        let cache = ResponseCache::new(7);
        let id = ClientCmdId::random(100);
        let mut batch = Batch::new(&eng);
        cache
            .put_response(&mut batch, id, Timestamp::new(1, 0), &response_with_value(1))
            .expect("put");
        batch.commit().expect("commit");

        let mut batch = Batch::new(&eng);
        let copied = cache.copy_into(&eng, &mut batch, 9).expect("copy");
        batch.commit().expect("commit");
        assert_eq!(copied, 1);

        let dest = ResponseCache::new(9);
        assert!(dest.lookup(&eng, id).expect("lookup").is_some());
        // The source entry is untouched.
        assert!(cache.lookup(&eng, id).expect("lookup").is_some());
    }

    #[test]
    fn gc_removes_only_expired_entries() {
        let eng = MemEngine::new();
        let cache = ResponseCache::new(7);
        let old_id = ClientCmdId::random(1);
        let new_id = ClientCmdId::random(2);
        let mut batch = Batch::new(&eng);
        cache
            .put_response(&mut batch, old_id, Timestamp::new(10, 0), &response_with_value(1))
            .expect("put");
        cache
            .put_response(&mut batch, new_id, Timestamp::new(99, 0), &response_with_value(2))
            .expect("put");
        batch.commit().expect("commit");

        let mut batch = Batch::new(&eng);
        let removed = cache
            .gc(&eng, &mut batch, Timestamp::new(50, 0))
            .expect("gc");
        batch.commit().expect("commit");
        assert_eq!(removed, 1);
        assert!(cache.lookup(&eng, old_id).expect("lookup").is_none());
        assert!(cache.lookup(&eng, new_id).expect("lookup").is_some());
    }
}
