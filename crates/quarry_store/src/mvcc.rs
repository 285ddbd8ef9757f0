//! Versioned reads and writes over the ordered engine.
//!
//! Each user key owns a metadata record at its bare encoded key (intent
//! marker, newest version timestamp, or an inline value for non-MVCC
//! metadata) followed by version records whose keys append the
//! bit-inverted timestamp, so iteration yields newest versions first.

use crate::clock::Timestamp;
use crate::data::RangeStats;
use crate::engine::{Batch, EngineReader};
use crate::error::{Error, Result};
use crate::keys;
use crate::txn::{Intent, Transaction};
use crate::value::Value;

use serde::{Deserialize, Serialize};

/// Per-key metadata record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MvccMetadata {
    /// Set while an uncommitted intent covers the key.
    pub txn: Option<Transaction>,
    /// Timestamp of the newest version (the intent's, if one exists).
    pub timestamp: Timestamp,
    /// Whether the newest version is a deletion tombstone.
    pub deleted: bool,
    /// Inline payload for non-MVCC keys (zero-timestamp writes).
    pub inline_value: Option<Value>,
}

/// One visible row returned by scans.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Value,
}

// ---- key encoding ----

/// Bare (metadata) form of an MVCC key.
pub fn mvcc_encode_meta_key(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 2);
    keys::encode_bytes_ascending(key, &mut out);
    out
}

/// Versioned form: bare key plus the bit-inverted timestamp, newest
/// first. A zero timestamp yields the bare form.
pub fn mvcc_encode_key(key: &[u8], ts: Timestamp) -> Vec<u8> {
    let mut out = mvcc_encode_meta_key(key);
    if !ts.is_zero() {
        out.extend_from_slice(&(!(ts.wall_time as u64)).to_be_bytes());
        out.extend_from_slice(&(!(ts.logical as u32)).to_be_bytes());
    }
    out
}

/// Split an engine key back into user key and version timestamp (zero
/// for metadata records).
pub fn mvcc_decode_key(enc: &[u8]) -> anyhow::Result<(Vec<u8>, Timestamp)> {
    let (key, used) = keys::decode_bytes_ascending(enc)?;
    let rest = &enc[used..];
    if rest.is_empty() {
        return Ok((key, Timestamp::ZERO));
    }
    anyhow::ensure!(rest.len() == 12, "malformed mvcc version suffix");
    let mut wall = [0u8; 8];
    wall.copy_from_slice(&rest[..8]);
    let mut logical = [0u8; 4];
    logical.copy_from_slice(&rest[8..]);
    Ok((
        key,
        Timestamp::new(
            !u64::from_be_bytes(wall) as i64,
            !u32::from_be_bytes(logical) as i32,
        ),
    ))
}

/// Smallest key greater than every key with the given prefix.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.last_mut() {
        if *last == 0xff {
            out.pop();
        } else {
            *last += 1;
            return out;
        }
    }
    // All 0xff: no upper bound below infinity; unreachable for encoded keys.
    vec![0xff; prefix.len() + 1]
}

// ---- record access ----

fn load_meta<R: EngineReader + ?Sized>(
    eng: &R,
    key: &[u8],
) -> anyhow::Result<Option<MvccMetadata>> {
    let Some(bytes) = eng.get(&mvcc_encode_meta_key(key))? else {
        return Ok(None);
    };
    Ok(Some(bincode::deserialize(&bytes)?))
}

fn put_meta(batch: &mut Batch<'_>, key: &[u8], meta: &MvccMetadata) -> anyhow::Result<()> {
    batch.put(&mvcc_encode_meta_key(key), &bincode::serialize(meta)?);
    Ok(())
}

/// Newest version of `key` at or below `max_ts`: `(version_ts, value)`
/// where a `None` value is a deletion tombstone.
fn load_version<R: EngineReader + ?Sized>(
    eng: &R,
    key: &[u8],
    max_ts: Timestamp,
) -> anyhow::Result<Option<(Timestamp, Option<Value>)>> {
    if max_ts.is_zero() {
        return Ok(None);
    }
    let lo = mvcc_encode_key(key, max_ts);
    let hi = prefix_end(&mvcc_encode_meta_key(key));
    let mut found: Option<(Timestamp, Option<Value>)> = None;
    let mut decode_err: Option<anyhow::Error> = None;
    eng.iterate(&lo, &hi, false, &mut |k, v| {
        match mvcc_decode_key(k).and_then(|(_, ts)| {
            let val: Option<Value> = bincode::deserialize(v)?;
            Ok((ts, val))
        }) {
            Ok(decoded) => found = Some(decoded),
            Err(err) => decode_err = Some(err),
        }
        Ok(true)
    })?;
    if let Some(err) = decode_err {
        return Err(err);
    }
    Ok(found)
}

fn make_intent(key: &[u8], txn: &Transaction) -> Intent {
    Intent {
        key: key.to_vec(),
        end_key: Vec::new(),
        txn: txn.clone(),
    }
}

fn finish_value(mut value: Value, key: &[u8], ts: Timestamp) -> Result<Value> {
    value
        .verify(key)
        .map_err(|e| Error::internal(format!("corrupt value: {e:#}")))?;
    value.timestamp = Some(ts);
    Ok(value)
}

// ---- point operations ----

/// Read the most recent version of `key` visible at `ts`.
///
/// A consistent read fails with `WriteIntent` when another transaction's
/// intent covers the key at or below `ts`; an inconsistent read returns
/// the newest committed value below the intent alongside the intent.
/// The reader's own intent is visible to it.
pub fn mvcc_get<R: EngineReader + ?Sized>(
    eng: &R,
    key: &[u8],
    ts: Timestamp,
    consistent: bool,
    txn: Option<&Transaction>,
) -> Result<(Option<Value>, Option<Intent>)> {
    if key.is_empty() {
        return Err(Error::InvalidKey("empty key".to_string()));
    }
    let Some(meta) = load_meta(eng, key)? else {
        return Ok((None, None));
    };
    if let Some(inline) = meta.inline_value {
        return Ok((Some(inline), None));
    }

    let mut intent = None;
    if let Some(meta_txn) = &meta.txn {
        let own = txn.map(|t| t.id == meta_txn.id).unwrap_or(false);
        if own {
            // Our own provisional write is visible regardless of ts.
            return match load_version(eng, key, meta.timestamp)? {
                Some((vts, Some(value))) => Ok((Some(finish_value(value, key, vts)?), None)),
                _ => Ok((None, None)),
            };
        }
        if meta.timestamp <= ts {
            if consistent {
                return Err(Error::WriteIntent {
                    intents: vec![make_intent(key, meta_txn)],
                    resolved: false,
                    index: None,
                });
            }
            // Inconsistent: surface the intent, read beneath it.
            intent = Some(make_intent(key, meta_txn));
            return match load_version(eng, key, meta.timestamp.prev())? {
                Some((vts, Some(value))) => {
                    Ok((Some(finish_value(value, key, vts)?), intent))
                }
                _ => Ok((None, intent)),
            };
        }
    }

    // Uncertainty: a version above the read timestamp but within the
    // transaction's uncertainty window forces a restart.
    if consistent && meta.txn.is_none() {
        if let Some(t) = txn {
            if meta.timestamp > ts && meta.timestamp <= t.max_timestamp {
                return Err(Error::ReadWithinUncertaintyInterval {
                    timestamp: ts,
                    existing: meta.timestamp,
                    node_id: 0,
                });
            }
        }
    }

    match load_version(eng, key, ts)? {
        Some((vts, Some(value))) => Ok((Some(finish_value(value, key, vts)?), intent)),
        _ => Ok((None, intent)),
    }
}

fn mvcc_write_version(
    batch: &mut Batch<'_>,
    key: &[u8],
    ts: Timestamp,
    value: Option<Value>,
    txn: Option<&Transaction>,
) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidKey("empty key".to_string()));
    }
    if ts.is_zero() {
        // Inline non-MVCC write.
        if txn.is_some() {
            return Err(Error::internal("transactional write at zero timestamp"));
        }
        let meta = MvccMetadata {
            inline_value: value,
            ..Default::default()
        };
        return put_meta(batch, key, &meta).map_err(Error::from);
    }

    if let Some(meta) = load_meta(batch, key)? {
        if meta.inline_value.is_some() {
            return Err(Error::internal("versioned write over an inline value"));
        }
        match &meta.txn {
            Some(meta_txn) => {
                let own = txn.map(|t| t.id == meta_txn.id).unwrap_or(false);
                if !own {
                    return Err(Error::WriteIntent {
                        intents: vec![make_intent(key, meta_txn)],
                        resolved: false,
                        index: None,
                    });
                }
                let own_txn = txn.expect("own intent implies txn");
                if own_txn.epoch < meta_txn.epoch {
                    return Err(Error::internal("transaction epoch regression"));
                }
                // Replace our provisional version in place.
                batch.delete(&mvcc_encode_key(key, meta.timestamp));
            }
            None => {
                if meta.timestamp >= ts {
                    return Err(Error::WriteTooOld {
                        timestamp: ts,
                        existing: meta.timestamp,
                    });
                }
            }
        }
    }

    let deleted = value.is_none();
    batch.put(
        &mvcc_encode_key(key, ts),
        &bincode::serialize(&value).map_err(|e| Error::internal(e))?,
    );
    let meta = MvccMetadata {
        txn: txn.cloned(),
        timestamp: ts,
        deleted,
        inline_value: None,
    };
    put_meta(batch, key, &meta)?;
    Ok(())
}

/// Write a new version of `key`; with a transaction the version is an
/// intent until resolved.
pub fn mvcc_put(
    batch: &mut Batch<'_>,
    key: &[u8],
    ts: Timestamp,
    mut value: Value,
    txn: Option<&Transaction>,
) -> Result<()> {
    if value.checksum.is_none() {
        value.init_checksum(key);
    }
    mvcc_write_version(batch, key, ts, Some(value), txn)
}

/// Write a deletion tombstone version.
pub fn mvcc_delete(
    batch: &mut Batch<'_>,
    key: &[u8],
    ts: Timestamp,
    txn: Option<&Transaction>,
) -> Result<()> {
    mvcc_write_version(batch, key, ts, None, txn)
}

/// Atomic compare-and-set: the currently visible value must match
/// `expected` (absent when `expected` is `None`).
pub fn mvcc_conditional_put(
    batch: &mut Batch<'_>,
    key: &[u8],
    ts: Timestamp,
    value: Value,
    expected: Option<&Value>,
    txn: Option<&Transaction>,
) -> Result<()> {
    let (actual, _) = mvcc_get(batch, key, Timestamp::MAX, true, txn)?;
    match (&actual, expected) {
        (None, None) => {}
        (Some(v), Some(exp)) if v.payload_equal(exp) => {}
        _ => {
            return Err(Error::ConditionFailed {
                actual,
                index: None,
            })
        }
    }
    mvcc_put(batch, key, ts, value, txn)
}

/// Add `delta` to the integer stored at `key` (0 when absent) and return
/// the new value.
pub fn mvcc_increment(
    batch: &mut Batch<'_>,
    key: &[u8],
    ts: Timestamp,
    txn: Option<&Transaction>,
    delta: i64,
) -> Result<i64> {
    let (existing, _) = mvcc_get(batch, key, Timestamp::MAX, true, txn)?;
    let prev = match existing {
        Some(v) => v
            .as_int()
            .map_err(|e| Error::internal(format!("increment on non-integer value: {e:#}")))?,
        None => 0,
    };
    let next = prev
        .checked_add(delta)
        .ok_or_else(|| Error::internal("integer overflow on increment"))?;
    mvcc_put(batch, key, ts, Value::from_int(next), txn)?;
    Ok(next)
}

// ---- inline (non-MVCC) helpers ----

pub fn mvcc_get_inline<R: EngineReader + ?Sized>(
    eng: &R,
    key: &[u8],
) -> anyhow::Result<Option<Value>> {
    Ok(load_meta(eng, key)?.and_then(|m| m.inline_value))
}

pub fn mvcc_put_inline(batch: &mut Batch<'_>, key: &[u8], value: Value) -> anyhow::Result<()> {
    let meta = MvccMetadata {
        inline_value: Some(value),
        ..Default::default()
    };
    put_meta(batch, key, &meta)
}

pub fn mvcc_delete_inline(batch: &mut Batch<'_>, key: &[u8]) {
    batch.delete(&mvcc_encode_meta_key(key));
}

// ---- scans ----

struct ScanState {
    rows: Vec<KeyValue>,
    intents: Vec<Intent>,
}

/// Enumerate up to `max_rows` visible versions in `[lo, hi)` at `ts`.
/// Foreign intents in consistent mode fail the scan with the collected
/// intent list; inconsistent scans return them alongside the rows.
pub fn mvcc_scan<R: EngineReader + ?Sized>(
    eng: &R,
    lo: &[u8],
    hi: &[u8],
    ts: Timestamp,
    max_rows: u64,
    consistent: bool,
    txn: Option<&Transaction>,
    reverse: bool,
) -> Result<(Vec<KeyValue>, Vec<Intent>)> {
    let mut state = ScanState {
        rows: Vec::new(),
        intents: Vec::new(),
    };
    let enc_lo = mvcc_encode_meta_key(lo);
    let enc_hi = mvcc_encode_meta_key(hi);
    let mut last_key: Option<Vec<u8>> = None;
    let mut failure: Option<Error> = None;

    eng.iterate(&enc_lo, &enc_hi, reverse, &mut |k, _| {
        let (ukey, _) = mvcc_decode_key(k)?;
        if last_key.as_deref() == Some(ukey.as_slice()) {
            return Ok(false);
        }
        last_key = Some(ukey.clone());
        match scan_one_key(eng, &ukey, ts, consistent, txn, &mut state) {
            Ok(()) => {}
            Err(err) => {
                failure = Some(err);
                return Ok(true);
            }
        }
        Ok(max_rows > 0 && state.rows.len() as u64 >= max_rows)
    })?;

    if let Some(err) = failure {
        return Err(err);
    }
    if consistent && !state.intents.is_empty() {
        return Err(Error::WriteIntent {
            intents: state.intents,
            resolved: false,
            index: None,
        });
    }
    Ok((state.rows, state.intents))
}

fn scan_one_key<R: EngineReader + ?Sized>(
    eng: &R,
    key: &[u8],
    ts: Timestamp,
    consistent: bool,
    txn: Option<&Transaction>,
    state: &mut ScanState,
) -> Result<()> {
    match mvcc_get(eng, key, ts, consistent, txn) {
        Ok((value, intent)) => {
            if let Some(intent) = intent {
                state.intents.push(intent);
            }
            if let Some(value) = value {
                state.rows.push(KeyValue {
                    key: key.to_vec(),
                    value,
                });
            }
            Ok(())
        }
        Err(Error::WriteIntent { mut intents, .. }) if consistent => {
            // Keep scanning so the error carries every conflicting intent.
            state.intents.append(&mut intents);
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Invoke `f` for each visible row; `f` returns true to stop.
pub fn mvcc_iterate<R: EngineReader + ?Sized>(
    eng: &R,
    lo: &[u8],
    hi: &[u8],
    ts: Timestamp,
    consistent: bool,
    txn: Option<&Transaction>,
    reverse: bool,
    f: &mut dyn FnMut(KeyValue) -> Result<bool>,
) -> Result<()> {
    let enc_lo = mvcc_encode_meta_key(lo);
    let enc_hi = mvcc_encode_meta_key(hi);
    let mut last_key: Option<Vec<u8>> = None;
    let mut failure: Option<Error> = None;

    eng.iterate(&enc_lo, &enc_hi, reverse, &mut |k, _| {
        let (ukey, _) = mvcc_decode_key(k)?;
        if last_key.as_deref() == Some(ukey.as_slice()) {
            return Ok(false);
        }
        last_key = Some(ukey.clone());
        match mvcc_get(eng, &ukey, ts, consistent, txn) {
            Ok((Some(value), _)) => match f(KeyValue {
                key: ukey,
                value,
            }) {
                Ok(stop) => Ok(stop),
                Err(err) => {
                    failure = Some(err);
                    Ok(true)
                }
            },
            Ok((None, _)) => Ok(false),
            Err(err) => {
                failure = Some(err);
                Ok(true)
            }
        }
    })?;
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Delete every visible key in `[lo, hi)`, up to `max` (0 = unlimited).
/// Returns the deleted keys in ascending order.
pub fn mvcc_delete_range(
    batch: &mut Batch<'_>,
    lo: &[u8],
    hi: &[u8],
    ts: Timestamp,
    max: u64,
    txn: Option<&Transaction>,
) -> Result<Vec<Vec<u8>>> {
    let (rows, _) = mvcc_scan(batch, lo, hi, Timestamp::MAX, max, true, txn, false)?;
    let mut deleted = Vec::with_capacity(rows.len());
    for row in rows {
        mvcc_delete(batch, &row.key, ts, txn)?;
        deleted.push(row.key);
    }
    Ok(deleted)
}

// ---- intent resolution ----

/// Resolve the intent on `key` for `txn`: commit it (moving the version
/// forward if the transaction was pushed), adjust it for a pending push,
/// or remove it entirely on abort.
pub fn mvcc_resolve_intent(
    batch: &mut Batch<'_>,
    key: &[u8],
    txn: &Transaction,
) -> Result<()> {
    use crate::txn::TxnStatus;

    let Some(meta) = load_meta(batch, key)? else {
        return Ok(());
    };
    let Some(meta_txn) = &meta.txn else {
        return Ok(());
    };
    if meta_txn.id != txn.id {
        return Ok(());
    }

    let commit = txn.status == TxnStatus::Committed && txn.epoch >= meta_txn.epoch;
    let pushed = txn.timestamp > meta.timestamp;

    if commit {
        let mut final_ts = meta.timestamp;
        if pushed {
            // The transaction was pushed after writing: relocate the
            // provisional version to the commit timestamp.
            if let Some((vts, value)) = load_version(batch, key, meta.timestamp)? {
                batch.delete(&mvcc_encode_key(key, vts));
                batch.put(
                    &mvcc_encode_key(key, txn.timestamp),
                    &bincode::serialize(&value).map_err(Error::internal)?,
                );
            }
            final_ts = txn.timestamp;
        }
        let new_meta = MvccMetadata {
            txn: None,
            timestamp: final_ts,
            deleted: meta.deleted,
            inline_value: None,
        };
        put_meta(batch, key, &new_meta)?;
        return Ok(());
    }

    if txn.status == TxnStatus::Pending {
        if pushed {
            // Push succeeded but the transaction is still running: slide
            // the intent to its new timestamp.
            if let Some((vts, value)) = load_version(batch, key, meta.timestamp)? {
                batch.delete(&mvcc_encode_key(key, vts));
                batch.put(
                    &mvcc_encode_key(key, txn.timestamp),
                    &bincode::serialize(&value).map_err(Error::internal)?,
                );
            }
            let new_meta = MvccMetadata {
                txn: Some(txn.clone()),
                timestamp: txn.timestamp,
                deleted: meta.deleted,
                inline_value: None,
            };
            put_meta(batch, key, &new_meta)?;
        }
        return Ok(());
    }

    // Aborted: drop the provisional version and re-expose the newest
    // committed one.
    batch.delete(&mvcc_encode_key(key, meta.timestamp));
    match load_version(batch, key, meta.timestamp.prev())? {
        Some((vts, value)) => {
            let new_meta = MvccMetadata {
                txn: None,
                timestamp: vts,
                deleted: value.is_none(),
                inline_value: None,
            };
            put_meta(batch, key, &new_meta)?;
        }
        None => {
            mvcc_delete_inline(batch, key);
        }
    }
    Ok(())
}

/// Resolve every intent of `txn` in `[lo, hi)`; returns how many were
/// resolved.
pub fn mvcc_resolve_intent_range(
    batch: &mut Batch<'_>,
    lo: &[u8],
    hi: &[u8],
    txn: &Transaction,
) -> Result<usize> {
    let enc_lo = mvcc_encode_meta_key(lo);
    let enc_hi = mvcc_encode_meta_key(hi);
    let mut candidates: Vec<Vec<u8>> = Vec::new();
    batch
        .iterate(&enc_lo, &enc_hi, false, &mut |k, v| {
            let (ukey, ts) = mvcc_decode_key(k)?;
            if !ts.is_zero() {
                return Ok(false);
            }
            let meta: MvccMetadata = bincode::deserialize(v)?;
            if meta.txn.as_ref().map(|t| t.id) == Some(txn.id) {
                candidates.push(ukey);
            }
            Ok(false)
        })
        .map_err(Error::from)?;
    for key in &candidates {
        mvcc_resolve_intent(batch, key, txn)?;
    }
    Ok(candidates.len())
}

// ---- statistics ----

/// Coarse size statistics for the engine span `[lo, hi)` (user keys).
pub fn mvcc_range_stats<R: EngineReader + ?Sized>(
    eng: &R,
    lo: &[u8],
    hi: &[u8],
) -> anyhow::Result<RangeStats> {
    let enc_lo = mvcc_encode_meta_key(lo);
    let enc_hi = mvcc_encode_meta_key(hi);
    let mut stats = RangeStats::default();
    eng.iterate(&enc_lo, &enc_hi, false, &mut |k, v| {
        stats.total_bytes += (k.len() + v.len()) as u64;
        let (_, ts) = mvcc_decode_key(k)?;
        if ts.is_zero() {
            stats.key_count += 1;
            let meta: MvccMetadata = bincode::deserialize(v)?;
            if meta.txn.is_some() {
                stats.intent_count += 1;
            }
        }
        Ok(false)
    })?;
    Ok(stats)
}

/// Pick a key splitting `[lo, hi)` roughly in half by accumulated bytes.
pub fn mvcc_find_split_key<R: EngineReader + ?Sized>(
    eng: &R,
    lo: &[u8],
    hi: &[u8],
) -> anyhow::Result<Option<Vec<u8>>> {
    let stats = mvcc_range_stats(eng, lo, hi)?;
    if stats.key_count < 2 {
        return Ok(None);
    }
    let target = stats.total_bytes / 2;
    let enc_lo = mvcc_encode_meta_key(lo);
    let enc_hi = mvcc_encode_meta_key(hi);
    let mut acc = 0u64;
    let mut split: Option<Vec<u8>> = None;
    eng.iterate(&enc_lo, &enc_hi, false, &mut |k, v| {
        acc += (k.len() + v.len()) as u64;
        if acc < target {
            return Ok(false);
        }
        let (ukey, ts) = mvcc_decode_key(k)?;
        if !ts.is_zero() {
            return Ok(false);
        }
        if ukey.as_slice() > lo {
            split = Some(ukey);
            return Ok(true);
        }
        Ok(false)
    })?;
    Ok(split.filter(|k| k.as_slice() < hi))
}
