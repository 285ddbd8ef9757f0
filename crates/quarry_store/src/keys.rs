//! Key-space layout.
//!
//! The key space reserves a local prefix for per-range metadata that must
//! never be addressed by user requests. Local keys come in two shapes:
//! range-ID-local keys (raft state, response cache) keyed by range ID,
//! and range-key-local keys (descriptor, transaction records) anchored at
//! an address key so they split and merge with the range.

use crate::data::RangeId;
use crate::txn::TxnId;

/// Smallest possible key.
pub const KEY_MIN: &[u8] = b"";
/// Largest permitted key; no user key may reach it.
pub const KEY_MAX: &[u8] = b"\xff\xff";
/// Prefix for all store- and range-local metadata.
pub const LOCAL_PREFIX: &[u8] = b"\x00\x00\x00";
/// Sentinel separating local keys from addressable keys.
pub const LOCAL_MAX: &[u8] = b"\x00\x00\x01";
/// First-level addressing records.
pub const META1_PREFIX: &[u8] = b"\x00\x00meta1";
/// Second-level addressing records.
pub const META2_PREFIX: &[u8] = b"\x00\x00meta2";

const RANGE_ID_INFIX: u8 = b'i';
const RANGE_KEY_INFIX: u8 = b'k';
const STORE_INFIX: u8 = b's';

const LOG_SUFFIX: &[u8] = b"rftl";
const HARD_STATE_SUFFIX: &[u8] = b"rfhs";
const TRUNCATED_STATE_SUFFIX: &[u8] = b"rfts";
const APPLIED_INDEX_SUFFIX: &[u8] = b"rfai";
const LAST_INDEX_SUFFIX: &[u8] = b"rfli";
const TOMBSTONE_SUFFIX: &[u8] = b"rftb";
const LEASE_SUFFIX: &[u8] = b"rlls";
const RANGE_STATS_SUFFIX: &[u8] = b"stat";
const RESPONSE_CACHE_SUFFIX: &[u8] = b"res-";
const DESCRIPTOR_SUFFIX: &[u8] = b"rdsc";
const TRANSACTION_SUFFIX: &[u8] = b"txn-";

fn range_id_prefix(range_id: RangeId) -> Vec<u8> {
    let mut out = Vec::with_capacity(LOCAL_PREFIX.len() + 1 + 8);
    out.extend_from_slice(LOCAL_PREFIX);
    out.push(RANGE_ID_INFIX);
    out.extend_from_slice(&range_id.to_be_bytes());
    out
}

fn range_id_key(range_id: RangeId, suffix: &[u8]) -> Vec<u8> {
    let mut out = range_id_prefix(range_id);
    out.extend_from_slice(suffix);
    out
}

/// Span (exclusive end) covering every range-ID-local key of a range.
pub fn range_id_span(range_id: RangeId) -> (Vec<u8>, Vec<u8>) {
    let start = range_id_prefix(range_id);
    let end = range_id_prefix(range_id + 1);
    (start, end)
}

pub fn raft_log_key(range_id: RangeId, index: u64) -> Vec<u8> {
    let mut out = range_id_key(range_id, LOG_SUFFIX);
    out.extend_from_slice(&index.to_be_bytes());
    out
}

/// Log index parsed back out of a raft log key.
pub fn decode_raft_log_index(range_id: RangeId, key: &[u8]) -> anyhow::Result<u64> {
    let prefix = range_id_key(range_id, LOG_SUFFIX);
    anyhow::ensure!(
        key.len() == prefix.len() + 8 && key.starts_with(&prefix),
        "not a raft log key for range {range_id}"
    );
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[prefix.len()..]);
    Ok(u64::from_be_bytes(buf))
}

pub fn raft_hard_state_key(range_id: RangeId) -> Vec<u8> {
    range_id_key(range_id, HARD_STATE_SUFFIX)
}

pub fn raft_truncated_state_key(range_id: RangeId) -> Vec<u8> {
    range_id_key(range_id, TRUNCATED_STATE_SUFFIX)
}

pub fn raft_applied_index_key(range_id: RangeId) -> Vec<u8> {
    range_id_key(range_id, APPLIED_INDEX_SUFFIX)
}

pub fn raft_last_index_key(range_id: RangeId) -> Vec<u8> {
    range_id_key(range_id, LAST_INDEX_SUFFIX)
}

pub fn raft_tombstone_key(range_id: RangeId) -> Vec<u8> {
    range_id_key(range_id, TOMBSTONE_SUFFIX)
}

pub fn range_lease_key(range_id: RangeId) -> Vec<u8> {
    range_id_key(range_id, LEASE_SUFFIX)
}

pub fn range_stats_key(range_id: RangeId) -> Vec<u8> {
    range_id_key(range_id, RANGE_STATS_SUFFIX)
}

pub fn response_cache_key(range_id: RangeId, wall_time: i64, random: i64) -> Vec<u8> {
    let mut out = range_id_key(range_id, RESPONSE_CACHE_SUFFIX);
    out.extend_from_slice(&(wall_time as u64).to_be_bytes());
    out.extend_from_slice(&(random as u64).to_be_bytes());
    out
}

/// Span covering every response cache entry of a range.
pub fn response_cache_span(range_id: RangeId) -> (Vec<u8>, Vec<u8>) {
    let start = range_id_key(range_id, RESPONSE_CACHE_SUFFIX);
    let mut end = start.clone();
    let last = end.len() - 1;
    end[last] += 1;
    (start, end)
}

/// Order-preserving byte-string encoding: `0x00` escapes to `0x00 0xff`
/// and the string terminates with `0x00 0x01`, so encoded keys sort
/// exactly like their sources and no encoded key is a prefix of another.
pub fn encode_bytes_ascending(key: &[u8], out: &mut Vec<u8>) {
    for &b in key {
        if b == 0x00 {
            out.extend_from_slice(&[0x00, 0xff]);
        } else {
            out.push(b);
        }
    }
    out.extend_from_slice(&[0x00, 0x01]);
}

/// Decode an escape-encoded byte string, returning the decoded bytes and
/// the number of encoded bytes consumed (terminator included).
pub fn decode_bytes_ascending(data: &[u8]) -> anyhow::Result<(Vec<u8>, usize)> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0usize;
    while i < data.len() {
        let b = data[i];
        if b != 0x00 {
            out.push(b);
            i += 1;
            continue;
        }
        anyhow::ensure!(i + 1 < data.len(), "unterminated escape-encoded key");
        match data[i + 1] {
            0x01 => return Ok((out, i + 2)),
            0xff => {
                out.push(0x00);
                i += 2;
            }
            other => anyhow::bail!("invalid key escape byte {other:#04x}"),
        }
    }
    anyhow::bail!("escape-encoded key missing terminator")
}

fn range_key_prefix(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LOCAL_PREFIX.len() + 1 + key.len() + 2);
    out.extend_from_slice(LOCAL_PREFIX);
    out.push(RANGE_KEY_INFIX);
    encode_bytes_ascending(key, &mut out);
    out
}

pub fn range_descriptor_key(start_key: &[u8]) -> Vec<u8> {
    let mut out = range_key_prefix(start_key);
    out.extend_from_slice(DESCRIPTOR_SUFFIX);
    out
}

pub fn transaction_key(key: &[u8], id: TxnId) -> Vec<u8> {
    let mut out = range_key_prefix(key);
    out.extend_from_slice(TRANSACTION_SUFFIX);
    out.extend_from_slice(&id.0);
    out
}

/// Span of range-key-local keys anchored inside `[start, end)`. The keys
/// embed a length prefix, so the span bounds use the same framing.
pub fn range_key_local_span(start: &[u8], end: &[u8]) -> (Vec<u8>, Vec<u8>) {
    (range_key_prefix(start), range_key_prefix(end))
}

pub fn store_ident_key() -> Vec<u8> {
    let mut out = Vec::with_capacity(LOCAL_PREFIX.len() + 1 + 4);
    out.extend_from_slice(LOCAL_PREFIX);
    out.push(STORE_INFIX);
    out.extend_from_slice(b"iden");
    out
}

pub fn store_range_id_generator_key() -> Vec<u8> {
    let mut out = Vec::with_capacity(LOCAL_PREFIX.len() + 1 + 4);
    out.extend_from_slice(LOCAL_PREFIX);
    out.push(STORE_INFIX);
    out.extend_from_slice(b"rgid");
    out
}

/// Addressing record location for a range ending at `end_key`: meta2 for
/// user ranges, meta1 for meta2 ranges.
pub fn range_meta_key(end_key: &[u8]) -> Vec<u8> {
    if let Some(stripped) = end_key.strip_prefix(META2_PREFIX) {
        let mut out = META1_PREFIX.to_vec();
        out.extend_from_slice(stripped);
        return out;
    }
    if end_key.starts_with(META1_PREFIX) {
        return KEY_MIN.to_vec();
    }
    let mut out = META2_PREFIX.to_vec();
    out.extend_from_slice(end_key);
    out
}

pub fn is_local(key: &[u8]) -> bool {
    key.starts_with(LOCAL_PREFIX)
}

/// Whether a local key is a transaction record key.
pub fn is_transaction_key(key: &[u8]) -> bool {
    if !is_local(key) || key.get(LOCAL_PREFIX.len()) != Some(&RANGE_KEY_INFIX) {
        return false;
    }
    match decode_bytes_ascending(&key[LOCAL_PREFIX.len() + 1..]) {
        Ok((_, used)) => key[LOCAL_PREFIX.len() + 1 + used..].starts_with(TRANSACTION_SUFFIX),
        Err(_) => false,
    }
}

/// The address key used for routing. Global keys address themselves;
/// range-key-local keys address their embedded anchor key; other local
/// keys have no address.
pub fn addr(key: &[u8]) -> anyhow::Result<Vec<u8>> {
    if !is_local(key) {
        return Ok(key.to_vec());
    }
    let rest = &key[LOCAL_PREFIX.len()..];
    anyhow::ensure!(
        rest.first() == Some(&RANGE_KEY_INFIX),
        "local key {key:?} is not addressable"
    );
    let (anchor, _) = decode_bytes_ascending(&rest[1..])?;
    Ok(anchor)
}

/// First key strictly after every key with prefix `key`.
pub fn next_key(key: &[u8]) -> Vec<u8> {
    let mut out = key.to_vec();
    out.push(0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_keys_stay_below_local_max() {
        assert!(raft_log_key(1, 5).as_slice() < LOCAL_MAX);
        assert!(range_descriptor_key(b"a").as_slice() < LOCAL_MAX);
        assert!(store_ident_key().as_slice() < LOCAL_MAX);
        assert!(META1_PREFIX > LOCAL_MAX);
        assert!(META2_PREFIX > META1_PREFIX);
        assert!(META2_PREFIX < KEY_MAX);
    }

    #[test]
    fn raft_log_keys_sort_by_index() {
        let a = raft_log_key(1, 1);
        let b = raft_log_key(1, 2);
        let c = raft_log_key(1, 256);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(decode_raft_log_index(1, &c).expect("decode"), 256);
    }

    #[test]
    fn addr_recovers_anchor_key() {
        let desc_key = range_descriptor_key(b"house");
        assert_eq!(addr(&desc_key).expect("addr"), b"house");
        let txn_key = transaction_key(b"house", TxnId([7; 16]));
        assert_eq!(addr(&txn_key).expect("addr"), b"house");
        assert_eq!(addr(b"user-key").expect("addr"), b"user-key");
        // Range-ID local keys have no address.
        assert!(addr(&raft_hard_state_key(1)).is_err());
    }

    #[test]
    fn range_meta_key_levels() {
        let user_end = b"zzz";
        let meta2 = range_meta_key(user_end);
        assert!(meta2.starts_with(META2_PREFIX));
        let meta1 = range_meta_key(&meta2);
        assert!(meta1.starts_with(META1_PREFIX));
        assert_eq!(range_meta_key(&meta1), KEY_MIN.to_vec());
    }

    #[test]
    fn range_key_local_span_contains_descriptor() {
        let (lo, hi) = range_key_local_span(b"a", b"c");
        let desc = range_descriptor_key(b"b");
        assert!(lo.as_slice() <= desc.as_slice() && desc.as_slice() < hi.as_slice());
        let outside = range_descriptor_key(b"d");
        assert!(outside.as_slice() >= hi.as_slice());
    }

    #[test]
    fn range_key_local_keys_sort_like_their_anchors() {
        // "ab" < "b" must hold for the anchored local keys too.
        let ab = range_descriptor_key(b"ab");
        let b = range_descriptor_key(b"b");
        assert!(ab < b);
        // Anchors containing zero bytes keep their order.
        let z1 = range_descriptor_key(b"a\x00");
        let z2 = range_descriptor_key(b"a\x00\x01");
        assert!(range_descriptor_key(b"a") < z1);
        assert!(z1 < z2);
        assert!(z2 < b);
    }

    #[test]
    fn transaction_keys_are_recognized() {
        let txn_key = transaction_key(b"anchor", TxnId([9; 16]));
        assert!(is_transaction_key(&txn_key));
        assert!(!is_transaction_key(&range_descriptor_key(b"anchor")));
        assert!(!is_transaction_key(b"anchor"));
    }

    #[test]
    fn escape_encoding_roundtrip() {
        for key in [&b""[..], b"a", b"a\x00b", b"\x00\x00", b"\xff"] {
            let mut enc = Vec::new();
            encode_bytes_ascending(key, &mut enc);
            let (dec, used) = decode_bytes_ascending(&enc).expect("decode");
            assert_eq!(dec, key);
            assert_eq!(used, enc.len());
        }
    }
}
