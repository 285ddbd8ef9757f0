//! Tagged values with key-seeded checksums.

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueTag {
    #[default]
    Bytes,
    Int,
    Float,
    Time,
    TimeSeries,
}

impl ValueTag {
    fn code(self) -> u8 {
        match self {
            ValueTag::Bytes => 0,
            ValueTag::Int => 1,
            ValueTag::Float => 2,
            ValueTag::Time => 3,
            ValueTag::TimeSeries => 4,
        }
    }
}

/// A stored value: raw bytes interpreted per tag, an optional version
/// timestamp filled in on reads, and a CRC keyed by the owning user key
/// so a value cannot be transplanted to another key undetected.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Value {
    pub tag: ValueTag,
    pub raw: Vec<u8>,
    pub timestamp: Option<Timestamp>,
    pub checksum: Option<u32>,
}

impl Value {
    pub fn from_bytes(raw: Vec<u8>) -> Self {
        Self {
            tag: ValueTag::Bytes,
            raw,
            timestamp: None,
            checksum: None,
        }
    }

    pub fn from_int(v: i64) -> Self {
        Self {
            tag: ValueTag::Int,
            raw: v.to_be_bytes().to_vec(),
            timestamp: None,
            checksum: None,
        }
    }

    pub fn from_float(v: f64) -> Self {
        Self {
            tag: ValueTag::Float,
            raw: v.to_bits().to_be_bytes().to_vec(),
            timestamp: None,
            checksum: None,
        }
    }

    pub fn from_time(ts: Timestamp) -> Self {
        let mut raw = Vec::with_capacity(12);
        raw.extend_from_slice(&ts.wall_time.to_be_bytes());
        raw.extend_from_slice(&ts.logical.to_be_bytes());
        Self {
            tag: ValueTag::Time,
            raw,
            timestamp: None,
            checksum: None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn as_int(&self) -> anyhow::Result<i64> {
        anyhow::ensure!(
            self.tag == ValueTag::Int,
            "value is {:?}, not an integer",
            self.tag
        );
        anyhow::ensure!(self.raw.len() == 8, "malformed integer value");
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.raw);
        Ok(i64::from_be_bytes(buf))
    }

    pub fn as_float(&self) -> anyhow::Result<f64> {
        anyhow::ensure!(
            self.tag == ValueTag::Float,
            "value is {:?}, not a float",
            self.tag
        );
        anyhow::ensure!(self.raw.len() == 8, "malformed float value");
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.raw);
        Ok(f64::from_bits(u64::from_be_bytes(buf)))
    }

    fn compute_checksum(&self, key: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(key);
        hasher.update(&[self.tag.code()]);
        hasher.update(&self.raw);
        hasher.finalize()
    }

    /// Seed the checksum for the key this value will be written under.
    pub fn init_checksum(&mut self, key: &[u8]) {
        self.checksum = Some(self.compute_checksum(key));
    }

    /// Verify the checksum, if one was initialized, against `key`.
    pub fn verify(&self, key: &[u8]) -> anyhow::Result<()> {
        if let Some(sum) = self.checksum {
            let actual = self.compute_checksum(key);
            anyhow::ensure!(
                sum == actual,
                "invalid checksum ({actual:08x} != {sum:08x}) for key {key:?}"
            );
        }
        Ok(())
    }

    /// Byte-wise equality of the stored payload (tag plus raw bytes),
    /// ignoring timestamps and checksums. This is the comparison used by
    /// conditional puts.
    pub fn payload_equal(&self, other: &Value) -> bool {
        self.tag == other.tag && self.raw == other.raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_roundtrip() {
        let v = Value::from_int(-42);
        assert_eq!(v.as_int().expect("int"), -42);
        assert!(v.as_float().is_err());
    }

    #[test]
    fn checksum_is_keyed() {
        let mut v = Value::from_bytes(b"payload".to_vec());
        v.init_checksum(b"key-a");
        assert!(v.verify(b"key-a").is_ok());
        // The same value transplanted under another key fails.
        assert!(v.verify(b"key-b").is_err());
    }

    #[test]
    fn checksum_covers_tag_and_raw() {
        let mut a = Value::from_bytes(8i64.to_be_bytes().to_vec());
        a.init_checksum(b"k");
        let mut b = Value::from_int(8);
        b.init_checksum(b"k");
        // Same raw bytes, different tag: checksums must differ.
        assert_ne!(a.checksum, b.checksum);
    }

    #[test]
    fn unset_checksum_verifies() {
        let v = Value::from_bytes(b"x".to_vec());
        assert!(v.verify(b"anything").is_ok());
    }
}
