//! Record schemas: the Blob Table and the Attribute Table
//!
//! Both tables are keyed by the same byte encoding of [`CacheKey`]:
//!
//! ```text
//! key bytes | 0x00 | version (i32, sign bit flipped, big endian) | subkey bytes
//! ```
//!
//! Byte order of encoded keys equals `CacheKey` order, so a prefix scan on
//! `key | 0x00` visits every version and subkey of one key in order, and a
//! forward range from any encoded key resumes a full-table scan.

use crate::types::{CacheKey, Timestamp};
use crate::{CacheError, Result};
use heed::types::Bytes;
use heed::{Database, RoTxn, RwTxn};
use serde::{Deserialize, Serialize};
use std::ops::Bound;

const VERSION_LEN: usize = 4;

/// Named database holding inline payloads
pub fn blob_table_name(cache_name: &str) -> String {
    format!("lcs_{}", cache_name)
}

/// Named database holding attribute records
pub fn attribute_table_name(cache_name: &str) -> String {
    format!("lcs_{}_attr", cache_name)
}

/// Encode a cache key for the store
pub fn encode_key(key: &str, version: i32, subkey: &str) -> Result<Vec<u8>> {
    if key.as_bytes().contains(&0) {
        return Err(CacheError::InvalidArgument(format!(
            "cache key {:?} contains a NUL byte",
            key
        )));
    }
    let mut buf = Vec::with_capacity(key.len() + 1 + VERSION_LEN + subkey.len());
    buf.extend_from_slice(key.as_bytes());
    buf.push(0);
    buf.extend_from_slice(&((version as u32) ^ 0x8000_0000).to_be_bytes());
    buf.extend_from_slice(subkey.as_bytes());
    Ok(buf)
}

pub fn encode_cache_key(cache_key: &CacheKey) -> Result<Vec<u8>> {
    encode_key(&cache_key.key, cache_key.version, &cache_key.subkey)
}

/// Prefix covering every version/subkey of `key`
pub fn key_prefix(key: &str) -> Result<Vec<u8>> {
    if key.as_bytes().contains(&0) {
        return Err(CacheError::InvalidArgument(format!(
            "cache key {:?} contains a NUL byte",
            key
        )));
    }
    let mut buf = Vec::with_capacity(key.len() + 1);
    buf.extend_from_slice(key.as_bytes());
    buf.push(0);
    Ok(buf)
}

pub fn decode_key(raw: &[u8]) -> Result<CacheKey> {
    let nul = raw
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| CacheError::Corruption("table key without separator".into()))?;
    let rest = &raw[nul + 1..];
    if rest.len() < VERSION_LEN {
        return Err(CacheError::Corruption("table key truncated before version".into()));
    }
    let mut version = [0u8; VERSION_LEN];
    version.copy_from_slice(&rest[..VERSION_LEN]);
    let version = (u32::from_be_bytes(version) ^ 0x8000_0000) as i32;

    let key = String::from_utf8(raw[..nul].to_vec())
        .map_err(|_| CacheError::Corruption("table key is not UTF-8".into()))?;
    let subkey = String::from_utf8(rest[VERSION_LEN..].to_vec())
        .map_err(|_| CacheError::Corruption("table subkey is not UTF-8".into()))?;
    Ok(CacheKey { key, version, subkey })
}

/// Per-entry metadata kept in the Attribute Table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRecord {
    /// Last update (or access) time, seconds
    pub time_stamp: Timestamp,
    /// Payload lives in an overflow file
    pub overflow: bool,
    /// Payload length in bytes
    pub size: u64,
    /// CRC32 of the payload
    pub checksum: u32,
    /// Key/version probe record (subkey collapsed to "")
    pub probe: bool,
}

impl AttributeRecord {
    pub fn entry(time_stamp: Timestamp, overflow: bool, size: u64, checksum: u32) -> Self {
        Self {
            time_stamp,
            overflow,
            size,
            checksum,
            probe: false,
        }
    }

    pub fn probe(time_stamp: Timestamp) -> Self {
        Self {
            time_stamp,
            overflow: false,
            size: 0,
            checksum: 0,
            probe: true,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(raw)?)
    }
}

/// One scanned attribute row
#[derive(Debug, Clone)]
pub struct AttributeRow {
    pub raw_key: Vec<u8>,
    pub key: CacheKey,
    pub record: AttributeRecord,
}

/// Blob Table: inline payloads only
#[derive(Clone, Copy)]
pub struct BlobTable {
    db: Database<Bytes, Bytes>,
}

impl BlobTable {
    pub fn new(db: Database<Bytes, Bytes>) -> Self {
        Self { db }
    }

    pub fn get<'t>(&self, txn: &'t RoTxn, key: &CacheKey) -> Result<Option<&'t [u8]>> {
        let raw = encode_cache_key(key)?;
        Ok(self.db.get(txn, &raw)?)
    }

    pub fn put(&self, txn: &mut RwTxn, key: &CacheKey, data: &[u8]) -> Result<()> {
        let raw = encode_cache_key(key)?;
        self.db.put(txn, &raw, data)?;
        Ok(())
    }

    pub fn delete(&self, txn: &mut RwTxn, key: &CacheKey) -> Result<bool> {
        let raw = encode_cache_key(key)?;
        Ok(self.db.delete(txn, &raw)?)
    }

    /// Copy up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns `(copied, total_len)`, or `None` when the row is gone.
    pub fn read_at(
        &self,
        txn: &RoTxn,
        key: &CacheKey,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<Option<(usize, u64)>> {
        let Some(value) = self.get(txn, key)? else {
            return Ok(None);
        };
        let total = value.len() as u64;
        if offset >= total {
            return Ok(Some((0, total)));
        }
        let start = offset as usize;
        let n = buf.len().min(value.len() - start);
        buf[..n].copy_from_slice(&value[start..start + n]);
        Ok(Some((n, total)))
    }

    /// Every stored row under `key`, any version or subkey
    pub fn keys_for(&self, txn: &RoTxn, key: &str) -> Result<Vec<CacheKey>> {
        let prefix = key_prefix(key)?;
        let mut keys = Vec::new();
        for item in self.db.prefix_iter(txn, &prefix)? {
            let (raw, _) = item?;
            keys.push(decode_key(raw)?);
        }
        Ok(keys)
    }

    /// Visit every row (used by offline verification)
    pub fn for_each<F>(&self, txn: &RoTxn, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        for item in self.db.iter(txn)? {
            let (raw, value) = item?;
            f(raw, value)?;
        }
        Ok(())
    }

    pub fn clear(&self, txn: &mut RwTxn) -> Result<()> {
        self.db.clear(txn)?;
        Ok(())
    }

    pub fn len(&self, txn: &RoTxn) -> Result<u64> {
        Ok(self.db.len(txn)?)
    }
}

/// Attribute Table: one record per live entry, plus probe records.
///
/// Two logical indexes live here. "By full key" holds one record per
/// (key, version, subkey). "By key ignoring subkey" holds the probe record at
/// (key, version, "") so a key/version can be checked without knowing any
/// subkey. When subkey tracking is off, `put_entry` writes both and
/// `delete_entry` removes the probe together with the last sibling.
#[derive(Clone, Copy)]
pub struct AttributeTable {
    db: Database<Bytes, Bytes>,
}

impl AttributeTable {
    pub fn new(db: Database<Bytes, Bytes>) -> Self {
        Self { db }
    }

    pub fn get(&self, txn: &RoTxn, key: &CacheKey) -> Result<Option<AttributeRecord>> {
        let raw = encode_cache_key(key)?;
        match self.db.get(txn, &raw)? {
            Some(value) => Ok(Some(AttributeRecord::decode(value)?)),
            None => Ok(None),
        }
    }

    fn put(&self, txn: &mut RwTxn, key: &CacheKey, record: &AttributeRecord) -> Result<()> {
        let raw = encode_cache_key(key)?;
        let value = record.encode()?;
        self.db.put(txn, &raw, &value)?;
        Ok(())
    }

    /// Insert or replace an entry record, keeping the probe index in sync
    pub fn put_entry(
        &self,
        txn: &mut RwTxn,
        key: &CacheKey,
        record: AttributeRecord,
        track_subkey: bool,
    ) -> Result<()> {
        self.put(txn, key, &record)?;
        if !track_subkey && !key.subkey.is_empty() {
            self.touch(txn, &key.probe(), record.time_stamp)?;
        }
        Ok(())
    }

    /// Set the time stamp of a record, creating a probe record if absent
    pub fn touch(&self, txn: &mut RwTxn, key: &CacheKey, time_stamp: Timestamp) -> Result<()> {
        let record = match self.get(txn, key)? {
            Some(mut existing) => {
                existing.time_stamp = time_stamp;
                existing
            }
            None => AttributeRecord::probe(time_stamp),
        };
        self.put(txn, key, &record)
    }

    /// Set the time stamp of an existing record; absent records stay absent
    pub fn touch_existing(&self, txn: &mut RwTxn, key: &CacheKey, time_stamp: Timestamp) -> Result<bool> {
        match self.get(txn, key)? {
            Some(mut existing) => {
                existing.time_stamp = existing.time_stamp.max(time_stamp);
                self.put(txn, key, &existing)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete an entry record; drop the probe once no sibling remains.
    ///
    /// An empty-subkey record that still has siblings is demoted to a probe
    /// instead of being deleted.
    pub fn delete_entry(&self, txn: &mut RwTxn, key: &CacheKey) -> Result<bool> {
        let raw = encode_cache_key(key)?;
        if key.subkey.is_empty() {
            if let Some(record) = self.get(txn, key)? {
                if self.has_siblings(txn, key)? {
                    if !record.probe {
                        self.put(txn, key, &AttributeRecord::probe(record.time_stamp))?;
                    }
                    return Ok(!record.probe);
                }
            }
            return Ok(self.db.delete(txn, &raw)?);
        }

        let deleted = self.db.delete(txn, &raw)?;

        let probe = key.probe();
        if let Some(record) = self.get(txn, &probe)? {
            if record.probe && !self.has_siblings(txn, &probe)? {
                let raw = encode_cache_key(&probe)?;
                self.db.delete(txn, &raw)?;
            }
        }
        Ok(deleted)
    }

    /// Any non-probe record for the same key/version, other than the probe slot itself
    fn has_siblings(&self, txn: &RoTxn, probe: &CacheKey) -> Result<bool> {
        let prefix = encode_key(&probe.key, probe.version, "")?;
        for item in self.db.prefix_iter(txn, &prefix)? {
            let (raw, value) = item?;
            if raw == prefix.as_slice() {
                continue;
            }
            if !AttributeRecord::decode(value)?.probe {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Every record under `key` (entries and probes)
    pub fn rows_for(&self, txn: &RoTxn, key: &str) -> Result<Vec<AttributeRow>> {
        let prefix = key_prefix(key)?;
        let mut rows = Vec::new();
        for item in self.db.prefix_iter(txn, &prefix)? {
            let (raw, value) = item?;
            rows.push(AttributeRow {
                raw_key: raw.to_vec(),
                key: decode_key(raw)?,
                record: AttributeRecord::decode(value)?,
            });
        }
        Ok(rows)
    }

    /// Forward cursor: up to `limit` rows strictly after `after`.
    ///
    /// The second value is false once the end of the table was reached.
    pub fn scan_after(
        &self,
        txn: &RoTxn,
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<(Vec<AttributeRow>, bool)> {
        let lower = match after {
            Some(raw) => Bound::Excluded(raw),
            None => Bound::Unbounded,
        };
        let range: (Bound<&[u8]>, Bound<&[u8]>) = (lower, Bound::Unbounded);

        let mut rows = Vec::with_capacity(limit.min(1024));
        let mut iter = self.db.range(txn, &range)?;
        while rows.len() < limit {
            match iter.next() {
                Some(item) => {
                    let (raw, value) = item?;
                    rows.push(AttributeRow {
                        raw_key: raw.to_vec(),
                        key: decode_key(raw)?,
                        record: AttributeRecord::decode(value)?,
                    });
                }
                None => return Ok((rows, false)),
            }
        }
        let more = iter.next().is_some();
        Ok((rows, more))
    }

    /// Visit every raw row (used by offline verification)
    pub fn for_each<F>(&self, txn: &RoTxn, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        for item in self.db.iter(txn)? {
            let (raw, value) = item?;
            f(raw, value)?;
        }
        Ok(())
    }

    pub fn clear(&self, txn: &mut RwTxn) -> Result<()> {
        self.db.clear(txn)?;
        Ok(())
    }

    pub fn len(&self, txn: &RoTxn) -> Result<u64> {
        Ok(self.db.len(txn)?)
    }
}
