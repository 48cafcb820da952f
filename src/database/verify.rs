//! Offline integrity check
//!
//! Runs against a cache directory that no instance in this process has
//! mounted. Both tables and the overflow files are cross-checked, and the
//! attribute table is dumped as JSON lines next to the store.

use super::core::BlobCache;
use crate::config::CacheConfig;
use crate::storage::tables::{attribute_table_name, blob_table_name, decode_key};
use crate::storage::{AttributeRecord, AttributeTable, BlobTable, Checksum, OverflowFiles};
use crate::txn::env::{open_detached, remove_region_file};
use crate::txn::SharedEnv;
use crate::{CacheError, Result};
use ahash::AHashSet;
use heed::types::Bytes;
use heed::{Database, Env};
use rayon::prelude::*;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// One inconsistency found by [`BlobCache::verify`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum VerifyIssue {
    /// Attribute row whose key or value does not decode (raw key in hex)
    UndecodableAttribute { raw_key: String },
    /// Inline entry without a blob row
    MissingBlob { key: String },
    MissingOverflowFile { key: String },
    SizeMismatch { key: String, expected: u64, actual: u64 },
    ChecksumMismatch { key: String, expected: u32, actual: u32 },
    /// Blob row without an attribute record
    OrphanBlob { key: String },
    /// Overflow file no attribute record points to
    OrphanFile { path: PathBuf },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub attributes: u64,
    pub probes: u64,
    pub blobs: u64,
    pub overflow_entries: u64,
    pub overflow_files: u64,
    pub issues: Vec<VerifyIssue>,
    /// JSON-lines dump of the attribute table
    pub dump_path: Option<PathBuf>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

#[derive(Serialize)]
struct DumpLine<'a> {
    key: &'a str,
    version: i32,
    subkey: &'a str,
    #[serde(flatten)]
    record: AttributeRecord,
}

impl BlobCache {
    /// Check the cache `name` stored under `path`.
    ///
    /// With `force_remove` the region file is deleted afterwards, whoever
    /// left it behind.
    pub fn verify(path: impl AsRef<Path>, name: &str, force_remove: bool) -> Result<VerifyReport> {
        let path = path.as_ref();
        if SharedEnv::is_live(path) {
            return Err(CacheError::InvalidArgument(format!(
                "cache directory {} is mounted in this process",
                path.display()
            )));
        }

        let mut config = CacheConfig::new(path, name);
        config.read_only = true;
        config.validate()?;

        let env = open_detached(path, &config)?;
        let result = scan(&env, path, name);
        env.prepare_for_closing().wait();
        if force_remove {
            remove_region_file(path)?;
        }

        let report = result?;
        for issue in &report.issues {
            tracing::warn!(cache = name, ?issue, "Verify finding");
        }
        tracing::info!(
            cache = name,
            path = %path.display(),
            attributes = report.attributes,
            blobs = report.blobs,
            issues = report.issues.len(),
            "Verify finished"
        );
        Ok(report)
    }
}

fn scan(env: &Env, dir: &Path, name: &str) -> Result<VerifyReport> {
    let files = OverflowFiles::new(dir, name);
    let txn = env.read_txn()?;
    let blob_db: Option<Database<Bytes, Bytes>> = env.open_database(&txn, Some(blob_table_name(name).as_str()))?;
    let attr_db: Option<Database<Bytes, Bytes>> =
        env.open_database(&txn, Some(attribute_table_name(name).as_str()))?;
    let (Some(blob_db), Some(attr_db)) = (blob_db, attr_db) else {
        return Err(CacheError::StoreOpen(format!("tables of cache '{}' do not exist", name)));
    };
    let blobs = BlobTable::new(blob_db);
    let attrs = AttributeTable::new(attr_db);

    let mut report = VerifyReport::default();
    let mut attribute_keys: AHashSet<Vec<u8>> = AHashSet::new();
    let mut referenced: AHashSet<PathBuf> = AHashSet::new();
    let mut overflow_checks: Vec<OverflowCheck> = Vec::new();

    let dump_path = dir.join(format!("{}.db.bak", attribute_table_name(name)));
    let mut dump = BufWriter::new(File::create(&dump_path)?);

    // 1. Attributes against blobs and files
    attrs.for_each(&txn, |raw, value| {
        report.attributes += 1;
        attribute_keys.insert(raw.to_vec());

        let (key, record) = match (decode_key(raw), AttributeRecord::decode(value)) {
            (Ok(key), Ok(record)) => (key, record),
            _ => {
                report.issues.push(VerifyIssue::UndecodableAttribute {
                    raw_key: hex::encode(raw),
                });
                return Ok(());
            }
        };
        let line = DumpLine {
            key: &key.key,
            version: key.version,
            subkey: &key.subkey,
            record,
        };
        serde_json::to_writer(&mut dump, &line)?;
        dump.write_all(b"\n")?;

        if record.probe {
            report.probes += 1;
            return Ok(());
        }

        if record.overflow {
            // file contents are checked after the table scan
            report.overflow_entries += 1;
            let path = files.path_for_key(&key);
            referenced.insert(path.clone());
            overflow_checks.push(OverflowCheck {
                key: key.to_string(),
                path,
                record,
            });
            return Ok(());
        }

        match blobs.get(&txn, &key)? {
            Some(data) => {
                let issue = compare(&key.to_string(), &record, data.len() as u64, Checksum::compute(data));
                report.issues.extend(issue);
            }
            None => report.issues.push(VerifyIssue::MissingBlob { key: key.to_string() }),
        }
        Ok(())
    })?;
    dump.flush()?;

    // 2. Blobs without attributes
    blobs.for_each(&txn, |raw, _| {
        report.blobs += 1;
        if !attribute_keys.contains(raw) {
            let key = decode_key(raw)
                .map(|key| key.to_string())
                .unwrap_or_else(|_| hex::encode(raw));
            report.issues.push(VerifyIssue::OrphanBlob { key });
        }
        Ok(())
    })?;
    txn.commit()?;

    // 3. Overflow payloads, hashed in parallel
    let findings: Vec<Result<Option<VerifyIssue>>> = overflow_checks
        .par_iter()
        .map(|check| check.run(&files))
        .collect();
    for finding in findings {
        report.issues.extend(finding?);
    }

    // 4. Files without attributes
    for path in files.list()? {
        report.overflow_files += 1;
        if !referenced.contains(&path) {
            report.issues.push(VerifyIssue::OrphanFile { path });
        }
    }

    report.dump_path = Some(dump_path);
    Ok(report)
}

struct OverflowCheck {
    key: String,
    path: PathBuf,
    record: AttributeRecord,
}

impl OverflowCheck {
    fn run(&self, files: &OverflowFiles) -> Result<Option<VerifyIssue>> {
        match files.open_read(&self.path) {
            Ok(file) => {
                let (crc, len) = Checksum::compute_reader(file)?;
                Ok(compare(&self.key, &self.record, len, crc))
            }
            Err(CacheError::NotFound(_)) => Ok(Some(VerifyIssue::MissingOverflowFile {
                key: self.key.clone(),
            })),
            Err(e) => Err(e),
        }
    }
}

fn compare(key: &str, record: &AttributeRecord, len: u64, crc: u32) -> Option<VerifyIssue> {
    if len != record.size {
        Some(VerifyIssue::SizeMismatch {
            key: key.to_string(),
            expected: record.size,
            actual: len,
        })
    } else if crc != record.checksum {
        Some(VerifyIssue::ChecksumMismatch {
            key: key.to_string(),
            expected: record.checksum,
            actual: crc,
        })
    } else {
        None
    }
}
