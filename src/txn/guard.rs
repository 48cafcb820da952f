//! Transaction guard
//!
//! Every mutation of the blob and attribute tables runs inside exactly one
//! [`with_transaction`] call: the closure gets the write transaction, a normal
//! return commits, an error aborts. Guards do not nest; LMDB allows a single
//! write transaction per environment at a time.

use crate::config::WriteSyncMode;
use crate::txn::env::SharedEnv;
use crate::{CacheError, Result};
use heed::{RoTxn, RwTxn};

/// Run `f` in one write transaction over both tables
pub fn with_transaction<T, F>(shared: &SharedEnv, sync: WriteSyncMode, f: F) -> Result<T>
where
    F: FnOnce(&mut RwTxn) -> Result<T>,
{
    if shared.is_read_only() {
        return Err(CacheError::ReadOnly);
    }

    let mut txn = shared.env().write_txn()?;
    match f(&mut txn) {
        Ok(value) => {
            txn.commit()?;
            shared.record_commit();
            if sync.requires_immediate_sync() {
                shared.force_sync()?;
            }
            Ok(value)
        }
        Err(e) => {
            txn.abort();
            shared.record_abort();
            Err(e)
        }
    }
}

/// Run `f` in a short read transaction
pub fn with_read_txn<T, F>(shared: &SharedEnv, f: F) -> Result<T>
where
    F: FnOnce(&RoTxn) -> Result<T>,
{
    let txn = shared.env().read_txn()?;
    let value = f(&txn)?;
    txn.commit()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::txn::env::{open_environment, release_environment};
    use heed::types::Bytes;
    use heed::Database;
    use tempfile::TempDir;

    #[test]
    fn test_commit_and_abort() {
        let dir = TempDir::new().unwrap();
        let opened = open_environment(&CacheConfig::for_testing(dir.path())).unwrap();
        let shared = opened.shared;

        let db: Database<Bytes, Bytes> = with_transaction(&shared, WriteSyncMode::WriteSync, |txn| {
            Ok(shared.env().create_database(txn, Some("guard_test"))?)
        })
        .unwrap();

        with_transaction(&shared, WriteSyncMode::WriteNoSync, |txn| {
            db.put(txn, &b"kept"[..], &b"1"[..])?;
            Ok(())
        })
        .unwrap();

        let err = with_transaction(&shared, WriteSyncMode::WriteNoSync, |txn| {
            db.put(txn, &b"dropped"[..], &b"2"[..])?;
            Err::<(), _>(CacheError::InvalidArgument("boom".into()))
        });
        assert!(err.is_err());

        let (kept, dropped) = with_read_txn(&shared, |txn| {
            Ok((db.get(txn, &b"kept"[..])?.is_some(), db.get(txn, &b"dropped"[..])?.is_some()))
        })
        .unwrap();
        assert!(kept);
        assert!(!dropped);
        assert_eq!(shared.commits(), 2);
        assert_eq!(shared.aborts(), 1);

        release_environment(shared, true).unwrap();
    }
}
