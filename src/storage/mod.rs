//! Storage layer
//!
//! Table schemas over the LMDB environment, overflow files for large
//! payloads, and payload checksums.

pub mod checksum;
pub mod file_manager;
pub mod tables;

pub use checksum::{Checksum, ChecksumBuilder};
pub use file_manager::{OverflowFiles, OVERFLOW_SUFFIX};
pub use tables::{AttributeRecord, AttributeRow, AttributeTable, BlobTable};
