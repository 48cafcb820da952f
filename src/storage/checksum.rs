//! Payload checksums
//!
//! Every stored blob carries the CRC32 of its payload in its attribute
//! record. Writers fold bytes in as they arrive through [`ChecksumBuilder`];
//! offline verification recomputes and compares.
//!
//! ```ignore
//! use motecache::storage::checksum::Checksum;
//!
//! let data = b"payload";
//! let crc = Checksum::compute(data);
//! Checksum::verify(data, crc)?;
//! ```

use crate::{CacheError, Result};
use crc32fast::Hasher;
use std::io::{self, Read, Write};

pub struct Checksum;

impl Checksum {
    pub fn compute(data: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// Compare against an expected value, `Corruption` on mismatch
    pub fn verify(data: &[u8], expected: u32) -> Result<()> {
        let actual = Self::compute(data);
        if actual != expected {
            return Err(CacheError::Corruption(format!(
                "checksum mismatch: expected {:#010x}, got {:#010x} (data_len={})",
                expected,
                actual,
                data.len()
            )));
        }
        Ok(())
    }

    /// Drain a reader, returning (checksum, byte count)
    pub fn compute_reader<R: Read>(mut reader: R) -> io::Result<(u32, u64)> {
        let mut builder = ChecksumBuilder::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            builder.update(&buf[..n]);
        }
        Ok((builder.finalize(), builder.len()))
    }
}

/// Incremental CRC32 for streamed payloads
#[derive(Clone, Default)]
pub struct ChecksumBuilder {
    hasher: Hasher,
    len: u64,
}

impl ChecksumBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.len += data.len() as u64;
    }

    /// Bytes folded in so far
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current checksum; the builder stays usable
    pub fn finalize(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}

impl Write for ChecksumBuilder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_basic() {
        let data = b"Hello, cache!";
        let checksum = Checksum::compute(data);

        assert!(Checksum::verify(data, checksum).is_ok());
        assert!(Checksum::verify(data, checksum.wrapping_add(1)).is_err());

        let corrupted = b"Hello, cache?";
        assert!(matches!(
            Checksum::verify(corrupted, checksum),
            Err(CacheError::Corruption(_))
        ));
    }

    #[test]
    fn test_checksum_builder() {
        let mut builder = ChecksumBuilder::new();
        builder.update(b"Hello, ");
        builder.update(b"cache!");
        assert_eq!(builder.len(), 13);
        assert_eq!(builder.finalize(), Checksum::compute(b"Hello, cache!"));

        // finalize does not consume
        builder.update(b"!");
        assert_eq!(builder.finalize(), Checksum::compute(b"Hello, cache!!"));
    }

    #[test]
    fn test_checksum_builder_write_trait() {
        let mut builder = ChecksumBuilder::new();
        builder.write_all(b"Hello, ").unwrap();
        builder.write_all(b"cache!").unwrap();
        builder.flush().unwrap();
        assert_eq!(builder.finalize(), Checksum::compute(b"Hello, cache!"));
    }

    #[test]
    fn test_checksum_reader() {
        let data = vec![7u8; 200_000];
        let (crc, len) = Checksum::compute_reader(&data[..]).unwrap();
        assert_eq!(len, 200_000);
        assert_eq!(crc, Checksum::compute(&data));
    }

    #[test]
    fn test_checksum_empty_data() {
        assert_eq!(Checksum::compute(b""), 0);
        assert!(ChecksumBuilder::new().is_empty());
        assert_eq!(ChecksumBuilder::new().finalize(), 0);
    }
}
