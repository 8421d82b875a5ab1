//! File metadata
//!
//! A `FileMeta` describes one file packed into a shard. Size, start offset
//! and checksum are filled in when the file is written.

use crate::checksum::crc32c;
use crate::error::{Result, XyzError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata for a single file stored inside a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Random file identifier
    pub id: Uuid,
    /// Full virtual path, e.g. `/photos/cat.jpg`
    pub full_name: String,
    /// Creation time (unix seconds)
    pub created: u32,
    /// Content length in bytes
    pub size: u32,
    /// Offset of the content inside the shard contents section
    pub start_offset: u32,
    /// CRC32C of the content
    pub checksum: u32,
}

impl FileMeta {
    /// Create metadata for a new file; size, offset and checksum are unset.
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            full_name: full_name.into(),
            created: crate::unix_now() as u32,
            size: 0,
            start_offset: 0,
            checksum: 0,
        }
    }

    /// Fill in size and checksum from the file content.
    pub fn describe(&mut self, data: &[u8]) -> Result<()> {
        self.size = u32::try_from(data.len()).map_err(|_| XyzError::FileTooLarge {
            size: data.len() as u64,
            max: u32::MAX as u64,
        })?;
        self.checksum = crc32c(data);
        Ok(())
    }

    /// Check content against the recorded size and checksum.
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        if data.len() as u64 != self.size as u64 {
            return Err(XyzError::CorruptData(format!(
                "{}: expected {} bytes, got {}",
                self.full_name,
                self.size,
                data.len()
            )));
        }
        let actual = crc32c(data);
        if actual != self.checksum {
            return Err(XyzError::ChecksumMismatch {
                expected: self.checksum,
                actual,
            });
        }
        Ok(())
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// End offset (exclusive) inside the shard contents
    pub fn end_offset(&self) -> u64 {
        self.start_offset as u64 + self.size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_and_verify() {
        let mut meta = FileMeta::new("/docs/readme.md");
        meta.describe(b"hello world").unwrap();
        assert_eq!(meta.size, 11);
        assert!(meta.verify(b"hello world").is_ok());
        assert!(matches!(
            meta.verify(b"hello_world"),
            Err(XyzError::ChecksumMismatch { .. })
        ));
        assert!(matches!(meta.verify(b"hello"), Err(XyzError::CorruptData(_))));
    }

    #[test]
    fn test_json_bytes() {
        let mut meta = FileMeta::new("/a/b/c.bin");
        meta.describe(&[7u8; 300]).unwrap();
        meta.start_offset = 4096;

        let bytes = meta.to_bytes().unwrap();
        let parsed = FileMeta::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, meta);
        assert_eq!(parsed.end_offset(), 4396);
    }
}
