//! Shard file header
//!
//! The header is the last section of a shard file so that a reader can find
//! every other section from the end of the file:
//!
//! ```text
//! "YXZ" | u32 version | u32 file_count | u32 index_len
//!       | u32 file_meta_len | u32 contents_len | u32 header_len
//! ```
//!
//! All integers are big-endian; `header_len` is always the final four bytes.

use bytes::{Buf, BufMut};
use xyzfs_core::error::{Result, XyzError};

pub const SHARD_MAGIC: &[u8; 3] = b"YXZ";
pub const SHARD_FORMAT_VERSION: u32 = 1;
pub const SHARD_HEADER_LEN: u32 = 3 + 4 * 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardMeta {
    pub version: u32,
    pub file_count: u32,
    pub index_len: u32,
    pub file_meta_len: u32,
    pub contents_len: u32,
}

impl Default for ShardMeta {
    fn default() -> Self {
        Self {
            version: SHARD_FORMAT_VERSION,
            file_count: 0,
            index_len: 0,
            file_meta_len: 0,
            contents_len: 0,
        }
    }
}

impl ShardMeta {
    /// Bytes occupied by the whole shard file
    pub fn file_len(&self) -> u64 {
        self.contents_len as u64
            + self.file_meta_len as u64
            + self.index_len as u64
            + SHARD_HEADER_LEN as u64
    }

    /// Offset of the file meta section
    pub fn file_meta_offset(&self) -> u64 {
        self.contents_len as u64
    }

    /// Offset of the index section
    pub fn index_offset(&self) -> u64 {
        self.contents_len as u64 + self.file_meta_len as u64
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SHARD_HEADER_LEN as usize);
        buf.put_slice(SHARD_MAGIC);
        buf.put_u32(self.version);
        buf.put_u32(self.file_count);
        buf.put_u32(self.index_len);
        buf.put_u32(self.file_meta_len);
        buf.put_u32(self.contents_len);
        buf.put_u32(SHARD_HEADER_LEN);
        buf
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SHARD_HEADER_LEN as usize {
            return Err(XyzError::InvalidShardHeader(format!(
                "expected {} header bytes, got {}",
                SHARD_HEADER_LEN,
                bytes.len()
            )));
        }
        if &bytes[..3] != SHARD_MAGIC {
            return Err(XyzError::InvalidShardHeader(format!(
                "bad magic {:?}",
                &bytes[..3]
            )));
        }
        bytes.advance(3);

        let meta = Self {
            version: bytes.get_u32(),
            file_count: bytes.get_u32(),
            index_len: bytes.get_u32(),
            file_meta_len: bytes.get_u32(),
            contents_len: bytes.get_u32(),
        };
        let header_len = bytes.get_u32();
        if meta.version == 0 {
            return Err(XyzError::InvalidShardHeader("version 0".to_string()));
        }
        if header_len != SHARD_HEADER_LEN {
            return Err(XyzError::InvalidShardHeader(format!(
                "header length field {header_len}"
            )));
        }
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let meta = ShardMeta {
            file_count: 2,
            index_len: 100,
            file_meta_len: 50,
            contents_len: 1000,
            ..Default::default()
        };
        let bytes = meta.to_bytes();
        assert_eq!(bytes.len(), 27);
        assert_eq!(&bytes[..3], b"YXZ");
        assert_eq!(&bytes[23..], &27u32.to_be_bytes());
        assert_eq!(ShardMeta::from_bytes(&bytes).unwrap(), meta);
        assert_eq!(meta.file_len(), 1177);
        assert_eq!(meta.index_offset(), 1050);
    }

    #[test]
    fn test_bad_magic_and_version() {
        let mut bytes = ShardMeta::default().to_bytes();
        bytes[0] = b'Z';
        assert!(matches!(
            ShardMeta::from_bytes(&bytes),
            Err(XyzError::InvalidShardHeader(_))
        ));

        let zero = ShardMeta {
            version: 0,
            ..Default::default()
        };
        assert!(ShardMeta::from_bytes(&zero.to_bytes()).is_err());
    }
}
