//! CRC32 (Castagnoli) helpers
//!
//! Every checksum in xyzFS uses the Castagnoli polynomial: file contents in
//! shards, reassembled chunk transfers and transport acknowledgements.

/// Compute the CRC32C of a byte slice.
pub fn crc32c(data: &[u8]) -> u32 {
    ::crc32c::crc32c(data)
}

/// Incremental CRC32C over several slices.
#[derive(Debug, Default, Clone, Copy)]
pub struct Crc32cHasher {
    state: u32,
}

impl Crc32cHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.state = ::crc32c::crc32c_append(self.state, data);
    }

    pub fn finalize(&self) -> u32 {
        self.state
    }
}
