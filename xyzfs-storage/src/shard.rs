//! Shard storage
//!
//! A shard packs many files into one append-only contents buffer and stores
//! it on disk as:
//!
//! ```text
//! [contents][file meta JSON][index bytes][header]
//! ```
//!
//! Each sub-component (contents, file list, index, header, buffer mode,
//! loaded and flushed gates, capacity reservations) sits behind its own lock.
//! A shard opened from disk starts unloaded; the first access loads the
//! header, index and file list, but never the contents, which are read from
//! disk on demand.

use crate::broadcast::IndexBroadcaster;
use crate::shard_file_meta::ShardFileMeta;
use crate::shard_index::ShardIndex;
use crate::shard_meta::{ShardMeta, SHARD_HEADER_LEN};
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use xyzfs_core::error::{Result, XyzError};
use xyzfs_core::FileMeta;

/// What the in-memory buffer is currently being used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    Idle,
    Read,
    Write,
}

/// Identity of a shard within its block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardDescriptor {
    pub id: Uuid,
    pub block_id: Uuid,
    pub block_index: u32,
    pub parity: bool,
}

impl ShardDescriptor {
    /// File name: `s_<uuid>.<block_index>[.parity].data`
    pub fn file_name(&self) -> String {
        let parity = if self.parity { ".parity" } else { "" };
        format!("s_{}.{}{}.data", self.id, self.block_index, parity)
    }

    /// Inverse of [`ShardDescriptor::file_name`]
    pub fn parse_file_name(block_id: Uuid, name: &str) -> Option<Self> {
        let stem = name.strip_prefix("s_")?.strip_suffix(".data")?;
        let (stem, parity) = match stem.strip_suffix(".parity") {
            Some(s) => (s, true),
            None => (stem, false),
        };
        let (id, index) = stem.split_once('.')?;
        Some(Self {
            id: Uuid::parse_str(id).ok()?,
            block_id,
            block_index: index.parse().ok()?,
            parity,
        })
    }
}

#[derive(Debug, Default)]
struct Contents {
    /// `None` while the contents only live on disk
    buf: Option<Vec<u8>>,
    offset: u32,
}

pub struct Shard {
    descriptor: ShardDescriptor,
    dir: PathBuf,
    shard_size: u32,
    broadcaster: Arc<dyn IndexBroadcaster>,

    mode: Mutex<BufferMode>,
    contents: RwLock<Contents>,
    file_meta: RwLock<ShardFileMeta>,
    index: RwLock<ShardIndex>,
    header: RwLock<ShardMeta>,
    loaded: Mutex<bool>,
    flushed: Mutex<bool>,
    reserved: Mutex<u32>,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.descriptor.id)
            .field("block_index", &self.descriptor.block_index)
            .field("parity", &self.descriptor.parity)
            .field("dir", &self.dir)
            .finish()
    }
}

impl Shard {
    /// Create a new, empty, in-memory shard.
    pub fn new(
        descriptor: ShardDescriptor,
        dir: impl Into<PathBuf>,
        shard_size: u32,
        broadcaster: Arc<dyn IndexBroadcaster>,
    ) -> Self {
        Self::build(descriptor, dir.into(), shard_size, broadcaster, true)
    }

    /// Reference a shard that already exists on disk; nothing is read yet.
    pub fn open(
        descriptor: ShardDescriptor,
        dir: impl Into<PathBuf>,
        shard_size: u32,
        broadcaster: Arc<dyn IndexBroadcaster>,
    ) -> Self {
        Self::build(descriptor, dir.into(), shard_size, broadcaster, false)
    }

    fn build(
        descriptor: ShardDescriptor,
        dir: PathBuf,
        shard_size: u32,
        broadcaster: Arc<dyn IndexBroadcaster>,
        fresh: bool,
    ) -> Self {
        Self {
            dir,
            shard_size,
            broadcaster,
            mode: Mutex::new(BufferMode::Idle),
            contents: RwLock::new(Contents {
                buf: fresh.then(Vec::new),
                offset: 0,
            }),
            file_meta: RwLock::new(ShardFileMeta::new()),
            index: RwLock::new(ShardIndex::new(descriptor.id)),
            header: RwLock::new(ShardMeta::default()),
            loaded: Mutex::new(fresh),
            flushed: Mutex::new(!fresh),
            reserved: Mutex::new(0),
            descriptor,
        }
    }

    pub fn id(&self) -> Uuid {
        self.descriptor.id
    }

    pub fn block_id(&self) -> Uuid {
        self.descriptor.block_id
    }

    pub fn block_index(&self) -> u32 {
        self.descriptor.block_index
    }

    pub fn is_parity(&self) -> bool {
        self.descriptor.parity
    }

    pub fn descriptor(&self) -> ShardDescriptor {
        self.descriptor
    }

    pub fn shard_size(&self) -> u32 {
        self.shard_size
    }

    pub fn file_path(&self) -> PathBuf {
        self.dir.join(self.descriptor.file_name())
    }

    pub fn is_loaded(&self) -> bool {
        *self.loaded.lock()
    }

    pub fn is_flushed(&self) -> bool {
        *self.flushed.lock()
    }

    pub fn buffer_mode(&self) -> BufferMode {
        *self.mode.lock()
    }

    /// Bytes of contents written so far
    pub fn used_bytes(&self) -> Result<u32> {
        self.ensure_loaded()?;
        Ok(self.contents.read().offset)
    }

    pub fn file_count(&self) -> Result<u32> {
        self.ensure_loaded()?;
        Ok(self.header.read().file_count)
    }

    /// Snapshot of the file list in write order
    pub fn files(&self) -> Result<Vec<FileMeta>> {
        self.ensure_loaded()?;
        Ok(self.file_meta.read().files().to_vec())
    }

    /// Reserve `size` bytes for an upcoming write.
    ///
    /// Returns `false` for parity shards and when the shard lacks room.
    pub fn allocate_capacity(&self, size: u32) -> Result<bool> {
        if self.is_parity() {
            return Ok(false);
        }
        self.ensure_loaded()?;
        let mut reserved = self.reserved.lock();
        if self.shard_size.saturating_sub(*reserved) >= size {
            *reserved += size;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Unreserved bytes left in the shard
    pub fn available_capacity(&self) -> Result<u32> {
        if self.is_parity() {
            return Ok(0);
        }
        self.ensure_loaded()?;
        Ok(self.shard_size.saturating_sub(*self.reserved.lock()))
    }

    /// Append a file to the shard.
    ///
    /// Fills in size, start offset and checksum of `meta` and returns the
    /// stored copy.
    pub fn add_file(&self, mut meta: FileMeta, data: &[u8]) -> Result<FileMeta> {
        if self.is_parity() {
            return Err(XyzError::InvariantViolation(format!(
                "write to parity shard {}",
                self.id()
            )));
        }
        self.ensure_loaded()?;

        {
            let mut mode = self.mode.lock();
            if *mode == BufferMode::Read {
                return Err(XyzError::InvariantViolation(format!(
                    "write to shard {} while loading",
                    self.id()
                )));
            }
            *mode = BufferMode::Write;
        }
        let written = self.append(&mut meta, data);
        *self.mode.lock() = BufferMode::Idle;
        let end = written?;

        {
            let mut reserved = self.reserved.lock();
            *reserved = (*reserved).max(end);
        }
        *self.flushed.lock() = false;

        metrics::counter!("xyzfs_shard_files_written_total").increment(1);
        metrics::counter!("xyzfs_shard_bytes_written_total").increment(data.len() as u64);
        debug!(
            shard = %self.id(),
            file = %meta.full_name,
            size = meta.size,
            offset = meta.start_offset,
            "File added to shard"
        );

        self.broadcast_index();

        if !self.test_contains_file(&meta.full_name)? {
            return Err(XyzError::InvariantViolation(format!(
                "index of shard {} does not contain {} after write",
                self.id(),
                meta.full_name
            )));
        }
        Ok(meta)
    }

    /// Write contents, file list, header and index. Returns the new offset.
    fn append(&self, meta: &mut FileMeta, data: &[u8]) -> Result<u32> {
        meta.describe(data)?;

        let mut contents = self.contents.write();
        if contents.buf.is_none() {
            let existing = self.read_contents_from_disk(contents.offset)?;
            contents.buf = Some(existing);
        }

        let available = self.shard_size.saturating_sub(contents.offset);
        if meta.size > available {
            return Err(XyzError::ShardFull {
                shard: self.id().to_string(),
                requested: meta.size as u64,
                available: available as u64,
            });
        }

        meta.start_offset = contents.offset;
        if let Some(buf) = contents.buf.as_mut() {
            buf.extend_from_slice(data);
        }
        contents.offset += meta.size;

        self.file_meta.write().add(meta.clone());
        {
            let mut header = self.header.write();
            header.file_count += 1;
            header.contents_len = contents.offset;
        }
        self.index.write().add(&meta.full_name);
        Ok(contents.offset)
    }

    /// Read a file by full name; the flag reports whether it came from memory.
    pub fn read_file(&self, full_name: &str) -> Result<(Vec<u8>, bool)> {
        self.ensure_loaded()?;
        let meta = self
            .file_meta
            .read()
            .get_by_name(full_name)
            .cloned()
            .ok_or_else(|| XyzError::FileNotFound {
                name: full_name.to_string(),
                scanned: 1,
            })?;

        {
            let contents = self.contents.read();
            if let Some(buf) = contents.buf.as_ref() {
                if buf.len() as u64 >= meta.end_offset() {
                    let start = meta.start_offset as usize;
                    return Ok((buf[start..start + meta.size as usize].to_vec(), true));
                }
            }
        }

        let mut file = File::open(self.file_path())?;
        file.seek(SeekFrom::Start(meta.start_offset as u64))?;
        let mut data = vec![0u8; meta.size as usize];
        file.read_exact(&mut data)?;
        meta.verify(&data).map_err(|e| {
            warn!(shard = %self.id(), file = %full_name, error = %e, "Corrupt file content on disk");
            XyzError::CorruptData(format!("{full_name} in shard {}: {e}", self.id()))
        })?;
        Ok((data, false))
    }

    /// Probabilistic membership test against the shard's index
    pub fn test_contains_file(&self, full_name: &str) -> Result<bool> {
        self.ensure_loaded()?;
        Ok(self.index.read().test(full_name))
    }

    /// Serialized index for broadcasting
    pub fn index_bytes(&self) -> Result<Vec<u8>> {
        self.ensure_loaded()?;
        self.index.read().to_bytes()
    }

    /// Full contents section, read from disk when not in memory
    pub fn contents_bytes(&self) -> Result<Vec<u8>> {
        self.ensure_loaded()?;
        let contents = self.contents.read();
        match contents.buf.as_ref() {
            Some(buf) => Ok(buf.clone()),
            None => self.read_contents_from_disk(contents.offset),
        }
    }

    /// Replace the contents of a parity shard with freshly encoded bytes.
    pub fn set_parity_contents(&self, data: Vec<u8>) -> Result<()> {
        if !self.is_parity() {
            return Err(XyzError::InvariantViolation(format!(
                "parity contents written to data shard {}",
                self.id()
            )));
        }
        let len = u32::try_from(data.len())
            .ok()
            .filter(|len| *len <= self.shard_size)
            .ok_or_else(|| XyzError::ShardFull {
                shard: self.id().to_string(),
                requested: data.len() as u64,
                available: self.shard_size as u64,
            })?;
        self.ensure_loaded()?;

        {
            let mut contents = self.contents.write();
            contents.buf = Some(data);
            contents.offset = len;
        }
        self.header.write().contents_len = len;
        *self.flushed.lock() = false;
        Ok(())
    }

    /// Write the shard to disk if it has unflushed changes.
    pub fn persist(&self) -> Result<()> {
        let mut flushed = self.flushed.lock();
        if *flushed {
            return Ok(());
        }

        fs::create_dir_all(&self.dir)?;
        let bytes = self.to_binary()?;
        let path = self.file_path();
        let tmp = path.with_extension("data.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;

        self.broadcast_index();
        *flushed = true;
        info!(shard = %self.id(), path = ?path, bytes = bytes.len(), "Shard persisted");
        Ok(())
    }

    /// Load header, index and file list from disk. Idempotent.
    pub fn load(&self) -> Result<()> {
        let mut loaded = self.loaded.lock();
        if *loaded {
            return Ok(());
        }

        *self.mode.lock() = BufferMode::Read;
        let result = self.read_sections();
        *self.mode.lock() = BufferMode::Idle;
        let (header, file_meta, index) = result?;

        {
            let mut contents = self.contents.write();
            contents.buf = None;
            contents.offset = header.contents_len;
        }
        *self.reserved.lock() = header.contents_len;
        *self.file_meta.write() = file_meta;
        *self.index.write() = index;
        *self.header.write() = header;
        *loaded = true;

        debug!(shard = %self.id(), files = header.file_count, "Shard loaded");
        Ok(())
    }

    /// Drop every cached section; the next access reloads from disk.
    pub fn unload(&self) -> Result<()> {
        let flushed = self.flushed.lock();
        let mut loaded = self.loaded.lock();
        if !*loaded {
            return Ok(());
        }
        if !*flushed {
            return Err(XyzError::InvariantViolation(format!(
                "unload of shard {} with unflushed writes",
                self.id()
            )));
        }

        *self.contents.write() = Contents::default();
        self.file_meta.write().clear();
        self.index.write().reset();
        *self.header.write() = ShardMeta::default();
        *self.reserved.lock() = 0;
        *loaded = false;
        debug!(shard = %self.id(), "Shard unloaded");
        Ok(())
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }
        self.load()
    }

    fn read_sections(&self) -> Result<(ShardMeta, ShardFileMeta, ShardIndex)> {
        let path = self.file_path();
        let mut file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        if file_len < SHARD_HEADER_LEN as u64 {
            return Err(XyzError::InvalidShardHeader(format!(
                "{} is {} bytes, shorter than a header",
                path.display(),
                file_len
            )));
        }

        file.seek(SeekFrom::End(-4))?;
        let mut len_buf = [0u8; 4];
        file.read_exact(&mut len_buf)?;
        let header_len = u32::from_be_bytes(len_buf) as u64;
        if header_len != SHARD_HEADER_LEN as u64 {
            return Err(XyzError::InvalidShardHeader(format!(
                "header length {header_len} in {}",
                path.display()
            )));
        }

        let header_bytes = read_at(&mut file, file_len - header_len, header_len)?;
        let header = ShardMeta::from_bytes(&header_bytes)?;
        if header.file_len() != file_len {
            return Err(XyzError::CorruptData(format!(
                "{}: header describes {} bytes, file has {}",
                path.display(),
                header.file_len(),
                file_len
            )));
        }

        let index_bytes = read_at(&mut file, header.index_offset(), header.index_len as u64)?;
        let index = ShardIndex::from_bytes(&index_bytes)?;
        if index.shard_id() != self.id() {
            return Err(XyzError::CorruptData(format!(
                "{}: index belongs to shard {}",
                path.display(),
                index.shard_id()
            )));
        }

        let meta_bytes = read_at(
            &mut file,
            header.file_meta_offset(),
            header.file_meta_len as u64,
        )?;
        let file_meta = ShardFileMeta::from_bytes(&meta_bytes)?;

        Ok((header, file_meta, index))
    }

    fn read_contents_from_disk(&self, len: u32) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut file = File::open(self.file_path())?;
        read_at(&mut file, 0, len as u64)
    }

    /// Serialize to the on-disk layout
    ///
    /// The contents lock is held for the whole snapshot; writers update the
    /// file list, index and header only while holding it exclusively.
    pub fn to_binary(&self) -> Result<Vec<u8>> {
        self.ensure_loaded()?;
        let contents = self.contents.read();
        let file_meta = self.file_meta.read().to_bytes()?;
        let index = self.index.read().to_bytes()?;
        let on_disk;
        let body: &[u8] = match contents.buf.as_ref() {
            Some(buf) => buf,
            None => {
                on_disk = self.read_contents_from_disk(contents.offset)?;
                &on_disk
            }
        };

        let header = {
            let mut header = self.header.write();
            header.contents_len = body.len() as u32;
            header.file_meta_len = file_meta.len() as u32;
            header.index_len = index.len() as u32;
            *header
        };

        let mut out = Vec::with_capacity(header.file_len() as usize);
        out.extend_from_slice(body);
        out.extend_from_slice(&file_meta);
        out.extend_from_slice(&index);
        out.extend_from_slice(&header.to_bytes());
        Ok(out)
    }

    fn broadcast_index(&self) {
        match self.index.read().to_bytes() {
            Ok(bytes) => self.broadcaster.broadcast_index(self.id(), bytes),
            Err(e) => warn!(shard = %self.id(), error = %e, "Failed to serialize shard index"),
        }
    }
}

fn read_at(file: &mut File, offset: u64, len: u64) -> Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::NoopBroadcaster;
    use parking_lot::Mutex as PlMutex;
    use std::path::Path;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingBroadcaster {
        sent: PlMutex<Vec<Uuid>>,
    }

    impl IndexBroadcaster for RecordingBroadcaster {
        fn broadcast_index(&self, shard_id: Uuid, index_bytes: Vec<u8>) {
            assert!(ShardIndex::from_bytes(&index_bytes).is_ok());
            self.sent.lock().push(shard_id);
        }
    }

    fn descriptor(parity: bool) -> ShardDescriptor {
        ShardDescriptor {
            id: Uuid::new_v4(),
            block_id: Uuid::new_v4(),
            block_index: if parity { 10 } else { 0 },
            parity,
        }
    }

    fn data_shard(dir: &Path, size: u32) -> Shard {
        Shard::new(descriptor(false), dir, size, Arc::new(NoopBroadcaster))
    }

    #[test]
    fn test_file_name_round_trip() {
        let d = descriptor(true);
        let parsed = ShardDescriptor::parse_file_name(d.block_id, &d.file_name()).unwrap();
        assert_eq!(parsed, d);
        assert!(ShardDescriptor::parse_file_name(d.block_id, "gossip_nodes.json").is_none());
    }

    #[test]
    fn test_offsets_are_prefix_sums() {
        let dir = TempDir::new().unwrap();
        let shard = data_shard(dir.path(), 1 << 20);
        let sizes = [0usize, 17, 4096, 1, 333];

        let mut expected = 0u32;
        for (i, size) in sizes.iter().enumerate() {
            let meta = shard
                .add_file(FileMeta::new(format!("/f/{i}")), &vec![i as u8; *size])
                .unwrap();
            assert_eq!(meta.start_offset, expected);
            expected += *size as u32;
        }
        assert_eq!(shard.used_bytes().unwrap(), expected);
        assert_eq!(shard.file_count().unwrap(), sizes.len() as u32);
    }

    #[test]
    fn test_persist_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let d = descriptor(false);
        let shard = Shard::new(d, dir.path(), 1 << 20, Arc::new(NoopBroadcaster));
        for i in 0..5 {
            shard
                .add_file(FileMeta::new(format!("/docs/{i}.txt")), format!("body {i}").as_bytes())
                .unwrap();
        }
        shard.persist().unwrap();
        assert!(shard.is_flushed());

        let reopened = Shard::open(d, dir.path(), 1 << 20, Arc::new(NoopBroadcaster));
        assert!(!reopened.is_loaded());
        assert_eq!(reopened.file_count().unwrap(), 5);

        let names: Vec<String> = reopened.files().unwrap().into_iter().map(|f| f.full_name).collect();
        let expected: Vec<String> = (0..5).map(|i| format!("/docs/{i}.txt")).collect();
        assert_eq!(names, expected);
        for name in &expected {
            assert!(reopened.test_contains_file(name).unwrap());
        }

        let (data, from_memory) = reopened.read_file("/docs/3.txt").unwrap();
        assert_eq!(data, b"body 3");
        assert!(!from_memory);
    }

    #[test]
    fn test_parity_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let shard = Shard::new(descriptor(true), dir.path(), 1024, Arc::new(NoopBroadcaster));
        assert!(matches!(
            shard.add_file(FileMeta::new("/x"), b"x"),
            Err(XyzError::InvariantViolation(_))
        ));
        assert!(!shard.allocate_capacity(1).unwrap());
    }

    #[test]
    fn test_shard_full() {
        let dir = TempDir::new().unwrap();
        let shard = data_shard(dir.path(), 10);
        shard.add_file(FileMeta::new("/a"), &[1; 8]).unwrap();
        assert!(matches!(
            shard.add_file(FileMeta::new("/b"), &[1; 3]),
            Err(XyzError::ShardFull { .. })
        ));
        assert_eq!(shard.file_count().unwrap(), 1);
    }

    #[test]
    fn test_allocate_capacity_reserves() {
        let dir = TempDir::new().unwrap();
        let shard = data_shard(dir.path(), 100);
        assert!(shard.allocate_capacity(60).unwrap());
        assert!(!shard.allocate_capacity(60).unwrap());
        assert!(shard.allocate_capacity(40).unwrap());
        assert_eq!(shard.available_capacity().unwrap(), 0);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let shard = data_shard(dir.path(), 100);
        assert!(matches!(
            shard.read_file("/nope"),
            Err(XyzError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_corrupt_content_detected_on_disk_read() {
        let dir = TempDir::new().unwrap();
        let d = descriptor(false);
        let shard = Shard::new(d, dir.path(), 1024, Arc::new(NoopBroadcaster));
        shard.add_file(FileMeta::new("/c"), b"clean bytes").unwrap();
        shard.persist().unwrap();

        let path = shard.file_path();
        let mut bytes = fs::read(&path).unwrap();
        bytes[0] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let reopened = Shard::open(d, dir.path(), 1024, Arc::new(NoopBroadcaster));
        assert!(matches!(
            reopened.read_file("/c"),
            Err(XyzError::CorruptData(_))
        ));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let d = descriptor(false);
        let shard = Shard::new(d, dir.path(), 1024, Arc::new(NoopBroadcaster));
        shard.persist().unwrap();

        let path = shard.file_path();
        let mut bytes = fs::read(&path).unwrap();
        let header_start = bytes.len() - SHARD_HEADER_LEN as usize;
        bytes[header_start] = b'Q';
        fs::write(&path, bytes).unwrap();

        let reopened = Shard::open(d, dir.path(), 1024, Arc::new(NoopBroadcaster));
        assert!(matches!(
            reopened.load(),
            Err(XyzError::InvalidShardHeader(_))
        ));
    }

    #[test]
    fn test_unload_requires_flush() {
        let dir = TempDir::new().unwrap();
        let shard = data_shard(dir.path(), 1024);
        shard.add_file(FileMeta::new("/u"), b"u").unwrap();
        assert!(shard.unload().is_err());
        shard.persist().unwrap();
        shard.unload().unwrap();
        assert!(!shard.is_loaded());
        assert!(shard.test_contains_file("/u").unwrap());
    }

    #[test]
    fn test_append_after_reload_keeps_earlier_contents() {
        let dir = TempDir::new().unwrap();
        let shard = data_shard(dir.path(), 1024);
        shard.add_file(FileMeta::new("/first"), b"first").unwrap();
        shard.persist().unwrap();
        shard.unload().unwrap();

        let second = shard.add_file(FileMeta::new("/second"), b"second").unwrap();
        assert_eq!(second.start_offset, 5);
        shard.persist().unwrap();
        shard.unload().unwrap();

        assert_eq!(shard.read_file("/first").unwrap().0, b"first");
        assert_eq!(shard.read_file("/second").unwrap().0, b"second");
    }

    #[test]
    fn test_writes_and_persist_broadcast() {
        let dir = TempDir::new().unwrap();
        let recorder = Arc::new(RecordingBroadcaster::default());
        let shard = Shard::new(descriptor(false), dir.path(), 1024, recorder.clone());
        shard.add_file(FileMeta::new("/b"), b"b").unwrap();
        shard.persist().unwrap();
        shard.persist().unwrap();
        assert_eq!(recorder.sent.lock().len(), 2);
        assert!(recorder.sent.lock().iter().all(|id| *id == shard.id()));
    }

    #[test]
    fn test_image_consistent_during_writes() {
        let dir = TempDir::new().unwrap();
        let shard = Arc::new(data_shard(dir.path(), 1024 * 1024));

        let writer = {
            let shard = Arc::clone(&shard);
            std::thread::spawn(move || {
                for i in 0..500 {
                    shard
                        .add_file(FileMeta::new(format!("/w/{i}")), &[i as u8; 64])
                        .unwrap();
                }
            })
        };

        let mut images = 0;
        while !writer.is_finished() || images == 0 {
            let image = shard.to_binary().unwrap();
            let header_at = image.len() - SHARD_HEADER_LEN as usize;
            let header = ShardMeta::from_bytes(&image[header_at..]).unwrap();
            let meta_at = header.file_meta_offset() as usize;
            let files =
                ShardFileMeta::from_bytes(&image[meta_at..meta_at + header.file_meta_len as usize])
                    .unwrap();
            assert_eq!(files.len() as u64 * 64, header.contents_len as u64);
            assert!(files
                .files()
                .iter()
                .all(|f| f.end_offset() <= header.contents_len as u64));
            images += 1;
        }
        writer.join().unwrap();
    }
}
