//! File transfer chunking
//!
//! Files travel over the binary transport as `FileChunk` messages:
//!
//! ```text
//! chunk 0:    u32 transfer | u32 chunk | u8 target_set | [16] target | u32 meta_len | meta | u32 chunk_count | u32 len | content
//! chunk 1..N: u32 transfer | u32 chunk | u32 len | content
//! ```
//!
//! Chunks may arrive in any order and more than once. A receiver collects
//! one transfer and reports completion exactly once.

use crate::message::{BinaryMessageType, Message};
use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;
use xyzfs_core::error::{Result, XyzError};
use xyzfs_core::{Crc32cHasher, FileMeta};

/// Default size of one chunk message
pub const DEFAULT_CHUNK_SIZE: u32 = 1024 * 1024;

/// Fixed bytes in chunk 0 besides the meta JSON and content
pub const FIRST_CHUNK_OVERHEAD: u32 = 4 + 4 + 1 + 16 + 4 + 4 + 4;

/// Fixed bytes in every later chunk besides the content
pub const CHUNK_OVERHEAD: u32 = 4 + 4 + 4;

/// Splits files into chunk messages
#[derive(Debug)]
pub struct FileSplitter {
    chunk_size: u32,
    next_transfer: AtomicU32,
}

impl FileSplitter {
    pub fn new(chunk_size: u32) -> Self {
        Self {
            chunk_size,
            next_transfer: AtomicU32::new(1),
        }
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Content capacity of every chunk after the first
    pub fn later_capacity(&self) -> u32 {
        self.chunk_size.saturating_sub(CHUNK_OVERHEAD)
    }

    /// Split `data` into chunk messages, optionally aimed at one shard.
    pub fn split(&self, meta: &FileMeta, data: &[u8], target_shard: Option<Uuid>) -> Result<Vec<Message>> {
        let meta_bytes = meta.to_bytes()?;
        let first_capacity = (self.chunk_size as u64)
            .checked_sub(FIRST_CHUNK_OVERHEAD as u64 + meta_bytes.len() as u64)
            .ok_or_else(|| {
                XyzError::Capacity(format!(
                    "file meta of {} bytes does not fit a {} byte chunk",
                    meta_bytes.len(),
                    self.chunk_size
                ))
            })? as usize;
        let later_capacity = self.later_capacity() as usize;
        if later_capacity == 0 {
            return Err(XyzError::Capacity(format!(
                "chunk size {} leaves no room for content",
                self.chunk_size
            )));
        }
        if u32::try_from(data.len()).is_err() {
            return Err(XyzError::FileTooLarge {
                size: data.len() as u64,
                max: u32::MAX as u64,
            });
        }

        let chunk_count = if data.len() <= first_capacity {
            1
        } else {
            1 + (data.len() - first_capacity).div_ceil(later_capacity)
        };
        let transfer = self.next_transfer.fetch_add(1, Ordering::Relaxed);

        let mut chunks = Vec::with_capacity(chunk_count);
        let first_len = data.len().min(first_capacity);
        let mut first = Vec::with_capacity(FIRST_CHUNK_OVERHEAD as usize + meta_bytes.len() + first_len);
        first.put_u32(transfer);
        first.put_u32(0);
        match target_shard {
            Some(id) => {
                first.put_u8(1);
                first.put_slice(id.as_bytes());
            }
            None => {
                first.put_u8(0);
                first.put_slice(&[0u8; 16]);
            }
        }
        first.put_u32(meta_bytes.len() as u32);
        first.put_slice(&meta_bytes);
        first.put_u32(chunk_count as u32);
        first.put_u32(first_len as u32);
        first.put_slice(&data[..first_len]);
        chunks.push(Message::new(BinaryMessageType::FileChunk, first));

        for (i, content) in data[first_len..].chunks(later_capacity).enumerate() {
            let mut buf = Vec::with_capacity(CHUNK_OVERHEAD as usize + content.len());
            buf.put_u32(transfer);
            buf.put_u32(i as u32 + 1);
            buf.put_u32(content.len() as u32);
            buf.put_slice(content);
            chunks.push(Message::new(BinaryMessageType::FileChunk, buf));
        }

        debug!(
            transfer,
            chunks = chunks.len(),
            size = data.len(),
            file = %meta.full_name,
            "File split into chunks"
        );
        Ok(chunks)
    }
}

impl Default for FileSplitter {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

/// Transfer number carried at the start of every chunk payload
pub fn transfer_number(payload: &[u8]) -> Result<u32> {
    if payload.len() < 8 {
        return Err(XyzError::MalformedMessage(format!(
            "file chunk of {} bytes",
            payload.len()
        )));
    }
    Ok(u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]))
}

fn take<'a>(buf: &mut &'a [u8], len: usize, what: &str) -> Result<&'a [u8]> {
    if buf.len() < len {
        return Err(XyzError::MalformedMessage(format!(
            "file chunk truncated in {what}"
        )));
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn take_u32(buf: &mut &[u8], what: &str) -> Result<u32> {
    let mut bytes = take(buf, 4, what)?;
    Ok(bytes.get_u32())
}

/// Reassembles one transfer
#[derive(Debug)]
pub struct FileReceiver {
    transfer: u32,
    meta: Option<FileMeta>,
    target_shard: Option<Uuid>,
    chunk_count: Option<u32>,
    chunks: BTreeMap<u32, Vec<u8>>,
    completed: bool,
    last_chunk: Instant,
}

impl FileReceiver {
    pub fn new(transfer: u32) -> Self {
        Self {
            transfer,
            meta: None,
            target_shard: None,
            chunk_count: None,
            chunks: BTreeMap::new(),
            completed: false,
            last_chunk: Instant::now(),
        }
    }

    pub fn transfer(&self) -> u32 {
        self.transfer
    }

    pub fn meta(&self) -> Option<&FileMeta> {
        self.meta.as_ref()
    }

    pub fn target_shard(&self) -> Option<Uuid> {
        self.target_shard
    }

    /// Time since the last chunk arrived
    pub fn idle(&self) -> Duration {
        self.last_chunk.elapsed()
    }

    /// Add one chunk payload. Returns `true` when this chunk completed the transfer.
    pub fn add(&mut self, payload: &[u8]) -> Result<bool> {
        self.last_chunk = Instant::now();
        let mut buf = payload;
        let transfer = take_u32(&mut buf, "transfer number")?;
        if transfer != self.transfer {
            return Err(XyzError::InvalidArgument(format!(
                "chunk of transfer {transfer} given to receiver of transfer {}",
                self.transfer
            )));
        }
        let chunk = take_u32(&mut buf, "chunk number")?;
        if self.chunks.contains_key(&chunk) {
            debug!(transfer, chunk, "Ignoring duplicate file chunk");
            return Ok(false);
        }
        if let Some(count) = self.chunk_count {
            if chunk >= count {
                return Err(XyzError::MalformedMessage(format!(
                    "chunk {chunk} of transfer {transfer} exceeds chunk count {count}"
                )));
            }
        }

        if chunk == 0 {
            let flag = take(&mut buf, 1, "target flag")?[0];
            let target = Uuid::from_slice(take(&mut buf, 16, "target shard")?)?;
            let meta_len = take_u32(&mut buf, "meta length")? as usize;
            let meta = FileMeta::from_bytes(take(&mut buf, meta_len, "file meta")?)?;
            let count = take_u32(&mut buf, "chunk count")?;
            if count == 0 {
                return Err(XyzError::MalformedMessage(format!(
                    "transfer {transfer} declares zero chunks"
                )));
            }
            if let Some(max) = self.chunks.keys().next_back() {
                if *max >= count {
                    return Err(XyzError::MalformedMessage(format!(
                        "transfer {transfer} already holds chunk {max} of {count}"
                    )));
                }
            }
            let content = Self::read_content(&mut buf)?;
            self.target_shard = (flag == 1).then_some(target);
            self.meta = Some(meta);
            self.chunk_count = Some(count);
            self.chunks.insert(chunk, content);
        } else {
            let content = Self::read_content(&mut buf)?;
            self.chunks.insert(chunk, content);
        }

        if self.completed {
            return Ok(false);
        }
        self.completed = self.is_complete();
        Ok(self.completed)
    }

    fn read_content(buf: &mut &[u8]) -> Result<Vec<u8>> {
        let len = take_u32(buf, "content length")? as usize;
        Ok(take(buf, len, "content")?.to_vec())
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.chunk_count, Some(count) if self.chunks.len() as u32 == count)
    }

    /// Reassembled file content, checked against the file meta.
    pub fn bytes(&self) -> Result<Vec<u8>> {
        let meta = self
            .meta
            .as_ref()
            .filter(|_| self.is_complete())
            .ok_or_else(|| {
                XyzError::InvalidArgument(format!("transfer {} is incomplete", self.transfer))
            })?;

        let total: usize = self.chunks.values().map(Vec::len).sum();
        let mut data = Vec::with_capacity(total);
        let mut hasher = Crc32cHasher::new();
        for content in self.chunks.values() {
            hasher.update(content);
            data.extend_from_slice(content);
        }

        let actual = hasher.finalize();
        if actual != meta.checksum {
            return Err(XyzError::ChecksumMismatch {
                expected: meta.checksum,
                actual,
            });
        }
        if data.len() as u64 != meta.size as u64 {
            return Err(XyzError::CorruptData(format!(
                "{}: expected {} bytes, reassembled {}",
                meta.full_name,
                meta.size,
                data.len()
            )));
        }
        Ok(data)
    }
}

/// A fully received and verified file
#[derive(Debug, Clone)]
pub struct CompletedTransfer {
    pub node: String,
    pub transfer: u32,
    pub meta: FileMeta,
    pub target_shard: Option<Uuid>,
    pub data: Vec<u8>,
}

/// Receivers for in-flight transfers, keyed by sending node and transfer number
///
/// Keys of completed transfers are remembered until the idle timeout passes,
/// so a chunk redelivered by a sender retry never completes a file twice.
#[derive(Debug)]
pub struct ReceiverRegistry {
    receivers: Mutex<HashMap<(String, u32), FileReceiver>>,
    completed: Mutex<HashMap<(String, u32), Instant>>,
    idle_timeout: Duration,
}

impl ReceiverRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            receivers: Mutex::new(HashMap::new()),
            completed: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.receivers.lock().len()
    }

    /// Completed transfers still remembered for duplicate suppression
    pub fn recently_completed(&self) -> usize {
        self.completed.lock().len()
    }

    /// Route a chunk from `node`; returns the file once its last chunk lands.
    pub fn accept(&self, node: &str, payload: &[u8]) -> Result<Option<CompletedTransfer>> {
        let transfer = transfer_number(payload)?;
        let key = (node.to_string(), transfer);

        let mut completed = self.completed.lock();
        if completed.contains_key(&key) {
            debug!(node = %node, transfer, "Ignoring chunk of completed transfer");
            return Ok(None);
        }
        let mut receivers = self.receivers.lock();
        let receiver = receivers
            .entry(key.clone())
            .or_insert_with(|| FileReceiver::new(transfer));
        if !receiver.add(payload)? {
            return Ok(None);
        }
        let Some(receiver) = receivers.remove(&key) else {
            return Ok(None);
        };
        drop(receivers);

        let data = receiver.bytes()?;
        let meta = receiver
            .meta
            .ok_or_else(|| XyzError::Internal(format!("transfer {transfer} completed without meta")))?;
        completed.insert(key, Instant::now());
        Ok(Some(CompletedTransfer {
            node: node.to_string(),
            transfer,
            meta,
            target_shard: receiver.target_shard,
            data,
        }))
    }

    /// Drop receivers idle longer than the timeout; returns how many were dropped.
    pub fn sweep(&self) -> usize {
        self.completed
            .lock()
            .retain(|_, at| at.elapsed() < self.idle_timeout);
        let mut receivers = self.receivers.lock();
        let before = receivers.len();
        receivers.retain(|(node, transfer), receiver| {
            let keep = receiver.idle() < self.idle_timeout;
            if !keep {
                warn!(node = %node, transfer, "Dropping stalled file transfer");
            }
            keep
        });
        before - receivers.len()
    }

    /// Sweep periodically until the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                registry.sweep();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn described(name: &str, data: &[u8]) -> FileMeta {
        let mut meta = FileMeta::new(name);
        meta.describe(data).unwrap();
        meta
    }

    #[test]
    fn test_chunk_count_and_sizes() {
        let splitter = FileSplitter::new(256);
        let data = vec![7u8; 1000];
        let meta = described("/a", &data);
        let meta_len = meta.to_bytes().unwrap().len() as u32;
        let first_capacity = (256 - FIRST_CHUNK_OVERHEAD - meta_len) as usize;

        let chunks = splitter.split(&meta, &data, None).unwrap();
        let expected = 1 + (1000 - first_capacity).div_ceil(244);
        assert_eq!(chunks.len(), expected);
        assert!(chunks.iter().all(|c| c.data().len() <= 256));
        assert!(chunks.iter().all(|c| c.kind_code() == BinaryMessageType::FileChunk as u32));
    }

    #[test]
    fn test_transfer_numbers_increase() {
        let splitter = FileSplitter::new(4096);
        let meta = described("/a", b"x");
        let a = splitter.split(&meta, b"x", None).unwrap();
        let b = splitter.split(&meta, b"x", None).unwrap();
        assert_eq!(transfer_number(a[0].data()).unwrap(), 1);
        assert_eq!(transfer_number(b[0].data()).unwrap(), 2);
    }

    #[test]
    fn test_meta_too_large() {
        let splitter = FileSplitter::new(64);
        let meta = described("/a/very/long/path/that/cannot/fit/into/a/tiny/chunk", b"x");
        assert!(matches!(
            splitter.split(&meta, b"x", None),
            Err(XyzError::Capacity(_))
        ));
    }

    #[test]
    fn test_target_shard_carried() {
        let splitter = FileSplitter::new(512);
        let data = vec![1u8; 2000];
        let meta = described("/t", &data);
        let target = Uuid::new_v4();
        let chunks = splitter.split(&meta, &data, Some(target)).unwrap();

        let registry = ReceiverRegistry::new(Duration::from_secs(60));
        let mut done = None;
        for chunk in chunks.iter().rev() {
            if let Some(t) = registry.accept("10.0.0.1", chunk.data()).unwrap() {
                done = Some(t);
            }
        }
        let done = done.unwrap();
        assert_eq!(done.target_shard, Some(target));
        assert_eq!(done.data, data);
        assert_eq!(registry.in_flight(), 0);
    }

    #[test]
    fn test_checksum_mismatch() {
        let splitter = FileSplitter::new(512);
        let data = vec![9u8; 100];
        let mut meta = described("/bad", &data);
        meta.checksum ^= 1;
        let chunks = splitter.split(&meta, &data, None).unwrap();
        let mut receiver = FileReceiver::new(transfer_number(chunks[0].data()).unwrap());
        assert!(receiver.add(chunks[0].data()).unwrap());
        assert!(matches!(receiver.bytes(), Err(XyzError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_chunk_rejected() {
        let splitter = FileSplitter::new(512);
        let meta = described("/x", b"hello");
        let chunks = splitter.split(&meta, b"hello", None).unwrap();
        let payload = chunks[0].data();
        let mut receiver = FileReceiver::new(transfer_number(payload).unwrap());
        assert!(matches!(
            receiver.add(&payload[..payload.len() - 2]),
            Err(XyzError::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_sweep_drops_idle_receivers() {
        let splitter = FileSplitter::new(512);
        let data = vec![3u8; 3000];
        let meta = described("/s", &data);
        let chunks = splitter.split(&meta, &data, None).unwrap();

        let registry = ReceiverRegistry::new(Duration::ZERO);
        assert!(registry.accept("n1", chunks[0].data()).unwrap().is_none());
        assert_eq!(registry.in_flight(), 1);
        assert_eq!(registry.sweep(), 1);
        assert_eq!(registry.in_flight(), 0);
    }

    #[test]
    fn test_same_transfer_from_two_nodes() {
        let splitter = FileSplitter::new(512);
        let data = vec![5u8; 1500];
        let meta = described("/n", &data);
        let chunks = splitter.split(&meta, &data, None).unwrap();

        let registry = ReceiverRegistry::new(Duration::from_secs(60));
        for chunk in &chunks[..chunks.len() - 1] {
            registry.accept("a", chunk.data()).unwrap();
            registry.accept("b", chunk.data()).unwrap();
        }
        assert_eq!(registry.in_flight(), 2);
        assert!(registry.accept("a", chunks[chunks.len() - 1].data()).unwrap().is_some());
        assert_eq!(registry.in_flight(), 1);
    }

    #[test]
    fn test_redelivered_chunk_completes_once() {
        let splitter = FileSplitter::new(4096);
        let meta = described("/a/b.txt", b"hello");
        let chunks = splitter.split(&meta, b"hello", None).unwrap();
        assert_eq!(chunks.len(), 1);

        let registry = ReceiverRegistry::new(Duration::from_secs(60));
        let first = registry.accept("10.0.0.1", chunks[0].data()).unwrap();
        assert_eq!(first.unwrap().data, b"hello");
        assert!(registry.accept("10.0.0.1", chunks[0].data()).unwrap().is_none());
        assert_eq!(registry.in_flight(), 0);
        assert_eq!(registry.recently_completed(), 1);
    }

    #[test]
    fn test_completed_keys_expire_on_sweep() {
        let splitter = FileSplitter::new(4096);
        let meta = described("/e", b"data");
        let chunks = splitter.split(&meta, b"data", None).unwrap();

        let registry = ReceiverRegistry::new(Duration::ZERO);
        assert!(registry.accept("n1", chunks[0].data()).unwrap().is_some());
        assert_eq!(registry.recently_completed(), 1);
        registry.sweep();
        assert_eq!(registry.recently_completed(), 0);
    }

    #[test]
    fn test_failed_transfer_not_remembered() {
        let splitter = FileSplitter::new(4096);
        let mut meta = described("/bad", b"oops");
        meta.checksum ^= 1;
        let chunks = splitter.split(&meta, b"oops", None).unwrap();

        let registry = ReceiverRegistry::new(Duration::from_secs(60));
        for _ in 0..2 {
            assert!(matches!(
                registry.accept("n1", chunks[0].data()),
                Err(XyzError::ChecksumMismatch { .. })
            ));
        }
        assert_eq!(registry.recently_completed(), 0);
    }
}
