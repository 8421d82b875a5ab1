//! Message envelope shared by the binary and gossip transports
//!
//! ```text
//! u32 version | u32 type | u32 data_len | data
//! ```
//!
//! All integers are big-endian. The meaning of `type` depends on the
//! service the envelope travels on.

use bytes::{Buf, BufMut, Bytes};
use uuid::Uuid;
use xyzfs_core::error::{Result, XyzError};

pub const MESSAGE_VERSION: u32 = 1;
pub const ENVELOPE_HEADER_LEN: usize = 12;

/// Message types on the binary (data) transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BinaryMessageType {
    Empty = 0,
    ShardIndex = 1,
    FileChunk = 2,
    CreateShard = 3,
}

impl TryFrom<u32> for BinaryMessageType {
    type Error = XyzError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Empty),
            1 => Ok(Self::ShardIndex),
            2 => Ok(Self::FileChunk),
            3 => Ok(Self::CreateShard),
            other => Err(XyzError::MalformedMessage(format!(
                "unknown binary message type {other}"
            ))),
        }
    }
}

impl From<BinaryMessageType> for u32 {
    fn from(value: BinaryMessageType) -> Self {
        value as u32
    }
}

/// Message types on the gossip transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum GossipMessageType {
    Empty = 0,
    Hello = 1,
    NodeState = 2,
    NodeList = 3,
}

impl TryFrom<u32> for GossipMessageType {
    type Error = XyzError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Empty),
            1 => Ok(Self::Hello),
            2 => Ok(Self::NodeState),
            3 => Ok(Self::NodeList),
            other => Err(XyzError::MalformedMessage(format!(
                "unknown gossip message type {other}"
            ))),
        }
    }
}

impl From<GossipMessageType> for u32 {
    fn from(value: GossipMessageType) -> Self {
        value as u32
    }
}

/// A typed envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    version: u32,
    kind: u32,
    data: Bytes,
}

impl Message {
    pub fn new(kind: impl Into<u32>, data: impl Into<Bytes>) -> Self {
        Self {
            version: MESSAGE_VERSION,
            kind: kind.into(),
            data: data.into(),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Raw type code
    pub fn kind_code(&self) -> u32 {
        self.kind
    }

    /// Type code decoded as `K`
    pub fn kind<K>(&self) -> Result<K>
    where
        K: TryFrom<u32, Error = XyzError>,
    {
        K::try_from(self.kind)
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENVELOPE_HEADER_LEN + self.data.len());
        buf.put_u32(self.version);
        buf.put_u32(self.kind);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ENVELOPE_HEADER_LEN {
            return Err(XyzError::MalformedMessage(format!(
                "envelope of {} bytes is shorter than its header",
                bytes.len()
            )));
        }
        let mut buf = bytes;
        let version = buf.get_u32();
        let kind = buf.get_u32();
        let len = buf.get_u32() as usize;
        if version != MESSAGE_VERSION {
            return Err(XyzError::MalformedMessage(format!(
                "unsupported envelope version {version}"
            )));
        }
        if buf.remaining() != len {
            return Err(XyzError::MalformedMessage(format!(
                "envelope declares {len} data bytes, carries {}",
                buf.remaining()
            )));
        }
        Ok(Self {
            version,
            kind,
            data: Bytes::copy_from_slice(buf),
        })
    }
}

/// Ask a peer to materialize an empty shard for a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateShardRequest {
    pub block_id: Uuid,
    pub shard_id: Uuid,
}

impl CreateShardRequest {
    pub const LEN: usize = 32;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.put_slice(self.block_id.as_bytes());
        buf.put_slice(self.shard_id.as_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::LEN {
            return Err(XyzError::MalformedMessage(format!(
                "create shard payload of {} bytes",
                bytes.len()
            )));
        }
        Ok(Self {
            block_id: Uuid::from_slice(&bytes[..16])?,
            shard_id: Uuid::from_slice(&bytes[16..])?,
        })
    }

    pub fn to_message(&self) -> Message {
        Message::new(BinaryMessageType::CreateShard, self.to_bytes())
    }
}
