//! Wire framing and compression
//!
//! Request frame (client to server):
//! ```text
//! u32 len | gzip(payload)            (len = compressed length)
//! ```
//! Response frame (server to client):
//! ```text
//! u32 len | u32 crc32c(request payload) | response bytes   (len = 4 + response length)
//! ```
//! Response bytes start with a status byte: `0` followed by the handler's
//! reply, or `1` followed by a UTF-8 error message.
//!
//! Lengths are big-endian. Reads always use `read_exact`, so frames split
//! across any number of TCP segments are reassembled.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{ErrorKind, Read, Write};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use xyzfs_core::error::{Result, XyzError};

/// Default upper bound on a single frame (and on a decompressed payload)
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 64), Compression::fast());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompress, refusing output larger than `max_len`.
pub fn gunzip(data: &[u8], max_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(max_len as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| XyzError::MalformedMessage(format!("gzip: {e}")))?;
    if out.len() > max_len {
        return Err(XyzError::MalformedMessage(format!(
            "decompressed payload exceeds {max_len} bytes"
        )));
    }
    Ok(out)
}

/// Write one length-prefixed request frame.
pub async fn write_request<W>(writer: &mut W, compressed: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u32(compressed.len() as u32).await?;
    writer.write_all(compressed).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` on a clean end of stream before the length prefix.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_len {
        return Err(XyzError::MalformedMessage(format!(
            "frame of {len} bytes exceeds limit {max_len}"
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Write the acknowledgement frame for a handled request.
pub async fn write_response<W>(writer: &mut W, request_crc: u32, response: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(8 + response.len());
    frame.extend_from_slice(&((4 + response.len()) as u32).to_be_bytes());
    frame.extend_from_slice(&request_crc.to_be_bytes());
    frame.extend_from_slice(response);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read an acknowledgement frame, returning the echoed CRC and the body.
pub async fn read_response<R>(reader: &mut R, max_len: usize) -> Result<(u32, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let frame = read_frame(reader, max_len)
        .await?
        .ok_or_else(|| XyzError::Io(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            "connection closed before response",
        )))?;
    if frame.len() < 4 {
        return Err(XyzError::MalformedMessage(format!(
            "response frame of {} bytes has no checksum",
            frame.len()
        )));
    }
    let crc = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    Ok((crc, frame[4..].to_vec()))
}

pub const STATUS_OK: u8 = 0;
pub const STATUS_ERROR: u8 = 1;

/// Response bytes for a handled request
pub fn ok_body(reply: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + reply.len());
    body.push(STATUS_OK);
    body.extend_from_slice(reply);
    body
}

/// Response bytes for a request the handler rejected
pub fn error_body(message: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(1 + message.len());
    body.push(STATUS_ERROR);
    body.extend_from_slice(message.as_bytes());
    body
}

/// Split response bytes into the handler's reply or its error.
pub fn decode_body(node: &str, mut body: Vec<u8>) -> Result<Vec<u8>> {
    match body.first().copied() {
        Some(STATUS_OK) => {
            body.remove(0);
            Ok(body)
        }
        Some(STATUS_ERROR) => Err(XyzError::Remote {
            node: node.to_string(),
            message: String::from_utf8_lossy(&body[1..]).into_owned(),
        }),
        Some(other) => Err(XyzError::MalformedMessage(format!(
            "unknown response status {other} from {node}"
        ))),
        None => Err(XyzError::MalformedMessage(format!(
            "response from {node} has no status"
        ))),
    }
}
