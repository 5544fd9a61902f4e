use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::error::{RemotingError, Result};
use crate::protocol::Packet;

/// Maximum frame payload size (100 MB)
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Codec for encoding/decoding packets
///
/// Only JSON is supported; the enum leaves room for other formats.
///
/// # Example
///
/// ```
/// use remoting_common::transport::Codec;
/// use remoting_common::protocol::{Packet, Ping};
///
/// let codec = Codec::new();
/// let packet = Packet::from(Ping { timestamp: 1 });
///
/// let encoded = codec.encode(&packet).unwrap();
/// let decoded = codec.decode(&encoded).unwrap();
/// assert_eq!(packet, decoded);
/// ```
pub enum Codec {
    /// JSON codec (currently the only supported format)
    Json(JsonCodec),
}

impl Codec {
    pub fn new() -> Self {
        Codec::Json(JsonCodec)
    }

    /// Encode a packet to bytes
    pub fn encode(&self, packet: &Packet) -> Result<Vec<u8>> {
        match self {
            Codec::Json(_) => JsonCodec::encode(packet),
        }
    }

    /// Decode a packet from bytes
    pub fn decode(&self, data: &[u8]) -> Result<Packet> {
        match self {
            Codec::Json(_) => JsonCodec::decode(data),
        }
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

/// JSON codec for packets
///
/// The packet kind travels as a `kind` field, so a frame can be decoded
/// without knowing what the peer meant to send.
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode(packet: &Packet) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(packet)?)
    }

    /// Decode a packet
    ///
    /// # Errors
    ///
    /// Returns [`RemotingError::Decode`] for malformed data; a partially
    /// decoded packet is never returned.
    pub fn decode(data: &[u8]) -> Result<Packet> {
        serde_json::from_slice(data).map_err(|e| RemotingError::Decode(e.to_string()))
    }
}

/// Writes one frame.
///
/// Wire format: `[4-byte length as u32 big-endian] + [JSON data]`
pub async fn write_frame<W>(writer: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let encoded = JsonCodec::encode(packet)?;
    if encoded.len() > MAX_FRAME_SIZE {
        return Err(RemotingError::InvalidRequest(format!(
            "Frame too large: {} bytes (max {} bytes)",
            encoded.len(),
            MAX_FRAME_SIZE
        )));
    }

    let len = encoded.len() as u32;
    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| map_io_error(e, "writing length prefix"))?;
    writer
        .write_all(&encoded)
        .await
        .map_err(|e| map_io_error(e, "writing data"))?;
    writer
        .flush()
        .await
        .map_err(|e| map_io_error(e, "flushing stream"))?;

    Ok(())
}

/// Reads one frame.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
///
/// # Errors
///
/// - [`RemotingError::Decode`] if the length exceeds [`MAX_FRAME_SIZE`] or
///   the payload is not a valid packet
/// - [`RemotingError::Connection`] if the stream fails mid-frame
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(map_io_error(e, "reading length prefix")),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(RemotingError::Decode(format!(
            "Frame too large: {} bytes (max {} bytes)",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| map_io_error(e, "reading data"))?;

    JsonCodec::decode(&buf).map(Some)
}

fn map_io_error(err: std::io::Error, context: &str) -> RemotingError {
    match err.kind() {
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::NotConnected
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::UnexpectedEof => {
            RemotingError::Connection(format!("{}: Connection lost", context))
        }
        _ => RemotingError::Io(err),
    }
}
