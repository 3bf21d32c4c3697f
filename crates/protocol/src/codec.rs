//! Control message serialization using postcard
//!
//! Messages are serialized with postcard and framed with a length prefix so
//! they can be exchanged over a Unix stream socket.
//!
//! # Frame Format
//!
//! ```text
//! [Length: u32 (big-endian)][Message bytes (postcard serialized)]
//! ```
//!
//! Control messages are tiny; frames above [`MAX_FRAME_SIZE`] are rejected
//! before any allocation.

use crate::{CURRENT_VERSION, ProtocolVersion, error::ProtocolError, error::Result};
use serde::{Serialize, de::DeserializeOwned};
use std::io::{Read, Write};

#[cfg(feature = "async")]
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum allowed frame size (4 KiB)
pub const MAX_FRAME_SIZE: usize = 4 * 1024;

/// Encode a message to bytes using postcard
pub fn encode_message<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(message).map_err(ProtocolError::from)
}

/// Decode a message from bytes using postcard
///
/// # Example
/// ```
/// use protocol::{ControlRequest, encode_message, decode_message};
///
/// let bytes = encode_message(&ControlRequest::get_config()).unwrap();
/// let decoded: ControlRequest = decode_message(&bytes).unwrap();
/// assert_eq!(decoded.code, protocol::UNLOCKER_GET_CONFIG);
/// ```
pub fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    postcard::from_bytes(bytes).map_err(ProtocolError::from)
}

/// Validate protocol version compatibility
///
/// Major versions must match; minor differences are tolerated both ways.
pub fn validate_version(message_version: &ProtocolVersion) -> Result<()> {
    if message_version.is_compatible_with(&CURRENT_VERSION) {
        return Ok(());
    }
    Err(ProtocolError::IncompatibleVersion {
        major: message_version.major,
        minor: message_version.minor,
        expected_major: CURRENT_VERSION.major,
        expected_minor: CURRENT_VERSION.minor,
    })
}

/// Encode a message with length prefix for framing
pub fn encode_framed<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    let message_bytes = encode_message(message)?;
    let message_len = message_bytes.len();

    if message_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: message_len,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(4 + message_len);
    frame.extend_from_slice(&(message_len as u32).to_be_bytes());
    frame.extend_from_slice(&message_bytes);

    Ok(frame)
}

/// Decode a framed message
pub fn decode_framed<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    if frame.len() < 4 {
        return Err(ProtocolError::IncompleteFrame {
            expected: 4,
            actual: frame.len(),
        });
    }

    let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    check_length(length)?;

    if frame.len() < 4 + length {
        return Err(ProtocolError::IncompleteFrame {
            expected: 4 + length,
            actual: frame.len(),
        });
    }

    decode_message(&frame[4..4 + length])
}

/// Write a framed message to a blocking writer
pub fn write_framed<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let framed = encode_framed(message)?;
    writer.write_all(&framed)?;
    writer.flush()?;
    Ok(())
}

/// Read a framed message from a blocking reader
pub fn read_framed<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let length = u32::from_be_bytes(len_bytes) as usize;
    check_length(length)?;

    let mut message_bytes = vec![0u8; length];
    reader.read_exact(&mut message_bytes)?;
    decode_message(&message_bytes)
}

/// Async: write a framed message
#[cfg(feature = "async")]
pub async fn write_framed_async<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let framed = encode_framed(message)?;
    writer.write_all(&framed).await?;
    writer.flush().await?;
    Ok(())
}

/// Async: read and decode a framed message
#[cfg(feature = "async")]
pub async fn read_framed_async<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let length = u32::from_be_bytes(len_bytes) as usize;
    check_length(length)?;

    let mut message_bytes = vec![0u8; length];
    reader.read_exact(&mut message_bytes).await?;
    decode_message(&message_bytes)
}

fn check_length(length: usize) -> Result<()> {
    if length > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}
