//! Message framing
//!
//! JSON bodies are framed by a 4-byte little-endian length prefix. The
//! declared length is checked against a ceiling before any allocation so
//! a hostile prefix cannot balloon memory.
//!
//! Writes are atomic from the framer's perspective: the prefix and body
//! go out in a single `write_all`, and any failure aborts the exchange —
//! the caller must dispose the stream without reuse.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Default ceiling for a single framed message
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024; // 1 MiB

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Encode a message with its length prefix
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    let json = serde_json::to_vec(msg)?;
    let len = u32::try_from(json.len()).map_err(|_| ProtocolError::MessageTooLarge {
        len: json.len(),
        max: u32::MAX as usize,
    })?;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + json.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Read one length-prefixed JSON message from the stream
pub async fn read_message<T, S>(stream: &mut S, max_size: usize) -> Result<T, ProtocolError>
where
    T: DeserializeOwned,
    S: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(map_eof)?;

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > max_size {
        return Err(ProtocolError::MessageTooLarge { len, max: max_size });
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.map_err(map_eof)?;

    Ok(serde_json::from_slice(&body)?)
}

/// Write one length-prefixed JSON message and flush
pub async fn write_message<T, S>(stream: &mut S, msg: &T) -> Result<(), ProtocolError>
where
    T: Serialize,
    S: AsyncWrite + Unpin + ?Sized,
{
    let buf = encode_message(msg)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

fn map_eof(e: std::io::Error) -> ProtocolError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::UnexpectedEof
    } else {
        ProtocolError::Io(e)
    }
}
