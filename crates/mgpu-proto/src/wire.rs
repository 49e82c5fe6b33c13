//! Length-free JSON-over-TCP framing shared by master and agent.
//!
//! Every message on the wire is a single JSON object terminated by a
//! newline. Reads are bounded by a fixed 8 KiB buffer, matching the
//! read-buffer limit described for the control protocol; a message that
//! does not fit is rejected rather than reassembled across reads.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::error::ProtoError;

/// Fixed read-buffer size for a single wire message.
pub const READ_BUFFER_LIMIT: usize = 8 * 1024;

/// Read one newline-delimited JSON message from `reader`.
///
/// Returns `Ok(None)` if the peer closed the connection cleanly before
/// writing anything (a normal end-of-stream, not an error).
///
/// # Errors
///
/// Returns [`ProtoError::TooLarge`] if the line exceeds
/// [`READ_BUFFER_LIMIT`], [`ProtoError::ConnectionClosed`] if the peer
/// closed mid-message, [`ProtoError::Io`] on a transport failure, or
/// [`ProtoError::Serialization`] if the line is not valid JSON for `T`.
pub async fn read_json_line<R, T>(reader: &mut BufReader<R>) -> Result<Option<T>, ProtoError>
where
    R: tokio::io::AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let mut limited = reader.take(READ_BUFFER_LIMIT as u64 + 1);
    let n = limited.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    if line.len() > READ_BUFFER_LIMIT {
        return Err(ProtoError::TooLarge {
            limit: READ_BUFFER_LIMIT,
        });
    }
    if !line.ends_with('\n') {
        return Err(ProtoError::ConnectionClosed);
    }
    let trimmed = line.trim_end();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let value = serde_json::from_str(trimmed)?;
    Ok(Some(value))
}

/// Write one value as a single newline-terminated JSON line and flush.
///
/// # Errors
///
/// Returns [`ProtoError::Io`] on a transport failure or
/// [`ProtoError::Serialization`] if `value` cannot be serialized.
pub async fn write_json_line<W, T>(writer: &mut W, value: &T) -> Result<(), ProtoError>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    let mut buf = serde_json::to_vec(value)?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
