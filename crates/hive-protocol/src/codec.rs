use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Codec-level error: IO or malformed JSON.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Read a single JSONL message from an async buffered reader.
///
/// Returns `Ok(None)` when the stream is closed (EOF).
/// Returns `Err` on malformed JSON or IO errors.
pub async fn read_message<R, T>(reader: &mut R) -> Result<Option<T>, CodecError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let bytes_read = reader.read_line(&mut line).await?;
    if bytes_read == 0 {
        return Ok(None); // EOF
    }

    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let msg: T = serde_json::from_str(trimmed)
        .map_err(|e| CodecError::Protocol(format!("invalid JSON: {}: {}", e, trimmed)))?;
    Ok(Some(msg))
}

/// Write a single JSONL message to an async writer.
///
/// Serializes the message as compact JSON followed by a newline, then flushes.
pub async fn write_message<W, T>(writer: &mut W, msg: &T) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let json =
        serde_json::to_string(msg).map_err(|e| CodecError::Protocol(e.to_string()))?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
