//! Newline-delimited JSON framing.
//!
//! Both the netd socket protocol and the in-VM agent channel exchange one
//! JSON object per line. Frames are capped so a misbehaving peer cannot make
//! us buffer without bound.

use std::io;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Default frame cap for control messages.
pub const MAX_FRAME_BYTES: usize = 1_048_576;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("frame exceeds {0} bytes")]
    TooLarge(usize),
    #[error("peer closed the connection mid-frame")]
    Truncated,
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read raw bytes up to (not including) the next `\n`.
///
/// Returns `Ok(None)` on a clean EOF before any byte of a new line.
pub async fn read_line<R>(reader: &mut R, max: usize) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return if buf.is_empty() {
                Ok(None)
            } else {
                Err(FrameError::Truncated)
            };
        }

        if let Some(pos) = available.iter().position(|b| *b == b'\n') {
            buf.extend_from_slice(&available[..pos]);
            reader.consume(pos + 1);
            if buf.len() > max {
                return Err(FrameError::TooLarge(max));
            }
            return Ok(Some(buf));
        }

        let n = available.len();
        buf.extend_from_slice(available);
        reader.consume(n);
        if buf.len() > max {
            return Err(FrameError::TooLarge(max));
        }
    }
}

/// Read and decode one JSON frame.
pub async fn read_frame<R, T>(reader: &mut R, max: usize) -> Result<Option<T>, FrameError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    match read_line(reader, max).await? {
        Some(line) => Ok(Some(serde_json::from_slice(&line)?)),
        None => Ok(None),
    }
}

/// Encode `value` as a single line and flush it.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn reads_consecutive_lines() {
        let data: &[u8] = b"{\"a\":1}\n{\"a\":2}\n";
        let mut reader = BufReader::new(data);
        let first: serde_json::Value = read_frame(&mut reader, 64).await.unwrap().unwrap();
        let second: serde_json::Value = read_frame(&mut reader, 64).await.unwrap().unwrap();
        assert_eq!(first["a"], 1);
        assert_eq!(second["a"], 2);
        let eof: Option<serde_json::Value> = read_frame(&mut reader, 64).await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn oversized_line_is_rejected() {
        let data = vec![b'x'; 200];
        let mut reader = BufReader::new(&data[..]);
        let err = read_line(&mut reader, 100).await.unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(100)));
    }

    #[tokio::test]
    async fn partial_line_at_eof_is_truncated() {
        let data: &[u8] = b"{\"a\":";
        let mut reader = BufReader::new(data);
        let err = read_line(&mut reader, 100).await.unwrap_err();
        assert!(matches!(err, FrameError::Truncated));
    }
}
