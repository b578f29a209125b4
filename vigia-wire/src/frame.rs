//! Length-prefix framing for the TCP protocols
//!
//! Every TCP channel in the network (ingestion, command poll, status query,
//! push control) speaks the same frame format:
//!
//! ```text
//! [len: u32 big-endian] [payload: len bytes]
//! ```
//!
//! A zero-length frame is a valid, meaningful message: "no command pending"
//! on the poll channel, stream terminator on location streams, "no data" on
//! a failed on-demand read.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame payload. Nothing on this network comes
/// close; a larger prefix is treated as a corrupt stream, not a buffer to
/// allocate.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),
}

/// Write one length-prefixed frame. An empty payload writes the bare
/// zero-length prefix.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(payload.len()));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
///
/// Returns `Ok(None)` when the peer closes the connection before a complete
/// frame arrives (before or inside the prefix, or mid-payload) — callers
/// drop such connections silently. `Ok(Some(vec![]))` is a zero-length
/// frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    if len == 0 {
        return Ok(Some(Vec::new()));
    }

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload).await {
        Ok(_) => Ok(Some(payload)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}
