//! Framing for the external byte stream.
//!
//! Each frame is `[8-byte little-endian length][payload bytes]`. There are no
//! other message boundaries on the stream.

pub mod protocol;

pub use protocol::{EvalRequest, Message, Response, Segment, ValueKind};

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (1 GiB). Safety valve against malformed length prefixes.
pub const MAX_FRAME_SIZE: u64 = 1024 * 1024 * 1024;

/// Payload buffer reserved up front, before any payload byte arrives.
const INITIAL_CAPACITY: u64 = 64 * 1024;

/// Write one frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = payload.len() as u64;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Read one frame.
///
/// Returns `Ok(None)` on a clean end of stream (EOF before the first length
/// byte). EOF anywhere inside a frame is an `UnexpectedEof` error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 8];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a frame header",
            ));
        }
        filled += n;
    }

    let len = u64::from_le_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame exceeds max size: {len} > {MAX_FRAME_SIZE}"),
        ));
    }

    // Grow with the bytes actually received; the prefix alone allocates little.
    let mut payload = Vec::with_capacity(usize::try_from(len.min(INITIAL_CAPACITY)).unwrap_or(0));
    let received = (&mut *reader).take(len).read_to_end(&mut payload).await?;
    if received as u64 != len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("stream ended inside a frame: {received} of {len} bytes"),
        ));
    }
    Ok(Some(payload))
}
