//! Byte-level framing of protocol messages.
//!
//! Layout on the stream, all integers little-endian:
//!
//! ```text
//! u32 frame_count | (u32 frame_len | frame_bytes) * frame_count
//! ```
//!
//! Frames are opaque byte strings; their interpretation lives in
//! [`crate::net::protocol`]. Oversized or structurally impossible messages
//! are rejected before any allocation proportional to the claimed size, and
//! surface as `InvalidData` so the peer can be answered with `malformed`
//! and dropped.

use bytes::{BufMut, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on frames per message; the widest request (`acquire`) has 6.
const MAX_FRAMES: u32 = 8;

/// Write one message to the stream.
pub async fn write_message<W>(writer: &mut W, frames: &[Vec<u8>]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload: usize = frames.iter().map(|f| f.len() + 4).sum();
    let mut buf = BytesMut::with_capacity(4 + payload);
    buf.put_u32_le(frames.len() as u32);
    for frame in frames {
        buf.put_u32_le(frame.len() as u32);
        buf.put_slice(frame);
    }
    writer.write_all(&buf).await?;
    writer.flush().await
}

/// Read one message from the stream.
///
/// Fails with `InvalidData` if the message claims more than [`MAX_FRAMES`]
/// frames or more than `max_bytes` total payload. Fails with
/// `UnexpectedEof` if the peer closes mid-message.
pub async fn read_message<R>(reader: &mut R, max_bytes: usize) -> io::Result<Vec<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let frame_count = read_u32(reader).await?;
    if frame_count == 0 || frame_count > MAX_FRAMES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message claims {frame_count} frames"),
        ));
    }

    let mut total = 0usize;
    let mut frames = Vec::with_capacity(frame_count as usize);
    for _ in 0..frame_count {
        let len = read_u32(reader).await? as usize;
        total = total.saturating_add(len);
        if total > max_bytes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message exceeds maximum size of {max_bytes} bytes"),
            ));
        }
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await?;
        frames.push(frame);
    }
    Ok(frames)
}

async fn read_u32<R>(reader: &mut R) -> io::Result<u32>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).await?;
    Ok(u32::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::DEFAULT_MAX_MESSAGE_BYTES;

    #[tokio::test]
    async fn test_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let frames = vec![b"acquire".to_vec(), b"z:\\shot.h5".to_vec(), b"100".to_vec()];

        write_message(&mut client, &frames).await.unwrap();
        let read = read_message(&mut server, DEFAULT_MAX_MESSAGE_BYTES)
            .await
            .unwrap();
        assert_eq!(read, frames);
    }

    #[tokio::test]
    async fn test_empty_frame_allowed() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let frames = vec![b"ping".to_vec(), Vec::new()];

        write_message(&mut client, &frames).await.unwrap();
        let read = read_message(&mut server, DEFAULT_MAX_MESSAGE_BYTES)
            .await
            .unwrap();
        assert_eq!(read, frames);
    }

    #[tokio::test]
    async fn test_zero_frames_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&0u32.to_le_bytes()).await.unwrap();

        let err = read_message(&mut server, DEFAULT_MAX_MESSAGE_BYTES)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        // One frame claiming 1 MiB; must be rejected before reading it.
        client.write_all(&1u32.to_le_bytes()).await.unwrap();
        client
            .write_all(&(1024u32 * 1024).to_le_bytes())
            .await
            .unwrap();

        let err = read_message(&mut server, 1024).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_message_is_eof() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&2u32.to_le_bytes()).await.unwrap();
        client.write_all(&5u32.to_le_bytes()).await.unwrap();
        client.write_all(b"ab").await.unwrap();
        drop(client);

        let err = read_message(&mut server, DEFAULT_MAX_MESSAGE_BYTES)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
