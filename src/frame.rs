use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum size of a single frame on the wire.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Reads u32-LE length-prefixed frames from a byte stream.
pub struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next frame. Returns `Ok(None)` on end of stream at a
    /// frame boundary, which terminates a session cleanly.
    pub async fn read_frame(&mut self) -> io::Result<Option<Bytes>> {
        let mut len_bytes = [0u8; 4];
        match self.reader.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        }

        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds maximum of {}", len, MAX_FRAME_SIZE),
            ));
        }

        let mut buffer = vec![0u8; len];
        self.reader.read_exact(&mut buffer).await?;
        Ok(Some(Bytes::from(buffer)))
    }
}

/// Writes u32-LE length-prefixed frames to a byte stream.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame(&mut self, data: &[u8]) -> io::Result<()> {
        let mut buffer = BytesMut::with_capacity(4 + data.len());
        put_frame(&mut buffer, data)?;
        self.writer.write_all(&buffer).await?;
        self.writer.flush().await
    }

    /// Writes a header frame and a body frame as a single buffered write,
    /// so the pair cannot interleave with writes from other tasks.
    pub async fn write_message(&mut self, header: &[u8], body: &[u8]) -> io::Result<()> {
        let mut buffer = BytesMut::with_capacity(8 + header.len() + body.len());
        put_frame(&mut buffer, header)?;
        put_frame(&mut buffer, body)?;
        self.writer.write_all(&buffer).await?;
        self.writer.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}

fn put_frame(buffer: &mut BytesMut, data: &[u8]) -> io::Result<()> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds maximum of {}", data.len(), MAX_FRAME_SIZE),
        ));
    }
    buffer.put_u32_le(data.len() as u32);
    buffer.put_slice(data);
    Ok(())
}
