//! Authenticated frame I/O over a byte stream.
//!
//! ```text
//! +-------------------+-----------+-----------+--------------------+
//! | enc(u32 body_len) | len tag   | body tag  | encrypted envelope |
//! +-------------------+-----------+-----------+--------------------+
//! ```
//!
//! The fixed-size prefix is verified before any body byte is awaited.

use bytes::{BufMut, Bytes, BytesMut};
use mesh_wire::{Envelope, WireError, MAX_ENVELOPE_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::cipher::{Opener, Sealer, LEN_PREFIX, TAG_LEN};
use crate::LinkError;

/// Bytes added to every envelope on the wire
pub const FRAME_OVERHEAD: usize = LEN_PREFIX + TAG_LEN;

/// Writes sealed frames to the outbound half of a stream
pub struct FrameWriter<W> {
    writer: W,
    sealer: Sealer,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a writer with its outbound protection state
    pub fn new(writer: W, sealer: Sealer) -> Self {
        Self { writer, sealer }
    }

    /// Encode, seal and flush one envelope
    pub async fn write(&mut self, envelope: &Envelope) -> Result<(), LinkError> {
        let body = envelope.encode()?;
        self.write_body(body).await
    }

    /// Seal and flush an already encoded envelope
    pub async fn write_body(&mut self, mut body: BytesMut) -> Result<(), LinkError> {
        let prefix = self.sealer.seal_len(body.len() as u32)?;
        let tag = self.sealer.seal(&mut body)?;

        let mut frame = BytesMut::with_capacity(FRAME_OVERHEAD + body.len());
        frame.put_slice(&prefix);
        frame.put_slice(&tag);
        frame.put_slice(&body);

        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut down the outbound half
    pub async fn shutdown(&mut self) -> Result<(), LinkError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Reads and verifies frames from the inbound half of a stream
pub struct FrameReader<R> {
    reader: R,
    opener: Opener,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a reader with its inbound protection state
    pub fn new(reader: R, opener: Opener) -> Self {
        Self { reader, opener }
    }

    /// Read, verify and decode the next envelope.
    ///
    /// End of stream on a frame boundary yields [`LinkError::Closed`]; end of
    /// stream inside a frame is an I/O error.
    pub async fn read(&mut self) -> Result<Envelope, LinkError> {
        let mut prefix = [0u8; LEN_PREFIX];
        if self.reader.read(&mut prefix[..1]).await? == 0 {
            return Err(LinkError::Closed);
        }
        self.reader.read_exact(&mut prefix[1..]).await?;

        let body_len = self.opener.open_len(&prefix)? as usize;
        if body_len > MAX_ENVELOPE_SIZE {
            return Err(LinkError::Malformed(WireError::Size(body_len)));
        }

        let mut tag = [0u8; TAG_LEN];
        self.reader.read_exact(&mut tag).await?;

        let mut body = vec![0u8; body_len];
        self.reader.read_exact(&mut body).await?;

        self.opener.open(&tag, &mut body)?;
        Ok(Envelope::decode(Bytes::from(body))?)
    }
}
