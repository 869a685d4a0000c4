//! Length-prefixed wire framing.
//!
//! Every frame on a client socket and on a worker handshake stream is:
//!
//! ```text
//! [u32 BE length] [payload: length bytes]
//! ```
//!
//! Zero-length payloads are legal; an empty frame is the legacy reply a
//! client receives when its worker disappeared mid-request.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::HiveError;

/// Length-prefix width in bytes.
pub const LEN_PREFIX: usize = 4;

/// Encode a payload into a wire-format frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(LEN_PREFIX + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete payloads.
/// Handles TCP-style byte stream reassembly.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame: usize,
}

impl FrameDecoder {
    /// Create a new decoder with an empty buffer and the given size cap.
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame,
        }
    }

    /// Feed bytes into the decoder and extract all complete payloads.
    ///
    /// Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns [`HiveError::FrameTooLarge`] when a frame header announces
    /// a length above the cap. The caller must close the connection.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Bytes>, HiveError> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            // Need the full length header first.
            if self.buf.len() < LEN_PREFIX {
                break;
            }

            let length =
                u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
            if length > self.max_frame {
                return Err(HiveError::FrameTooLarge {
                    size: length,
                    limit: self.max_frame,
                });
            }

            let total = LEN_PREFIX + length;
            if self.buf.len() < total {
                break; // Incomplete frame, wait for more data
            }

            self.buf.advance(LEN_PREFIX);
            frames.push(self.buf.split_to(length).freeze());
        }

        Ok(frames)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

/// Read exactly one frame from an async stream.
///
/// Returns `Ok(None)` on a clean EOF before the first header byte.
/// Used on the handshake streams, where exactly one frame flows in each
/// direction.
pub async fn read_frame<R>(reader: &mut R, max_frame: usize) -> Result<Option<Bytes>, anyhow::Error>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; LEN_PREFIX];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let length = u32::from_be_bytes(header) as usize;
    if length > max_frame {
        return Err(HiveError::FrameTooLarge {
            size: length,
            limit: max_frame,
        }
        .into());
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}

/// Write one frame to an async stream.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(payload)).await?;
    writer.flush().await
}
