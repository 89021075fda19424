//! Codec for tunnel messages
//!
//! Format: [length: u16 little-endian][payload: length bytes]
//!
//! The peer channel is an ordered byte stream without message boundaries, so
//! every request and every reply chunk travels behind an explicit length
//! prefix. [`TunnelCodec`] plugs into `tokio_util::codec::Framed`; the
//! [`read_message`] / [`write_message`] helpers work on any tokio reader or
//! writer and are what the roles use for one-shot exchanges.

use crate::{LENGTH_PREFIX_SIZE, MAX_PAYLOAD_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Payload too large: {0} bytes (max {max})", max = MAX_PAYLOAD_SIZE)]
    PayloadTooLarge(usize),

    #[error("Truncated message: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },

    #[error("Partial write: wrote {written} of {expected} bytes")]
    PartialWrite { written: usize, expected: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed tunnel message codec
#[derive(Debug, Default, Clone, Copy)]
pub struct TunnelCodec;

impl TunnelCodec {
    /// Encode a single payload into a standalone frame
    pub fn encode_frame(payload: &[u8]) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        TunnelCodec.encode(Bytes::copy_from_slice(payload), &mut buf)?;
        Ok(buf.freeze())
    }
}

impl Encoder<Bytes> for TunnelCodec {
    type Error = CodecError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge(payload.len()));
        }

        dst.reserve(LENGTH_PREFIX_SIZE + payload.len());
        dst.put_u16_le(payload.len() as u16);
        dst.put(payload);
        Ok(())
    }
}

impl Decoder for TunnelCodec {
    type Item = Bytes;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            src.reserve(LENGTH_PREFIX_SIZE - src.len());
            return Ok(None);
        }

        let length = u16::from_le_bytes([src[0], src[1]]) as usize;
        let frame_len = LENGTH_PREFIX_SIZE + length;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(src.split_to(length).freeze()))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => {
                let expected = if buf.len() < LENGTH_PREFIX_SIZE {
                    LENGTH_PREFIX_SIZE
                } else {
                    LENGTH_PREFIX_SIZE + u16::from_le_bytes([buf[0], buf[1]]) as usize
                };
                Err(CodecError::Truncated {
                    expected,
                    received: buf.len(),
                })
            }
        }
    }
}

/// Write one framed message, looping over partial writes
pub async fn write_message<W>(writer: &mut W, payload: &[u8]) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = TunnelCodec::encode_frame(payload)?;
    write_full(writer, &frame).await?;
    writer.flush().await?;
    trace!("Wrote tunnel message with {} byte payload", payload.len());
    Ok(())
}

/// Write every byte of `buf`; a writer that stops accepting bytes is a partial write
pub async fn write_full<W>(writer: &mut W, buf: &[u8]) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0;
    while written < buf.len() {
        let n = writer.write(&buf[written..]).await?;
        if n == 0 {
            return Err(CodecError::PartialWrite {
                written,
                expected: buf.len(),
            });
        }
        written += n;
    }
    Ok(())
}

/// Read one framed message
///
/// Returns `Ok(None)` if the stream ends cleanly before the first prefix byte,
/// and `Truncated` if it ends anywhere inside a frame.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Bytes>, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    let received = read_full(reader, &mut prefix).await?;
    if received == 0 {
        return Ok(None);
    }
    if received < LENGTH_PREFIX_SIZE {
        return Err(CodecError::Truncated {
            expected: LENGTH_PREFIX_SIZE,
            received,
        });
    }

    let length = u16::from_le_bytes(prefix) as usize;
    let mut payload = BytesMut::zeroed(length);
    let received = read_full(reader, &mut payload).await?;
    if received < length {
        return Err(CodecError::Truncated {
            expected: length,
            received,
        });
    }

    trace!("Read tunnel message with {} byte payload", length);
    Ok(Some(payload.freeze()))
}

async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Writer that accepts at most `chunk` bytes per call and stops after `limit` bytes
    struct TrickleWriter {
        data: Vec<u8>,
        chunk: usize,
        limit: usize,
    }

    impl AsyncWrite for TrickleWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let this = self.get_mut();
            let room = this.limit - this.data.len();
            let n = buf.len().min(this.chunk).min(room);
            this.data.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_ping_wire_format() {
        let frame = TunnelCodec::encode_frame(b"PING").unwrap();
        assert_eq!(&frame[..], &[0x04, 0x00, b'P', b'I', b'N', b'G']);
    }

    #[test]
    fn test_length_prefix_is_little_endian() {
        let payload = vec![0xAB; 0x0102];
        let frame = TunnelCodec::encode_frame(&payload).unwrap();
        assert_eq!(frame[0], 0x02);
        assert_eq!(frame[1], 0x01);
        assert_eq!(frame.len(), 2 + 0x0102);
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        let err = TunnelCodec::encode_frame(&payload).unwrap_err();
        assert!(matches!(err, CodecError::PayloadTooLarge(n) if n == MAX_PAYLOAD_SIZE + 1));
    }

    #[test]
    fn test_decoder_waits_for_complete_frame() {
        let frame = TunnelCodec::encode_frame(b"hello world").unwrap();
        let mut codec = TunnelCodec;

        let mut buf = BytesMut::from(&frame[..1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[1..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[5..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], b"hello world");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decoder_handles_back_to_back_frames() {
        let mut codec = TunnelCodec;
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"first"), &mut buf).unwrap();
        codec.encode(Bytes::new(), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"third"), &mut buf).unwrap();

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"first");
        assert!(codec.decode(&mut buf).unwrap().unwrap().is_empty());
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"third");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_decode_eof_reports_truncation() {
        let frame = TunnelCodec::encode_frame(b"abcdef").unwrap();
        let mut codec = TunnelCodec;
        let mut buf = BytesMut::from(&frame[..4]);

        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Truncated {
                expected: 8,
                received: 4
            }
        ));

        let mut empty = BytesMut::new();
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_roundtrip_boundary_sizes() {
        for size in [0usize, 1, MAX_PAYLOAD_SIZE] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let (mut a, mut b) = tokio::io::duplex(1024);

            let writer = {
                let payload = payload.clone();
                tokio::spawn(async move { write_message(&mut a, &payload).await })
            };

            let decoded = read_message(&mut b).await.unwrap().unwrap();
            writer.await.unwrap().unwrap();
            assert_eq!(decoded.len(), size);
            assert_eq!(&decoded[..], &payload[..]);
        }
    }

    #[tokio::test]
    async fn test_read_clean_eof_is_none() {
        let mut empty: &[u8] = &[];
        assert!(read_message(&mut empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_truncated_prefix_and_payload() {
        let mut half_prefix: &[u8] = &[0x04];
        let err = read_message(&mut half_prefix).await.unwrap_err();
        assert!(matches!(
            err,
            CodecError::Truncated {
                expected: 2,
                received: 1
            }
        ));

        let mut short_payload: &[u8] = &[0x04, 0x00, b'P', b'I'];
        let err = read_message(&mut short_payload).await.unwrap_err();
        assert!(matches!(
            err,
            CodecError::Truncated {
                expected: 4,
                received: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_write_loops_over_partial_writes() {
        let mut writer = TrickleWriter {
            data: Vec::new(),
            chunk: 1,
            limit: usize::MAX,
        };

        write_message(&mut writer, b"PING").await.unwrap();
        assert_eq!(writer.data, vec![0x04, 0x00, b'P', b'I', b'N', b'G']);
    }

    #[tokio::test]
    async fn test_write_reports_stalled_writer() {
        let mut writer = TrickleWriter {
            data: Vec::new(),
            chunk: 2,
            limit: 3,
        };

        let err = write_message(&mut writer, b"PING").await.unwrap_err();
        assert!(matches!(
            err,
            CodecError::PartialWrite {
                written: 3,
                expected: 6
            }
        ));
    }
}
