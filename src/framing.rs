//! Frame codec shared by the listener and the connector.
//!
//! Two wire formats are supported:
//!
//! ```text
//! Length-prefixed: [4 bytes: payload length, big-endian u32] [payload]
//! Close-delimited: [payload] <sender shuts down its write side>
//!
//! Example (length-prefixed):
//! 00 00 00 0c  48 65 6c 6c 6f 20 53 65 72 76 65 72   ("Hello Server")
//! ```
//!
//! Readers loop until the declared byte count has arrived, however the
//! stream happens to split it. A length of zero is a valid empty message.
//! End-of-stream before the first byte of a frame is `ConnectionClosed`
//! with nothing transferred; end-of-stream inside a frame reports how far
//! it got.

use crate::error::{ExchangeError, Operation, Result};
use bytes::{Bytes, BytesMut};
use clap::ValueEnum;
use serde::Deserialize;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Width of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Default upper bound on a single frame's payload.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Payload bytes requested per read.
const READ_CHUNK: usize = 8192;

/// Consecutive `Interrupted` results tolerated before giving up.
pub const MAX_INTERRUPTED_RETRIES: u32 = 8;

/// How message boundaries are marked on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// Fixed-width big-endian length, then the payload.
    #[default]
    LengthPrefixed,
    /// Payload terminated by the sender half-closing the stream.
    /// Cannot carry an empty message.
    CloseDelimited,
}

/// Read one complete frame.
pub async fn read_frame<R>(reader: &mut R, framing: Framing, max_frame_size: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match framing {
        Framing::LengthPrefixed => read_length_prefixed(reader, max_frame_size).await,
        Framing::CloseDelimited => read_until_close(reader, max_frame_size).await,
    }
}

/// Write one complete frame and flush it.
///
/// In close-delimited mode the write side is shut down afterwards; the
/// read side stays open for the reply. An empty payload is refused there,
/// since the peer could not tell it apart from a closed connection.
pub async fn write_frame<W>(
    writer: &mut W,
    framing: Framing,
    max_frame_size: usize,
    payload: &[u8],
) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if payload.len() > max_frame_size {
        return Err(ExchangeError::FrameTooLarge {
            length: payload.len(),
            max: max_frame_size,
        });
    }

    match framing {
        Framing::LengthPrefixed => {
            let length =
                u32::try_from(payload.len()).map_err(|_| ExchangeError::FrameTooLarge {
                    length: payload.len(),
                    max: u32::MAX as usize,
                })?;

            write_retrying(writer, &length.to_be_bytes(), 0).await?;
            write_retrying(writer, payload, HEADER_LEN).await?;
            writer
                .flush()
                .await
                .map_err(|e| ExchangeError::from_stream(Operation::Write, HEADER_LEN + payload.len(), e))
        }
        Framing::CloseDelimited => {
            if payload.is_empty() {
                return Err(ExchangeError::EmptyCloseDelimited);
            }
            write_retrying(writer, payload, 0).await?;
            writer
                .shutdown()
                .await
                .map_err(|e| ExchangeError::from_stream(Operation::Write, payload.len(), e))
        }
    }
}

async fn read_length_prefixed<R>(reader: &mut R, max_frame_size: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;

    while filled < HEADER_LEN {
        let n = read_retrying(reader, &mut header[filled..], filled).await?;
        if n == 0 {
            return Err(ExchangeError::ConnectionClosed {
                transferred: filled,
            });
        }
        filled += n;
    }

    let length = u32::from_be_bytes(header) as usize;
    if length > max_frame_size {
        return Err(ExchangeError::FrameTooLarge {
            length,
            max: max_frame_size,
        });
    }

    let mut payload = BytesMut::with_capacity(length);

    // Read in chunks until we have all the data
    while payload.len() < length {
        let start = payload.len();
        let chunk_size = (length - start).min(READ_CHUNK);
        payload.resize(start + chunk_size, 0);

        let n = read_retrying(reader, &mut payload[start..], HEADER_LEN + start).await?;
        payload.truncate(start + n);

        if n == 0 {
            return Err(ExchangeError::ConnectionClosed {
                transferred: HEADER_LEN + start,
            });
        }
        trace!(bytes = n, remaining = length - payload.len(), "Read payload chunk");
    }

    Ok(payload.freeze())
}

async fn read_until_close<R>(reader: &mut R, max_frame_size: usize) -> Result<Bytes>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut payload = BytesMut::with_capacity(READ_CHUNK);

    loop {
        let start = payload.len();
        payload.resize(start + READ_CHUNK, 0);

        let n = read_retrying(reader, &mut payload[start..], start).await?;
        payload.truncate(start + n);

        if n == 0 {
            break;
        }
        if payload.len() > max_frame_size {
            return Err(ExchangeError::FrameTooLarge {
                length: payload.len(),
                max: max_frame_size,
            });
        }
        trace!(bytes = n, total = payload.len(), "Read chunk");
    }

    if payload.is_empty() {
        return Err(ExchangeError::ConnectionClosed { transferred: 0 });
    }

    Ok(payload.freeze())
}

/// One read, retrying `Interrupted` up to the bound.
async fn read_retrying<R>(reader: &mut R, buf: &mut [u8], transferred: usize) -> Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut attempts = 0;
    loop {
        match reader.read(buf).await {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                attempts += 1;
                if attempts > MAX_INTERRUPTED_RETRIES {
                    return Err(ExchangeError::Interrupted {
                        op: Operation::Read,
                        attempts,
                    });
                }
                trace!(attempts, "Read interrupted, retrying");
            }
            Err(e) => return Err(ExchangeError::from_stream(Operation::Read, transferred, e)),
        }
    }
}

/// Write all of `data`, looping over short writes.
async fn write_retrying<W>(writer: &mut W, mut data: &[u8], mut transferred: usize) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut attempts = 0;
    while !data.is_empty() {
        match writer.write(data).await {
            Ok(0) => {
                return Err(ExchangeError::ConnectionClosed { transferred });
            }
            Ok(n) => {
                if n < data.len() {
                    trace!(written = n, remaining = data.len() - n, "Short write");
                }
                data = &data[n..];
                transferred += n;
                attempts = 0;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                attempts += 1;
                if attempts > MAX_INTERRUPTED_RETRIES {
                    return Err(ExchangeError::Interrupted {
                        op: Operation::Write,
                        attempts,
                    });
                }
                trace!(attempts, "Write interrupted, retrying");
            }
            Err(e) => return Err(ExchangeError::from_stream(Operation::Write, transferred, e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio_test::io::Builder;

    fn interrupted() -> io::Error {
        io::Error::new(io::ErrorKind::Interrupted, "signal")
    }

    /// Writer that accepts at most `max_per_write` bytes per call and fails
    /// the first `interrupts` calls with `Interrupted`.
    struct Trickle {
        out: Vec<u8>,
        max_per_write: usize,
        interrupts: u32,
        shutdown: bool,
    }

    impl Trickle {
        fn new(max_per_write: usize, interrupts: u32) -> Self {
            Self {
                out: Vec::new(),
                max_per_write,
                interrupts,
                shutdown: false,
            }
        }
    }

    impl AsyncWrite for Trickle {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.interrupts > 0 {
                self.interrupts -= 1;
                return Poll::Ready(Err(interrupted()));
            }
            let n = buf.len().min(self.max_per_write);
            self.out.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            self.shutdown = true;
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_read_split_across_chunks() {
        let mut mock = Builder::new()
            .read(&[0, 0])
            .read(&[0, 12])
            .read(b"Hel")
            .read(b"lo ")
            .read(b"Server")
            .build();

        let msg = read_frame(&mut mock, Framing::LengthPrefixed, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        assert_eq!(&msg[..], b"Hello Server");
    }

    #[tokio::test]
    async fn test_read_empty_message() {
        let mut mock = Builder::new().read(&[0, 0, 0, 0]).build();

        let msg = read_frame(&mut mock, Framing::LengthPrefixed, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        assert!(msg.is_empty());
    }

    #[tokio::test]
    async fn test_read_closed_before_any_bytes() {
        let mut mock = Builder::new().build();

        let err = read_frame(&mut mock, Framing::LengthPrefixed, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::ConnectionClosed { transferred: 0 }));
        assert!(!err.is_mid_frame_close());
    }

    #[tokio::test]
    async fn test_read_closed_mid_header() {
        let mut mock = Builder::new().read(&[0, 0]).build();

        let err = read_frame(&mut mock, Framing::LengthPrefixed, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::ConnectionClosed { transferred: 2 }));
    }

    #[tokio::test]
    async fn test_read_closed_mid_payload() {
        let mut mock = Builder::new().read(&[0, 0, 0, 10]).read(b"abc").build();

        let err = read_frame(&mut mock, Framing::LengthPrefixed, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::ConnectionClosed { transferred: 7 }));
        assert!(err.is_mid_frame_close());
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_frame() {
        let mut mock = Builder::new().read(&[0, 0, 1, 0]).build();

        let err = read_frame(&mut mock, Framing::LengthPrefixed, 16)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::FrameTooLarge {
                length: 256,
                max: 16
            }
        ));
    }

    #[tokio::test]
    async fn test_read_retries_interrupted() {
        let mut mock = Builder::new()
            .read_error(interrupted())
            .read(&[0, 0, 0, 2])
            .read_error(interrupted())
            .read(b"hi")
            .build();

        let msg = read_frame(&mut mock, Framing::LengthPrefixed, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        assert_eq!(&msg[..], b"hi");
    }

    #[tokio::test]
    async fn test_read_gives_up_after_repeated_interrupts() {
        // The builder must be gone before the mock hands out queued errors.
        let mut mock = {
            let mut builder = Builder::new();
            for _ in 0..=MAX_INTERRUPTED_RETRIES {
                builder.read_error(interrupted());
            }
            builder.build()
        };

        let err = read_frame(&mut mock, Framing::LengthPrefixed, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Interrupted {
                op: Operation::Read,
                attempts
            } if attempts == MAX_INTERRUPTED_RETRIES + 1
        ));
    }

    #[tokio::test]
    async fn test_read_close_delimited() {
        let mut mock = Builder::new().read(b"Hello ").read(b"Server").build();

        let msg = read_frame(&mut mock, Framing::CloseDelimited, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        assert_eq!(&msg[..], b"Hello Server");
    }

    #[tokio::test]
    async fn test_read_close_delimited_nothing_sent() {
        let mut mock = Builder::new().build();

        let err = read_frame(&mut mock, Framing::CloseDelimited, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::ConnectionClosed { transferred: 0 }));
    }

    #[tokio::test]
    async fn test_read_close_delimited_over_limit() {
        let mut mock = Builder::new().read(b"0123456789").build();

        let err = read_frame(&mut mock, Framing::CloseDelimited, 4)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::FrameTooLarge { max: 4, .. }));
    }

    #[tokio::test]
    async fn test_write_length_prefixed() {
        let mut mock = Builder::new()
            .write(&[0, 0, 0, 12])
            .write(b"Hello Server")
            .build();

        write_frame(
            &mut mock,
            Framing::LengthPrefixed,
            DEFAULT_MAX_FRAME_SIZE,
            b"Hello Server",
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_write_survives_short_writes_and_interrupts() {
        let mut writer = Trickle::new(3, 2);

        write_frame(
            &mut writer,
            Framing::LengthPrefixed,
            DEFAULT_MAX_FRAME_SIZE,
            b"Hello Server",
        )
        .await
        .unwrap();

        let mut expected = vec![0, 0, 0, 12];
        expected.extend_from_slice(b"Hello Server");
        assert_eq!(writer.out, expected);
        assert!(!writer.shutdown);
    }

    #[tokio::test]
    async fn test_write_close_delimited_shuts_down() {
        let mut writer = Trickle::new(5, 0);

        write_frame(
            &mut writer,
            Framing::CloseDelimited,
            DEFAULT_MAX_FRAME_SIZE,
            b"Hello Server",
        )
        .await
        .unwrap();

        assert_eq!(writer.out, b"Hello Server");
        assert!(writer.shutdown);
    }

    #[tokio::test]
    async fn test_write_close_delimited_refuses_empty() {
        let mut writer = Trickle::new(5, 0);

        let err = write_frame(&mut writer, Framing::CloseDelimited, DEFAULT_MAX_FRAME_SIZE, b"")
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::EmptyCloseDelimited));
        assert!(writer.out.is_empty());
        assert!(!writer.shutdown);
    }

    #[tokio::test]
    async fn test_write_rejects_oversized_payload() {
        let mut out: Vec<u8> = Vec::new();

        let err = write_frame(&mut out, Framing::LengthPrefixed, 4, b"hello")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::FrameTooLarge { length: 5, max: 4 }
        ));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_large_message_through_small_pipe() {
        // A 64-byte duplex forces many partial reads and writes.
        let (mut a, mut b) = tokio::io::duplex(64);
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let sent = payload.clone();

        let writer = tokio::spawn(async move {
            write_frame(&mut a, Framing::LengthPrefixed, DEFAULT_MAX_FRAME_SIZE, &sent).await
        });

        let received = read_frame(&mut b, Framing::LengthPrefixed, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(&received[..], &payload[..]);
    }
}
