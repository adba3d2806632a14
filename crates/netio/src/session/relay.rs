//! I/O relay.
//!
//! Pumps bytes between the side that runs the command and the side that
//! consumes it. On the server that is the local process against the session
//! streams; on the client it is the session streams against local stdio.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::process::{BoxReader, BoxWriter, ProcessIo};

/// The consuming side of a relay: supplies input, receives output.
pub struct Consumer {
    /// Input forwarded to the producer.
    pub stdin: BoxReader,
    /// Destination for the producer's output.
    pub stdout: BoxWriter,
    /// Destination for the producer's error output.
    pub stderr: BoxWriter,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer").finish_non_exhaustive()
    }
}

/// Bytes moved in the output directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
}

/// Relay until the producer's stdout and stderr are exhausted.
///
/// Each output destination is shut down as soon as its copy ends, so the
/// peer learns per stream that no more output is coming. The input copy runs
/// on a detached task that is not awaited: interactive input has no natural
/// end. It finishes, and shuts down the producer's input, when its source
/// reaches EOF or fails, which at the latest happens when the session closes.
pub async fn relay(producer: ProcessIo, consumer: Consumer) -> RelayStats {
    let ProcessIo {
        stdin: mut producer_in,
        stdout: mut producer_out,
        stderr: mut producer_err,
    } = producer;
    let Consumer {
        stdin: mut consumer_in,
        stdout: mut consumer_out,
        stderr: mut consumer_err,
    } = consumer;

    tokio::spawn(async move {
        let copied = pipe(&mut consumer_in, &mut producer_in, "stdin").await;
        trace!(bytes = copied, "Input relay finished");
    });

    let (stdout_bytes, stderr_bytes) = tokio::join!(
        pipe(&mut producer_out, &mut consumer_out, "stdout"),
        pipe(&mut producer_err, &mut consumer_err, "stderr"),
    );

    debug!(stdout_bytes, stderr_bytes, "Output relay finished");
    RelayStats {
        stdout_bytes,
        stderr_bytes,
    }
}

/// Copy one direction to completion, then close the destination.
async fn pipe<R, W>(reader: &mut R, writer: &mut W, stream: &'static str) -> u64
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let copied = match tokio::io::copy(reader, writer).await {
        Ok(n) => n,
        Err(e) => {
            debug!(stream, error = %e, "Relay copy ended with error");
            0
        }
    };

    if let Err(e) = writer.shutdown().await {
        trace!(stream, error = %e, "Failed to close relay destination");
    }
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::time::timeout;

    fn reader(bytes: &'static [u8]) -> BoxReader {
        Box::new(Cursor::new(bytes))
    }

    async fn read_to_end(mut stream: DuplexStream) -> Vec<u8> {
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_outputs_copied_and_closed() {
        let (stdout_dst, stdout_peer) = tokio::io::duplex(1024);
        let (stderr_dst, stderr_peer) = tokio::io::duplex(1024);
        let (producer_in, _producer_in_peer) = tokio::io::duplex(1024);

        let producer = ProcessIo {
            stdin: Box::new(producer_in),
            stdout: reader(b"hello\n"),
            stderr: reader(b"oops\n"),
        };
        let consumer = Consumer {
            stdin: reader(b""),
            stdout: Box::new(stdout_dst),
            stderr: Box::new(stderr_dst),
        };

        let stats = relay(producer, consumer).await;
        assert_eq!(
            stats,
            RelayStats {
                stdout_bytes: 6,
                stderr_bytes: 5,
            }
        );

        // Destinations were shut down, so the peers read to EOF.
        assert_eq!(read_to_end(stdout_peer).await, b"hello\n");
        assert_eq!(read_to_end(stderr_peer).await, b"oops\n");
    }

    #[tokio::test]
    async fn test_returns_without_waiting_for_input() {
        // Input source that never ends while the test holds its peer.
        let (consumer_in, mut consumer_in_peer) = tokio::io::duplex(1024);
        let (producer_in, producer_in_peer) = tokio::io::duplex(1024);

        let producer = ProcessIo {
            stdin: Box::new(producer_in),
            stdout: reader(b"done"),
            stderr: reader(b""),
        };
        let consumer = Consumer {
            stdin: Box::new(consumer_in),
            stdout: Box::new(tokio::io::sink()),
            stderr: Box::new(tokio::io::sink()),
        };

        timeout(Duration::from_secs(5), relay(producer, consumer))
            .await
            .expect("relay must not wait on the input direction");

        // The detached input copy keeps running and closes on EOF.
        consumer_in_peer.write_all(b"late input").await.unwrap();
        consumer_in_peer.shutdown().await.unwrap();
        drop(consumer_in_peer);

        let received = timeout(Duration::from_secs(5), read_to_end(producer_in_peer))
            .await
            .unwrap();
        assert_eq!(received, b"late input");
    }

    #[tokio::test]
    async fn test_input_order_preserved() {
        let (producer_in, producer_in_peer) = tokio::io::duplex(256);
        let input: Vec<u8> = (0..50_000u32).map(|i| (i % 253) as u8).collect();
        let expected = input.clone();

        let producer = ProcessIo {
            stdin: Box::new(producer_in),
            stdout: reader(b""),
            stderr: reader(b""),
        };
        let consumer = Consumer {
            stdin: Box::new(Cursor::new(input)),
            stdout: Box::new(tokio::io::sink()),
            stderr: Box::new(tokio::io::sink()),
        };

        relay(producer, consumer).await;
        let received = timeout(Duration::from_secs(5), read_to_end(producer_in_peer))
            .await
            .unwrap();
        assert_eq!(received, expected);
    }
}
