//! Bidirectional copy between the two legs of a connection pair
//!
//! End-of-stream on one leg is forwarded as a write shutdown on the other, so
//! half-closed TCP exchanges keep working. An error in either direction ends
//! the whole copy. `bridge` additionally shuts both legs down once the copy
//! is over, whatever the reason.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, trace};

use super::DEFAULT_BUFFER_SIZE;

/// Result of a bidirectional copy operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyResult {
    /// Bytes transferred from the first leg to the second
    pub a_to_b: u64,
    /// Bytes transferred from the second leg to the first
    pub b_to_a: u64,
}

impl CopyResult {
    /// Total bytes transferred in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.a_to_b + self.b_to_a
    }
}

/// Bidirectional copy state machine
struct BidirectionalCopy<'a, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    a: &'a mut A,
    b: &'a mut B,
    a_to_b: TransferState,
    b_to_a: TransferState,
}

/// State for one direction of transfer
struct TransferState {
    buf: Box<[u8]>,
    read_done: bool,
    write_done: bool,
    pos: usize,
    cap: usize,
    bytes_transferred: u64,
}

impl TransferState {
    fn new(buf_size: usize) -> Self {
        Self {
            buf: vec![0u8; buf_size.max(1)].into_boxed_slice(),
            read_done: false,
            write_done: false,
            pos: 0,
            cap: 0,
            bytes_transferred: 0,
        }
    }

    fn is_done(&self) -> bool {
        self.write_done
    }

    fn poll_transfer<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<io::Result<()>>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        loop {
            if self.write_done {
                return Poll::Ready(Ok(()));
            }

            if self.pos < self.cap {
                let n = match writer.as_mut().poll_write(cx, &self.buf[self.pos..self.cap]) {
                    Poll::Ready(Ok(0)) => {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write zero bytes",
                        )));
                    }
                    Poll::Ready(Ok(n)) => n,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                };
                self.pos += n;
                self.bytes_transferred += n as u64;

                if self.pos == self.cap {
                    self.pos = 0;
                    self.cap = 0;
                }
            } else if self.read_done {
                // Drained: propagate EOF as a half-close
                match writer.as_mut().poll_flush(cx) {
                    Poll::Ready(Ok(())) => {}
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
                match writer.as_mut().poll_shutdown(cx) {
                    Poll::Ready(Ok(())) => {
                        self.write_done = true;
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                }
            } else {
                let mut read_buf = ReadBuf::new(&mut self.buf);
                match reader.as_mut().poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = read_buf.filled().len();
                        if n == 0 {
                            self.read_done = true;
                        } else {
                            self.cap = n;
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => {
                        // Nothing to read; make sure earlier writes are not parked in a buffer
                        if let Poll::Ready(Err(e)) = writer.as_mut().poll_flush(cx) {
                            return Poll::Ready(Err(e));
                        }
                        return Poll::Pending;
                    }
                }
            }
        }
    }
}

impl<'a, A, B> BidirectionalCopy<'a, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    fn new(a: &'a mut A, b: &'a mut B, buf_size: usize) -> Self {
        Self {
            a,
            b,
            a_to_b: TransferState::new(buf_size),
            b_to_a: TransferState::new(buf_size),
        }
    }

    fn result(&self) -> CopyResult {
        CopyResult {
            a_to_b: self.a_to_b.bytes_transferred,
            b_to_a: self.b_to_a.bytes_transferred,
        }
    }
}

impl<A, B> std::future::Future for BidirectionalCopy<'_, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    type Output = Result<CopyResult, (io::Error, CopyResult)>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        if let Poll::Ready(Err(e)) =
            this.a_to_b
                .poll_transfer(cx, Pin::new(&mut *this.a), Pin::new(&mut *this.b))
        {
            debug!("A->B transfer error: {}", e);
            return Poll::Ready(Err((e, this.result())));
        }

        if let Poll::Ready(Err(e)) =
            this.b_to_a
                .poll_transfer(cx, Pin::new(&mut *this.b), Pin::new(&mut *this.a))
        {
            debug!("B->A transfer error: {}", e);
            return Poll::Ready(Err((e, this.result())));
        }

        if this.a_to_b.is_done() && this.b_to_a.is_done() {
            Poll::Ready(Ok(this.result()))
        } else {
            Poll::Pending
        }
    }
}

/// Perform bidirectional copy between two streams
///
/// Copies in both directions until both have reached EOF. The first error in
/// either direction aborts the copy.
///
/// # Errors
///
/// Returns the first I/O error seen in either direction.
pub async fn bidirectional_copy<A, B>(a: &mut A, b: &mut B) -> io::Result<CopyResult>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    bidirectional_copy_with_buffer(a, b, DEFAULT_BUFFER_SIZE).await
}

/// Perform bidirectional copy with custom buffer size
///
/// # Errors
///
/// Returns the first I/O error seen in either direction.
pub async fn bidirectional_copy_with_buffer<A, B>(
    a: &mut A,
    b: &mut B,
    buf_size: usize,
) -> io::Result<CopyResult>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    BidirectionalCopy::new(a, b, buf_size)
        .await
        .map_err(|(e, _)| e)
}

/// Outcome of bridging a connection pair
#[derive(Debug)]
pub struct BridgeResult {
    /// Bytes moved in each direction, including those moved before an error
    pub bytes: CopyResult,
    /// The error that ended the bridge, if any
    pub error: Option<io::Error>,
}

impl BridgeResult {
    /// Whether both legs reached end-of-stream cleanly
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

/// Bridge two established connections until they terminate
///
/// Takes ownership of both legs; when this returns both have been shut down
/// and dropped.
pub async fn bridge<A, B>(mut a: A, mut b: B, buf_size: usize) -> BridgeResult
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let outcome = BidirectionalCopy::new(&mut a, &mut b, buf_size).await;

    // Already shut down on the clean path; errors here only mean "already closed"
    let _ = a.shutdown().await;
    let _ = b.shutdown().await;

    match outcome {
        Ok(bytes) => {
            trace!(a_to_b = bytes.a_to_b, b_to_a = bytes.b_to_a, "bridge closed");
            BridgeResult { bytes, error: None }
        }
        Err((error, bytes)) => BridgeResult {
            bytes,
            error: Some(error),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bridge_relays_both_directions() {
        let (mut client, client_side) = duplex(64);
        let (server_side, mut server) = duplex(64);

        let task = tokio::spawn(bridge(client_side, server_side, 16));

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        server.write_all(b"world!").await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world!");

        client.shutdown().await.unwrap();
        server.shutdown().await.unwrap();

        let result = task.await.unwrap();
        assert!(result.is_clean());
        assert_eq!(result.bytes.a_to_b, 5);
        assert_eq!(result.bytes.b_to_a, 6);
        assert_eq!(result.bytes.total(), 11);
    }

    #[tokio::test]
    async fn test_half_close_is_forwarded() {
        let (mut client, client_side) = duplex(64);
        let (server_side, mut server) = duplex(64);

        let task = tokio::spawn(bridge(client_side, server_side, 64));

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        // Server sees the request followed by EOF, then still answers
        let mut request = Vec::new();
        server.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        server.write_all(b"response").await.unwrap();
        server.shutdown().await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response");

        assert!(task.await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_closing_one_leg_closes_the_other() {
        let (client, client_side) = duplex(64);
        let (server_side, mut server) = duplex(64);

        let task = tokio::spawn(bridge(client_side, server_side, 64));

        // Dropping the client ends the a->b direction; the server reads EOF
        drop(client);
        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        drop(server);
        let result = task.await.unwrap();
        assert_eq!(result.bytes.total(), 0);
    }

    #[tokio::test]
    async fn test_bidirectional_copy_counts_bytes() {
        let (mut a_peer, mut a) = duplex(64);
        let (mut b, mut b_peer) = duplex(64);

        let copy = tokio::spawn(async move { bidirectional_copy(&mut a, &mut b).await });

        a_peer.write_all(&[7u8; 40]).await.unwrap();
        a_peer.shutdown().await.unwrap();
        let mut received = Vec::new();
        b_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), 40);
        b_peer.shutdown().await.unwrap();

        let result = copy.await.unwrap().unwrap();
        assert_eq!(result, CopyResult { a_to_b: 40, b_to_a: 0 });
    }

    #[test]
    fn test_copy_result_total() {
        let result = CopyResult {
            a_to_b: 100,
            b_to_a: 200,
        };
        assert_eq!(result.total(), 300);
    }
}
