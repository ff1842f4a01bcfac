//! Duplex connections with address metadata
//!
//! `DuplexConn` is the capability set the bridge works with: ordered reads,
//! writes, shutdown, plus a local and remote address. Kernel sockets provide
//! it natively; any other byte stream (an overlay stream, an in-memory pipe)
//! is adapted with `StreamConn`, whose addresses are declared by the caller
//! and never used for routing.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// An ordered, bidirectional byte stream
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized {}

/// A byte stream that behaves like a network connection
pub trait DuplexConn: AsyncRead + AsyncWrite + Send + Unpin {
    /// Address of this end of the connection
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Address of the other end of the connection
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

/// Type-erased connection handed to the bridge
pub type BoxedConn = Box<dyn DuplexConn>;

impl DuplexConn for TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

impl<T: DuplexConn + ?Sized> DuplexConn for Box<T> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        (**self).peer_addr()
    }
}

/// Adapts a raw byte stream into a `DuplexConn`
///
/// Reads, writes and shutdown are delegated unchanged to the inner stream.
pub struct StreamConn<S> {
    inner: S,
    local: SocketAddr,
    remote: SocketAddr,
}

impl<S> StreamConn<S>
where
    S: ByteStream,
{
    /// Wrap `inner`, declaring its local and remote addresses
    pub fn new(inner: S, local: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            inner,
            local,
            remote,
        }
    }

    /// Get a reference to the wrapped stream
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Unwrap the stream, dropping the address metadata
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> fmt::Debug for StreamConn<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConn")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl<S> DuplexConn for StreamConn<S>
where
    S: ByteStream,
{
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.remote)
    }
}

impl<S> AsyncRead for StreamConn<S>
where
    S: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for StreamConn<S>
where
    S: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
