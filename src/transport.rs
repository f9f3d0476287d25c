//! # Transport Layer
//!
//! Reliable exact-length stream I/O. Every transfer either moves the full
//! requested byte count or fails; partial reads and writes are retried
//! internally and never surface to the protocol code.
//!
//! A read-ahead buffer backs [`Transport::peek`], which exposes pending
//! bytes without consuming them. Bytes that were peeked are handed out
//! first by the next [`Transport::recv_exact`].

use std::future::Future;
use std::io::ErrorKind;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time::{timeout, Duration};
use tracing::trace;

use crate::error::{ProtocolError, ProtocolResult};

/// Initial read buffer capacity; fits the largest message plus its prefix
const READ_BUFFER_SIZE: usize = 4096;

/// Transport connection wrapping a byte stream
pub struct Transport<S = TcpStream> {
    /// The underlying stream
    stream: S,
    /// Bytes read from the stream but not yet consumed
    read_buffer: BytesMut,
    /// Deadline applied to each receive
    read_timeout: Option<Duration>,
    /// Deadline applied to each send
    write_timeout: Option<Duration>,
    /// Bytes sent
    bytes_sent: u64,
    /// Bytes received
    bytes_received: u64,
}

/// Run `fut` under an optional deadline
async fn with_deadline<T, F>(deadline: Option<Duration>, fut: F) -> ProtocolResult<T>
where
    F: Future<Output = ProtocolResult<T>>,
{
    match deadline {
        Some(limit) => timeout(limit, fut)
            .await
            .map_err(|_| ProtocolError::Timeout(limit))?,
        None => fut.await,
    }
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already-connected stream
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buffer: BytesMut::with_capacity(READ_BUFFER_SIZE),
            read_timeout: None,
            write_timeout: None,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// Apply per-operation deadlines
    pub fn with_timeouts(mut self, read: Option<Duration>, write: Option<Duration>) -> Self {
        self.read_timeout = read;
        self.write_timeout = write;
        self
    }

    /// Get bytes sent
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Get bytes received
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Number of bytes read ahead and not yet consumed
    pub fn buffered(&self) -> usize {
        self.read_buffer.len()
    }

    /// Write every byte of `buf`, retrying short and interrupted writes
    pub async fn send_all(&mut self, buf: &[u8]) -> ProtocolResult<()> {
        let deadline = self.write_timeout;
        with_deadline(deadline, self.write_loop(buf)).await?;
        self.bytes_sent += buf.len() as u64;
        trace!(len = buf.len(), "sent");
        Ok(())
    }

    async fn write_loop(&mut self, buf: &[u8]) -> ProtocolResult<()> {
        let mut sent = 0;
        while sent < buf.len() {
            match self.stream.write(&buf[sent..]).await {
                Ok(0) => {
                    return Err(ProtocolError::Transport(std::io::Error::new(
                        ErrorKind::WriteZero,
                        "stream accepted zero bytes",
                    )))
                }
                Ok(n) => sent += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(ProtocolError::Transport(e)),
            }
        }
        self.stream.flush().await?;
        Ok(())
    }

    /// Read until at least `len` bytes are buffered
    async fn fill_to(&mut self, len: usize) -> ProtocolResult<()> {
        while self.read_buffer.len() < len {
            self.read_buffer.reserve(len - self.read_buffer.len());
            match self.stream.read_buf(&mut self.read_buffer).await {
                Ok(0) => {
                    return Err(ProtocolError::ShortRead {
                        expected: len,
                        received: self.read_buffer.len(),
                    })
                }
                Ok(n) => self.bytes_received += n as u64,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(ProtocolError::Transport(e)),
            }
        }
        Ok(())
    }

    /// Receive exactly `len` bytes
    ///
    /// An orderly close by the peer before `len` bytes arrive is reported as
    /// [`ProtocolError::ShortRead`].
    pub async fn recv_exact(&mut self, len: usize) -> ProtocolResult<Bytes> {
        let deadline = self.read_timeout;
        with_deadline(deadline, self.fill_to(len)).await?;
        trace!(len, "received");
        Ok(self.read_buffer.split_to(len).freeze())
    }

    /// Receive exactly `N` bytes into an array
    pub async fn recv_array<const N: usize>(&mut self) -> ProtocolResult<[u8; N]> {
        let bytes = self.recv_exact(N).await?;
        let mut out = [0u8; N];
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    /// Look at the next `len` bytes without consuming them
    pub async fn peek(&mut self, len: usize) -> ProtocolResult<&[u8]> {
        let deadline = self.read_timeout;
        with_deadline(deadline, self.fill_to(len)).await?;
        Ok(&self.read_buffer[..len])
    }

    /// Discard `len` bytes that were already peeked
    pub fn consume(&mut self, len: usize) {
        let len = len.min(self.read_buffer.len());
        let _ = self.read_buffer.split_to(len);
    }

    /// Shutdown the write side of the connection
    pub async fn shutdown(&mut self) -> ProtocolResult<()> {
        self.stream.shutdown().await.map_err(ProtocolError::Transport)
    }

    /// Get a mutable reference to the underlying stream
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

impl Transport<TcpStream> {
    /// Connect to `host:port`, optionally bounded by a deadline
    pub async fn connect(host: &str, port: u16, deadline: Option<Duration>) -> ProtocolResult<Self> {
        let addr = format!("{}:{}", host, port);
        let connect = async {
            TcpStream::connect((host, port))
                .await
                .map_err(|source| ProtocolError::Connect {
                    addr: addr.clone(),
                    source,
                })
        };

        let stream = match deadline {
            Some(limit) => timeout(limit, connect).await.map_err(|_| ProtocolError::Connect {
                addr: addr.clone(),
                source: std::io::Error::new(ErrorKind::TimedOut, "connect timed out"),
            })??,
            None => connect.await?,
        };

        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }

    /// Snapshot of transfer counters
    pub fn stats(&self) -> Option<TransportStats> {
        Some(TransportStats {
            peer_addr: self.stream.peer_addr().ok()?,
            local_addr: self.stream.local_addr().ok()?,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
        })
    }
}

/// TCP listener wrapper
pub struct TransportListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TransportListener {
    /// Bind to an address
    pub async fn bind(addr: impl ToSocketAddrs) -> ProtocolResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Get the local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept a new connection
    pub async fn accept(&self) -> ProtocolResult<(Transport, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((Transport::new(stream), addr))
    }
}

/// Transport statistics
#[derive(Debug, Clone)]
pub struct TransportStats {
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl std::fmt::Display for TransportStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {}: sent={} bytes, recv={} bytes",
            self.local_addr, self.peer_addr, self.bytes_sent, self.bytes_received
        )
    }
}
