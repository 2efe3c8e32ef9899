// Copyright 2025 Berth Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter, ReadBuf};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{BerthError, Result};
use crate::transport::{Connection, Connector};

/// Default timeout for establishing a TCP connection (5 seconds)
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default size of the outbound buffer of a [`TcpConnection`]
const DEFAULT_BUFFER_CAPACITY: usize = 8 * 1024;

/// Dials TCP servers with tokio.
///
/// Every resolved address of `host` is tried in turn until one accepts. Each
/// attempt is bounded by the connect timeout; if every attempt times out the
/// dial fails with [`BerthError::Timeout`].
///
/// # Example
///
/// ```no_run
/// use berth_common::transport::{Connector, TcpConnector};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let connector = TcpConnector::new()
///     .with_connect_timeout(Duration::from_millis(500))
///     .with_nodelay(true);
/// let conn = connector.connect("127.0.0.1", 11211).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    nodelay: bool,
    buffer_capacity: usize,
}

impl TcpConnector {
    /// Creates a connector with a 5 second connect timeout and Nagle enabled.
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            nodelay: false,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }

    /// Bounds each connection attempt.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Applied per resolved address, not to the whole dial
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets `TCP_NODELAY` on every dialed socket.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Capacity of the per-connection outbound buffer.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity.max(1);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for TcpConnector {
    type Conn = TcpConnection;

    /// Connects to `host:port`.
    ///
    /// The host is resolved first, and each resolved address is tried in
    /// turn until one accepts within the connect timeout.
    ///
    /// # Arguments
    ///
    /// * `host` - A hostname or IP literal
    /// * `port` - The TCP port
    ///
    /// # Returns
    ///
    /// A [`TcpConnection`] with `TCP_NODELAY` applied if configured
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The address cannot be resolved ([`BerthError::Connection`])
    /// - Every attempt timed out ([`BerthError::Timeout`])
    /// - Every address refused or failed ([`BerthError::Connection`])
    async fn connect(&self, host: &str, port: u16) -> Result<TcpConnection> {
        let addr = format!("{}:{}", host, port);
        let socket_addrs = tokio::net::lookup_host(addr.as_str())
            .await
            .map_err(|e| BerthError::Connection(format!("Invalid address '{}': {}", addr, e)))?;

        let timeout_ms = self.connect_timeout.as_millis() as u64;
        let mut last_err = None;
        let mut timed_out = false;

        for socket_addr in socket_addrs {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(socket_addr)).await {
                Ok(Ok(stream)) => {
                    if self.nodelay {
                        stream.set_nodelay(true)?;
                    }
                    debug!(%socket_addr, "Connected");
                    return TcpConnection::with_capacity(self.buffer_capacity, stream);
                }
                Ok(Err(e)) => {
                    last_err = Some(e.to_string());
                }
                Err(_) => {
                    timed_out = true;
                    last_err = Some(format!("timed out after {}ms", timeout_ms));
                }
            }
        }

        if timed_out {
            return Err(BerthError::Timeout(timeout_ms));
        }

        Err(BerthError::Connection(format!(
            "Failed to connect to {}: {}",
            addr,
            last_err.unwrap_or_else(|| "no addresses resolved".to_string())
        )))
    }
}

/// A pooled TCP connection with a user-space outbound buffer.
///
/// Writes go through a [`BufWriter`], so [`Connection::buffered`] reports
/// exactly the bytes a caller has written but not flushed yet. The pool uses
/// that count to decide when a released connection is safe to hand out again.
#[derive(Debug)]
pub struct TcpConnection {
    stream: BufWriter<TcpStream>,
    peer: SocketAddr,
}

impl TcpConnection {
    /// Wraps an already connected stream, e.g. one accepted or dialed
    /// outside the pool and later handed to `Pool::add`.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY, stream)
    }

    pub fn with_capacity(capacity: usize, stream: TcpStream) -> Result<Self> {
        let peer = stream.peer_addr()?;
        Ok(Self {
            stream: BufWriter::with_capacity(capacity, stream),
            peer,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.get_ref().local_addr()?)
    }

    pub fn get_ref(&self) -> &TcpStream {
        self.stream.get_ref()
    }

    /// Unwraps the stream. Unflushed bytes are discarded.
    pub fn into_inner(self) -> TcpStream {
        self.stream.into_inner()
    }
}

impl Connection for TcpConnection {
    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn is_open(&self) -> bool {
        // Peek a single byte without parking: EOF or a hard error means the
        // peer went away while the socket sat idle.
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        let mut byte = [0u8; 1];
        let mut buf = ReadBuf::new(&mut byte);
        match self.stream.get_ref().poll_peek(&mut cx, &mut buf) {
            Poll::Pending => true,
            Poll::Ready(Ok(0)) => false,
            Poll::Ready(Ok(_)) => true,
            Poll::Ready(Err(e)) => e.kind() == io::ErrorKind::WouldBlock,
        }
    }

    fn buffered(&self) -> usize {
        self.stream.buffer().len()
    }

    async fn drain(&mut self) -> Result<()> {
        self.stream.flush().await?;
        Ok(())
    }

    fn end(self) {
        let peer = self.peer;
        match self.stream.into_inner().into_std() {
            Ok(stream) => {
                if let Err(e) = stream.shutdown(Shutdown::Both) {
                    debug!(%peer, error = %e, "Shutdown of ended connection failed");
                }
            }
            Err(e) => {
                debug!(%peer, error = %e, "Could not detach ended connection from reactor");
            }
        }
    }
}

impl AsyncRead for TcpConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
