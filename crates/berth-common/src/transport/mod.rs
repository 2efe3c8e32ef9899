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

//! Berth Transport Layer
//!
//! The pool never touches sockets directly. It talks to two traits:
//!
//! - **[`Connection`]**: one established duplex byte stream. The pool needs
//!   to know where it points, whether it is still open, how many bytes are
//!   still waiting to be sent, and how to end it.
//! - **[`Connector`]**: dials a `host:port` and yields a [`Connection`].
//!
//! [`TcpConnector`] / [`TcpConnection`] are the tokio implementations used in
//! production. Tests substitute scripted in-memory implementations.
//!
//! # Example
//!
//! ```no_run
//! use berth_common::transport::{Connection, Connector, TcpConnector};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = TcpConnector::new();
//! let conn = connector.connect("127.0.0.1", 6379).await?;
//! assert!(conn.is_open());
//! # Ok(())
//! # }
//! ```

pub mod tcp;

use std::future::Future;
use std::net::SocketAddr;

use crate::error::Result;

pub use tcp::{TcpConnection, TcpConnector};

/// An established, pool-manageable connection.
pub trait Connection: Send + 'static {
    /// Remote endpoint, if the connection is (still) attached to one.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Whether the connection can still carry traffic.
    ///
    /// Must not block. Implementations that cannot tell should return `true`
    /// and let real I/O surface the failure.
    fn is_open(&self) -> bool;

    /// Bytes accepted for sending that have not been handed to the OS yet.
    fn buffered(&self) -> usize;

    /// Resolves once [`buffered`](Self::buffered) reaches zero.
    fn drain(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Gracefully terminates the connection. No further reuse.
    fn end(self);
}

/// Dials servers on behalf of the pool.
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    /// Opens a new connection to `host:port`.
    ///
    /// Any error (refused, unreachable, timed out) is treated by the pool as
    /// a transient failure of that server.
    fn connect(&self, host: &str, port: u16) -> impl Future<Output = Result<Self::Conn>> + Send;
}
