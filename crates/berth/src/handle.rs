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

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use berth_common::{Connection, Result};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, warn};

use crate::registry::ServerId;
use crate::socket_table::ConnId;

/// A registered connection together with its table coordinates.
pub(crate) struct Pooled<T> {
    pub(crate) id: ConnId,
    pub(crate) server: ServerId,
    pub(crate) conn: T,
}

/// The pool side of the handle protocol.
pub(crate) trait Checkin<T>: Send + Sync {
    /// Takes back a connection with an empty output buffer.
    fn checkin(self: Arc<Self>, pooled: Pooled<T>);

    /// Forgets and ends a connection that must not be reused.
    fn discard(self: Arc<Self>, pooled: Pooled<T>);

    fn runtime(&self) -> &tokio::runtime::Handle;

    fn tag(&self, server: ServerId) -> &str;
}

/// A connection checked out of a [`Pool`](crate::Pool).
///
/// While a handle exists nobody else can obtain its connection. Give it back
/// with [`release`](Self::release), or terminate it with [`end`](Self::end).
/// Dropping a handle without doing either ends the connection.
///
/// When the connection implements [`AsyncRead`] / [`AsyncWrite`] (as
/// [`TcpConnection`](berth_common::TcpConnection) does) so does the handle.
pub struct Handle<T: Connection> {
    // Some until release/end/drop
    inner: Option<Pooled<T>>,
    owner: Arc<dyn Checkin<T>>,
}

impl<T: Connection> Handle<T> {
    pub(crate) fn new(pooled: Pooled<T>, owner: Arc<dyn Checkin<T>>) -> Self {
        Self {
            inner: Some(pooled),
            owner,
        }
    }

    fn pooled(&self) -> &Pooled<T> {
        self.inner.as_ref().expect("handle used after release")
    }

    fn pooled_mut(&mut self) -> &mut Pooled<T> {
        self.inner.as_mut().expect("handle used after release")
    }

    pub fn id(&self) -> ConnId {
        self.pooled().id
    }

    pub fn server(&self) -> ServerId {
        self.pooled().server
    }

    /// Tag of the server this connection points at.
    pub fn tag(&self) -> &str {
        self.owner.tag(self.server())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.pooled().conn.peer_addr()
    }

    pub fn is_open(&self) -> bool {
        self.pooled().conn.is_open()
    }

    pub fn buffered(&self) -> usize {
        self.pooled().conn.buffered()
    }

    pub async fn drain(&mut self) -> Result<()> {
        self.pooled_mut().conn.drain().await
    }

    pub fn get_ref(&self) -> &T {
        &self.pooled().conn
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.pooled_mut().conn
    }

    /// Returns the connection to the pool.
    ///
    /// If output is still buffered the connection is held back until the
    /// buffer drains; a drain failure ends it instead. On a closed pool the
    /// connection is ended.
    pub fn release(mut self) {
        let Some(pooled) = self.inner.take() else {
            return;
        };
        let owner = Arc::clone(&self.owner);

        let pending = pooled.conn.buffered();
        if pending == 0 {
            owner.checkin(pooled);
            return;
        }

        debug!(
            server = %owner.tag(pooled.server),
            conn = %pooled.id,
            pending,
            "deferring release until output drains"
        );
        let runtime = owner.runtime().clone();
        runtime.spawn(async move {
            let mut pooled = pooled;
            while pooled.conn.buffered() > 0 {
                if let Err(e) = pooled.conn.drain().await {
                    warn!(
                        server = %owner.tag(pooled.server),
                        conn = %pooled.id,
                        error = %e,
                        "drain failed, dropping connection"
                    );
                    owner.discard(pooled);
                    return;
                }
            }
            owner.checkin(pooled);
        });
    }

    /// Terminates the connection and removes it from the pool.
    pub fn end(mut self) {
        if let Some(pooled) = self.inner.take() {
            Arc::clone(&self.owner).discard(pooled);
        }
    }
}

impl<T: Connection> Drop for Handle<T> {
    fn drop(&mut self) {
        if let Some(pooled) = self.inner.take() {
            debug!(
                server = %self.owner.tag(pooled.server),
                conn = %pooled.id,
                "handle dropped without release"
            );
            Arc::clone(&self.owner).discard(pooled);
        }
    }
}

impl<T: Connection> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Handle");
        if let Some(pooled) = &self.inner {
            s.field("id", &pooled.id)
                .field("server", &self.owner.tag(pooled.server))
                .field("peer", &pooled.conn.peer_addr());
        }
        s.finish()
    }
}

impl<T: Connection + AsyncRead + Unpin> AsyncRead for Handle<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(Handle::get_mut(Pin::into_inner(self))).poll_read(cx, buf)
    }
}

impl<T: Connection + AsyncWrite + Unpin> AsyncWrite for Handle<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(Handle::get_mut(Pin::into_inner(self))).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(Handle::get_mut(Pin::into_inner(self))).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(Handle::get_mut(Pin::into_inner(self))).poll_shutdown(cx)
    }
}
