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

//! TCP Pool Integration Tests
//!
//! These tests run the pool against real listeners on `127.0.0.1:0` and
//! verify that it:
//! - spreads connections according to server weights
//! - avoids servers that refuse connections
//! - flushes buffered output before reusing a released connection
//! - ends idle connections on close

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use berth::{Pool, PoolConfig, ServerConfig, TcpConnection};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

/// Accepts connections, records what they send and counts hang-ups.
struct TestServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<u8>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TestServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        {
            let accepted = Arc::clone(&accepted);
            let closed = Arc::clone(&closed);
            let received = Arc::clone(&received);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        result = listener.accept() => {
                            let Ok((mut stream, _)) = result else { continue };
                            accepted.fetch_add(1, Ordering::SeqCst);
                            let closed = Arc::clone(&closed);
                            let received = Arc::clone(&received);
                            tokio::spawn(async move {
                                let mut buf = [0u8; 1024];
                                loop {
                                    match stream.read(&mut buf).await {
                                        Ok(0) | Err(_) => break,
                                        Ok(n) => received.lock().unwrap().extend_from_slice(&buf[..n]),
                                    }
                                }
                                closed.fetch_add(1, Ordering::SeqCst);
                            });
                        }
                        _ = &mut shutdown_rx => break,
                    }
                }
            });
        }

        Self {
            addr,
            accepted,
            closed,
            received,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    fn config(&self) -> ServerConfig {
        ServerConfig::new("127.0.0.1", self.addr.port())
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A loopback port with nothing listening on it.
async fn refused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn eventually<F: FnMut() -> bool>(mut condition: F) {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("condition not reached within 5s");
}

#[tokio::test]
async fn test_pool_spreads_connections_by_weight() {
    let light = TestServer::start().await;
    let heavy = TestServer::start().await;

    let pool = Pool::new(
        vec![
            light.config().with_tag("light"),
            heavy.config().with_tag("heavy").with_weight(3),
        ],
        PoolConfig::default().with_min(4).with_max(4),
    )
    .unwrap();

    eventually(|| pool.len() == 4).await;
    let status = pool.status();
    assert_eq!(status.server("light").unwrap().connections, 1);
    assert_eq!(status.server("heavy").unwrap().connections, 3);

    eventually(|| light.accepted() == 1 && heavy.accepted() == 3).await;
    pool.close();
}

#[tokio::test]
async fn test_refused_server_is_avoided() {
    let live = TestServer::start().await;
    let dead_port = refused_port().await;

    let pool = Pool::new(
        vec![
            ServerConfig::new("127.0.0.1", dead_port).with_tag("dead"),
            live.config().with_tag("live"),
        ],
        PoolConfig::default().with_min(1).with_max(2),
    )
    .unwrap();

    eventually(|| pool.status().server("dead").is_some_and(|s| s.avoided)).await;
    assert_eq!(pool.len(), 0);

    // the next trigger goes to the healthy server
    assert!(pool.acquire().is_none());
    eventually(|| pool.len() == 1).await;

    let handle = pool.acquire().unwrap();
    assert_eq!(handle.tag(), "live");
    assert_eq!(handle.peer_addr(), Some(live.addr));
    handle.release();
    pool.close();
}

#[tokio::test]
async fn test_release_flushes_before_reuse() {
    let server = TestServer::start().await;
    let pool = Pool::new(
        vec![server.config()],
        PoolConfig::default().with_min(1).with_max(1),
    )
    .unwrap();

    let mut handle = pool.get().await.unwrap();
    handle.write_all(b"ping").await.unwrap();
    // still sitting in the write buffer
    assert_eq!(handle.buffered(), 4);

    let id = handle.id();
    handle.release();
    eventually(|| pool.status().available == 1).await;
    eventually(|| server.received() == b"ping").await;

    let again = pool.acquire().unwrap();
    assert_eq!(again.id(), id);
    assert_eq!(again.buffered(), 0);
    again.release();

    pool.close();
    eventually(|| server.closed() == 1).await;
    assert_eq!(pool.len(), 0);
}

#[tokio::test]
async fn test_close_keeps_checked_out_connection_usable() {
    let server = TestServer::start().await;
    let pool = Pool::new(
        vec![server.config()],
        PoolConfig::default().with_min(2).with_max(2),
    )
    .unwrap();
    eventually(|| pool.status().available == 2).await;

    let mut handle = pool.acquire().unwrap();
    pool.close();
    eventually(|| server.closed() == 1).await;

    handle.write_all(b"still here").await.unwrap();
    handle.drain().await.unwrap();
    eventually(|| server.received() == b"still here").await;

    handle.release();
    eventually(|| server.closed() == 2).await;
    assert_eq!(pool.len(), 0);
}

#[tokio::test]
async fn test_add_external_connection() {
    let server = TestServer::start().await;
    let pool = Pool::new(
        vec![server.config().with_tag("ext")],
        PoolConfig::default().with_min(0).with_max(1),
    )
    .unwrap();

    let stream = TcpStream::connect(server.addr).await.unwrap();
    let conn = TcpConnection::from_stream(stream).unwrap();
    assert!(pool.add(conn));

    let other = TestServer::start().await;
    let stray = TcpConnection::from_stream(TcpStream::connect(other.addr).await.unwrap()).unwrap();
    assert!(!pool.add(stray));

    let handle = pool.acquire().unwrap();
    assert_eq!(handle.tag(), "ext");
    handle.release();
    assert_eq!(pool.len(), 1);
}
