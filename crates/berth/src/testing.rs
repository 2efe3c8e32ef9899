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

//! Scripted in-memory transport for pool tests.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use berth_common::{BerthError, Connection, Connector, Result};
use tokio::sync::{Notify, Semaphore};

/// Observable state of one mock connection, shared with the test.
#[derive(Debug)]
pub struct MockState {
    open: AtomicBool,
    ended: AtomicBool,
    buffered: AtomicUsize,
    changed: Notify,
}

impl MockState {
    fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            ended: AtomicBool::new(false),
            buffered: AtomicUsize::new(0),
            changed: Notify::new(),
        }
    }

    pub fn set_buffered(&self, bytes: usize) {
        self.buffered.store(bytes, Ordering::SeqCst);
    }

    /// Empties the output buffer and wakes any drain.
    pub fn flush(&self) {
        self.buffered.store(0, Ordering::SeqCst);
        self.changed.notify_one();
    }

    /// Simulates the remote end hanging up.
    pub fn close_by_peer(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.changed.notify_one();
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct MockConnection {
    peer: Option<SocketAddr>,
    state: Arc<MockState>,
}

impl MockConnection {
    /// A connection that did not come from a [`MockConnector`].
    pub fn detached(peer: &str) -> (Self, Arc<MockState>) {
        let state = Arc::new(MockState::new());
        let conn = Self {
            peer: peer.parse().ok(),
            state: Arc::clone(&state),
        };
        (conn, state)
    }
}

impl Connection for MockConnection {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst) && !self.state.is_ended()
    }

    fn buffered(&self) -> usize {
        self.state.buffered.load(Ordering::SeqCst)
    }

    async fn drain(&mut self) -> Result<()> {
        loop {
            if self.buffered() == 0 {
                return Ok(());
            }
            if !self.is_open() {
                return Err(BerthError::Connection("peer closed with pending output".into()));
            }
            self.state.changed.notified().await;
        }
    }

    fn end(self) {
        self.state.ended.store(true, Ordering::SeqCst);
        self.state.open.store(false, Ordering::SeqCst);
    }
}

/// How a dial to a given endpoint behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dial {
    Connect,
    Refuse,
    /// Never completes.
    Hang,
    /// Completes once [`MockConnector::open_gate`] hands out a permit.
    Gated,
}

#[derive(Debug)]
struct ConnectorInner {
    plans: Mutex<HashMap<String, Dial>>,
    dials: Mutex<Vec<String>>,
    connections: Mutex<Vec<(String, Arc<MockState>)>>,
    gate: Semaphore,
}

/// Connector whose outcome per `host:port` is scripted by the test.
/// Endpoints without a plan connect successfully.
#[derive(Debug, Clone)]
pub struct MockConnector {
    inner: Arc<ConnectorInner>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ConnectorInner {
                plans: Mutex::new(HashMap::new()),
                dials: Mutex::new(Vec::new()),
                connections: Mutex::new(Vec::new()),
                gate: Semaphore::new(0),
            }),
        }
    }

    pub fn plan(self, endpoint: &str, dial: Dial) -> Self {
        self.set_plan(endpoint, dial);
        self
    }

    pub fn set_plan(&self, endpoint: &str, dial: Dial) {
        self.inner
            .plans
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), dial);
    }

    pub fn open_gate(&self, permits: usize) {
        self.inner.gate.add_permits(permits);
    }

    /// Every dial attempt so far, in order.
    pub fn dials(&self) -> Vec<String> {
        self.inner.dials.lock().unwrap().clone()
    }

    pub fn dial_count(&self, endpoint: &str) -> usize {
        self.dials().iter().filter(|d| *d == endpoint).count()
    }

    /// States of successfully dialed connections, in dial order.
    pub fn connections(&self) -> Vec<Arc<MockState>> {
        self.inner
            .connections
            .lock()
            .unwrap()
            .iter()
            .map(|(_, state)| Arc::clone(state))
            .collect()
    }

    pub fn connections_to(&self, endpoint: &str) -> Vec<Arc<MockState>> {
        self.inner
            .connections
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| e == endpoint)
            .map(|(_, state)| Arc::clone(state))
            .collect()
    }

    fn plan_for(&self, endpoint: &str) -> Dial {
        self.inner
            .plans
            .lock()
            .unwrap()
            .get(endpoint)
            .copied()
            .unwrap_or(Dial::Connect)
    }
}

impl Connector for MockConnector {
    type Conn = MockConnection;

    async fn connect(&self, host: &str, port: u16) -> Result<MockConnection> {
        let endpoint = format!("{}:{}", host, port);
        self.inner.dials.lock().unwrap().push(endpoint.clone());

        match self.plan_for(&endpoint) {
            Dial::Connect => {}
            Dial::Refuse => {
                return Err(BerthError::Connection(format!("{}: connection refused", endpoint)));
            }
            Dial::Hang => std::future::pending::<()>().await,
            Dial::Gated => {
                self.inner
                    .gate
                    .acquire()
                    .await
                    .map_err(|e| BerthError::Connection(e.to_string()))?
                    .forget();
            }
        }

        let (conn, state) = MockConnection::detached(&endpoint);
        self.inner
            .connections
            .lock()
            .unwrap()
            .push((endpoint, state));
        Ok(conn)
    }
}

/// Lets spawned pool tasks run until they block.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Polls `condition` until it holds, panicking after two seconds.
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(2), wait).await.is_err() {
        panic!("condition not reached within 2s");
    }
}

/// Runs `future` with a two second ceiling.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("future did not complete within 2s")
}
