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

//! The pool orchestrator.
//!
//! All mutable state lives in one [`PoolState`] behind a std mutex. The lock
//! is only ever held for bookkeeping: dialing, draining, ending connections
//! and running callbacks all happen after it is released. Work that touches
//! the outside world is either spawned on the runtime captured at
//! construction or performed by the caller once the guard is dropped.

use std::fmt;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use berth_common::{BerthError, Connection, Connector, Result, TcpConnector};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::backoff::BackoffTracker;
use crate::config::{PoolConfig, ServerConfig};
use crate::demand_queue::DemandQueue;
use crate::handle::{Checkin, Handle, Pooled};
use crate::registry::{Registry, ServerId};
use crate::selector::{self, Candidate};
use crate::socket_table::SocketTable;
use crate::status::{Phase, PoolStatus, ServerStatus};

type Callback<T> = Box<dyn FnOnce(Handle<T>) + Send>;

/// Someone waiting in the demand queue.
enum Waiter<T: Connection> {
    Callback(Callback<T>),
    /// A [`Pool::get`] caller. Abandoned once its receiver is gone.
    Channel(oneshot::Sender<Handle<T>>),
}

impl<T: Connection> Waiter<T> {
    fn is_abandoned(&self) -> bool {
        matches!(self, Waiter::Channel(tx) if tx.is_closed())
    }
}

struct PoolState<T: Connection> {
    phase: Phase,
    table: SocketTable,
    backoff: BackoffTracker,
    /// Idle connections, most recently returned last
    available: Vec<Pooled<T>>,
    queue: DemandQueue<Waiter<T>>,
    /// Dials in flight, indexed by server
    dialing: Vec<usize>,
}

/// Where a connection went after [`PoolState::place`]. Anything but
/// `Stacked` needs follow-up once the lock is released.
enum Placement<T: Connection> {
    Stacked,
    Deliver(Waiter<T>, Pooled<T>),
    End(Pooled<T>),
}

impl<T: Connection> PoolState<T> {
    fn pending(&self) -> usize {
        self.dialing.iter().sum()
    }

    /// Pops the most recent idle connection that is still open.
    ///
    /// Connections found closed on the way are unregistered and collected in
    /// `stale` so the caller can end them outside the lock.
    fn pop_open(&mut self, stale: &mut Vec<Pooled<T>>) -> Option<Pooled<T>> {
        while let Some(pooled) = self.available.pop() {
            if pooled.conn.is_open() {
                return Some(pooled);
            }
            self.table.remove(pooled.server, pooled.id);
            stale.push(pooled);
        }
        None
    }

    /// Idle connections the refill loop aims for: `min`, or more while
    /// waiters are queued.
    fn idle_target(&self, min: usize) -> usize {
        min.max(self.queue.len())
    }

    /// Routes a registered connection: newest live waiter first, else the
    /// stack. Abandoned `get()` waiters met on the way are discarded.
    fn place(&mut self, pooled: Pooled<T>) -> Placement<T> {
        if self.phase == Phase::Closed {
            self.table.remove(pooled.server, pooled.id);
            return Placement::End(pooled);
        }
        while let Some(waiter) = self.queue.pop() {
            if !waiter.is_abandoned() {
                return Placement::Deliver(waiter, pooled);
            }
        }
        self.available.push(pooled);
        Placement::Stacked
    }
}

struct Shared<C: Connector> {
    connector: C,
    registry: Registry,
    config: PoolConfig,
    runtime: tokio::runtime::Handle,
    state: Mutex<PoolState<C::Conn>>,
}

impl<C: Connector> Shared<C> {
    fn state(&self) -> MutexGuard<'_, PoolState<C::Conn>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tag_of(&self, server: ServerId) -> &str {
        &self.registry.get(server).tag
    }

    fn handle(self: &Arc<Self>, pooled: Pooled<C::Conn>) -> Handle<C::Conn> {
        let owner: Arc<dyn Checkin<C::Conn>> = Arc::clone(self) as Arc<dyn Checkin<C::Conn>>;
        Handle::new(pooled, owner)
    }

    fn dispatch(self: &Arc<Self>, placement: Placement<C::Conn>) {
        match placement {
            Placement::Stacked => {}
            Placement::Deliver(waiter, pooled) => {
                debug!(
                    server = %self.tag_of(pooled.server),
                    conn = %pooled.id,
                    "handing connection to queued waiter"
                );
                let handle = self.handle(pooled);
                match waiter {
                    Waiter::Callback(callback) => {
                        self.runtime.spawn(async move { callback(handle) });
                    }
                    Waiter::Channel(tx) => {
                        // the waiter gave up in the meantime
                        if let Err(handle) = tx.send(handle) {
                            handle.release();
                        }
                    }
                }
            }
            Placement::End(pooled) => {
                debug!(
                    server = %self.tag_of(pooled.server),
                    conn = %pooled.id,
                    "pool closed, ending connection"
                );
                pooled.conn.end();
            }
        }
    }

    fn end_stale(&self, stale: Vec<Pooled<C::Conn>>) {
        for pooled in stale {
            debug!(
                server = %self.tag_of(pooled.server),
                conn = %pooled.id,
                "dropping idle connection closed by peer"
            );
            pooled.conn.end();
        }
    }

    /// Dials until the idle target or the total ceiling is met, counting
    /// dials already in flight toward both. Queued waiters raise the idle
    /// target, so a pool with `min == 0` still dials on demand.
    fn ensure(self: &Arc<Self>) {
        let mut to_dial = Vec::new();
        {
            let mut state = self.state();
            if state.phase == Phase::Closed {
                return;
            }

            let now = Instant::now();
            loop {
                let pending = state.pending();
                let total = state.table.total();
                if state.available.len() + pending >= state.idle_target(self.config.min)
                    || total + pending >= self.config.max
                {
                    break;
                }

                let candidates: Vec<Candidate> = state
                    .backoff
                    .eligible_at(self.registry.ids(), now)
                    .into_iter()
                    .map(|server| Candidate {
                        server,
                        weight: self.registry.get(server).weight,
                        connections: state.table.count(server) + state.dialing[server.index()],
                    })
                    .collect();

                let Some(server) = selector::recommend(&candidates, self.config.max, total + pending)
                else {
                    debug!(
                        available = state.available.len(),
                        total,
                        "no eligible server to dial"
                    );
                    break;
                };

                state.dialing[server.index()] += 1;
                to_dial.push(server);
            }
        }

        for server in to_dial {
            self.spawn_dial(server);
        }
    }

    fn spawn_dial(self: &Arc<Self>, server: ServerId) {
        let shared = Arc::clone(self);
        self.runtime.spawn(async move {
            let target = shared.registry.get(server);
            debug!(server = %target.tag, host = %target.host, port = target.port, "dialing");
            let result = shared.connector.connect(&target.host, target.port).await;
            shared.finish_dial(server, result);
        });
    }

    fn finish_dial(self: &Arc<Self>, server: ServerId, result: Result<C::Conn>) {
        let tag = self.tag_of(server);

        match result {
            Ok(conn) => {
                let (recovered, placement) = {
                    let mut state = self.state();
                    state.dialing[server.index()] = state.dialing[server.index()].saturating_sub(1);
                    if state.phase == Phase::Closed {
                        drop(state);
                        debug!(server = %tag, "dial completed after close, ending connection");
                        conn.end();
                        return;
                    }

                    let recovered = state.backoff.clear(server);
                    let id = state.table.insert(server, conn.peer_addr());
                    debug!(server = %tag, conn = %id, "connection established");
                    let placement = state.place(Pooled { id, server, conn });
                    (recovered, placement)
                };

                if recovered {
                    info!(server = %tag, "server reachable again, backoff cleared");
                }
                self.dispatch(placement);
                self.ensure();
            }
            Err(e) => {
                let entry = {
                    let mut state = self.state();
                    state.dialing[server.index()] = state.dialing[server.index()].saturating_sub(1);
                    if state.phase == Phase::Closed {
                        return;
                    }
                    state.backoff.record_failure(server)
                };
                warn!(
                    server = %tag,
                    error = %e,
                    cooldown_secs = entry.cooldown.as_secs(),
                    "dial failed, avoiding server"
                );
            }
        }
    }
}

impl<C: Connector> Checkin<C::Conn> for Shared<C> {
    fn checkin(self: Arc<Self>, pooled: Pooled<C::Conn>) {
        if !pooled.conn.is_open() {
            debug!(
                server = %self.tag_of(pooled.server),
                conn = %pooled.id,
                "released connection is closed"
            );
            self.discard(pooled);
            return;
        }
        let placement = self.state().place(pooled);
        self.dispatch(placement);
        self.ensure();
    }

    fn discard(self: Arc<Self>, pooled: Pooled<C::Conn>) {
        self.state().table.remove(pooled.server, pooled.id);
        pooled.conn.end();
        self.ensure();
    }

    fn runtime(&self) -> &tokio::runtime::Handle {
        &self.runtime
    }

    fn tag(&self, server: ServerId) -> &str {
        self.tag_of(server)
    }
}

/// Weighted client-side connection pool.
///
/// A pool keeps between `min` idle and `max` total connections open toward
/// a fixed roster of servers, dialing whichever server is furthest below
/// its weighted share. Servers that refuse or time out are avoided for an
/// escalating window (2 minutes doubling up to 128 by default).
///
/// # Getting a connection
///
/// - [`acquire`](Self::acquire) returns an idle connection or `None`.
/// - [`queue`](Self::queue) runs a callback with the next connection. The
///   most recently queued callback is served first.
/// - [`get`](Self::get) awaits the next connection, bounded by
///   `acquire_timeout`.
///
/// Every path hands out a [`Handle`]. Call [`Handle::release`] when done.
///
/// # Runtime
///
/// The pool spawns its dials and callbacks on the tokio runtime that was
/// current when it was built. Building one outside a runtime fails with
/// [`BerthError::NoRuntime`].
///
/// # Example
///
/// ```rust,no_run
/// use berth::{Pool, PoolConfig, ServerConfig};
///
/// # #[tokio::main]
/// # async fn main() -> berth::Result<()> {
/// let pool = Pool::new(
///     vec![
///         "10.0.0.1:6379".parse::<ServerConfig>()?,
///         "10.0.0.2:6379*3".parse::<ServerConfig>()?,
///     ],
///     PoolConfig::default().with_min(2).with_max(8),
/// )?;
///
/// let conn = pool.get().await?;
/// println!("talking to {}", conn.tag());
/// conn.release();
///
/// pool.close();
/// # Ok(())
/// # }
/// ```
pub struct Pool<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Pool<TcpConnector> {
    /// Builds a TCP pool with the default [`TcpConnector`].
    ///
    /// # Arguments
    ///
    /// * `servers` - The roster, in selection tie-break order
    /// * `config` - Pool sizing, backoff and `get()` timeout
    ///
    /// # Errors
    ///
    /// Same as [`with_connector`](Self::with_connector).
    pub fn new<I>(servers: I, config: PoolConfig) -> Result<Self>
    where
        I: IntoIterator<Item = ServerConfig>,
    {
        Self::with_connector(servers, config, TcpConnector::new())
    }
}

impl<C: Connector> Pool<C> {
    /// Builds a pool that dials through `connector` and starts filling it.
    ///
    /// # Arguments
    ///
    /// * `servers` - The roster, in selection tie-break order
    /// * `config` - Pool sizing, backoff and `get()` timeout
    /// * `connector` - Dials new connections, see [`Connector`]
    ///
    /// # Returns
    ///
    /// A pool whose first dials toward `min` are already spawned.
    ///
    /// # Errors
    ///
    /// - [`BerthError::InvalidConfig`] for `max == 0` or a bad backoff range
    /// - [`BerthError::NoServers`], [`BerthError::InvalidServer`] or
    ///   [`BerthError::DuplicateTag`] for a bad roster
    /// - [`BerthError::NoRuntime`] outside a tokio runtime
    ///
    /// Nothing is dialed unless construction succeeds.
    pub fn with_connector<I>(servers: I, config: PoolConfig, connector: C) -> Result<Self>
    where
        I: IntoIterator<Item = ServerConfig>,
    {
        config.validate()?;
        let registry = Registry::new(servers)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BerthError::NoRuntime(e.to_string()))?;

        let state = PoolState {
            phase: Phase::Active,
            table: SocketTable::new(registry.len()),
            backoff: BackoffTracker::new(config.backoff),
            available: Vec::new(),
            queue: DemandQueue::new(),
            dialing: vec![0; registry.len()],
        };

        info!(
            servers = registry.len(),
            min = config.min,
            max = config.max,
            "connection pool created"
        );

        let shared = Arc::new(Shared {
            connector,
            registry,
            config,
            runtime,
            state: Mutex::new(state),
        });
        shared.ensure();

        Ok(Self { shared })
    }

    /// Takes the most recently returned idle connection, if any, and tops
    /// the pool up.
    ///
    /// Idle connections the peer has closed are dropped along the way.
    ///
    /// # Returns
    ///
    /// A [`Handle`] on an idle connection, or `None` when nothing is idle.
    /// `None` never waits: use [`queue`](Self::queue) or [`get`](Self::get)
    /// to wait for the next connection.
    pub fn acquire(&self) -> Option<Handle<C::Conn>> {
        let mut stale = Vec::new();
        let pooled = self.shared.state().pop_open(&mut stale);
        self.shared.end_stale(stale);
        self.shared.ensure();
        pooled.map(|pooled| self.shared.handle(pooled))
    }

    /// Runs `callback` with a connection as soon as one is available.
    ///
    /// The callback never runs on the caller's stack: even when a connection
    /// is idle right now it is invoked from a spawned task. Callbacks still
    /// waiting when the pool closes are dropped without being called.
    ///
    /// Each queued callback raises the number of idle connections the pool
    /// dials toward, up to `max`.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Closed`] if the pool is closed. The callback is
    /// dropped.
    pub fn queue<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(Handle<C::Conn>) + Send + 'static,
    {
        self.enqueue(Waiter::Callback(Box::new(callback)))
    }

    fn enqueue(&self, waiter: Waiter<C::Conn>) -> Result<()> {
        let mut stale = Vec::new();

        let ready = {
            let mut state = self.shared.state();
            if state.phase == Phase::Closed {
                return Err(BerthError::Closed);
            }
            match state.pop_open(&mut stale) {
                Some(pooled) => Some((waiter, pooled)),
                None => {
                    state.queue.push(waiter);
                    None
                }
            }
        };

        self.shared.end_stale(stale);
        self.shared.ensure();
        if let Some((waiter, pooled)) = ready {
            self.shared.dispatch(Placement::Deliver(waiter, pooled));
        }
        Ok(())
    }

    /// Waits for a connection, at most `acquire_timeout`.
    ///
    /// The caller joins the demand queue like a [`queue`](Self::queue)
    /// callback would, so the most recent `get()` is served first. An idle
    /// connection is returned without waiting.
    ///
    /// # Returns
    ///
    /// A [`Handle`] the caller owns exclusively until it is released.
    ///
    /// # Errors
    ///
    /// - [`BerthError::AcquireTimeout`] if nothing arrived in time
    /// - [`BerthError::Closed`] if the pool is or becomes closed
    ///
    /// A waiter that times out, or whose future is dropped, leaves the queue.
    /// A connection racing toward it goes back to the pool instead.
    pub async fn get(&self) -> Result<Handle<C::Conn>> {
        let (tx, mut rx) = oneshot::channel();
        self.enqueue(Waiter::Channel(tx))?;

        let timeout = self.shared.config.acquire_timeout;
        let received = tokio::time::timeout(timeout, &mut rx).await;
        match received {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(_)) => Err(BerthError::Closed),
            Err(_) => {
                rx.close();
                // delivered between the deadline and the close
                if let Ok(handle) = rx.try_recv() {
                    return Ok(handle);
                }
                self.shared
                    .state()
                    .queue
                    .retain(|waiter| !waiter.is_abandoned());
                Err(BerthError::AcquireTimeout(timeout.as_millis() as u64))
            }
        }
    }

    /// Registers an externally established connection.
    ///
    /// The peer address must match a configured server: an IP literal host
    /// or `localhost` for a loopback peer, and the same port. On success the
    /// connection goes to the newest waiter, or onto the idle stack.
    ///
    /// # Returns
    ///
    /// `false`, leaving the pool untouched, when the connection is not open,
    /// has no peer address, points at no configured server, or the pool is
    /// closed. `max` is not enforced here.
    pub fn add(&self, conn: C::Conn) -> bool {
        self.try_add(conn).is_ok()
    }

    /// Like [`add`](Self::add), but gives a rejected connection back.
    ///
    /// # Errors
    ///
    /// Returns the connection unchanged when [`add`](Self::add) would
    /// return `false`.
    pub fn try_add(&self, conn: C::Conn) -> std::result::Result<(), C::Conn> {
        if !conn.is_open() {
            return Err(conn);
        }
        let Some(peer) = conn.peer_addr() else {
            return Err(conn);
        };
        let Some(server) = self.shared.registry.resolve_endpoint(peer) else {
            debug!(%peer, "rejecting connection to unknown endpoint");
            return Err(conn);
        };

        let placement = {
            let mut state = self.shared.state();
            if state.phase == Phase::Closed {
                return Err(conn);
            }
            let id = state.table.insert(server, Some(peer));
            debug!(server = %self.shared.tag_of(server), conn = %id, "connection added");
            state.place(Pooled { id, server, conn })
        };
        self.shared.dispatch(placement);
        Ok(())
    }

    /// Closes the pool. Irreversible.
    ///
    /// Idle connections are ended at once and queued callbacks are dropped.
    /// Checked-out connections keep working; releasing them ends them. No
    /// further dials are started, and dials already in flight end their
    /// connection on arrival.
    pub fn close(&self) {
        let (idle, waiters) = {
            let mut state = self.shared.state();
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Closed;
            let idle = mem::take(&mut state.available);
            for pooled in &idle {
                state.table.remove(pooled.server, pooled.id);
            }
            (idle, state.queue.drain_all())
        };

        info!(
            idle = idle.len(),
            waiters = waiters.len(),
            "connection pool closed"
        );
        for pooled in idle {
            pooled.conn.end();
        }
        drop(waiters);
    }

    /// Registered connections, idle or checked out. Dials in flight and
    /// connections released after [`close`](Self::close) are not counted.
    pub fn len(&self) -> usize {
        self.shared.state().table.total()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state().phase == Phase::Closed
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Takes a point-in-time snapshot of the pool and of every server.
    ///
    /// # Returns
    ///
    /// A [`PoolStatus`] that serializes with serde, e.g. for `berth probe`.
    pub fn status(&self) -> PoolStatus {
        let state = self.shared.state();
        let now = Instant::now();

        let servers = self
            .shared
            .registry
            .iter()
            .map(|(id, server)| {
                let retry_in = state.backoff.avoided_for(id, now);
                ServerStatus {
                    tag: server.tag.clone(),
                    host: server.host.clone(),
                    port: server.port,
                    weight: server.weight,
                    connections: state.table.count(id),
                    dialing: state.dialing[id.index()],
                    avoided: retry_in.is_some(),
                    cooldown_secs: state.backoff.entry(id).map(|entry| entry.cooldown.as_secs()),
                    retry_in_secs: retry_in.map(|d| d.as_secs()),
                }
            })
            .collect();

        PoolStatus {
            phase: state.phase,
            min: self.shared.config.min,
            max: self.shared.config.max,
            total: state.table.total(),
            available: state.available.len(),
            queued: state.queue.len(),
            dialing: state.pending(),
            servers,
        }
    }
}

impl<C: Connector> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state();
        f.debug_struct("Pool")
            .field("phase", &state.phase)
            .field("servers", &self.shared.registry.len())
            .field("total", &state.table.total())
            .field("available", &state.available.len())
            .field("queued", &state.queue.len())
            .finish()
    }
}
