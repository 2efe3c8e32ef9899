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

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use crate::registry::ServerId;

/// Identifier of a connection, unique within its server's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Bookkeeping for one live connection owned by the pool.
///
/// The connection value itself is not stored here: it is either on the
/// available stack or inside a checked-out handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub id: ConnId,
    pub server: ServerId,
    pub peer: Option<SocketAddr>,
    pub registered_at: Instant,
}

#[derive(Debug, Default)]
struct ServerSockets {
    next_id: u64,
    entries: HashMap<ConnId, SocketEntry>,
}

/// Per-server table of live connections.
///
/// The pool's length is the sum of all entries, so an entry must exist for
/// exactly as long as the pool considers the connection alive.
#[derive(Debug)]
pub struct SocketTable {
    servers: Vec<ServerSockets>,
}

impl SocketTable {
    /// A table with one empty slot per registered server.
    pub fn new(server_count: usize) -> Self {
        Self {
            servers: (0..server_count).map(|_| ServerSockets::default()).collect(),
        }
    }

    /// Records a new connection and returns its fresh id.
    pub fn insert(&mut self, server: ServerId, peer: Option<SocketAddr>) -> ConnId {
        let sockets = &mut self.servers[server.index()];
        let mut id = ConnId(sockets.next_id);
        while sockets.entries.contains_key(&id) {
            sockets.next_id = sockets.next_id.wrapping_add(1);
            id = ConnId(sockets.next_id);
        }
        sockets.next_id = sockets.next_id.wrapping_add(1);

        sockets.entries.insert(
            id,
            SocketEntry {
                id,
                server,
                peer,
                registered_at: Instant::now(),
            },
        );
        id
    }

    pub fn remove(&mut self, server: ServerId, id: ConnId) -> Option<SocketEntry> {
        self.servers
            .get_mut(server.index())
            .and_then(|sockets| sockets.entries.remove(&id))
    }

    pub fn contains(&self, server: ServerId, id: ConnId) -> bool {
        self.servers
            .get(server.index())
            .is_some_and(|sockets| sockets.entries.contains_key(&id))
    }

    pub fn count(&self, server: ServerId) -> usize {
        self.servers
            .get(server.index())
            .map_or(0, |sockets| sockets.entries.len())
    }

    pub fn total(&self) -> usize {
        self.servers.iter().map(|sockets| sockets.entries.len()).sum()
    }

    /// Entries of one server, oldest first.
    pub fn entries(&self, server: ServerId) -> Vec<&SocketEntry> {
        let mut entries: Vec<&SocketEntry> = self
            .servers
            .get(server.index())
            .map(|sockets| sockets.entries.values().collect())
            .unwrap_or_default();
        entries.sort_by_key(|entry| entry.id);
        entries
    }
}
