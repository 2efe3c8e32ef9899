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
use std::net::{IpAddr, SocketAddr};

use berth_common::{BerthError, Result};
use serde::Serialize;

use crate::config::ServerConfig;

/// Position of a server in its registry.
///
/// Registry order is the order servers were given to the constructor, and
/// it is the tie-break order for selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(usize);

impl ServerId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A configured backend. Immutable once the pool is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Server {
    pub tag: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

impl Server {
    /// Whether a connection whose remote end is `addr` belongs to this server.
    ///
    /// Only literal IP hosts and `localhost` can be matched; hostnames would
    /// need a DNS lookup, which registration never does.
    pub fn matches_endpoint(&self, addr: SocketAddr) -> bool {
        if self.port != addr.port() {
            return false;
        }
        match self.host.parse::<IpAddr>() {
            Ok(ip) => ip == addr.ip() || ip.to_canonical() == addr.ip().to_canonical(),
            Err(_) => self.host.eq_ignore_ascii_case("localhost") && addr.ip().is_loopback(),
        }
    }
}

/// The fixed roster of servers a pool balances over.
#[derive(Debug, Clone)]
pub struct Registry {
    servers: Vec<Server>,
    by_tag: HashMap<String, ServerId>,
}

impl Registry {
    /// Builds a registry, rejecting empty rosters, zero weights and
    /// duplicate tags (explicit or derived from `host:port`).
    pub fn new<I>(configs: I) -> Result<Self>
    where
        I: IntoIterator<Item = ServerConfig>,
    {
        let mut servers = Vec::new();
        let mut by_tag = HashMap::new();

        for config in configs {
            let tag = config.resolved_tag();
            let weight = config.resolved_weight();
            if weight == 0 {
                return Err(BerthError::InvalidServer {
                    tag,
                    reason: "weight must be positive".to_string(),
                });
            }
            if by_tag.contains_key(&tag) {
                return Err(BerthError::DuplicateTag(tag));
            }

            let id = ServerId(servers.len());
            by_tag.insert(tag.clone(), id);
            servers.push(Server {
                tag,
                host: config.host,
                port: config.port,
                weight,
            });
        }

        if servers.is_empty() {
            return Err(BerthError::NoServers);
        }

        Ok(Self { servers, by_tag })
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Panics if `id` came from another registry.
    pub fn get(&self, id: ServerId) -> &Server {
        &self.servers[id.0]
    }

    pub fn lookup(&self, tag: &str) -> Option<ServerId> {
        self.by_tag.get(tag).copied()
    }

    /// First server (in registry order) whose endpoint is `addr`.
    pub fn resolve_endpoint(&self, addr: SocketAddr) -> Option<ServerId> {
        self.iter()
            .find(|(_, server)| server.matches_endpoint(addr))
            .map(|(id, _)| id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ServerId, &Server)> + '_ {
        self.servers
            .iter()
            .enumerate()
            .map(|(index, server)| (ServerId(index), server))
    }

    pub fn ids(&self) -> impl Iterator<Item = ServerId> + '_ {
        (0..self.servers.len()).map(ServerId)
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }
}
