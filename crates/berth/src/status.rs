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

use serde::Serialize;

/// Lifecycle of a pool. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Active,
    Closed,
}

/// Point-in-time snapshot of a pool, as returned by
/// [`Pool::status`](crate::Pool::status).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStatus {
    pub phase: Phase,
    pub min: usize,
    pub max: usize,
    /// Registered connections, idle or checked out
    pub total: usize,
    pub available: usize,
    pub queued: usize,
    pub dialing: usize,
    pub servers: Vec<ServerStatus>,
}

impl PoolStatus {
    pub fn checked_out(&self) -> usize {
        self.total.saturating_sub(self.available)
    }

    pub fn server(&self, tag: &str) -> Option<&ServerStatus> {
        self.servers.iter().find(|server| server.tag == tag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerStatus {
    pub tag: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub connections: usize,
    pub dialing: usize,
    /// Inside a backoff window right now
    pub avoided: bool,
    /// Current window length, kept after it lapses until a dial succeeds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in_secs: Option<u64>,
}
