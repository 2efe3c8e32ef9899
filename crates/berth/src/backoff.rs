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

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::BackoffConfig;
use crate::registry::ServerId;

/// Avoidance window for one server that recently failed to accept a dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvoidEntry {
    pub last_failure: Instant,
    pub cooldown: Duration,
}

impl AvoidEntry {
    /// Whether the window is still open at `now`.
    pub fn is_active_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_failure) < self.cooldown
    }

    /// Time left in the window, `None` once it has lapsed.
    pub fn remaining_at(&self, now: Instant) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(self.last_failure);
        self.cooldown.checked_sub(elapsed).filter(|d| !d.is_zero())
    }
}

/// Per-server adaptive backoff ("avoid list").
///
/// Entries expire lazily: a lapsed entry is simply ignored by
/// [`is_eligible_at`](Self::is_eligible_at) and only removed by
/// [`clear`](Self::clear) after a successful dial. Keeping it around is what
/// lets the next failure escalate the window instead of starting over.
///
/// # Escalation
///
/// | event                                  | cooldown            |
/// |----------------------------------------|---------------------|
/// | first failure                          | `initial`           |
/// | failure inside an open window          | unchanged           |
/// | failure after the window lapsed        | doubled, up to `max`|
/// | successful dial                        | entry removed       |
#[derive(Debug, Clone)]
pub struct BackoffTracker {
    config: BackoffConfig,
    entries: HashMap<ServerId, AvoidEntry>,
}

impl BackoffTracker {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    pub fn record_failure(&mut self, server: ServerId) -> AvoidEntry {
        self.record_failure_at(server, Instant::now())
    }

    pub fn record_failure_at(&mut self, server: ServerId, now: Instant) -> AvoidEntry {
        match self.entries.entry(server) {
            Entry::Vacant(slot) => *slot.insert(AvoidEntry {
                last_failure: now,
                cooldown: self.config.initial,
            }),
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                if !entry.is_active_at(now) {
                    entry.cooldown = entry.cooldown.saturating_mul(2).min(self.config.max);
                    entry.last_failure = now;
                }
                *entry
            }
        }
    }

    /// Forgets the server's failures. Returns whether it was being avoided.
    pub fn clear(&mut self, server: ServerId) -> bool {
        self.entries.remove(&server).is_some()
    }

    pub fn is_eligible_at(&self, server: ServerId, now: Instant) -> bool {
        self.entries
            .get(&server)
            .map_or(true, |entry| !entry.is_active_at(now))
    }

    /// `servers` minus those inside an open window, order preserved.
    pub fn eligible_at<I>(&self, servers: I, now: Instant) -> Vec<ServerId>
    where
        I: IntoIterator<Item = ServerId>,
    {
        servers
            .into_iter()
            .filter(|server| self.is_eligible_at(*server, now))
            .collect()
    }

    /// Remaining cooldown for `server`, `None` when it is eligible.
    pub fn avoided_for(&self, server: ServerId, now: Instant) -> Option<Duration> {
        self.entries.get(&server)?.remaining_at(now)
    }

    pub fn entry(&self, server: ServerId) -> Option<&AvoidEntry> {
        self.entries.get(&server)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
