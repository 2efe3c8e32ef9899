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

/// Pending acquisition requests, served most recent first.
///
/// Whoever queued last is handed the next connection that becomes available.
#[derive(Debug)]
pub struct DemandQueue<W> {
    waiters: Vec<W>,
}

impl<W> Default for DemandQueue<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> DemandQueue<W> {
    pub fn new() -> Self {
        Self {
            waiters: Vec::new(),
        }
    }

    pub fn push(&mut self, waiter: W) {
        self.waiters.push(waiter);
    }

    /// Removes the most recently queued waiter.
    pub fn pop(&mut self) -> Option<W> {
        self.waiters.pop()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Keeps only the waiters for which `keep` returns true, order preserved.
    pub fn retain<F>(&mut self, keep: F)
    where
        F: FnMut(&W) -> bool,
    {
        self.waiters.retain(keep);
    }

    /// Takes every waiter out, leaving the queue empty.
    pub fn drain_all(&mut self) -> Vec<W> {
        std::mem::take(&mut self.waiters)
    }
}
