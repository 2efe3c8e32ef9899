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

//! Berth: a weighted client-side TCP connection pool.
//!
//! A [`Pool`] keeps connections open toward a fixed list of weighted
//! servers, lends them out through [`Handle`]s, queues callers when none are
//! idle, and steers away from servers that fail to accept dials.

pub mod backoff;
pub mod config;
pub mod demand_queue;
pub mod handle;
pub mod pool;
pub mod registry;
pub mod selector;
pub mod socket_table;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use backoff::{AvoidEntry, BackoffTracker};
pub use config::{BackoffConfig, PoolConfig, ServerConfig};
pub use handle::Handle;
pub use pool::Pool;
pub use registry::{Registry, Server, ServerId};
pub use socket_table::ConnId;
pub use status::{Phase, PoolStatus, ServerStatus};

pub use berth_common::{BerthError, Connection, Connector, Result, TcpConnection, TcpConnector};
