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

//! Berth Common Types and Transport
//!
//! Shared infrastructure for the berth connection pool:
//!
//! - [`error`] - the [`BerthError`] taxonomy and [`Result`] alias
//! - [`transport`] - the [`Connection`](transport::Connection) /
//!   [`Connector`](transport::Connector) boundary and its tokio TCP
//!   implementation
//!
//! The pool itself lives in the `berth` crate and is generic over
//! [`Connector`](transport::Connector), so anything that behaves like a
//! duplex byte stream can be pooled.

pub mod error;
pub mod transport;

pub use error::{BerthError, Result};
pub use transport::{Connection, Connector, TcpConnection, TcpConnector};
