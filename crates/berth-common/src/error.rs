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

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BerthError {
    #[error("Duplicate server tag: {0}")]
    DuplicateTag(String),

    #[error("No servers configured")]
    NoServers,

    #[error("Invalid server '{tag}': {reason}")]
    InvalidServer { tag: String, reason: String },

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("No tokio runtime available: {0}")]
    NoRuntime(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connect timeout after {0}ms")]
    Timeout(u64),

    #[error("Timed out after {0}ms waiting for a pooled connection")]
    AcquireTimeout(u64),

    #[error("Pool is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BerthError {
    /// Returns `true` for failures that only say something about one server
    /// at one moment: they are fed into backoff rather than surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BerthError::Connection(_) | BerthError::Timeout(_) | BerthError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BerthError>;
