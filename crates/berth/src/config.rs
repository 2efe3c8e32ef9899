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

use std::str::FromStr;
use std::time::Duration;

use berth_common::{BerthError, Result};
use serde::{Deserialize, Serialize};

/// One backend the pool may dial.
///
/// `weight` defaults to 1 and `tag` defaults to `host:port`. Two entries that
/// resolve to the same tag are rejected when the pool is built.
///
/// # Textual form
///
/// `[tag@]host:port[*weight]`, e.g. `primary@10.0.0.5:6379*3`. IPv6 hosts are
/// written in brackets: `[::1]:6379`.
///
/// # Example
///
/// ```rust
/// use berth::ServerConfig;
///
/// let server: ServerConfig = "cache@10.0.0.5:11211*2".parse().unwrap();
/// assert_eq!(server.resolved_tag(), "cache");
/// assert_eq!(server.resolved_weight(), 2);
///
/// let plain = ServerConfig::new("10.0.0.6", 11211);
/// assert_eq!(plain.resolved_tag(), "10.0.0.6:11211");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: None,
            tag: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// The explicit tag, or `host:port`.
    pub fn resolved_tag(&self) -> String {
        match &self.tag {
            Some(tag) => tag.clone(),
            None => format!("{}:{}", self.host, self.port),
        }
    }

    pub fn resolved_weight(&self) -> u32 {
        self.weight.unwrap_or(1)
    }

    /// Parses a JSON array of server objects.
    ///
    /// ```rust
    /// use berth::ServerConfig;
    ///
    /// let servers = ServerConfig::list_from_json(
    ///     r#"[{"host": "10.0.0.1", "port": 80, "weight": 3}, {"host": "10.0.0.2", "port": 80}]"#,
    /// ).unwrap();
    /// assert_eq!(servers.len(), 2);
    /// assert_eq!(servers[1].resolved_weight(), 1);
    /// ```
    pub fn list_from_json(json: &str) -> Result<Vec<ServerConfig>> {
        Ok(serde_json::from_str(json)?)
    }
}

impl FromStr for ServerConfig {
    type Err = BerthError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| BerthError::InvalidServer {
            tag: s.to_string(),
            reason: reason.to_string(),
        };

        let (tag, rest) = match s.split_once('@') {
            Some((tag, rest)) if !tag.is_empty() => (Some(tag.to_string()), rest),
            Some(_) => return Err(invalid("empty tag before '@'")),
            None => (None, s),
        };

        let (endpoint, weight) = match rest.rsplit_once('*') {
            Some((endpoint, weight)) => {
                let weight: u32 = weight
                    .parse()
                    .map_err(|_| invalid("weight must be a positive integer"))?;
                (endpoint, Some(weight))
            }
            None => (rest, None),
        };

        let (host, port) = endpoint
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected host:port"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;

        Ok(Self {
            host: host.to_string(),
            port,
            weight,
            tag,
        })
    }
}

/// Adaptive avoidance windows for failing servers.
///
/// The first failure opens a window of `initial`. A failure seen after a
/// window has lapsed doubles it, up to `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(2 * 60),
            max: Duration::from_secs(128 * 60),
        }
    }
}

/// Pool sizing and timing.
///
/// # Default Configuration
///
/// - `min`: 5 idle connections kept ready
/// - `max`: 10 connections in total
/// - `backoff`: 2 minutes, doubling up to 128 minutes
/// - `acquire_timeout`: 30 seconds (only used by [`Pool::get`](crate::Pool::get))
///
/// # Example
///
/// ```rust
/// use berth::PoolConfig;
///
/// let config = PoolConfig::default().with_min(2).with_max(4);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Desired floor of idle connections
    pub min: usize,
    /// Ceiling of total connections
    pub max: usize,
    pub backoff: BackoffConfig,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 5,
            max: 10,
            backoff: BackoffConfig::default(),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    pub fn with_min(mut self, min: usize) -> Self {
        self.min = min;
        self
    }

    pub fn with_max(mut self, max: usize) -> Self {
        self.max = max;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max == 0 {
            return Err(BerthError::InvalidConfig("max must be at least 1".to_string()));
        }
        if self.backoff.initial.is_zero() {
            return Err(BerthError::InvalidConfig(
                "initial backoff must be non-zero".to_string(),
            ));
        }
        if self.backoff.max < self.backoff.initial {
            return Err(BerthError::InvalidConfig(format!(
                "max backoff {:?} is shorter than initial backoff {:?}",
                self.backoff.max, self.backoff.initial
            )));
        }
        Ok(())
    }
}
