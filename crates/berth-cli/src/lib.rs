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

//! # Berth CLI
//!
//! Operational helpers behind the `berth` binary:
//!
//! - **check**: validate a server list and print the resolved registry
//! - **probe**: build a real pool against the servers, let it fill, borrow
//!   one connection and report the pool's state
//!
//! Server lists come from repeated `--server` flags in the
//! `[tag@]host:port[*weight]` form, from a JSON file, or both.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use berth::{
    BackoffConfig, Pool, PoolConfig, PoolStatus, Registry, Server, ServerConfig, TcpConnector,
};
use serde::Serialize;

/// Collects servers from a JSON file (first) and `--server` flags (after).
pub fn load_servers(flags: &[String], config_file: Option<&Path>) -> Result<Vec<ServerConfig>> {
    let mut servers = Vec::new();

    if let Some(path) = config_file {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read server list {}", path.display()))?;
        let from_file = ServerConfig::list_from_json(&json)
            .with_context(|| format!("invalid server list in {}", path.display()))?;
        servers.extend(from_file);
    }

    for flag in flags {
        let server: ServerConfig = flag
            .parse()
            .with_context(|| format!("invalid --server value '{}'", flag))?;
        servers.push(server);
    }

    if servers.is_empty() {
        anyhow::bail!("no servers given; use --server or --config");
    }
    Ok(servers)
}

/// Validates `servers` the way a pool would and returns the resulting roster.
pub fn check(servers: Vec<ServerConfig>) -> Result<Vec<Server>> {
    let registry = Registry::new(servers)?;
    Ok(registry.servers().to_vec())
}

/// Knobs for [`probe`].
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub min: usize,
    pub max: usize,
    /// How long to let the pool fill before borrowing
    pub wait: Duration,
    pub acquire_timeout: Duration,
    pub connect_timeout: Duration,
    pub backoff: BackoffConfig,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            min: 1,
            max: 4,
            wait: Duration::from_millis(500),
            acquire_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(2),
            backoff: BackoffConfig::default(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ProbeReport {
    /// Tag of the server the borrowed connection went to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquired: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub status: PoolStatus,
}

/// Builds a TCP pool, waits for it to fill, borrows and returns one
/// connection, then closes the pool.
///
/// Failing to borrow is reported in [`ProbeReport::error`], not as `Err`:
/// unreachable servers are exactly what a probe is for.
pub async fn probe(servers: Vec<ServerConfig>, options: ProbeOptions) -> Result<ProbeReport> {
    let config = PoolConfig::default()
        .with_min(options.min)
        .with_max(options.max)
        .with_backoff(options.backoff)
        .with_acquire_timeout(options.acquire_timeout);
    let connector = TcpConnector::new().with_connect_timeout(options.connect_timeout);
    let pool = Pool::with_connector(servers, config, connector)?;

    let deadline = Instant::now() + options.wait;
    while Instant::now() < deadline && pool.status().available < options.min {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (acquired, error) = match pool.get().await {
        Ok(handle) => {
            let tag = handle.tag().to_string();
            tracing::info!(server = %tag, peer = ?handle.peer_addr(), "borrowed connection");
            handle.release();
            (Some(tag), None)
        }
        Err(e) => {
            tracing::warn!(error = %e, "could not borrow a connection");
            (None, Some(e.to_string()))
        }
    };

    let status = pool.status();
    pool.close();

    Ok(ProbeReport {
        acquired,
        error,
        status,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use tokio::net::TcpListener;

    fn flags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_load_servers_from_flags() {
        let servers = load_servers(&flags(&["a@10.0.0.1:80*2", "10.0.0.2:80"]), None).unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].resolved_tag(), "a");
        assert_eq!(servers[0].resolved_weight(), 2);
    }

    #[test]
    fn test_load_servers_file_then_flags() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"[{{"host": "10.0.0.9", "port": 6379, "tag": "cache"}}]"#).unwrap();

        let servers = load_servers(&flags(&["10.0.0.1:80"]), Some(file.path())).unwrap();
        let tags: Vec<String> = servers.iter().map(|s| s.resolved_tag()).collect();
        assert_eq!(tags, vec!["cache", "10.0.0.1:80"]);
    }

    #[test]
    fn test_load_servers_errors() {
        assert!(load_servers(&[], None).is_err());
        assert!(load_servers(&flags(&["nope"]), None).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(load_servers(&[], Some(file.path())).is_err());

        assert!(load_servers(&[], Some(Path::new("/nonexistent/servers.json"))).is_err());
    }

    #[test]
    fn test_check_reports_duplicates() {
        let servers = load_servers(&flags(&["10.0.0.1:80", "10.0.0.1:80*4"]), None).unwrap();
        let err = check(servers).unwrap_err();
        assert!(err.to_string().contains("Duplicate server tag"));
    }

    #[test]
    fn test_check_resolves_defaults() {
        let servers = load_servers(&flags(&["10.0.0.1:80", "b@10.0.0.2:81*3"]), None).unwrap();
        let roster = check(servers).unwrap();
        assert_eq!(roster[0].tag, "10.0.0.1:80");
        assert_eq!(roster[0].weight, 1);
        assert_eq!(roster[1].tag, "b");
        assert_eq!(roster[1].weight, 3);
    }

    #[tokio::test]
    async fn test_probe_borrows_from_live_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let servers = vec![ServerConfig::new("127.0.0.1", port).with_tag("live")];
        let report = probe(servers, ProbeOptions::default()).await.unwrap();

        assert_eq!(report.acquired.as_deref(), Some("live"));
        assert!(report.error.is_none());
        assert!(report.status.server("live").unwrap().connections >= 1);
    }

    #[tokio::test]
    async fn test_probe_reports_unreachable() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let options = ProbeOptions {
            wait: Duration::from_millis(50),
            acquire_timeout: Duration::from_millis(100),
            ..ProbeOptions::default()
        };
        let report = probe(vec![ServerConfig::new("127.0.0.1", port)], options)
            .await
            .unwrap();

        assert!(report.acquired.is_none());
        assert!(report.error.unwrap().contains("Timed out"));
        assert!(report.status.servers[0].avoided);
    }
}
