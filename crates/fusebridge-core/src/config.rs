// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-connection configuration

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Upper bound for the daemon reply timeout.
pub const MAX_DAEMON_TIMEOUT_SECS: u64 = 600;

pub const ENV_DAEMON_TIMEOUT: &str = "FUSEBRIDGE_DAEMON_TIMEOUT";
pub const ENV_MAX_TICKETS: &str = "FUSEBRIDGE_MAX_TICKETS";

/// Buffer sizing policy shared by every ticket of a connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IovConfig {
    /// Oversized-shrink attempts tolerated before a buffer is reallocated smaller.
    pub credit: i32,
    /// Slack a buffer may keep above the requested size without spending credit.
    pub permanent_bufsize: usize,
    /// Smallest allocation handed out.
    pub min_alloc: usize,
}

impl Default for IovConfig {
    fn default() -> Self {
        Self {
            credit: 16,
            permanent_bufsize: 1 << 19,
            min_alloc: 160,
        }
    }
}

/// Ticket retention limits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// High-water mark of the free list; released tickets beyond it are destroyed.
    pub max_free_tickets: usize,
    /// Maximum live tickets before the connection is declared dead (0 = unlimited).
    pub max_tickets: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_free_tickets: 1024,
            max_tickets: 0,
        }
    }
}

/// Parameters offered to the daemon during the INIT exchange.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    pub max_readahead: u32,
    /// Oldest protocol minor accepted from the daemon.
    pub required_minor: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            max_readahead: 16 * 65536,
            required_minor: fusebridge_proto::KERNEL_MINOR_VERSION,
        }
    }
}

/// Connection configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Seconds to wait for a daemon reply; zero waits forever.
    pub daemon_timeout_secs: u64,
    /// Largest single transfer accepted by the device write side.
    pub userkernel_bufsize: usize,
    pub pool: PoolConfig,
    pub iov: IovConfig,
    pub handshake: HandshakeConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            daemon_timeout_secs: 60,
            userkernel_bufsize: 16 * 1024 * 1024,
            pool: PoolConfig::default(),
            iov: IovConfig::default(),
            handshake: HandshakeConfig::default(),
        }
    }
}

impl BridgeConfig {
    pub fn from_json_bytes(bytes: &[u8]) -> BridgeResult<Self> {
        let config: BridgeConfig = serde_json::from_slice(bytes)
            .map_err(|e| BridgeError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> BridgeResult<Self> {
        match path {
            Some(path) => {
                let content = fs::read(path)?;
                Self::from_json_bytes(&content)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.daemon_timeout_secs > MAX_DAEMON_TIMEOUT_SECS {
            return Err(BridgeError::InvalidConfig(format!(
                "daemon_timeout_secs {} exceeds {}",
                self.daemon_timeout_secs, MAX_DAEMON_TIMEOUT_SECS
            )));
        }
        if self.iov.min_alloc == 0 {
            return Err(BridgeError::InvalidConfig("iov.min_alloc must be non-zero".into()));
        }
        if self.userkernel_bufsize < fusebridge_proto::REQUEST_HEADER_LEN {
            return Err(BridgeError::InvalidConfig(format!(
                "userkernel_bufsize {} cannot hold a request header",
                self.userkernel_bufsize
            )));
        }
        Ok(())
    }

    /// Apply `FUSEBRIDGE_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> BridgeResult<()> {
        self.apply_overrides_from(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> BridgeResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_DAEMON_TIMEOUT) {
            self.daemon_timeout_secs = parse_override(ENV_DAEMON_TIMEOUT, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_TICKETS) {
            self.pool.max_tickets = parse_override(ENV_MAX_TICKETS, &value)?;
        }
        self.validate()
    }

    /// Largest request a single device read may carry. The wire length field
    /// is 32 bits wide.
    pub fn transfer_limit(&self) -> usize {
        self.userkernel_bufsize.min(u32::MAX as usize)
    }

    /// Reply timeout, `None` meaning wait forever.
    pub fn daemon_timeout(&self) -> Option<Duration> {
        match self.daemon_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> BridgeResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| BridgeError::InvalidConfig(format!("{key}={value:?} is not a number")))
}
