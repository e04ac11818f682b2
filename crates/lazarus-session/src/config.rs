// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Session configuration
//!
//! Everything here can come from a JSON file (see [`load_config`]) and is
//! then overridden by command-line flags in the host binary. Call
//! [`SessionConfig::normalize`] after all overrides are applied.

use crate::error::{SessionError, SessionResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Hard cap on worker threads in the multi-threaded loop
pub const MAX_WORKER_THREADS: usize = 96;

pub const DEFAULT_WORKER_THREADS: usize = 10;

pub const DEFAULT_INTERRUPT_QUEUE_CAPACITY: usize = 64;

/// Largest time granularity the kernel accepts (one second, in ns)
const MAX_TIME_GRAN: u32 = 1_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Let users other than the mount owner (and root) access the mount
    pub allow_other: bool,
    pub connection: ConnectionConfig,
    pub workers: WorkerConfig,
    /// Pending interrupts kept before the oldest is evicted
    pub interrupt_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            allow_other: false,
            connection: ConnectionConfig::default(),
            workers: WorkerConfig::default(),
            interrupt_queue_capacity: DEFAULT_INTERRUPT_QUEUE_CAPACITY,
        }
    }
}

/// Limits proposed to the kernel during INIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub max_write: u32,
    pub max_read: u32,
    pub max_readahead: u32,
    pub max_background: u32,
    pub congestion_threshold: u32,
    /// Timestamp granularity in nanoseconds
    pub time_gran: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_write: u32::MAX,
            max_read: 0,
            max_readahead: 4,
            max_background: 4,
            congestion_threshold: 3,
            time_gran: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub multithread: bool,
    /// Give every worker its own cloned device channel
    pub clone_fd: bool,
    pub threads: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            multithread: false,
            clone_fd: false,
            threads: DEFAULT_WORKER_THREADS,
        }
    }
}

impl SessionConfig {
    pub fn normalize(&mut self) {
        let conn = &mut self.connection;
        if conn.time_gran < 1 {
            warn!("time_gran must be at least 1, using 1");
            conn.time_gran = 1;
        }
        let mut gran: u32 = 1;
        while gran < conn.time_gran && gran < MAX_TIME_GRAN {
            gran *= 10;
        }
        if gran != conn.time_gran {
            warn!(
                requested = conn.time_gran,
                used = gran,
                "time_gran must be a power of 10"
            );
            conn.time_gran = gran;
        }

        if self.workers.threads > MAX_WORKER_THREADS {
            warn!(
                requested = self.workers.threads,
                maximum = MAX_WORKER_THREADS,
                "too many worker threads requested"
            );
            self.workers.threads = MAX_WORKER_THREADS;
        }
        if self.workers.threads == 0 {
            self.workers.threads = 1;
        }
        if self.interrupt_queue_capacity == 0 {
            self.interrupt_queue_capacity = 1;
        }
    }
}

/// Load configuration from a JSON file, or defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> SessionResult<SessionConfig> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)
                .map_err(|e| SessionError::Config(format!("{}: {}", path.display(), e)))
        }
        None => Ok(SessionConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_default_config() {
        let config = load_config(None).unwrap();
        assert!(!config.allow_other);
        assert_eq!(config.connection.max_write, u32::MAX);
        assert_eq!(config.connection.max_readahead, 4);
        assert_eq!(config.connection.max_background, 4);
        assert_eq!(config.connection.congestion_threshold, 3);
        assert_eq!(config.workers.threads, 10);
    }

    #[test]
    fn test_load_partial_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let config_json = r#"{
            "allow_other": true,
            "connection": { "max_write": 131072 },
            "workers": { "multithread": true, "threads": 4 }
        }"#;
        temp_file.write_all(config_json.as_bytes()).unwrap();

        let config = load_config(Some(temp_file.path())).unwrap();
        assert!(config.allow_other);
        assert_eq!(config.connection.max_write, 131072);
        assert_eq!(config.connection.time_gran, 1);
        assert!(config.workers.multithread);
        assert_eq!(config.workers.threads, 4);
        assert_eq!(config.interrupt_queue_capacity, DEFAULT_INTERRUPT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_invalid_json_is_a_config_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"{ not json").unwrap();
        let err = load_config(Some(temp_file.path())).unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[test]
    fn test_normalize_rounds_time_gran_and_caps_threads() {
        let mut config = SessionConfig::default();
        config.connection.time_gran = 250;
        config.workers.threads = 500;
        config.normalize();
        assert_eq!(config.connection.time_gran, 1000);
        assert_eq!(config.workers.threads, MAX_WORKER_THREADS);

        config.connection.time_gran = 0;
        config.normalize();
        assert_eq!(config.connection.time_gran, 1);
    }
}
