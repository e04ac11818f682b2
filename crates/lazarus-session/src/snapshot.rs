// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Negotiated-state snapshot
//!
//! After INIT and DESTROY the session writes its negotiated state through a
//! [`SnapshotStore`]. A supervisor that restarts a crashed worker reads it
//! back so the new worker keeps serving without renegotiating.

use crate::conn::ConnectionInfo;
use crate::error::{SessionError, SessionResult};
use ssz::{Decode, Encode};
use ssz_derive::{Decode, Encode};
use std::sync::Mutex;

pub const SNAPSHOT_FORMAT_VERSION: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SessionSnapshot {
    pub format_version: u16,
    pub proto_major: u32,
    pub proto_minor: u32,
    pub capable: u32,
    pub want: u32,
    pub max_write: u32,
    pub max_read: u32,
    pub max_readahead: u32,
    pub max_background: u32,
    pub congestion_threshold: u32,
    pub time_gran: u32,
    pub bufsize: u64,
    pub inited: bool,
    pub destroyed: bool,
}

impl SessionSnapshot {
    pub fn capture(conn: &ConnectionInfo, bufsize: usize, inited: bool, destroyed: bool) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            proto_major: conn.proto_major,
            proto_minor: conn.proto_minor,
            capable: conn.capable,
            want: conn.want,
            max_write: conn.max_write,
            max_read: conn.max_read,
            max_readahead: conn.max_readahead,
            max_background: conn.max_background,
            congestion_threshold: conn.congestion_threshold,
            time_gran: conn.time_gran,
            bufsize: bufsize as u64,
            inited,
            destroyed,
        }
    }

    pub fn connection(&self) -> ConnectionInfo {
        ConnectionInfo {
            proto_major: self.proto_major,
            proto_minor: self.proto_minor,
            capable: self.capable,
            want: self.want,
            max_write: self.max_write,
            max_read: self.max_read,
            max_readahead: self.max_readahead,
            max_background: self.max_background,
            congestion_threshold: self.congestion_threshold,
            time_gran: self.time_gran,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.as_ssz_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> SessionResult<Self> {
        let snapshot = Self::from_ssz_bytes(bytes)
            .map_err(|e| SessionError::Snapshot(format!("failed to decode snapshot: {:?}", e)))?;
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(SessionError::Snapshot(format!(
                "unsupported snapshot format version {}",
                snapshot.format_version
            )));
        }
        Ok(snapshot)
    }
}

/// Destination for encoded snapshots.
///
/// Implementations backed by shared memory let a supervising process read
/// what a worker process wrote.
pub trait SnapshotStore: Send + Sync {
    fn save(&self, bytes: &[u8]);
    fn load(&self) -> Option<Vec<u8>>;
}

/// Process-local store, used when no supervisor is involved.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    bytes: Mutex<Option<Vec<u8>>>,
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, bytes: &[u8]) {
        if let Ok(mut slot) = self.bytes.lock() {
            *slot = Some(bytes.to_vec());
        }
    }

    fn load(&self) -> Option<Vec<u8>> {
        self.bytes.lock().ok().and_then(|slot| slot.clone())
    }
}
