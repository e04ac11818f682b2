// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Session snapshot store living in shared memory

use crate::error::RecoveryResult;
use crate::shared::SharedMapping;
use lazarus_session::SnapshotStore;
use std::sync::atomic::{fence, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use tracing::warn;

/// Room for one encoded snapshot
pub const SNAPSHOT_CAPACITY: usize = 256;

const READ_ATTEMPTS: usize = 64;

/// A sequence-locked byte buffer.
///
/// The writer makes `seq` odd, copies, then makes it even again. A reader
/// retries while `seq` is odd or changed under it. A writer killed midway
/// leaves `seq` odd; readers then give up and report nothing.
struct SnapshotCell {
    seq: AtomicU64,
    len: AtomicUsize,
    data: [AtomicU8; SNAPSHOT_CAPACITY],
}

impl Default for SnapshotCell {
    fn default() -> Self {
        Self {
            seq: AtomicU64::new(0),
            len: AtomicUsize::new(0),
            data: std::array::from_fn(|_| AtomicU8::new(0)),
        }
    }
}

/// [`SnapshotStore`] shared between the supervisor and every worker it forks.
///
/// Must be created before the first fork.
pub struct SharedSnapshot {
    cell: SharedMapping<SnapshotCell>,
}

impl SharedSnapshot {
    pub fn new() -> RecoveryResult<Self> {
        Ok(Self {
            cell: SharedMapping::new(1)?,
        })
    }

    fn cell(&self) -> &SnapshotCell {
        &self.cell[0]
    }
}

impl SnapshotStore for SharedSnapshot {
    fn save(&self, bytes: &[u8]) {
        if bytes.len() > SNAPSHOT_CAPACITY {
            warn!(len = bytes.len(), capacity = SNAPSHOT_CAPACITY, "snapshot too large, not saved");
            return;
        }
        let cell = self.cell();
        let seq = cell.seq.load(Ordering::Relaxed);
        let writing = (seq | 1).wrapping_add(if seq & 1 == 1 { 2 } else { 0 });
        cell.seq.store(writing, Ordering::Relaxed);
        fence(Ordering::Release);
        for (slot, byte) in cell.data.iter().zip(bytes) {
            slot.store(*byte, Ordering::Relaxed);
        }
        cell.len.store(bytes.len(), Ordering::Relaxed);
        cell.seq.store(writing.wrapping_add(1), Ordering::Release);
    }

    fn load(&self) -> Option<Vec<u8>> {
        let cell = self.cell();
        for _ in 0..READ_ATTEMPTS {
            let before = cell.seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                std::hint::spin_loop();
                continue;
            }
            if before == 0 {
                return None;
            }
            let len = cell.len.load(Ordering::Relaxed).min(SNAPSHOT_CAPACITY);
            let bytes: Vec<u8> = cell.data[..len]
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect();
            fence(Ordering::Acquire);
            if cell.seq.load(Ordering::Relaxed) == before {
                return Some(bytes);
            }
        }
        warn!("snapshot is being written or was torn by a dead writer");
        None
    }
}

impl std::fmt::Debug for SharedSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSnapshot")
            .field("seq", &self.cell().seq.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    #[test]
    fn test_empty_store_loads_nothing() {
        let store = SharedSnapshot::new().unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn test_latest_save_wins() {
        let store = SharedSnapshot::new().unwrap();
        store.save(b"first snapshot");
        store.save(b"second");
        assert_eq!(store.load().unwrap(), b"second");
    }

    #[test]
    fn test_oversized_snapshot_is_ignored() {
        let store = SharedSnapshot::new().unwrap();
        store.save(b"kept");
        store.save(&[7u8; SNAPSHOT_CAPACITY + 1]);
        assert_eq!(store.load().unwrap(), b"kept");
    }

    #[test]
    fn test_torn_write_reads_as_missing() {
        let store = SharedSnapshot::new().unwrap();
        store.save(b"good");
        store.cell().seq.fetch_add(1, Ordering::SeqCst);
        assert!(store.load().is_none());
        // The next complete write recovers
        store.save(b"fresh");
        assert_eq!(store.load().unwrap(), b"fresh");
    }

    #[test]
    fn test_child_save_is_visible_to_parent() {
        let store = SharedSnapshot::new().unwrap();
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                store.save(b"from the worker");
                unsafe { libc::_exit(0) };
            }
            ForkResult::Parent { child } => {
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
                assert_eq!(store.load().unwrap(), b"from the worker");
            }
        }
    }
}
