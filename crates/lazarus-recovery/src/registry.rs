// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fixed-capacity slot tables in shared memory
//!
//! Each slot records whether it is in use, the descriptor the worker uses
//! (`primary`, a number in the worker's descriptor table) and the duplicate
//! the supervisor holds (`backup`, a number in the supervisor's table, which
//! every newly forked worker inherits). Slot indices are the keys used by
//! the mirroring protocol.

use crate::error::{RecoveryError, RecoveryResult};
use crate::mirror::MirrorMessage;
use crate::shared::SharedMapping;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use tracing::{debug, info, warn};

const NO_FD: RawFd = -1;

#[repr(C)]
#[derive(Debug)]
pub struct Slot<M> {
    used: AtomicBool,
    primary: AtomicI32,
    backup: AtomicI32,
    meta: M,
}

impl<M: Default> Default for Slot<M> {
    fn default() -> Self {
        Self {
            used: AtomicBool::new(false),
            primary: AtomicI32::new(NO_FD),
            backup: AtomicI32::new(NO_FD),
            meta: M::default(),
        }
    }
}

fn fd_of(raw: RawFd) -> Option<RawFd> {
    (raw >= 0).then_some(raw)
}

impl<M> Slot<M> {
    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }

    pub fn primary(&self) -> Option<RawFd> {
        fd_of(self.primary.load(Ordering::Acquire))
    }

    pub fn backup(&self) -> Option<RawFd> {
        fd_of(self.backup.load(Ordering::Acquire))
    }

    /// Per-slot metadata kept alongside the descriptors
    pub fn meta(&self) -> &M {
        &self.meta
    }
}

/// What a recovery splice did to one table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpliceReport {
    /// Slots whose primary now refers to the backup
    pub restored: usize,
    /// Used slots without a backup; freed
    pub orphaned: usize,
}

pub struct SlotRegistry<M> {
    name: &'static str,
    slots: SharedMapping<Slot<M>>,
    reserved: usize,
    cursor: AtomicUsize,
}

impl<M: Default + Sync> SlotRegistry<M> {
    /// Map a table of `capacity` slots. The first `reserved` slots are never
    /// handed out.
    pub fn new(name: &'static str, capacity: usize, reserved: usize) -> RecoveryResult<Self> {
        let slots = SharedMapping::new(capacity)?;
        debug!(table = name, capacity, reserved, "slot table mapped");
        Ok(Self {
            name,
            slots,
            reserved: reserved.min(capacity),
            cursor: AtomicUsize::new(reserved.min(capacity)),
        })
    }
}

impl<M> SlotRegistry<M> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn used_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_used()).count()
    }

    fn slot_at(&self, key: u32) -> RecoveryResult<&Slot<M>> {
        self.slots
            .get(key as usize)
            .ok_or(RecoveryError::SlotOutOfRange {
                table: self.name,
                key,
            })
    }

    pub fn slot(&self, key: u32) -> Option<&Slot<M>> {
        self.slots.get(key as usize)
    }

    /// Claim a free slot, scanning circularly from the last allocation.
    ///
    /// Returns `None` when the table is full.
    pub fn allocate(&self) -> Option<u32> {
        let usable = self.capacity() - self.reserved;
        if usable == 0 {
            return None;
        }
        let start = self.cursor.load(Ordering::Relaxed);
        for step in 0..usable {
            let index = self.reserved + (start.saturating_sub(self.reserved) + step) % usable;
            let slot = &self.slots[index];
            if slot
                .used
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.primary.store(NO_FD, Ordering::Release);
                self.cursor.store(index + 1, Ordering::Relaxed);
                return Some(index as u32);
            }
        }
        warn!(table = self.name, capacity = self.capacity(), "slot table is full");
        None
    }

    /// Record the worker's descriptor for `key`; the slot takes ownership.
    pub fn set_primary(&self, key: u32, fd: OwnedFd) -> RecoveryResult<()> {
        let slot = self.slot_at(key)?;
        let old = slot.primary.swap(fd.into_raw_fd(), Ordering::AcqRel);
        if let Some(old) = fd_of(old) {
            // SAFETY: the slot owned this descriptor
            drop(unsafe { OwnedFd::from_raw_fd(old) });
        }
        Ok(())
    }

    /// Take the worker's descriptor back out of `key`.
    pub fn take_primary(&self, key: u32) -> Option<OwnedFd> {
        let slot = self.slots.get(key as usize)?;
        let raw = fd_of(slot.primary.swap(NO_FD, Ordering::AcqRel))?;
        // SAFETY: ownership was transferred in by set_primary or splice
        Some(unsafe { OwnedFd::from_raw_fd(raw) })
    }

    /// Free `key` for reuse. Any primary still stored is closed.
    pub fn release(&self, key: u32) -> RecoveryResult<()> {
        drop(self.take_primary(key));
        self.slot_at(key)?.used.store(false, Ordering::Release);
        Ok(())
    }

    /// Keep `fd` as the backup for `key`, closing any previous backup.
    pub fn store_backup(&self, key: u32, fd: OwnedFd) -> RecoveryResult<()> {
        let slot = self.slot_at(key)?;
        let old = slot.backup.swap(fd.into_raw_fd(), Ordering::AcqRel);
        if let Some(old) = fd_of(old) {
            warn!(table = self.name, key, "replacing a backup that was never released");
            // SAFETY: the slot owned this backup
            drop(unsafe { OwnedFd::from_raw_fd(old) });
        }
        Ok(())
    }

    /// Close the backup for `key`. Returns whether there was one.
    pub fn close_backup(&self, key: u32) -> RecoveryResult<bool> {
        let slot = self.slot_at(key)?;
        match fd_of(slot.backup.swap(NO_FD, Ordering::AcqRel)) {
            Some(raw) => {
                // SAFETY: the slot owned this backup
                drop(unsafe { OwnedFd::from_raw_fd(raw) });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Apply one mirror message addressed to this table.
    pub fn apply(&self, message: MirrorMessage, fd: Option<OwnedFd>) -> RecoveryResult<()> {
        if message.kind.is_creation() {
            let fd = fd.ok_or(RecoveryError::MissingDescriptor {
                kind: message.kind.as_str(),
                key: message.key,
            })?;
            self.store_backup(message.key, fd)
        } else {
            if !self.close_backup(message.key)? {
                debug!(table = self.name, key = message.key, "release of a slot without backup");
            }
            Ok(())
        }
    }

    /// Point every used slot's primary at its backup.
    ///
    /// Runs in the supervisor while no worker exists; the next worker
    /// inherits the backups under the same numbers. Used slots that never
    /// received a backup cannot be resumed and are freed.
    pub fn splice(&self) -> SpliceReport {
        let mut report = SpliceReport::default();
        for (index, slot) in self.slots.iter().enumerate() {
            if !slot.is_used() {
                continue;
            }
            match slot.backup() {
                Some(backup) => {
                    slot.primary.store(backup, Ordering::Release);
                    report.restored += 1;
                }
                None => {
                    warn!(table = self.name, key = index, "used slot has no backup, freeing it");
                    slot.primary.store(NO_FD, Ordering::Release);
                    slot.used.store(false, Ordering::Release);
                    report.orphaned += 1;
                }
            }
        }
        info!(
            table = self.name,
            restored = report.restored,
            orphaned = report.orphaned,
            "slot table spliced"
        );
        report
    }

    /// Close every backup. Used on teardown.
    pub fn close_all_backups(&self) -> usize {
        let mut closed = 0;
        for key in 0..self.capacity() as u32 {
            if matches!(self.close_backup(key), Ok(true)) {
                closed += 1;
            }
        }
        closed
    }

    /// Iterate over used slots with their keys.
    pub fn used(&self) -> impl Iterator<Item = (u32, &Slot<M>)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_used())
            .map(|(index, slot)| (index as u32, slot))
    }
}

impl<M> std::fmt::Debug for SlotRegistry<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotRegistry")
            .field("name", &self.name)
            .field("capacity", &self.capacity())
            .field("reserved", &self.reserved)
            .finish()
    }
}
