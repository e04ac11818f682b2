// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Descriptor tables of the passthrough filesystem
//!
//! Resolved paths, open files and open directories each live in a
//! [`SlotRegistry`] mapped before the supervisor forks. Node ids and file
//! handles handed to the kernel are derived from slot keys, so they stay
//! valid when a restarted worker takes over the same tables.

use lazarus_proto::ROOT_ID;
use lazarus_recovery::{
    mirror_channel, MirrorMessage, MirrorReceiver, MirrorSender, RecoveryError,
    RecoveryHandlers, RecoveryResult, ResourceKind, ShutdownSignal, SlotRegistry, SpliceReport,
};
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const INODE_CAPACITY: usize = 510;
pub const FILE_CAPACITY: usize = 255;
/// File keys 0-2 are never handed out so no handle looks like stdio
pub const RESERVED_FILE_SLOTS: usize = 3;
pub const DIR_CAPACITY: usize = 255;

/// How long the notify routine blocks before re-checking for shutdown
const NOTIFY_POLL: Duration = Duration::from_millis(100);

/// Directory handles carry this bit so they can't be confused with files
const DIR_HANDLE_BIT: u64 = 1 << 63;

/// Identity of a resolved path, shared with the supervisor.
#[derive(Debug, Default)]
pub struct InodeMeta {
    ino: AtomicU64,
    dev: AtomicU64,
    refcount: AtomicU64,
}

impl InodeMeta {
    pub fn ino(&self) -> u64 {
        self.ino.load(Ordering::Acquire)
    }

    pub fn dev(&self) -> u64 {
        self.dev.load(Ordering::Acquire)
    }

    pub fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::Acquire)
    }

    fn matches(&self, ino: u64, dev: u64) -> bool {
        self.refcount() > 0 && self.ino() == ino && self.dev() == dev
    }

    fn set(&self, ino: u64, dev: u64, refcount: u64) {
        self.ino.store(ino, Ordering::Release);
        self.dev.store(dev, Ordering::Release);
        self.refcount.store(refcount, Ordering::Release);
    }
}

/// A file handle as exchanged with the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenHandle {
    File(u32),
    Dir(u32),
}

impl OpenHandle {
    pub fn to_fh(self) -> u64 {
        match self {
            OpenHandle::File(key) => key as u64,
            OpenHandle::Dir(key) => DIR_HANDLE_BIT | key as u64,
        }
    }

    pub fn from_fh(fh: u64) -> Option<Self> {
        let key = u32::try_from(fh & !DIR_HANDLE_BIT).ok()?;
        Some(if fh & DIR_HANDLE_BIT != 0 {
            OpenHandle::Dir(key)
        } else {
            OpenHandle::File(key)
        })
    }
}

/// Node id for the inode stored at `key`
pub fn node_id(key: u32) -> u64 {
    key as u64 + ROOT_ID + 1
}

/// Inverse of [`node_id`]; `None` for the root and invalid ids.
pub fn inode_key(nodeid: u64) -> Option<u32> {
    nodeid
        .checked_sub(ROOT_ID + 1)
        .and_then(|key| u32::try_from(key).ok())
}

pub struct Tables {
    pub inodes: SlotRegistry<InodeMeta>,
    pub files: SlotRegistry<()>,
    pub dirs: SlotRegistry<()>,
    mirror: Option<MirrorSender>,
}

impl Tables {
    /// Map all three tables. With a `mirror`, every descriptor stored or
    /// released is announced to the supervisor.
    pub fn new(mirror: Option<MirrorSender>) -> RecoveryResult<Self> {
        Ok(Self {
            inodes: SlotRegistry::new("inodes", INODE_CAPACITY, 0)?,
            files: SlotRegistry::new("files", FILE_CAPACITY, RESERVED_FILE_SLOTS)?,
            dirs: SlotRegistry::new("dirs", DIR_CAPACITY, 0)?,
            mirror,
        })
    }

    pub fn is_mirrored(&self) -> bool {
        self.mirror.is_some()
    }

    /// Store `fd` as the primary of a slot claimed with `allocate`, then
    /// mirror it. Returns the raw descriptor now owned by the slot.
    pub fn install<M>(
        &self,
        registry: &SlotRegistry<M>,
        resource: ResourceKind,
        key: u32,
        fd: OwnedFd,
    ) -> RecoveryResult<RawFd> {
        let raw = fd.as_raw_fd();
        registry.set_primary(key, fd)?;
        if let Some(mirror) = &self.mirror {
            // SAFETY: the slot owns `raw` and nothing releases it before the
            // kernel learns about the new key
            let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
            if let Err(e) = mirror.created(resource, key, borrowed) {
                warn!(table = registry.name(), key, error = %e, "failed to mirror descriptor");
            }
        }
        Ok(raw)
    }

    /// Close the primary at `key`, announce the release and free the slot.
    pub fn uninstall<M>(
        &self,
        registry: &SlotRegistry<M>,
        resource: ResourceKind,
        key: u32,
    ) -> RecoveryResult<()> {
        let fd = registry.take_primary(key);
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.destroyed(resource, key) {
                warn!(table = registry.name(), key, error = %e, "failed to mirror release");
            }
        }
        drop(fd);
        registry.release(key)
    }

    /// Supervisor side: apply one mirror message to the right table.
    pub fn apply(&self, message: MirrorMessage, fd: Option<OwnedFd>) -> RecoveryResult<()> {
        match message.kind.resource() {
            ResourceKind::Path => self.inodes.apply(message, fd),
            ResourceKind::File => self.files.apply(message, fd),
            ResourceKind::Dir => self.dirs.apply(message, fd),
        }
    }

    pub fn splice(&self) -> [SpliceReport; 3] {
        [self.inodes.splice(), self.files.splice(), self.dirs.splice()]
    }

    pub fn close_all_backups(&self) -> usize {
        self.inodes.close_all_backups() + self.files.close_all_backups() + self.dirs.close_all_backups()
    }

    /// Find a live inode slot for `(ino, dev)` and take a reference on it.
    pub fn find_inode(&self, ino: u64, dev: u64) -> Option<u32> {
        self.inodes.used().find_map(|(key, slot)| {
            let meta = slot.meta();
            if meta.matches(ino, dev) {
                meta.refcount.fetch_add(1, Ordering::AcqRel);
                Some(key)
            } else {
                None
            }
        })
    }

    /// Claim an inode slot for a freshly resolved path with one reference.
    pub fn insert_inode(&self, fd: OwnedFd, ino: u64, dev: u64) -> RecoveryResult<Option<u32>> {
        let Some(key) = self.inodes.allocate() else {
            return Ok(None);
        };
        if let Some(slot) = self.inodes.slot(key) {
            slot.meta().set(ino, dev, 1);
        }
        self.install(&self.inodes, ResourceKind::Path, key, fd)?;
        Ok(Some(key))
    }

    /// Drop `nlookup` references; the slot is released when none remain.
    ///
    /// Returns the remaining count.
    pub fn forget_inode(&self, key: u32, nlookup: u64) -> RecoveryResult<u64> {
        let slot = self
            .inodes
            .slot(key)
            .filter(|slot| slot.is_used())
            .ok_or(RecoveryError::SlotOutOfRange {
                table: "inodes",
                key,
            })?;
        let meta = slot.meta();
        let current = meta.refcount();
        let remaining = current.saturating_sub(nlookup);
        if nlookup > current {
            warn!(key, refcount = current, nlookup, "forget exceeds lookup count");
        }
        meta.refcount.store(remaining, Ordering::Release);
        if remaining == 0 {
            meta.set(0, 0, 0);
            self.uninstall(&self.inodes, ResourceKind::Path, key)?;
        }
        Ok(remaining)
    }

    /// Release every primary in this process. Only meaningful without a
    /// supervisor, which owns the backups otherwise.
    pub fn release_all(&self) -> usize {
        let mut released = 0;
        for (resource, keys) in [
            (ResourceKind::Path, self.inodes.used().map(|(k, _)| k).collect::<Vec<_>>()),
            (ResourceKind::File, self.files.used().map(|(k, _)| k).collect()),
            (ResourceKind::Dir, self.dirs.used().map(|(k, _)| k).collect()),
        ] {
            for key in keys {
                let result = match resource {
                    ResourceKind::Path => self.uninstall(&self.inodes, resource, key),
                    ResourceKind::File => self.uninstall(&self.files, resource, key),
                    ResourceKind::Dir => self.uninstall(&self.dirs, resource, key),
                };
                if result.is_ok() {
                    released += 1;
                }
            }
        }
        released
    }
}

impl std::fmt::Debug for Tables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tables")
            .field("inodes", &self.inodes.used_count())
            .field("files", &self.files.used_count())
            .field("dirs", &self.dirs.used_count())
            .field("mirrored", &self.is_mirrored())
            .finish()
    }
}

/// Crash-recovery handlers for the passthrough tables.
///
/// `init` maps the tables and opens the mirror channel in the supervisor;
/// the worker reaches the tables through [`PassthroughRecovery::tables`].
#[derive(Default)]
pub struct PassthroughRecovery {
    tables: OnceLock<Arc<Tables>>,
    receiver: OnceLock<MirrorReceiver>,
    drain_lock: Mutex<()>,
}

impl PassthroughRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tables(&self) -> RecoveryResult<Arc<Tables>> {
        self.tables.get().cloned().ok_or(RecoveryError::NotInitialised)
    }

    /// Apply every queued mirror message. Serialised so a release can
    /// never be applied ahead of the creation it follows.
    fn drain(&self) -> RecoveryResult<usize> {
        let (Some(tables), Some(receiver)) = (self.tables.get(), self.receiver.get()) else {
            return Err(RecoveryError::NotInitialised);
        };
        let _guard = self.drain_lock.lock().unwrap_or_else(|p| p.into_inner());
        receiver.drain(|message, fd| {
            if let Err(e) = tables.apply(message, fd) {
                warn!(message = %message, error = %e, "failed to apply mirror message");
            }
        })
    }
}

impl RecoveryHandlers for PassthroughRecovery {
    fn init(&self) -> RecoveryResult<()> {
        let (sender, receiver) = mirror_channel()?;
        let tables = Tables::new(Some(sender))?;
        self.tables
            .set(Arc::new(tables))
            .map_err(|_| RecoveryError::Init("tables already initialised".to_string()))?;
        self.receiver
            .set(receiver)
            .map_err(|_| RecoveryError::Init("mirror receiver already initialised".to_string()))?;
        info!(
            inodes = INODE_CAPACITY,
            files = FILE_CAPACITY,
            dirs = DIR_CAPACITY,
            "passthrough tables mapped"
        );
        Ok(())
    }

    fn destroy(&self) {
        if let Some(tables) = self.tables.get() {
            let closed = tables.close_all_backups();
            debug!(closed, "backup descriptors closed");
        }
    }

    fn notify_routine(&self, shutdown: &ShutdownSignal) {
        let Some(receiver) = self.receiver.get() else {
            return;
        };
        while !shutdown.is_triggered() {
            match receiver.wait(NOTIFY_POLL) {
                Ok(false) => continue,
                Ok(true) => {
                    if let Err(e) = self.drain() {
                        warn!(error = %e, "mirror drain failed");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "mirror channel failed, notify routine stopping");
                    return;
                }
            }
        }
    }

    fn recover(&self) -> RecoveryResult<()> {
        let drained = self.drain()?;
        let tables = self.tables()?;
        let [inodes, files, dirs] = tables.splice();
        info!(
            drained,
            inodes = inodes.restored,
            files = files.restored,
            dirs = dirs.restored,
            orphaned = inodes.orphaned + files.orphaned + dirs.orphaned,
            "descriptor tables recovered"
        );
        Ok(())
    }
}

impl std::fmt::Debug for PassthroughRecovery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassthroughRecovery")
            .field("tables", &self.tables.get())
            .finish_non_exhaustive()
    }
}
