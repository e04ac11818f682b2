// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-mount session state
//!
//! A [`Session`] owns the negotiated connection parameters, the request
//! lists and the lifecycle flags of one mount. It is shared (`Arc`) between
//! the receive loops and every in-flight [`Request`].
//!
//! State machine:
//!
//! ```text
//! Created -> Mounted -> Negotiating -> Active -> Destroying -> Destroyed
//! ```
//!
//! `exited` is orthogonal: any state may be asked to stop serving.

use crate::channel::Channel;
use crate::config::SessionConfig;
use crate::conn::{self, ConnectionInfo};
use crate::dispatch;
use crate::error::{SessionError, SessionResult};
use crate::filesystem::Filesystem;
use crate::queue::{Arrival, InterruptOutcome, PendingInterrupt, RequestQueues};
use crate::request::Request;
use crate::snapshot::{SessionSnapshot, SnapshotStore};
use lazarus_proto::{InHeader, InitIn, InitOut, Opcode, OutHeader, IN_HEADER_SIZE, OUT_HEADER_SIZE};
use std::io::{self, IoSlice};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    Created = 0,
    Mounted = 1,
    Negotiating = 2,
    Active = 3,
    Destroying = 4,
    Destroyed = 5,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Created,
            1 => SessionState::Mounted,
            2 => SessionState::Negotiating,
            3 => SessionState::Active,
            4 => SessionState::Destroying,
            _ => SessionState::Destroyed,
        }
    }
}

/// Outcome of one read on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// A request of this many bytes is in the buffer
    Request(usize),
    /// Nothing to read yet (non-blocking channels only)
    Idle,
    /// The connection is gone; stop serving
    Closed,
}

pub struct Session {
    fs: Arc<dyn Filesystem>,
    config: SessionConfig,
    owner: u32,
    mountpoint: Option<PathBuf>,
    channel: OnceLock<Arc<Channel>>,
    clone_channels: Mutex<Vec<Arc<Channel>>>,
    conn: RwLock<ConnectionInfo>,
    queues: Mutex<RequestQueues>,
    bufsize: AtomicUsize,
    state: AtomicU8,
    exited: AtomicBool,
    error: AtomicI32,
    snapshot: OnceLock<Arc<dyn SnapshotStore>>,
}

impl Session {
    pub fn new(fs: Arc<dyn Filesystem>, mut config: SessionConfig) -> Self {
        config.normalize();
        let conn = ConnectionInfo::from_config(&config.connection);
        let capacity = config.interrupt_queue_capacity;
        Self {
            fs,
            config,
            owner: nix::unistd::getuid().as_raw(),
            mountpoint: None,
            channel: OnceLock::new(),
            clone_channels: Mutex::new(Vec::new()),
            conn: RwLock::new(conn),
            queues: Mutex::new(RequestQueues::new(capacity)),
            bufsize: AtomicUsize::new(conn::default_bufsize()),
            state: AtomicU8::new(SessionState::Created as u8),
            exited: AtomicBool::new(false),
            error: AtomicI32::new(0),
            snapshot: OnceLock::new(),
        }
    }

    pub fn with_mountpoint(mut self, mountpoint: impl Into<PathBuf>) -> Self {
        self.mountpoint = Some(mountpoint.into());
        self
    }

    /// Override the owning uid (defaults to the current user).
    pub fn with_owner(mut self, uid: u32) -> Self {
        self.owner = uid;
        self
    }

    /// Bind the session to its kernel channel. Allowed once.
    pub fn attach(&self, channel: Channel) -> SessionResult<()> {
        self.channel
            .set(Arc::new(channel))
            .map_err(|_| SessionError::AlreadyAttached)?;
        self.set_state(SessionState::Mounted);
        info!(mountpoint = ?self.mountpoint, "session attached to channel");
        Ok(())
    }

    pub fn channel(&self) -> SessionResult<Arc<Channel>> {
        self.channel.get().cloned().ok_or(SessionError::NotAttached)
    }

    /// Register where negotiated state is saved. Allowed once per session.
    pub fn register_snapshot(&self, store: Arc<dyn SnapshotStore>) -> SessionResult<()> {
        self.snapshot
            .set(store)
            .map_err(|_| SessionError::SnapshotAlreadyRegistered)
    }

    pub fn filesystem(&self) -> &Arc<dyn Filesystem> {
        &self.fs
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn owner(&self) -> u32 {
        self.owner
    }

    pub fn mountpoint(&self) -> Option<&Path> {
        self.mountpoint.as_deref()
    }

    pub fn connection(&self) -> ConnectionInfo {
        match self.conn.read() {
            Ok(conn) => *conn,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn bufsize(&self) -> usize {
        self.bufsize.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_inited(&self) -> bool {
        self.state() >= SessionState::Active
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == SessionState::Destroyed
    }

    pub fn exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub(crate) fn exit_flag(&self) -> &AtomicBool {
        &self.exited
    }

    /// Ask every loop serving this session to stop.
    pub fn exit(&self) {
        self.exited.store(true, Ordering::Release);
    }

    /// Sticky error as a negative errno, 0 when none
    pub fn error(&self) -> i32 {
        self.error.load(Ordering::Acquire)
    }

    pub(crate) fn fail(&self, errno: i32) {
        self.error.store(-errno, Ordering::Release);
        self.exit();
    }

    /// Clear the exit flag and sticky error once a loop has returned.
    pub fn reset(&self) {
        self.exited.store(false, Ordering::Release);
        self.error.store(0, Ordering::Release);
    }

    pub fn outstanding_requests(&self) -> usize {
        self.lock_queues().outstanding()
    }

    pub fn pending_interrupts(&self) -> usize {
        self.lock_queues().pending_interrupts()
    }

    fn lock_queues(&self) -> MutexGuard<'_, RequestQueues> {
        match self.queues.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn set_clone_channels(&self, channels: Vec<Arc<Channel>>) {
        match self.clone_channels.lock() {
            Ok(mut guard) => *guard = channels,
            Err(poisoned) => *poisoned.into_inner() = channels,
        }
    }

    /// Read one request from `channel` into `buf`.
    pub fn receive(&self, channel: &Channel, buf: &mut [u8]) -> SessionResult<Received> {
        loop {
            let res = channel.receive(buf);
            if self.exited() {
                return Ok(Received::Closed);
            }
            match res {
                Ok(0) => return Ok(Received::Closed),
                Ok(n) if n < IN_HEADER_SIZE => {
                    error!(size = n, "short read on fuse device");
                    return Err(SessionError::ShortRead(n));
                }
                Ok(n) => return Ok(Received::Request(n)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Received::Idle),
                Err(e) if e.raw_os_error() == Some(libc::ENODEV) => {
                    // Unmounted, or the connection was aborted
                    self.exit();
                    return Ok(Received::Closed);
                }
                Err(e) => {
                    error!(error = %e, "reading fuse device");
                    return Err(SessionError::Io(e));
                }
            }
        }
    }

    /// Decode and dispatch one request read from `channel`.
    pub fn process(self: &Arc<Self>, channel: &Arc<Channel>, buf: &[u8]) {
        let header = match InHeader::parse(buf) {
            Ok(header) => header,
            Err(e) => {
                warn!(error = %e, "dropping undecodable request header");
                return;
            }
        };
        let opcode = Opcode::try_from(header.opcode).ok();
        debug!(
            target: "lazarus::request",
            unique = header.unique,
            opcode = opcode.map(Opcode::name).unwrap_or("???"),
            code = header.opcode,
            nodeid = header.nodeid,
            insize = buf.len(),
            pid = header.pid,
            "request"
        );

        let req = Request::new(Arc::clone(self), Arc::clone(channel), &header);
        let is_init = opcode == Some(Opcode::Init);

        if self.is_inited() == is_init {
            // Either nothing but INIT before negotiation, or a second INIT
            req.reply_error(libc::EIO);
            return;
        }
        if !self.config.allow_other && header.uid != self.owner && header.uid != 0 && !is_init {
            req.reply_error(libc::EACCES);
            return;
        }
        let Some((op, handler)) = opcode.and_then(|op| dispatch::handler_for(op).map(|h| (op, h)))
        else {
            req.reply_error(libc::ENOSYS);
            return;
        };

        if op != Opcode::Interrupt {
            let arrival = self
                .lock_queues()
                .arrive(header.unique, req.claim_flag(), channel);
            if arrival == Arrival::Cancelled {
                debug!(target: "lazarus::request", unique = header.unique, "request cancelled by earlier interrupt");
                req.discard();
                return;
            }
        }

        let end = (header.len as usize).clamp(IN_HEADER_SIZE, buf.len());
        handler(req, &buf[IN_HEADER_SIZE..end]);
    }

    /// Write one reply: out header plus optional payload, as one message.
    pub(crate) fn send_reply(
        &self,
        channel: &Channel,
        unique: u64,
        error: i32,
        payload: &[u8],
    ) -> io::Result<()> {
        let header = OutHeader {
            len: (OUT_HEADER_SIZE + payload.len()) as u32,
            error,
            unique,
        };
        if error != 0 {
            debug!(
                target: "lazarus::reply",
                unique,
                error,
                reason = %io::Error::from_raw_os_error(-error),
                outsize = header.len,
                "reply"
            );
        } else {
            debug!(target: "lazarus::reply", unique, outsize = header.len, "reply");
        }

        let header_bytes = header.to_bytes();
        let iov = [IoSlice::new(&header_bytes), IoSlice::new(payload)];
        let iov = if payload.is_empty() { &iov[..1] } else { &iov[..] };
        loop {
            let res = channel.send(iov);
            if self.exited() {
                return Ok(());
            }
            match res {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::ENODEV) => {
                    self.exit();
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "writing fuse device");
                    return Err(e);
                }
            }
        }
    }

    pub(crate) fn complete(&self, unique: u64, claim: &Arc<AtomicBool>) {
        self.lock_queues().complete(unique, claim);
    }

    pub(crate) fn interrupt(&self, pending: PendingInterrupt) -> InterruptOutcome {
        self.lock_queues().interrupt(pending)
    }

    /// Clamp limits against the kernel's INIT and return the draft reply.
    pub(crate) fn negotiate(&self, arg: &InitIn, page: usize) -> InitOut {
        let mut guard = match self.conn.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (bufsize, out) = conn::negotiate_limits(&mut guard, arg, self.bufsize(), page);
        self.bufsize.store(bufsize, Ordering::Release);
        out
    }

    /// Let the filesystem see (and adjust) the negotiated parameters.
    pub(crate) fn run_fs_init(&self) -> ConnectionInfo {
        let mut conn = self.connection();
        self.fs.init(&mut conn);
        match self.conn.write() {
            Ok(mut guard) => *guard = conn,
            Err(poisoned) => *poisoned.into_inner() = conn,
        }
        conn
    }

    /// Run filesystem teardown unless it already ran.
    pub(crate) fn destroy_once(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= SessionState::Destroying as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                SessionState::Destroying as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        info!("destroying filesystem");
        self.fs.destroy();
        self.set_state(SessionState::Destroyed);
        true
    }

    pub(crate) fn save_snapshot(&self) {
        let Some(store) = self.snapshot.get() else {
            return;
        };
        let state = self.state();
        let snapshot = SessionSnapshot::capture(
            &self.connection(),
            self.bufsize(),
            state >= SessionState::Active,
            state == SessionState::Destroyed,
        );
        store.save(&snapshot.to_bytes());
    }

    /// Reload negotiated state from the registered snapshot store.
    ///
    /// Returns `false` when no store is registered or nothing was saved yet.
    pub fn restore(&self) -> SessionResult<bool> {
        let Some(bytes) = self.snapshot.get().and_then(|store| store.load()) else {
            return Ok(false);
        };
        let snapshot = SessionSnapshot::from_bytes(&bytes)?;
        match self.conn.write() {
            Ok(mut guard) => *guard = snapshot.connection(),
            Err(poisoned) => *poisoned.into_inner() = snapshot.connection(),
        }
        if snapshot.bufsize > 0 {
            self.bufsize.store(snapshot.bufsize as usize, Ordering::Release);
        }
        let state = if snapshot.destroyed {
            SessionState::Destroyed
        } else if snapshot.inited {
            SessionState::Active
        } else if self.channel.get().is_some() {
            SessionState::Mounted
        } else {
            SessionState::Created
        };
        self.set_state(state);
        info!(
            proto_major = snapshot.proto_major,
            proto_minor = snapshot.proto_minor,
            max_write = snapshot.max_write,
            state = ?state,
            "session state restored from snapshot"
        );
        Ok(true)
    }

    /// Final teardown: destroy the filesystem if it was initialised and not
    /// yet destroyed, and release cloned channels.
    pub fn shutdown(&self) {
        if self.is_inited() {
            self.destroy_once();
        }
        let released = match self.clone_channels.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        if !released.is_empty() {
            debug!(count = released.len(), "closing cloned channels");
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("mountpoint", &self.mountpoint)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .field("exited", &self.exited())
            .field("error", &self.error())
            .finish()
    }
}
