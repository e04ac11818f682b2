// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Descriptor mirroring protocol
//!
//! A worker announces every descriptor it creates with an ASCII message
//! `<kind>/<key>` carrying a duplicate of the descriptor, and every release
//! with the matching destruction kind and no descriptor. The supervisor keeps
//! the duplicates as backups so a restarted worker can resume with them.

use crate::ancillary::{recv_with_fd, send_with_fd};
use crate::error::{RecoveryError, RecoveryResult};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Longest message the protocol produces
pub const MAX_MESSAGE_LEN: usize = 64;

/// The table a mirrored descriptor belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Resolved path (inode) handles
    Path,
    File,
    Dir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MirrorKind {
    Lookup,
    Forget,
    Open,
    Close,
    Opendir,
    Closedir,
}

impl MirrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MirrorKind::Lookup => "lookup",
            MirrorKind::Forget => "forget",
            MirrorKind::Open => "open",
            MirrorKind::Close => "close",
            MirrorKind::Opendir => "opendir",
            MirrorKind::Closedir => "closedir",
        }
    }

    pub fn is_creation(self) -> bool {
        matches!(self, MirrorKind::Lookup | MirrorKind::Open | MirrorKind::Opendir)
    }

    pub fn resource(self) -> ResourceKind {
        match self {
            MirrorKind::Lookup | MirrorKind::Forget => ResourceKind::Path,
            MirrorKind::Open | MirrorKind::Close => ResourceKind::File,
            MirrorKind::Opendir | MirrorKind::Closedir => ResourceKind::Dir,
        }
    }

    pub fn creation(resource: ResourceKind) -> Self {
        match resource {
            ResourceKind::Path => MirrorKind::Lookup,
            ResourceKind::File => MirrorKind::Open,
            ResourceKind::Dir => MirrorKind::Opendir,
        }
    }

    pub fn destruction(resource: ResourceKind) -> Self {
        match resource {
            ResourceKind::Path => MirrorKind::Forget,
            ResourceKind::File => MirrorKind::Close,
            ResourceKind::Dir => MirrorKind::Closedir,
        }
    }
}

impl fmt::Display for MirrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MirrorKind {
    type Err = RecoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lookup" => Ok(MirrorKind::Lookup),
            "forget" => Ok(MirrorKind::Forget),
            "open" => Ok(MirrorKind::Open),
            "close" => Ok(MirrorKind::Close),
            "opendir" => Ok(MirrorKind::Opendir),
            "closedir" => Ok(MirrorKind::Closedir),
            other => Err(RecoveryError::MalformedMessage(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorMessage {
    pub kind: MirrorKind,
    /// Slot index in the table for `kind.resource()`
    pub key: u32,
}

impl MirrorMessage {
    pub fn new(kind: MirrorKind, key: u32) -> Self {
        Self { kind, key }
    }

    pub fn encode(&self) -> String {
        format!("{}/{}", self.kind, self.key)
    }

    pub fn parse(bytes: &[u8]) -> RecoveryResult<Self> {
        let malformed = || RecoveryError::MalformedMessage(String::from_utf8_lossy(bytes).into_owned());
        let text = std::str::from_utf8(bytes).map_err(|_| malformed())?;
        let (kind, key) = text.split_once('/').ok_or_else(malformed)?;
        if key.is_empty() || !key.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let kind = kind.parse()?;
        let key = key.parse().map_err(|_| malformed())?;
        Ok(Self { kind, key })
    }
}

impl fmt::Display for MirrorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

/// Create a connected sender/receiver pair.
///
/// Both ends must exist before the first fork so every worker inherits the
/// sender.
pub fn mirror_channel() -> RecoveryResult<(MirrorSender, MirrorReceiver)> {
    let (tx, rx) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(|e| RecoveryError::Io(io::Error::from(e)))?;
    Ok((MirrorSender { socket: tx }, MirrorReceiver { socket: rx }))
}

/// Worker side of the mirror channel.
#[derive(Debug)]
pub struct MirrorSender {
    socket: OwnedFd,
}

impl MirrorSender {
    pub fn send(&self, message: MirrorMessage, fd: Option<BorrowedFd<'_>>) -> RecoveryResult<()> {
        if message.kind.is_creation() && fd.is_none() {
            return Err(RecoveryError::MissingDescriptor {
                kind: message.kind.as_str(),
                key: message.key,
            });
        }
        let fd = if message.kind.is_creation() { fd } else { None };
        send_with_fd(self.socket.as_fd(), message.encode().as_bytes(), fd)?;
        debug!(message = %message, "mirrored");
        Ok(())
    }

    /// Announce a new descriptor stored at `key`.
    pub fn created(&self, resource: ResourceKind, key: u32, fd: BorrowedFd<'_>) -> RecoveryResult<()> {
        self.send(MirrorMessage::new(MirrorKind::creation(resource), key), Some(fd))
    }

    /// Announce that the descriptor at `key` was released.
    pub fn destroyed(&self, resource: ResourceKind, key: u32) -> RecoveryResult<()> {
        self.send(MirrorMessage::new(MirrorKind::destruction(resource), key), None)
    }
}

/// Supervisor side of the mirror channel.
#[derive(Debug)]
pub struct MirrorReceiver {
    socket: OwnedFd,
}

impl MirrorReceiver {
    /// Wait until a message is readable. Returns `false` on timeout.
    pub fn wait(&self, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        match unsafe { libc::poll(&mut pfd, 1, millis) } {
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
            0 => Ok(false),
            _ => Ok(true),
        }
    }

    /// Take one message if one is queued.
    pub fn try_recv(&self) -> RecoveryResult<Option<(MirrorMessage, Option<OwnedFd>)>> {
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        let (n, fd) = match recv_with_fd(self.socket.as_fd(), &mut buf, libc::MSG_DONTWAIT) {
            Ok(received) => received,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if n == 0 && fd.is_none() {
            return Ok(None);
        }
        let message = MirrorMessage::parse(&buf[..n])?;
        Ok(Some((message, fd)))
    }

    /// Hand every queued message to `apply`. Malformed messages are logged
    /// and skipped; any descriptor they carried is closed.
    pub fn drain(
        &self,
        mut apply: impl FnMut(MirrorMessage, Option<OwnedFd>),
    ) -> RecoveryResult<usize> {
        let mut handled = 0;
        loop {
            match self.try_recv() {
                Ok(Some((message, fd))) => {
                    apply(message, fd);
                    handled += 1;
                }
                Ok(None) => return Ok(handled),
                Err(RecoveryError::MalformedMessage(text)) => {
                    warn!(message = %text, "dropping malformed mirror message");
                }
                Err(e) => return Err(e),
            }
        }
    }
}
