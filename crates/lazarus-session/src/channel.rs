// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Kernel device channel
//!
//! A [`Channel`] is one open handle on `/dev/fuse` (or, in tests, one end of
//! a `SOCK_SEQPACKET` socket pair). Every read yields exactly one request
//! and every vectored write delivers exactly one reply.

use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::time::Duration;

pub const FUSE_DEVICE: &str = "/dev/fuse";

const FUSE_DEV_IOC_MAGIC: u8 = 229;

/// Attach a freshly opened device handle to an existing connection
const FUSE_DEV_IOC_CLONE: u64 =
    nix::request_code_read!(FUSE_DEV_IOC_MAGIC, 0, std::mem::size_of::<u32>()) as u64;

/// Ask the kernel to requeue every request the dead worker had read but not
/// answered. Provided by the crash-recovery kernel patch.
const FUSE_DEV_IOC_RECOVERY: u64 = nix::request_code_none!(FUSE_DEV_IOC_MAGIC, 0x20) as u64;

#[derive(Debug)]
pub struct Channel {
    file: File,
}

impl Channel {
    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
        }
    }

    pub fn open_device() -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(FUSE_DEVICE)?;
        Ok(Self { file })
    }

    /// Open a new device handle bound to the same connection as `self`.
    pub fn clone_device(&self) -> io::Result<Channel> {
        let clone = Self::open_device()?;
        let mut master = self.as_raw_fd() as u32;
        let res = unsafe {
            libc::ioctl(
                clone.as_raw_fd(),
                FUSE_DEV_IOC_CLONE as _,
                &mut master as *mut u32,
            )
        };
        if res == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(clone)
    }

    pub fn request_recovery(&self) -> io::Result<()> {
        let res = unsafe { libc::ioctl(self.as_raw_fd(), FUSE_DEV_IOC_RECOVERY as _, 0) };
        if res == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Read one request. Errors are returned raw; the caller classifies them.
    pub fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }

    /// Write one reply as a single vectored write.
    pub fn send(&self, iov: &[IoSlice<'_>]) -> io::Result<usize> {
        (&self.file).write_vectored(iov)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let fd = self.as_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags == -1 {
            return Err(io::Error::last_os_error());
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait until a request is readable. Returns `false` on timeout.
    pub fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let millis = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let res = unsafe { libc::poll(&mut pfd, 1, millis) };
        match res {
            -1 => Err(io::Error::last_os_error()),
            0 => Ok(false),
            _ => Ok(true),
        }
    }
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl From<OwnedFd> for Channel {
    fn from(fd: OwnedFd) -> Self {
        Self::from_fd(fd)
    }
}
