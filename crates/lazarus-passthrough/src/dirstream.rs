// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use lazarus_proto::DirentBuf;
use nix::errno::Errno;
use std::ffi::{CStr, OsStr};
use std::io;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::ptr::NonNull;

/// A directory stream over a duplicate of an open directory descriptor.
///
/// Streams are private to one worker process. The descriptor they were
/// made from lives in the shared tables, so a restarted worker simply
/// opens a new stream and seeks to the offset the kernel asks for.
pub struct DirStream {
    dir: NonNull<libc::DIR>,
    /// Cookie the stream is positioned at, if known
    offset: Option<i64>,
}

// SAFETY: the stream is only used behind a lock
unsafe impl Send for DirStream {}

impl DirStream {
    pub fn open(fd: RawFd) -> io::Result<Self> {
        let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
        if dup == -1 {
            return Err(io::Error::last_os_error());
        }
        match NonNull::new(unsafe { libc::fdopendir(dup) }) {
            Some(dir) => Ok(Self { dir, offset: None }),
            None => {
                let err = io::Error::last_os_error();
                unsafe { libc::close(dup) };
                Err(err)
            }
        }
    }

    /// Append entries starting at cookie `offset` until `buf` is full or
    /// the directory ends.
    pub fn fill(&mut self, offset: u64, buf: &mut DirentBuf) -> io::Result<()> {
        let offset = offset as i64;
        if self.offset != Some(offset) {
            unsafe { libc::seekdir(self.dir.as_ptr(), offset as libc::c_long) };
            self.offset = Some(offset);
        }
        loop {
            Errno::clear();
            let entry = unsafe { libc::readdir(self.dir.as_ptr()) };
            if entry.is_null() {
                return match Errno::last_raw() {
                    0 => Ok(()),
                    errno => {
                        self.offset = None;
                        Err(io::Error::from_raw_os_error(errno))
                    }
                };
            }
            // SAFETY: readdir returned a valid entry
            let entry = unsafe { &*entry };
            let name = unsafe { CStr::from_ptr(entry.d_name.as_ptr()) };
            let mode = (entry.d_type as u32) << 12;
            let next = entry.d_off;
            if !buf.push(entry.d_ino as u64, next as u64, mode, OsStr::from_bytes(name.to_bytes())) {
                // That entry was consumed; seek back on the next call
                self.offset = None;
                return Ok(());
            }
            self.offset = Some(next);
        }
    }
}

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe { libc::closedir(self.dir.as_ptr()) };
    }
}

impl std::fmt::Debug for DirStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirStream").field("offset", &self.offset).finish()
    }
}
