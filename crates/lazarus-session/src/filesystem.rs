// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Operation table
//!
//! A filesystem implements [`Filesystem`]. Every method receives an already
//! claimed [`Request`] and must answer it through one of the reply methods;
//! a request dropped without a reply is answered with EIO. Methods left at
//! their defaults behave like unset table entries.

use crate::conn::ConnectionInfo;
use crate::request::Request;
use lazarus_proto::{
    SetattrIn, FATTR_ATIME, FATTR_ATIME_NOW, FATTR_CTIME, FATTR_FH, FATTR_GID, FATTR_MODE,
    FATTR_MTIME, FATTR_MTIME_NOW, FATTR_SIZE, FATTR_UID, FOPEN_CACHE_DIR, FOPEN_DIRECT_IO,
    FOPEN_KEEP_CACHE, FOPEN_NONSEEKABLE,
};
use libc::ENOSYS;
use std::ffi::OsStr;

/// Per-open state exchanged between the kernel and the filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileInfo {
    /// Open flags as passed to open(2)
    pub flags: i32,
    pub fh: u64,
    pub lock_owner: u64,
    /// Set on FLUSH and on RELEASE with a pending flush
    pub flush: bool,
    pub direct_io: bool,
    pub keep_cache: bool,
    pub nonseekable: bool,
    pub cache_dir: bool,
}

impl FileInfo {
    pub fn with_flags(flags: u32) -> Self {
        Self {
            flags: flags as i32,
            ..Self::default()
        }
    }

    pub fn with_handle(fh: u64) -> Self {
        Self {
            fh,
            ..Self::default()
        }
    }

    pub(crate) fn open_flags(&self) -> u32 {
        let mut flags = 0;
        if self.direct_io {
            flags |= FOPEN_DIRECT_IO;
        }
        if self.keep_cache {
            flags |= FOPEN_KEEP_CACHE;
        }
        if self.nonseekable {
            flags |= FOPEN_NONSEEKABLE;
        }
        if self.cache_dir {
            flags |= FOPEN_CACHE_DIR;
        }
        flags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOrNow {
    Specific(TimeSpec),
    Now,
}

/// Attribute changes requested by SETATTR; `None` means unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
    pub ctime: Option<TimeSpec>,
    /// Handle the change was issued through, if any
    pub fh: Option<u64>,
}

impl SetAttr {
    pub fn from_wire(arg: &SetattrIn) -> Self {
        let valid = arg.valid;
        let has = |bit: u32| valid & bit != 0;
        let time = |now: u32, set: u32, sec: u64, nsec: u32| {
            if has(now) {
                Some(TimeOrNow::Now)
            } else if has(set) {
                Some(TimeOrNow::Specific(TimeSpec {
                    sec: sec as i64,
                    nsec,
                }))
            } else {
                None
            }
        };
        Self {
            mode: has(FATTR_MODE).then_some(arg.mode),
            uid: has(FATTR_UID).then_some(arg.uid),
            gid: has(FATTR_GID).then_some(arg.gid),
            size: has(FATTR_SIZE).then_some(arg.size),
            atime: time(FATTR_ATIME_NOW, FATTR_ATIME, arg.atime, arg.atimensec),
            mtime: time(FATTR_MTIME_NOW, FATTR_MTIME, arg.mtime, arg.mtimensec),
            ctime: has(FATTR_CTIME).then_some(TimeSpec {
                sec: arg.ctime as i64,
                nsec: arg.ctimensec,
            }),
            fh: has(FATTR_FH).then_some(arg.fh),
        }
    }
}

#[allow(unused_variables)]
pub trait Filesystem: Send + Sync {
    /// Called once during INIT, before the reply is built. May set `want`.
    fn init(&self, conn: &mut ConnectionInfo) {}

    /// Called once on DESTROY or when the session shuts down.
    fn destroy(&self) {}

    fn lookup(&self, req: Request, parent: u64, name: &OsStr) {
        req.reply_error(ENOSYS);
    }

    fn forget(&self, req: Request, ino: u64, nlookup: u64) {
        req.reply_none();
    }

    fn getattr(&self, req: Request, ino: u64, fh: Option<u64>) {
        req.reply_error(ENOSYS);
    }

    fn setattr(&self, req: Request, ino: u64, attr: SetAttr) {
        req.reply_error(ENOSYS);
    }

    fn mkdir(&self, req: Request, parent: u64, name: &OsStr, mode: u32) {
        req.reply_error(ENOSYS);
    }

    fn unlink(&self, req: Request, parent: u64, name: &OsStr) {
        req.reply_error(ENOSYS);
    }

    fn rmdir(&self, req: Request, parent: u64, name: &OsStr) {
        req.reply_error(ENOSYS);
    }

    fn rename(&self, req: Request, parent: u64, name: &OsStr, newparent: u64, newname: &OsStr) {
        req.reply_error(ENOSYS);
    }

    fn open(&self, req: Request, ino: u64, info: FileInfo) {
        req.reply_open(&info);
    }

    fn read(&self, req: Request, ino: u64, size: u32, offset: u64, info: FileInfo) {
        req.reply_error(ENOSYS);
    }

    fn write(&self, req: Request, ino: u64, data: &[u8], offset: u64, info: FileInfo) {
        req.reply_error(ENOSYS);
    }

    fn flush(&self, req: Request, ino: u64, info: FileInfo) {
        req.reply_error(ENOSYS);
    }

    fn release(&self, req: Request, ino: u64, info: FileInfo) {
        req.reply_ok();
    }

    fn opendir(&self, req: Request, ino: u64, info: FileInfo) {
        req.reply_open(&info);
    }

    fn readdir(&self, req: Request, ino: u64, size: u32, offset: u64, info: FileInfo) {
        req.reply_error(ENOSYS);
    }

    fn releasedir(&self, req: Request, ino: u64, info: FileInfo) {
        req.reply_ok();
    }

    fn create(&self, req: Request, parent: u64, name: &OsStr, mode: u32, info: FileInfo) {
        req.reply_error(ENOSYS);
    }
}
