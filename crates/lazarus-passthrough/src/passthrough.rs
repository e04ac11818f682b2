// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The passthrough filesystem
//!
//! Every operation is redirected to a source directory. Resolved paths are
//! held open with `O_PATH` in the inode table and deduplicated by
//! `(ino, dev)`; files and directories opened by the kernel get slots in the
//! file and directory tables.

use crate::dirstream::DirStream;
use crate::error::{PassthroughError, PassthroughResult};
use crate::sys::{self, errno};
use crate::tables::{inode_key, node_id, OpenHandle, Tables};
use lazarus_proto::{DirentBuf, ROOT_ID};
use lazarus_recovery::ResourceKind;
use lazarus_session::{
    attr_from_stat, EntryParam, FileInfo, Filesystem, Request, SetAttr, TimeOrNow,
};
use lazarus_session::{BufDst, BufSrc, FdRegion};
use std::collections::HashMap;
use std::ffi::{CString, OsStr};
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct Passthrough {
    source: PathBuf,
    root: OwnedFd,
    timeout: Duration,
    tables: Arc<Tables>,
    /// Serialises inode lookups and forgets within this process
    inode_lock: Mutex<()>,
    streams: Mutex<HashMap<u32, DirStream>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn time_spec(time: Option<TimeOrNow>) -> libc::timespec {
    match time {
        None => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        Some(TimeOrNow::Now) => libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_NOW,
        },
        Some(TimeOrNow::Specific(t)) => libc::timespec {
            tv_sec: t.sec as libc::time_t,
            tv_nsec: t.nsec as libc::c_long,
        },
    }
}

impl Passthrough {
    /// Serve `source`, which must be a directory. The root is opened now,
    /// before any fork, so every worker shares it.
    pub fn new(source: impl AsRef<Path>, timeout: Duration, tables: Arc<Tables>) -> PassthroughResult<Self> {
        let source = source.as_ref().to_path_buf();
        let meta = std::fs::symlink_metadata(&source).map_err(|e| PassthroughError::Source {
            path: source.clone(),
            source: e,
        })?;
        if !meta.is_dir() {
            return Err(PassthroughError::SourceNotDirectory(source));
        }
        let path = CString::new(source.as_os_str().as_bytes())
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let root = sys::open_path(&path, libc::O_PATH).map_err(|e| PassthroughError::Source {
            path: source.clone(),
            source: e,
        })?;
        info!(source = %source.display(), timeout = ?timeout, "passthrough source opened");
        Ok(Self {
            source,
            root,
            timeout,
            tables,
            inode_lock: Mutex::new(()),
            streams: Mutex::new(HashMap::new()),
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn tables(&self) -> &Arc<Tables> {
        &self.tables
    }

    /// The `O_PATH` descriptor behind node id `ino`.
    fn inode_fd(&self, ino: u64) -> io::Result<RawFd> {
        if ino == ROOT_ID {
            return Ok(self.root.as_raw_fd());
        }
        inode_key(ino)
            .and_then(|key| self.tables.inodes.slot(key))
            .filter(|slot| slot.is_used())
            .and_then(|slot| slot.primary())
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ESTALE))
    }

    fn file_fd(&self, fh: u64) -> io::Result<RawFd> {
        match OpenHandle::from_fh(fh) {
            Some(OpenHandle::File(key)) => self
                .tables
                .files
                .slot(key)
                .and_then(|slot| slot.primary())
                .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF)),
            _ => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }

    fn dir_key(&self, fh: u64) -> io::Result<u32> {
        match OpenHandle::from_fh(fh) {
            Some(OpenHandle::Dir(key)) if self.tables.dirs.slot(key).is_some_and(|s| s.is_used()) => Ok(key),
            _ => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }

    fn entry(&self, ino: u64, st: &libc::stat) -> EntryParam {
        EntryParam {
            ino,
            generation: 0,
            attr: attr_from_stat(st),
            attr_timeout: self.timeout,
            entry_timeout: self.timeout,
        }
    }

    /// Resolve `name` under `parent`, taking one lookup reference.
    fn do_lookup(&self, parent: u64, name: &OsStr) -> io::Result<EntryParam> {
        let dir = self.inode_fd(parent)?;
        let fd = sys::openat(dir, name, libc::O_PATH | libc::O_NOFOLLOW, 0)?;
        let st = sys::fstat_empty(fd.as_raw_fd())?;
        let (ino, dev) = (st.st_ino as u64, st.st_dev as u64);

        let _guard = lock(&self.inode_lock);
        let key = match self.tables.find_inode(ino, dev) {
            Some(key) => key,
            None => self
                .tables
                .insert_inode(fd, ino, dev)
                .map_err(|e| io::Error::other(e.to_string()))?
                .ok_or_else(|| {
                    warn!("inode table is full");
                    io::Error::from_raw_os_error(libc::ENFILE)
                })?,
        };
        let nodeid = node_id(key);
        debug!(parent, name = ?name, nodeid, "lookup");
        Ok(self.entry(nodeid, &st))
    }

    /// Store an opened file in the file table.
    fn install_file(&self, fd: OwnedFd) -> io::Result<u64> {
        let key = self.tables.files.allocate().ok_or_else(|| {
            warn!("file table is full");
            io::Error::from_raw_os_error(libc::ENFILE)
        })?;
        self.tables
            .install(&self.tables.files, ResourceKind::File, key, fd)
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(OpenHandle::File(key).to_fh())
    }

    fn getattr_reply(&self, req: Request, ino: u64) {
        match self.inode_fd(ino).and_then(sys::fstat_empty) {
            Ok(st) => req.reply_attr(&attr_from_stat(&st), self.timeout),
            Err(e) => req.reply_error(errno(&e)),
        }
    }

    fn apply_setattr(&self, ino: u64, attr: &SetAttr) -> io::Result<()> {
        let inode = self.inode_fd(ino)?;
        let handle = match attr.fh {
            Some(fh) => Some(self.file_fd(fh)?),
            None => None,
        };
        let proc = sys::proc_path(inode);

        if let Some(mode) = attr.mode {
            match handle {
                Some(fd) => sys::fchmod(fd, mode)?,
                None => sys::chmod(&proc, mode)?,
            }
        }
        if attr.uid.is_some() || attr.gid.is_some() {
            sys::fchown_empty(inode, attr.uid, attr.gid)?;
        }
        if let Some(size) = attr.size {
            match handle {
                Some(fd) => sys::ftruncate(fd, size)?,
                None => sys::truncate(&proc, size)?,
            }
        }
        if attr.atime.is_some() || attr.mtime.is_some() {
            let times = [time_spec(attr.atime), time_spec(attr.mtime)];
            match handle {
                Some(fd) => sys::futimens(fd, &times)?,
                None => sys::utimens(&proc, &times)?,
            }
        }
        Ok(())
    }
}

impl Filesystem for Passthrough {
    fn destroy(&self) {
        lock(&self.streams).clear();
        if !self.tables.is_mirrored() {
            let released = self.tables.release_all();
            debug!(released, "descriptor tables released");
        }
        info!(source = %self.source.display(), "passthrough destroyed");
    }

    fn lookup(&self, req: Request, parent: u64, name: &OsStr) {
        match self.do_lookup(parent, name) {
            Ok(entry) => req.reply_entry(&entry),
            Err(e) => req.reply_error(errno(&e)),
        }
    }

    fn forget(&self, req: Request, ino: u64, nlookup: u64) {
        if let Some(key) = inode_key(ino) {
            let _guard = lock(&self.inode_lock);
            match self.tables.forget_inode(key, nlookup) {
                Ok(remaining) => debug!(ino, nlookup, remaining, "forget"),
                Err(e) => warn!(ino, error = %e, "forget of unknown inode"),
            }
        }
        req.reply_none();
    }

    fn getattr(&self, req: Request, ino: u64, _fh: Option<u64>) {
        self.getattr_reply(req, ino);
    }

    fn setattr(&self, req: Request, ino: u64, attr: SetAttr) {
        match self.apply_setattr(ino, &attr) {
            Ok(()) => self.getattr_reply(req, ino),
            Err(e) => req.reply_error(errno(&e)),
        }
    }

    fn mkdir(&self, req: Request, parent: u64, name: &OsStr, mode: u32) {
        let result = self
            .inode_fd(parent)
            .and_then(|dir| sys::mkdirat(dir, name, mode))
            .and_then(|()| self.do_lookup(parent, name));
        match result {
            Ok(entry) => {
                debug!(parent, name = ?name, nodeid = entry.ino, "mkdir");
                req.reply_entry(&entry)
            }
            Err(e) => req.reply_error(errno(&e)),
        }
    }

    fn unlink(&self, req: Request, parent: u64, name: &OsStr) {
        let result = self.inode_fd(parent).and_then(|dir| sys::unlinkat(dir, name, 0));
        req.reply_error(result.err().map_or(0, |e| errno(&e)));
    }

    fn rmdir(&self, req: Request, parent: u64, name: &OsStr) {
        let result = self
            .inode_fd(parent)
            .and_then(|dir| sys::unlinkat(dir, name, libc::AT_REMOVEDIR));
        req.reply_error(result.err().map_or(0, |e| errno(&e)));
    }

    fn rename(&self, req: Request, parent: u64, name: &OsStr, newparent: u64, newname: &OsStr) {
        let result = self.inode_fd(parent).and_then(|dir| {
            let newdir = self.inode_fd(newparent)?;
            sys::renameat(dir, name, newdir, newname)
        });
        req.reply_error(result.err().map_or(0, |e| errno(&e)));
    }

    fn open(&self, req: Request, ino: u64, mut info: FileInfo) {
        debug!(ino, flags = info.flags, "open");
        let result = self
            .inode_fd(ino)
            .and_then(|fd| sys::open_path(&sys::proc_path(fd), info.flags & !libc::O_NOFOLLOW))
            .and_then(|fd| self.install_file(fd));
        match result {
            Ok(fh) => {
                info.fh = fh;
                info.direct_io = true;
                req.reply_open(&info);
            }
            Err(e) => req.reply_error(errno(&e)),
        }
    }

    fn create(&self, req: Request, parent: u64, name: &OsStr, mode: u32, mut info: FileInfo) {
        debug!(parent, name = ?name, "create");
        let opened = self.inode_fd(parent).and_then(|dir| {
            sys::openat(
                dir,
                name,
                (info.flags | libc::O_CREAT) & !libc::O_NOFOLLOW,
                mode as libc::mode_t,
            )
        });
        let fd = match opened {
            Ok(fd) => fd,
            Err(e) => return req.reply_error(errno(&e)),
        };
        let entry = match self.do_lookup(parent, name) {
            Ok(entry) => entry,
            Err(e) => return req.reply_error(errno(&e)),
        };
        match self.install_file(fd) {
            Ok(fh) => {
                info.fh = fh;
                info.direct_io = true;
                req.reply_create(&entry, &info);
            }
            Err(e) => {
                // The kernel never learns about the entry; give the
                // reference back
                if let Some(key) = inode_key(entry.ino) {
                    let _guard = lock(&self.inode_lock);
                    let _ = self.tables.forget_inode(key, 1);
                }
                req.reply_error(errno(&e));
            }
        }
    }

    fn read(&self, req: Request, ino: u64, size: u32, offset: u64, info: FileInfo) {
        debug!(ino, size, offset, "read");
        match self.file_fd(info.fh) {
            Ok(fd) => {
                // SAFETY: the handle stays open until RELEASE, which the
                // kernel only sends once no read is in flight
                let fd = unsafe { BorrowedFd::borrow_raw(fd) };
                req.reply_read(BufSrc::Fd(FdRegion::at(fd, offset)), size as usize);
            }
            Err(e) => req.reply_error(errno(&e)),
        }
    }

    fn write(&self, req: Request, ino: u64, data: &[u8], offset: u64, info: FileInfo) {
        debug!(ino, size = data.len(), offset, "write");
        match self.file_fd(info.fh) {
            Ok(fd) => {
                // SAFETY: as for read
                let fd = unsafe { BorrowedFd::borrow_raw(fd) };
                req.reply_write(BufDst::Fd(FdRegion::at(fd, offset)), BufSrc::Mem(data), data.len());
            }
            Err(e) => req.reply_error(errno(&e)),
        }
    }

    fn flush(&self, req: Request, _ino: u64, info: FileInfo) {
        let result = self.file_fd(info.fh).and_then(sys::flush);
        req.reply_error(result.err().map_or(0, |e| errno(&e)));
    }

    fn release(&self, req: Request, _ino: u64, info: FileInfo) {
        match OpenHandle::from_fh(info.fh) {
            Some(OpenHandle::File(key)) => {
                if let Err(e) = self.tables.uninstall(&self.tables.files, ResourceKind::File, key) {
                    warn!(fh = info.fh, error = %e, "release of unknown file handle");
                }
                req.reply_ok();
            }
            _ => req.reply_error(libc::EBADF),
        }
    }

    fn opendir(&self, req: Request, ino: u64, mut info: FileInfo) {
        let result = self.inode_fd(ino).and_then(|fd| {
            let dir = sys::openat(fd, OsStr::new("."), libc::O_RDONLY | libc::O_DIRECTORY, 0)?;
            let key = self.tables.dirs.allocate().ok_or_else(|| {
                warn!("directory table is full");
                io::Error::from_raw_os_error(libc::ENFILE)
            })?;
            self.tables
                .install(&self.tables.dirs, ResourceKind::Dir, key, dir)
                .map_err(|e| io::Error::other(e.to_string()))?;
            Ok(key)
        });
        match result {
            Ok(key) => {
                info.fh = OpenHandle::Dir(key).to_fh();
                req.reply_open(&info);
            }
            Err(e) => req.reply_error(errno(&e)),
        }
    }

    fn readdir(&self, req: Request, ino: u64, size: u32, offset: u64, info: FileInfo) {
        debug!(ino, size, offset, "readdir");
        let result = self.dir_key(info.fh).and_then(|key| {
            let mut streams = lock(&self.streams);
            let stream = match streams.entry(key) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    let fd = self
                        .tables
                        .dirs
                        .slot(key)
                        .and_then(|slot| slot.primary())
                        .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
                    entry.insert(DirStream::open(fd)?)
                }
            };
            let mut buf = DirentBuf::new(size as usize);
            stream.fill(offset, &mut buf)?;
            Ok(buf)
        });
        match result {
            Ok(buf) => req.reply_data(buf.as_bytes()),
            Err(e) => req.reply_error(errno(&e)),
        }
    }

    fn releasedir(&self, req: Request, _ino: u64, info: FileInfo) {
        match self.dir_key(info.fh) {
            Ok(key) => {
                lock(&self.streams).remove(&key);
                if let Err(e) = self.tables.uninstall(&self.tables.dirs, ResourceKind::Dir, key) {
                    warn!(fh = info.fh, error = %e, "releasedir failed");
                }
                req.reply_ok();
            }
            Err(e) => req.reply_error(errno(&e)),
        }
    }
}

impl std::fmt::Debug for Passthrough {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Passthrough")
            .field("source", &self.source)
            .field("timeout", &self.timeout)
            .field("tables", &self.tables)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> Arc<Tables> {
        Arc::new(Tables::new(None).unwrap())
    }

    #[test]
    fn test_source_must_be_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"").unwrap();

        let err = Passthrough::new(&file, Duration::ZERO, tables()).unwrap_err();
        assert!(matches!(err, PassthroughError::SourceNotDirectory(_)));
        let err = Passthrough::new(dir.path().join("missing"), Duration::ZERO, tables()).unwrap_err();
        assert!(matches!(err, PassthroughError::Source { .. }));
    }

    #[test]
    fn test_lookup_deduplicates_by_identity() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file"), b"abc").unwrap();
        let fs = Passthrough::new(dir.path(), Duration::from_secs(1), tables()).unwrap();

        let first = fs.do_lookup(ROOT_ID, OsStr::new("file")).unwrap();
        let second = fs.do_lookup(ROOT_ID, OsStr::new("file")).unwrap();
        assert_eq!(first.ino, second.ino);
        assert_eq!(first.attr.size, 3);
        assert_eq!(fs.tables().inodes.used_count(), 1);

        let err = fs.do_lookup(ROOT_ID, OsStr::new("missing")).unwrap_err();
        assert_eq!(errno(&err), libc::ENOENT);
        let err = fs.do_lookup(999, OsStr::new("file")).unwrap_err();
        assert_eq!(errno(&err), libc::ESTALE);
    }

    #[test]
    fn test_setattr_without_handle_uses_proc_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file"), b"0123456789").unwrap();
        let fs = Passthrough::new(dir.path(), Duration::ZERO, tables()).unwrap();
        let entry = fs.do_lookup(ROOT_ID, OsStr::new("file")).unwrap();

        let attr = SetAttr {
            size: Some(4),
            mode: Some(0o600),
            mtime: Some(TimeOrNow::Specific(lazarus_session::TimeSpec { sec: 1_000_000, nsec: 0 })),
            ..SetAttr::default()
        };
        fs.apply_setattr(entry.ino, &attr).unwrap();

        let meta = std::fs::metadata(dir.path().join("file")).unwrap();
        use std::os::unix::fs::MetadataExt;
        assert_eq!(meta.len(), 4);
        assert_eq!(meta.mode() & 0o777, 0o600);
        assert_eq!(meta.mtime(), 1_000_000);
    }

    #[test]
    fn test_time_spec_encoding() {
        assert_eq!(time_spec(None).tv_nsec, libc::UTIME_OMIT);
        assert_eq!(time_spec(Some(TimeOrNow::Now)).tv_nsec, libc::UTIME_NOW);
    }
}
