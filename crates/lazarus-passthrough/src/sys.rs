// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Thin descriptor-relative syscall wrappers

use std::ffi::{CString, OsStr};
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;

fn cstr(name: &OsStr) -> io::Result<CString> {
    CString::new(name.as_bytes()).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn check(res: libc::c_int) -> io::Result<()> {
    if res == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Errno to reply with for `err`
pub fn errno(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(libc::EIO)
}

/// Path that reopens `fd` through procfs
pub fn proc_path(fd: RawFd) -> CString {
    // A formatted integer never contains a NUL
    CString::new(format!("/proc/self/fd/{}", fd)).unwrap_or_default()
}

pub fn openat(dir: RawFd, name: &OsStr, flags: libc::c_int, mode: libc::mode_t) -> io::Result<OwnedFd> {
    let name = cstr(name)?;
    let fd = unsafe { libc::openat(dir, name.as_ptr(), flags | libc::O_CLOEXEC, mode as libc::c_uint) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: freshly opened
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn open_path(path: &CString, flags: libc::c_int) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::open(path.as_ptr(), flags | libc::O_CLOEXEC) };
    if fd == -1 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: freshly opened
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// stat the object `fd` refers to, without following symlinks.
pub fn fstat_empty(fd: RawFd) -> io::Result<libc::stat> {
    let mut st = MaybeUninit::<libc::stat>::uninit();
    let res = unsafe {
        libc::fstatat(
            fd,
            c"".as_ptr(),
            st.as_mut_ptr(),
            libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    check(res)?;
    // SAFETY: fstatat succeeded
    Ok(unsafe { st.assume_init() })
}

pub fn mkdirat(dir: RawFd, name: &OsStr, mode: u32) -> io::Result<()> {
    let name = cstr(name)?;
    check(unsafe { libc::mkdirat(dir, name.as_ptr(), mode as libc::mode_t) })
}

pub fn unlinkat(dir: RawFd, name: &OsStr, flags: libc::c_int) -> io::Result<()> {
    let name = cstr(name)?;
    check(unsafe { libc::unlinkat(dir, name.as_ptr(), flags) })
}

pub fn renameat(dir: RawFd, name: &OsStr, newdir: RawFd, newname: &OsStr) -> io::Result<()> {
    let name = cstr(name)?;
    let newname = cstr(newname)?;
    check(unsafe { libc::renameat(dir, name.as_ptr(), newdir, newname.as_ptr()) })
}

pub fn fchmod(fd: RawFd, mode: u32) -> io::Result<()> {
    check(unsafe { libc::fchmod(fd, mode as libc::mode_t) })
}

pub fn chmod(path: &CString, mode: u32) -> io::Result<()> {
    check(unsafe { libc::chmod(path.as_ptr(), mode as libc::mode_t) })
}

/// Change ownership of the object `fd` refers to; `None` leaves a field.
pub fn fchown_empty(fd: RawFd, uid: Option<u32>, gid: Option<u32>) -> io::Result<()> {
    let uid = uid.unwrap_or(u32::MAX) as libc::uid_t;
    let gid = gid.unwrap_or(u32::MAX) as libc::gid_t;
    check(unsafe {
        libc::fchownat(
            fd,
            c"".as_ptr(),
            uid,
            gid,
            libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
        )
    })
}

pub fn ftruncate(fd: RawFd, size: u64) -> io::Result<()> {
    check(unsafe { libc::ftruncate(fd, size as libc::off_t) })
}

pub fn truncate(path: &CString, size: u64) -> io::Result<()> {
    check(unsafe { libc::truncate(path.as_ptr(), size as libc::off_t) })
}

pub fn futimens(fd: RawFd, times: &[libc::timespec; 2]) -> io::Result<()> {
    check(unsafe { libc::futimens(fd, times.as_ptr()) })
}

pub fn utimens(path: &CString, times: &[libc::timespec; 2]) -> io::Result<()> {
    check(unsafe { libc::utimensat(libc::AT_FDCWD, path.as_ptr(), times.as_ptr(), 0) })
}

/// Close a duplicate of `fd`, surfacing errors a close would report.
pub fn flush(fd: RawFd) -> io::Result<()> {
    let dup = unsafe { libc::dup(fd) };
    if dup == -1 {
        return Err(io::Error::last_os_error());
    }
    check(unsafe { libc::close(dup) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_descriptor_relative_calls() {
        let dir = tempfile::tempdir().unwrap();
        let root = open_path(
            &CString::new(dir.path().as_os_str().as_bytes()).unwrap(),
            libc::O_PATH,
        )
        .unwrap();
        let root = root.as_raw_fd();

        mkdirat(root, OsStr::new("sub"), 0o755).unwrap();
        let sub = openat(root, OsStr::new("sub"), libc::O_PATH | libc::O_NOFOLLOW, 0).unwrap();
        let st = fstat_empty(sub.as_raw_fd()).unwrap();
        assert_eq!(st.st_mode & libc::S_IFMT, libc::S_IFDIR);

        renameat(root, OsStr::new("sub"), root, OsStr::new("moved")).unwrap();
        let err = unlinkat(root, OsStr::new("sub"), libc::AT_REMOVEDIR).unwrap_err();
        assert_eq!(errno(&err), libc::ENOENT);
        unlinkat(root, OsStr::new("moved"), libc::AT_REMOVEDIR).unwrap();
    }

    #[test]
    fn test_truncate_through_proc_path() {
        let mut file = tempfile::tempfile().unwrap();
        std::io::Write::write_all(&mut file, b"0123456789").unwrap();
        truncate(&proc_path(file.as_raw_fd()), 4).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 4);
        ftruncate(file.as_raw_fd(), 2).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 2);
        flush(file.as_raw_fd()).unwrap();
    }
}
