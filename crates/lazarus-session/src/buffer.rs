// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Memory/descriptor buffer copies
//!
//! Filesystems hand read and write payloads to the reply path as either a
//! memory slice or a descriptor region. [`copy_buf`] moves bytes between any
//! two of them.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

/// Size of the bounce buffer used for descriptor-to-descriptor copies
pub const BOUNCE_SIZE: usize = 4096;

/// A region of an open descriptor.
#[derive(Debug, Clone, Copy)]
pub struct FdRegion<'a> {
    pub fd: BorrowedFd<'a>,
    /// Use positioned I/O at this offset instead of the file position
    pub pos: Option<u64>,
    /// Keep going after a short transfer until `len` bytes or EOF
    pub retry: bool,
}

impl<'a> FdRegion<'a> {
    pub fn new(fd: BorrowedFd<'a>) -> Self {
        Self {
            fd,
            pos: None,
            retry: false,
        }
    }

    pub fn at(fd: BorrowedFd<'a>, pos: u64) -> Self {
        Self {
            fd,
            pos: Some(pos),
            retry: false,
        }
    }

    pub fn retrying(mut self) -> Self {
        self.retry = true;
        self
    }
}

#[derive(Debug)]
pub enum BufSrc<'a> {
    Mem(&'a [u8]),
    Fd(FdRegion<'a>),
}

#[derive(Debug)]
pub enum BufDst<'a> {
    Mem(&'a mut [u8]),
    Fd(FdRegion<'a>),
}

fn last_error() -> io::Error {
    io::Error::last_os_error()
}

fn fd_write(dst: &FdRegion<'_>, data: &[u8], off: usize) -> io::Result<usize> {
    let fd = dst.fd.as_raw_fd();
    let res = match dst.pos {
        Some(pos) => unsafe {
            libc::pwrite(
                fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                (pos + off as u64) as libc::off_t,
            )
        },
        None => unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) },
    };
    if res < 0 {
        Err(last_error())
    } else {
        Ok(res as usize)
    }
}

fn fd_read(src: &FdRegion<'_>, data: &mut [u8], off: usize) -> io::Result<usize> {
    let fd = src.fd.as_raw_fd();
    let res = match src.pos {
        Some(pos) => unsafe {
            libc::pread(
                fd,
                data.as_mut_ptr() as *mut libc::c_void,
                data.len(),
                (pos + off as u64) as libc::off_t,
            )
        },
        None => unsafe { libc::read(fd, data.as_mut_ptr() as *mut libc::c_void, data.len()) },
    };
    if res < 0 {
        Err(last_error())
    } else {
        Ok(res as usize)
    }
}

/// Memory into a descriptor.
fn copy_to_fd(dst: &FdRegion<'_>, mut dst_off: usize, src: &[u8]) -> io::Result<usize> {
    let mut copied = 0;
    while copied < src.len() {
        match fd_write(dst, &src[copied..], dst_off) {
            Err(e) if copied == 0 => return Err(e),
            Err(_) | Ok(0) => break,
            Ok(n) => {
                copied += n;
                dst_off += n;
            }
        }
        if !dst.retry {
            break;
        }
    }
    Ok(copied)
}

/// A descriptor into memory.
fn copy_from_fd(dst: &mut [u8], src: &FdRegion<'_>, mut src_off: usize) -> io::Result<usize> {
    let mut copied = 0;
    while copied < dst.len() {
        match fd_read(src, &mut dst[copied..], src_off) {
            Err(e) if copied == 0 => return Err(e),
            Err(_) | Ok(0) => break,
            Ok(n) => {
                copied += n;
                src_off += n;
            }
        }
        if !src.retry {
            break;
        }
    }
    Ok(copied)
}

fn copy_fd_to_fd(
    dst: &FdRegion<'_>,
    mut dst_off: usize,
    src: &FdRegion<'_>,
    mut src_off: usize,
    mut len: usize,
) -> io::Result<usize> {
    let mut bounce = [0u8; BOUNCE_SIZE];
    let mut copied = 0;
    while len > 0 {
        let chunk = len.min(BOUNCE_SIZE);
        let read = match copy_from_fd(&mut bounce[..chunk], src, src_off) {
            Err(e) if copied == 0 => return Err(e),
            Err(_) | Ok(0) => break,
            Ok(n) => n,
        };
        let written = match copy_to_fd(dst, dst_off, &bounce[..read]) {
            Err(e) if copied == 0 => return Err(e),
            Err(_) | Ok(0) => break,
            Ok(n) => n,
        };
        copied += written;
        if written < chunk {
            break;
        }
        dst_off += written;
        src_off += written;
        len -= written;
    }
    Ok(copied)
}

/// Copy up to `len` bytes from `src[src_off..]` to `dst[dst_off..]`.
///
/// Returns the number of bytes copied. An error is returned only when it
/// happened before any byte moved; later failures end the copy early.
pub fn copy_buf(
    dst: &mut BufDst<'_>,
    dst_off: usize,
    src: &BufSrc<'_>,
    src_off: usize,
    len: usize,
) -> io::Result<usize> {
    match (dst, src) {
        (BufDst::Mem(dst), BufSrc::Mem(src)) => {
            let len = len
                .min(dst.len().saturating_sub(dst_off))
                .min(src.len().saturating_sub(src_off));
            dst[dst_off..dst_off + len].copy_from_slice(&src[src_off..src_off + len]);
            Ok(len)
        }
        (BufDst::Fd(dst), BufSrc::Mem(src)) => {
            let end = src.len().min(src_off.saturating_add(len));
            let start = src_off.min(end);
            copy_to_fd(dst, dst_off, &src[start..end])
        }
        (BufDst::Mem(dst), BufSrc::Fd(src)) => {
            let end = dst.len().min(dst_off.saturating_add(len));
            let start = dst_off.min(end);
            copy_from_fd(&mut dst[start..end], src, src_off)
        }
        (BufDst::Fd(dst), BufSrc::Fd(src)) => copy_fd_to_fd(dst, dst_off, src, src_off, len),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::AsFd;
    use tempfile::tempfile;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_memory_to_memory() {
        let src = pattern(100);
        let mut out = vec![0u8; 100];
        let n = copy_buf(&mut BufDst::Mem(&mut out), 0, &BufSrc::Mem(&src), 0, 100).unwrap();
        assert_eq!(n, 100);
        assert_eq!(out, src);
    }

    #[test]
    fn test_memory_to_positioned_descriptor() {
        let file = tempfile().unwrap();
        let src = pattern(10_000);
        let region = FdRegion::at(file.as_fd(), 0).retrying();
        let n = copy_buf(&mut BufDst::Fd(region), 0, &BufSrc::Mem(&src), 0, src.len()).unwrap();
        assert_eq!(n, src.len());

        let mut back = Vec::new();
        (&file).seek(SeekFrom::Start(0)).unwrap();
        (&file).read_to_end(&mut back).unwrap();
        assert_eq!(back, src);
    }

    #[test]
    fn test_positioned_descriptor_to_memory() {
        let mut file = tempfile().unwrap();
        let src = pattern(9000);
        file.write_all(&src).unwrap();

        let mut out = vec![0u8; 8000];
        let region = FdRegion::at(file.as_fd(), 1000).retrying();
        let n = copy_buf(&mut BufDst::Mem(&mut out), 0, &BufSrc::Fd(region), 0, 8000).unwrap();
        assert_eq!(n, 8000);
        assert_eq!(out, src[1000..]);
    }

    #[test]
    fn test_descriptor_to_descriptor_bounces_in_chunks() {
        let mut input = tempfile().unwrap();
        let output = tempfile().unwrap();
        let src = pattern(3 * BOUNCE_SIZE + 17);
        input.write_all(&src).unwrap();

        let from = FdRegion::at(input.as_fd(), 0).retrying();
        let to = FdRegion::at(output.as_fd(), 0).retrying();
        let n = copy_buf(&mut BufDst::Fd(to), 0, &BufSrc::Fd(from), 0, src.len()).unwrap();
        assert_eq!(n, src.len());

        let mut back = Vec::new();
        (&output).seek(SeekFrom::Start(0)).unwrap();
        (&output).read_to_end(&mut back).unwrap();
        assert_eq!(back, src);
    }

    #[test]
    fn test_read_past_eof_is_short() {
        let mut file = tempfile().unwrap();
        file.write_all(b"short").unwrap();
        let mut out = vec![0u8; 64];
        let region = FdRegion::at(file.as_fd(), 0).retrying();
        let n = copy_buf(&mut BufDst::Mem(&mut out), 0, &BufSrc::Fd(region), 0, 64).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&out[..5], b"short");
    }

    #[test]
    fn test_error_before_any_byte_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let dir_handle = std::fs::File::open(dir.path()).unwrap();
        let mut out = vec![0u8; 16];
        // Reading a directory descriptor fails with EISDIR
        let region = FdRegion::at(dir_handle.as_fd(), 0);
        let err = copy_buf(&mut BufDst::Mem(&mut out), 0, &BufSrc::Fd(region), 0, 16).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EISDIR));
    }
}
