// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Request and reply layouts.
//!
//! Incoming argument structs decode from an [`ArgReader`] and take the
//! negotiated minor version, because older kernels send shorter structs.
//! Outgoing structs append their native-endian encoding to a `Vec<u8>` and
//! likewise truncate themselves to the compat size the kernel expects.

use crate::decode::{ArgReader, DecodeError};
use std::ffi::OsStr;

pub const IN_HEADER_SIZE: usize = 40;
pub const OUT_HEADER_SIZE: usize = 16;

// INIT capability flags
pub const FUSE_ASYNC_READ: u32 = 1 << 0;
pub const FUSE_POSIX_LOCKS: u32 = 1 << 1;
pub const FUSE_ATOMIC_O_TRUNC: u32 = 1 << 3;
pub const FUSE_EXPORT_SUPPORT: u32 = 1 << 4;
pub const FUSE_BIG_WRITES: u32 = 1 << 5;
pub const FUSE_DONT_MASK: u32 = 1 << 6;
pub const FUSE_SPLICE_WRITE: u32 = 1 << 7;
pub const FUSE_SPLICE_MOVE: u32 = 1 << 8;
pub const FUSE_SPLICE_READ: u32 = 1 << 9;
pub const FUSE_FLOCK_LOCKS: u32 = 1 << 10;
pub const FUSE_AUTO_INVAL_DATA: u32 = 1 << 12;
pub const FUSE_DO_READDIRPLUS: u32 = 1 << 13;
pub const FUSE_ASYNC_DIO: u32 = 1 << 15;
pub const FUSE_WRITEBACK_CACHE: u32 = 1 << 16;
pub const FUSE_PARALLEL_DIROPS: u32 = 1 << 18;
pub const FUSE_MAX_PAGES: u32 = 1 << 22;

// SETATTR valid bits
pub const FATTR_MODE: u32 = 1 << 0;
pub const FATTR_UID: u32 = 1 << 1;
pub const FATTR_GID: u32 = 1 << 2;
pub const FATTR_SIZE: u32 = 1 << 3;
pub const FATTR_ATIME: u32 = 1 << 4;
pub const FATTR_MTIME: u32 = 1 << 5;
pub const FATTR_FH: u32 = 1 << 6;
pub const FATTR_ATIME_NOW: u32 = 1 << 7;
pub const FATTR_MTIME_NOW: u32 = 1 << 8;
pub const FATTR_LOCKOWNER: u32 = 1 << 9;
pub const FATTR_CTIME: u32 = 1 << 10;

// OPEN reply flags
pub const FOPEN_DIRECT_IO: u32 = 1 << 0;
pub const FOPEN_KEEP_CACHE: u32 = 1 << 1;
pub const FOPEN_NONSEEKABLE: u32 = 1 << 2;
pub const FOPEN_CACHE_DIR: u32 = 1 << 3;

pub const FUSE_GETATTR_FH: u32 = 1 << 0;
pub const FUSE_RELEASE_FLUSH: u32 = 1 << 0;
pub const FUSE_WRITE_LOCKOWNER: u32 = 1 << 1;
pub const FUSE_READ_LOCKOWNER: u32 = 1 << 1;

pub const INIT_OUT_SIZE: usize = 64;
pub const COMPAT_INIT_OUT_SIZE: usize = 8;
pub const COMPAT_22_INIT_OUT_SIZE: usize = 24;
pub const ATTR_SIZE: usize = 88;
pub const COMPAT_ATTR_SIZE: usize = 80;
pub const ENTRY_OUT_SIZE: usize = 128;
pub const COMPAT_ENTRY_OUT_SIZE: usize = 120;
pub const ATTR_OUT_SIZE: usize = 104;
pub const COMPAT_ATTR_OUT_SIZE: usize = 96;

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_ne_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_ne_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_ne_bytes());
}

/// Fixed header preceding every kernel request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InHeader {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

impl InHeader {
    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = ArgReader::new(buf);
        let header = Self {
            len: r.u32()?,
            opcode: r.u32()?,
            unique: r.u64()?,
            nodeid: r.u64()?,
            uid: r.u32()?,
            gid: r.u32()?,
            pid: r.u32()?,
        };
        r.skip(4)?;
        Ok(header)
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.len);
        put_u32(out, self.opcode);
        put_u64(out, self.unique);
        put_u64(out, self.nodeid);
        put_u32(out, self.uid);
        put_u32(out, self.gid);
        put_u32(out, self.pid);
        put_u32(out, 0);
    }
}

/// Header preceding every reply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutHeader {
    pub len: u32,
    pub error: i32,
    pub unique: u64,
}

impl OutHeader {
    pub fn to_bytes(&self) -> [u8; OUT_HEADER_SIZE] {
        let mut out = [0u8; OUT_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.len.to_ne_bytes());
        out[4..8].copy_from_slice(&self.error.to_ne_bytes());
        out[8..16].copy_from_slice(&self.unique.to_ne_bytes());
        out
    }

    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut r = ArgReader::new(buf);
        Ok(Self {
            len: r.u32()?,
            error: r.u32()? as i32,
            unique: r.u64()?,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InitIn {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
}

impl InitIn {
    pub fn decode(r: &mut ArgReader<'_>) -> Result<Self, DecodeError> {
        let major = r.u32()?;
        let minor = r.u32()?;
        // Kernels before 7.6 stop after the version pair
        let (max_readahead, flags) = if r.remaining() >= 8 {
            (r.u32()?, r.u32()?)
        } else {
            (0, 0)
        };
        Ok(Self {
            major,
            minor,
            max_readahead,
            flags,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InitOut {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
    pub max_background: u16,
    pub congestion_threshold: u16,
    pub max_write: u32,
    pub time_gran: u32,
    pub max_pages: u16,
}

impl InitOut {
    /// Full 64-byte encoding; callers pick the prefix with [`InitOut::reply_size`].
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.major);
        put_u32(out, self.minor);
        put_u32(out, self.max_readahead);
        put_u32(out, self.flags);
        put_u16(out, self.max_background);
        put_u16(out, self.congestion_threshold);
        put_u32(out, self.max_write);
        put_u32(out, self.time_gran);
        put_u16(out, self.max_pages);
        put_u16(out, 0); // map_alignment
        put_u32(out, 0); // flags2
        out.extend_from_slice(&[0u8; 28]);
    }

    pub fn reply_size(kernel_minor: u32) -> usize {
        if kernel_minor < 5 {
            COMPAT_INIT_OUT_SIZE
        } else if kernel_minor < 23 {
            COMPAT_22_INIT_OUT_SIZE
        } else {
            INIT_OUT_SIZE
        }
    }
}

/// Attribute block shared by entry and attr replies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Attr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
}

impl Attr {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u64(out, self.ino);
        put_u64(out, self.size);
        put_u64(out, self.blocks);
        put_u64(out, self.atime);
        put_u64(out, self.mtime);
        put_u64(out, self.ctime);
        put_u32(out, self.atimensec);
        put_u32(out, self.mtimensec);
        put_u32(out, self.ctimensec);
        put_u32(out, self.mode);
        put_u32(out, self.nlink);
        put_u32(out, self.uid);
        put_u32(out, self.gid);
        put_u32(out, self.rdev);
        put_u32(out, self.blksize);
        put_u32(out, 0);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EntryOut {
    pub nodeid: u64,
    pub generation: u64,
    pub entry_valid: u64,
    pub attr_valid: u64,
    pub entry_valid_nsec: u32,
    pub attr_valid_nsec: u32,
    pub attr: Attr,
}

impl EntryOut {
    pub fn encode(&self, out: &mut Vec<u8>, minor: u32) {
        let start = out.len();
        put_u64(out, self.nodeid);
        put_u64(out, self.generation);
        put_u64(out, self.entry_valid);
        put_u64(out, self.attr_valid);
        put_u32(out, self.entry_valid_nsec);
        put_u32(out, self.attr_valid_nsec);
        self.attr.encode(out);
        if minor < 9 {
            out.truncate(start + COMPAT_ENTRY_OUT_SIZE);
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttrOut {
    pub attr_valid: u64,
    pub attr_valid_nsec: u32,
    pub attr: Attr,
}

impl AttrOut {
    pub fn encode(&self, out: &mut Vec<u8>, minor: u32) {
        let start = out.len();
        put_u64(out, self.attr_valid);
        put_u32(out, self.attr_valid_nsec);
        put_u32(out, 0);
        self.attr.encode(out);
        if minor < 9 {
            out.truncate(start + COMPAT_ATTR_OUT_SIZE);
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenOut {
    pub fh: u64,
    pub open_flags: u32,
}

impl OpenOut {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u64(out, self.fh);
        put_u32(out, self.open_flags);
        put_u32(out, 0);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteOut {
    pub size: u32,
}

impl WriteOut {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_u32(out, self.size);
        put_u32(out, 0);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ForgetIn {
    pub nlookup: u64,
}

impl ForgetIn {
    pub fn decode(r: &mut ArgReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self { nlookup: r.u64()? })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GetattrIn {
    pub getattr_flags: u32,
    pub fh: u64,
}

impl GetattrIn {
    pub fn decode(r: &mut ArgReader<'_>, minor: u32) -> Result<Self, DecodeError> {
        if minor < 9 {
            return Ok(Self::default());
        }
        let getattr_flags = r.u32()?;
        r.skip(4)?;
        Ok(Self {
            getattr_flags,
            fh: r.u64()?,
        })
    }

    pub fn fh(&self) -> Option<u64> {
        (self.getattr_flags & FUSE_GETATTR_FH != 0).then_some(self.fh)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetattrIn {
    pub valid: u32,
    pub fh: u64,
    pub size: u64,
    pub lock_owner: u64,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub atimensec: u32,
    pub mtimensec: u32,
    pub ctimensec: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl SetattrIn {
    pub fn decode(r: &mut ArgReader<'_>) -> Result<Self, DecodeError> {
        let valid = r.u32()?;
        r.skip(4)?;
        let fh = r.u64()?;
        let size = r.u64()?;
        let lock_owner = r.u64()?;
        let atime = r.u64()?;
        let mtime = r.u64()?;
        let ctime = r.u64()?;
        let atimensec = r.u32()?;
        let mtimensec = r.u32()?;
        let ctimensec = r.u32()?;
        let mode = r.u32()?;
        r.skip(4)?;
        let uid = r.u32()?;
        let gid = r.u32()?;
        r.skip(4)?;
        Ok(Self {
            valid,
            fh,
            size,
            lock_owner,
            atime,
            mtime,
            ctime,
            atimensec,
            mtimensec,
            ctimensec,
            mode,
            uid,
            gid,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenIn {
    pub flags: u32,
}

impl OpenIn {
    pub fn decode(r: &mut ArgReader<'_>) -> Result<Self, DecodeError> {
        let flags = r.u32()?;
        r.skip(4)?;
        Ok(Self { flags })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CreateIn {
    pub flags: u32,
    pub mode: u32,
    pub umask: u32,
}

impl CreateIn {
    /// Decode the fixed part; the file name follows.
    pub fn decode(r: &mut ArgReader<'_>, minor: u32) -> Result<Self, DecodeError> {
        let flags = r.u32()?;
        let mode = r.u32()?;
        if minor < 12 {
            return Ok(Self {
                flags,
                mode,
                umask: 0,
            });
        }
        let umask = r.u32()?;
        r.skip(4)?;
        Ok(Self { flags, mode, umask })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MkdirIn {
    pub mode: u32,
    pub umask: u32,
}

impl MkdirIn {
    pub fn decode(r: &mut ArgReader<'_>, minor: u32) -> Result<Self, DecodeError> {
        let mode = r.u32()?;
        let umask = r.u32()?;
        Ok(Self {
            mode,
            umask: if minor >= 12 { umask } else { 0 },
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReleaseIn {
    pub fh: u64,
    pub flags: u32,
    pub release_flags: u32,
    pub lock_owner: u64,
}

impl ReleaseIn {
    pub fn decode(r: &mut ArgReader<'_>, minor: u32) -> Result<Self, DecodeError> {
        let fh = r.u64()?;
        let flags = r.u32()?;
        let release_flags = r.u32()?;
        let lock_owner = if minor >= 8 { r.u64()? } else { 0 };
        Ok(Self {
            fh,
            flags,
            release_flags,
            lock_owner,
        })
    }

    pub fn flush(&self) -> bool {
        self.release_flags & FUSE_RELEASE_FLUSH != 0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushIn {
    pub fh: u64,
    pub lock_owner: u64,
}

impl FlushIn {
    pub fn decode(r: &mut ArgReader<'_>) -> Result<Self, DecodeError> {
        let fh = r.u64()?;
        r.skip(8)?;
        Ok(Self {
            fh,
            lock_owner: r.u64()?,
        })
    }
}

/// Shared shape of READ, READDIR and WRITE arguments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IoIn {
    pub fh: u64,
    pub offset: u64,
    pub size: u32,
    pub io_flags: u32,
    pub lock_owner: u64,
    pub flags: u32,
}

impl IoIn {
    pub fn decode(r: &mut ArgReader<'_>, minor: u32) -> Result<Self, DecodeError> {
        let fh = r.u64()?;
        let offset = r.u64()?;
        let size = r.u32()?;
        let io_flags = r.u32()?;
        if minor < 9 {
            return Ok(Self {
                fh,
                offset,
                size,
                io_flags,
                lock_owner: 0,
                flags: 0,
            });
        }
        let lock_owner = r.u64()?;
        let flags = r.u32()?;
        r.skip(4)?;
        Ok(Self {
            fh,
            offset,
            size,
            io_flags,
            lock_owner,
            flags,
        })
    }
}

pub type ReadIn = IoIn;

/// WRITE arguments followed by the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteIn<'a> {
    pub io: IoIn,
    pub data: &'a [u8],
}

impl<'a> WriteIn<'a> {
    pub fn decode(r: &mut ArgReader<'a>, minor: u32) -> Result<Self, DecodeError> {
        let io = IoIn::decode(r, minor)?;
        let data = r.bytes(io.size as usize)?;
        Ok(Self { io, data })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenameIn<'a> {
    pub newdir: u64,
    pub name: &'a OsStr,
    pub newname: &'a OsStr,
}

impl<'a> RenameIn<'a> {
    pub fn decode(r: &mut ArgReader<'a>) -> Result<Self, DecodeError> {
        let newdir = r.u64()?;
        let name = r.name()?;
        let newname = r.name()?;
        Ok(Self {
            newdir,
            name,
            newname,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InterruptIn {
    pub unique: u64,
}

impl InterruptIn {
    pub fn decode(r: &mut ArgReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self { unique: r.u64()? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_ne_bytes()).collect()
    }

    #[test]
    fn test_in_header_layout() {
        let header = InHeader {
            len: 56,
            opcode: 1,
            unique: 9,
            nodeid: 1,
            uid: 1000,
            gid: 100,
            pid: 4242,
        };
        let mut buf = Vec::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), IN_HEADER_SIZE);
        assert_eq!(&buf[8..16], &9u64.to_ne_bytes());
        assert_eq!(InHeader::parse(&buf).unwrap(), header);
    }

    #[test]
    fn test_init_out_reply_size_follows_minor() {
        assert_eq!(InitOut::reply_size(4), 8);
        assert_eq!(InitOut::reply_size(22), 24);
        assert_eq!(InitOut::reply_size(31), 64);

        let mut buf = Vec::new();
        InitOut::default().encode(&mut buf);
        assert_eq!(buf.len(), INIT_OUT_SIZE);
    }

    #[test]
    fn test_entry_and_attr_use_compat_sizes_on_old_kernels() {
        let entry = EntryOut::default();
        let mut modern = Vec::new();
        entry.encode(&mut modern, 31);
        assert_eq!(modern.len(), ENTRY_OUT_SIZE);

        let mut legacy = Vec::new();
        entry.encode(&mut legacy, 8);
        assert_eq!(legacy.len(), COMPAT_ENTRY_OUT_SIZE);

        let mut attr = Vec::new();
        AttrOut::default().encode(&mut attr, 8);
        assert_eq!(attr.len(), COMPAT_ATTR_OUT_SIZE);
    }

    #[test]
    fn test_write_in_compat_layout_has_no_lock_owner() {
        let mut data = Vec::new();
        data.extend_from_slice(&3u64.to_ne_bytes()); // fh
        data.extend_from_slice(&100u64.to_ne_bytes()); // offset
        data.extend_from_slice(&words(&[5, 0]));
        data.extend_from_slice(b"hello");

        let mut r = ArgReader::new(&data);
        let write = WriteIn::decode(&mut r, 8).unwrap();
        assert_eq!(write.io.fh, 3);
        assert_eq!(write.io.offset, 100);
        assert_eq!(write.data, b"hello");
    }

    #[test]
    fn test_create_in_name_offset_depends_on_minor() {
        let mut legacy = words(&[0o2, 0o644]);
        legacy.extend_from_slice(b"file\0");
        let mut r = ArgReader::new(&legacy);
        let create = CreateIn::decode(&mut r, 11).unwrap();
        assert_eq!(create.mode, 0o644);
        assert_eq!(r.name().unwrap(), "file");

        let mut modern = words(&[0o2, 0o644, 0o022, 0]);
        modern.extend_from_slice(b"file\0");
        let mut r = ArgReader::new(&modern);
        let create = CreateIn::decode(&mut r, 31).unwrap();
        assert_eq!(create.umask, 0o022);
        assert_eq!(r.name().unwrap(), "file");
    }

    #[test]
    fn test_getattr_fh_only_when_flagged() {
        let mut data = words(&[FUSE_GETATTR_FH, 0]);
        data.extend_from_slice(&77u64.to_ne_bytes());
        let mut r = ArgReader::new(&data);
        assert_eq!(GetattrIn::decode(&mut r, 31).unwrap().fh(), Some(77));

        let mut r = ArgReader::new(&[]);
        assert_eq!(GetattrIn::decode(&mut r, 8).unwrap().fh(), None);
    }
}
