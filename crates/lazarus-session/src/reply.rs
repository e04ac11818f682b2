// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use crate::buffer::{copy_buf, BufDst, BufSrc};
use crate::filesystem::FileInfo;
use crate::request::Request;
use lazarus_proto::{Attr, AttrOut, EntryOut, OpenOut, WriteOut};
use std::time::Duration;

/// Answer to a name lookup (LOOKUP, MKDIR, CREATE).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryParam {
    /// Node id handed to the kernel; 0 means a cacheable negative entry
    pub ino: u64,
    pub generation: u64,
    pub attr: Attr,
    pub attr_timeout: Duration,
    pub entry_timeout: Duration,
}

impl EntryParam {
    fn to_wire(&self) -> EntryOut {
        EntryOut {
            nodeid: self.ino,
            generation: self.generation,
            entry_valid: self.entry_timeout.as_secs(),
            attr_valid: self.attr_timeout.as_secs(),
            entry_valid_nsec: self.entry_timeout.subsec_nanos(),
            attr_valid_nsec: self.attr_timeout.subsec_nanos(),
            attr: self.attr,
        }
    }
}

/// Convert a `stat` result into the wire attribute block.
pub fn attr_from_stat(st: &libc::stat) -> Attr {
    Attr {
        ino: st.st_ino as u64,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: st.st_atime as u64,
        mtime: st.st_mtime as u64,
        ctime: st.st_ctime as u64,
        atimensec: st.st_atime_nsec as u32,
        mtimensec: st.st_mtime_nsec as u32,
        ctimensec: st.st_ctime_nsec as u32,
        mode: st.st_mode as u32,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
    }
}

impl Request {
    /// Reply with an errno; 0 is a bare success.
    pub fn reply_error(mut self, errno: i32) {
        self.send(-errno, &[]);
    }

    pub fn reply_ok(mut self) {
        self.send(0, &[]);
    }

    /// Finish without writing anything (FORGET).
    pub fn reply_none(mut self) {
        self.finish_silently();
    }

    pub fn reply_entry(mut self, entry: &EntryParam) {
        let minor = self.proto_minor();
        // Before 7.4 a zero node id was not a valid negative entry
        if entry.ino == 0 && minor < 4 {
            self.send(-libc::ENOENT, &[]);
            return;
        }
        let mut payload = Vec::with_capacity(128);
        entry.to_wire().encode(&mut payload, minor);
        self.send(0, &payload);
    }

    pub fn reply_attr(mut self, attr: &Attr, timeout: Duration) {
        let minor = self.proto_minor();
        let out = AttrOut {
            attr_valid: timeout.as_secs(),
            attr_valid_nsec: timeout.subsec_nanos(),
            attr: *attr,
        };
        let mut payload = Vec::with_capacity(104);
        out.encode(&mut payload, minor);
        self.send(0, &payload);
    }

    pub fn reply_open(mut self, info: &FileInfo) {
        let mut payload = Vec::with_capacity(16);
        OpenOut {
            fh: info.fh,
            open_flags: info.open_flags(),
        }
        .encode(&mut payload);
        self.send(0, &payload);
    }

    pub fn reply_create(mut self, entry: &EntryParam, info: &FileInfo) {
        let minor = self.proto_minor();
        let mut payload = Vec::with_capacity(144);
        entry.to_wire().encode(&mut payload, minor);
        OpenOut {
            fh: info.fh,
            open_flags: info.open_flags(),
        }
        .encode(&mut payload);
        self.send(0, &payload);
    }

    /// Raw payload, e.g. an encoded directory listing.
    pub fn reply_data(mut self, data: &[u8]) {
        self.send(0, data);
    }

    /// Copy up to `size` bytes out of `src` and send them as READ data.
    pub fn reply_read(mut self, src: BufSrc<'_>, size: usize) {
        let mut data = Vec::new();
        if data.try_reserve_exact(size).is_err() {
            self.send(-libc::ENOMEM, &[]);
            return;
        }
        data.resize(size, 0);
        match copy_buf(&mut BufDst::Mem(&mut data), 0, &src, 0, size) {
            Ok(n) => self.send(0, &data[..n]),
            Err(e) => self.send(-e.raw_os_error().unwrap_or(libc::EIO), &[]),
        }
    }

    /// Copy `size` bytes from `src` into `dst` and report the count written.
    pub fn reply_write(mut self, mut dst: BufDst<'_>, src: BufSrc<'_>, size: usize) {
        match copy_buf(&mut dst, 0, &src, 0, size) {
            Ok(n) => {
                let mut payload = Vec::with_capacity(8);
                WriteOut { size: n as u32 }.encode(&mut payload);
                self.send(0, &payload);
            }
            Err(e) => self.send(-e.raw_os_error().unwrap_or(libc::EIO), &[]),
        }
    }
}
