// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! INIT negotiation
//!
//! Negotiation is split in two halves around the filesystem's own `init`
//! callback: [`negotiate_limits`] clamps our proposals against what the
//! kernel announced, the filesystem may then adjust `want`, and
//! [`complete_reply`] fills in the remaining reply fields.

use crate::config::ConnectionConfig;
use lazarus_proto::{
    InitIn, InitOut, BUFFER_HEADER_SIZE, DEFAULT_MAX_PAGES_PER_REQ, FUSE_BIG_WRITES,
    FUSE_MAX_PAGES, KERNEL_MINOR_VERSION, KERNEL_VERSION, MAX_MAX_PAGES, MIN_READ_BUFFER,
};
use tracing::warn;

/// Negotiated connection parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub proto_major: u32,
    pub proto_minor: u32,
    /// Capability bits offered by the kernel
    pub capable: u32,
    /// Capability bits requested by the filesystem
    pub want: u32,
    pub max_write: u32,
    pub max_read: u32,
    pub max_readahead: u32,
    pub max_background: u32,
    pub congestion_threshold: u32,
    pub time_gran: u32,
}

impl ConnectionInfo {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            max_write: config.max_write,
            max_read: config.max_read,
            max_readahead: config.max_readahead,
            max_background: config.max_background,
            congestion_threshold: config.congestion_threshold,
            time_gran: config.time_gran,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    Supported,
    /// Kernel speaks an older major; the session cannot continue
    TooOld,
    /// Kernel speaks a newer major; it retries INIT with ours
    TooNew,
}

pub fn check_version(major: u32) -> VersionCheck {
    match major.cmp(&KERNEL_VERSION) {
        std::cmp::Ordering::Less => VersionCheck::TooOld,
        std::cmp::Ordering::Greater => VersionCheck::TooNew,
        std::cmp::Ordering::Equal => VersionCheck::Supported,
    }
}

pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

/// Receive buffer size before negotiation
pub fn default_bufsize() -> usize {
    MAX_MAX_PAGES * page_size() + BUFFER_HEADER_SIZE
}

/// Reply announcing our version and nothing else.
pub fn version_reply() -> InitOut {
    InitOut {
        major: KERNEL_VERSION,
        minor: KERNEL_MINOR_VERSION,
        ..InitOut::default()
    }
}

/// Record the kernel's announcement and clamp our limits against it.
///
/// Returns the new receive buffer size and the partially filled reply.
pub fn negotiate_limits(
    conn: &mut ConnectionInfo,
    arg: &InitIn,
    bufsize: usize,
    page: usize,
) -> (usize, InitOut) {
    conn.proto_major = arg.major;
    conn.proto_minor = arg.minor;
    conn.capable = arg.flags;
    conn.want = 0;

    let mut out = version_reply();
    let mut bufsize = bufsize;

    if arg.minor >= 6 {
        conn.max_readahead = conn.max_readahead.min(arg.max_readahead);
        if arg.flags & FUSE_MAX_PAGES == 0 {
            bufsize = bufsize.min(DEFAULT_MAX_PAGES_PER_REQ * page + BUFFER_HEADER_SIZE);
        }
    } else {
        conn.max_readahead = 0;
    }

    if bufsize < MIN_READ_BUFFER {
        warn!(bufsize, "buffer size too small, raising to minimum");
        bufsize = MIN_READ_BUFFER;
    }

    let body = (bufsize - BUFFER_HEADER_SIZE).min(u32::MAX as usize) as u32;
    if conn.max_write > body {
        conn.max_write = body;
    } else if conn.max_write < body {
        bufsize = (conn.max_write as usize + BUFFER_HEADER_SIZE).max(MIN_READ_BUFFER);
    }

    if arg.minor >= 13 {
        conn.max_background = conn.max_background.min(u16::MAX as u32);
        conn.congestion_threshold = conn.congestion_threshold.min(conn.max_background);
        if conn.congestion_threshold == 0 {
            conn.congestion_threshold = conn.max_background * 3 / 4;
        }
        out.max_background = conn.max_background as u16;
        out.congestion_threshold = conn.congestion_threshold as u16;
    }

    (bufsize, out)
}

/// Capability bits the filesystem asked for that the kernel did not offer.
pub fn unsupported_wants(conn: &ConnectionInfo) -> u32 {
    conn.want & !conn.capable
}

/// Fill in the reply fields that depend on the filesystem's `init`.
pub fn complete_reply(conn: &ConnectionInfo, arg: &InitIn, out: &mut InitOut, page: usize) {
    if arg.flags & FUSE_MAX_PAGES != 0 {
        out.flags |= FUSE_MAX_PAGES;
        let pages = (conn.max_write.max(1) as usize - 1) / page + 1;
        out.max_pages = pages.min(u16::MAX as usize) as u16;
    }
    out.flags |= FUSE_BIG_WRITES | conn.want;
    out.max_write = conn.max_write;
    out.max_readahead = conn.max_readahead;
    if conn.proto_minor >= 23 {
        out.time_gran = conn.time_gran;
    }
}
