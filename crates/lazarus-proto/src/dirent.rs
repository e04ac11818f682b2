// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

/// Offset of the name within a directory entry record
pub const NAME_OFFSET: usize = 24;

fn align8(len: usize) -> usize {
    (len + 7) & !7
}

/// Size-bounded buffer of kernel directory entry records.
///
/// Each record is `ino`, `off` (the cookie for the *next* entry), `namelen`,
/// `type` and the name, padded with zeroes to an 8-byte boundary.
pub struct DirentBuf {
    data: Vec<u8>,
    max: usize,
}

impl DirentBuf {
    pub fn new(max: usize) -> Self {
        Self {
            data: Vec::with_capacity(max.min(64 * 1024)),
            max,
        }
    }

    /// Record size for a name of `len` bytes.
    pub fn entry_size(len: usize) -> usize {
        align8(NAME_OFFSET + len)
    }

    /// Append an entry; returns `false` without writing if it does not fit.
    pub fn push(&mut self, ino: u64, off: u64, mode: u32, name: &OsStr) -> bool {
        let name = name.as_bytes();
        let size = Self::entry_size(name.len());
        if self.data.len() + size > self.max {
            return false;
        }
        let kind = (mode & libc::S_IFMT) >> 12;
        self.data.extend_from_slice(&ino.to_ne_bytes());
        self.data.extend_from_slice(&off.to_ne_bytes());
        self.data.extend_from_slice(&(name.len() as u32).to_ne_bytes());
        self.data.extend_from_slice(&kind.to_ne_bytes());
        self.data.extend_from_slice(name);
        self.data.resize(self.data.len() + size - NAME_OFFSET - name.len(), 0);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_are_padded_to_eight_bytes() {
        let mut buf = DirentBuf::new(4096);
        assert!(buf.push(5, 1, libc::S_IFREG | 0o644, OsStr::new("a")));
        assert_eq!(buf.len(), 32);
        assert!(buf.push(6, 2, libc::S_IFDIR | 0o755, OsStr::new("12345678")));
        assert_eq!(buf.len(), 64);

        let bytes = buf.as_bytes();
        assert_eq!(&bytes[0..8], &5u64.to_ne_bytes());
        assert_eq!(&bytes[16..20], &1u32.to_ne_bytes());
        assert_eq!(&bytes[20..24], &(libc::DT_REG as u32).to_ne_bytes());
        assert_eq!(bytes[24], b'a');
        assert!(bytes[25..32].iter().all(|&b| b == 0));
        assert_eq!(&bytes[52..56], &(libc::DT_DIR as u32).to_ne_bytes());
    }

    #[test]
    fn test_push_refuses_when_full() {
        let mut buf = DirentBuf::new(40);
        assert!(buf.push(1, 1, libc::S_IFREG, OsStr::new("first")));
        assert!(!buf.push(2, 2, libc::S_IFREG, OsStr::new("second")));
        assert_eq!(buf.len(), 32);
    }
}
