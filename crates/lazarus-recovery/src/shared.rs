// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Memory shared between the supervisor and its forked workers

use crate::error::RecoveryResult;
use std::io;
use std::ops::Deref;
use std::ptr::NonNull;

/// A fixed-length array in an anonymous `MAP_SHARED` mapping.
///
/// Created before forking, it stays shared with every child. `T` must be
/// made of atomics (or other types valid to access from several processes);
/// the elements are initialised with `T::default()`.
pub struct SharedMapping<T> {
    ptr: NonNull<T>,
    len: usize,
    bytes: usize,
}

// SAFETY: the mapping behaves like a Box<[T]> whose contents are only
// reachable through &T
unsafe impl<T: Sync> Send for SharedMapping<T> {}
unsafe impl<T: Sync> Sync for SharedMapping<T> {}

impl<T: Default> SharedMapping<T> {
    pub fn new(len: usize) -> RecoveryResult<Self> {
        let bytes = std::mem::size_of::<T>().max(1) * len.max(1);
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        let ptr = NonNull::new(addr as *mut T).ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;
        for i in 0..len {
            // SAFETY: in bounds of a fresh, page-aligned mapping
            unsafe { ptr.as_ptr().add(i).write(T::default()) };
        }
        Ok(Self { ptr, len, bytes })
    }
}

impl<T> Deref for SharedMapping<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: `len` elements were initialised in `new`
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> Drop for SharedMapping<T> {
    fn drop(&mut self) {
        unsafe {
            std::ptr::drop_in_place(std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len));
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.bytes);
        }
    }
}

impl<T> std::fmt::Debug for SharedMapping<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMapping")
            .field("len", &self.len)
            .field("bytes", &self.bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_elements_start_at_default() {
        let mapping: SharedMapping<AtomicU32> = SharedMapping::new(16).unwrap();
        assert_eq!(mapping.len(), 16);
        assert!(mapping.iter().all(|v| v.load(Ordering::Relaxed) == 0));
    }

    #[test]
    fn test_child_writes_are_visible_to_parent() {
        let mapping: SharedMapping<AtomicU32> = SharedMapping::new(2).unwrap();
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                mapping[1].store(77, Ordering::SeqCst);
                unsafe { libc::_exit(0) };
            }
            ForkResult::Parent { child } => {
                let status = waitpid(child, None).unwrap();
                assert_eq!(status, WaitStatus::Exited(child, 0));
                assert_eq!(mapping[1].load(Ordering::SeqCst), 77);
                assert_eq!(mapping[0].load(Ordering::SeqCst), 0);
            }
        }
    }
}
