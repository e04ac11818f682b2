// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Short messages with an optional descriptor attached (SCM_RIGHTS)

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

const FD_SIZE: libc::c_uint = mem::size_of::<RawFd>() as libc::c_uint;

/// Control buffer with room for one descriptor, aligned for `cmsghdr`.
fn control_buffer() -> Vec<u64> {
    let space = unsafe { libc::CMSG_SPACE(FD_SIZE) } as usize;
    vec![0u64; space.div_ceil(mem::size_of::<u64>())]
}

/// Send `payload` as one message, attaching `fd` when given.
pub fn send_with_fd(
    socket: BorrowedFd<'_>,
    payload: &[u8],
    fd: Option<BorrowedFd<'_>>,
) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    let mut control = control_buffer();
    if let Some(fd) = fd {
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(FD_SIZE) } as _;
        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        if cmsg.is_null() {
            return Err(io::Error::other("no room for control message header"));
        }
        unsafe {
            (*cmsg).cmsg_len = libc::CMSG_LEN(FD_SIZE) as _;
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut RawFd, fd.as_raw_fd());
        }
    }

    loop {
        let sent = unsafe { libc::sendmsg(socket.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
        if sent >= 0 {
            return Ok(sent as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Receive one message into `buf`, returning its length and the attached
/// descriptor, if any. Received descriptors are close-on-exec.
///
/// `flags` is passed to recvmsg(2), e.g. `MSG_DONTWAIT`.
pub fn recv_with_fd(
    socket: BorrowedFd<'_>,
    buf: &mut [u8],
    flags: libc::c_int,
) -> io::Result<(usize, Option<OwnedFd>)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut control = control_buffer();
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = (control.len() * mem::size_of::<u64>()) as _;

    let received = loop {
        let n = unsafe {
            libc::recvmsg(
                socket.as_raw_fd(),
                &mut msg,
                flags | libc::MSG_CMSG_CLOEXEC,
            )
        };
        if n >= 0 {
            break n as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };

    let mut attached = None;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        let (level, kind, len) = unsafe { ((*cmsg).cmsg_level, (*cmsg).cmsg_type, (*cmsg).cmsg_len) };
        if level == libc::SOL_SOCKET && kind == libc::SCM_RIGHTS {
            let header = unsafe { libc::CMSG_LEN(0) } as usize;
            let count = (len as usize).saturating_sub(header) / mem::size_of::<RawFd>();
            let data = unsafe { libc::CMSG_DATA(cmsg) } as *const RawFd;
            for i in 0..count {
                let raw = unsafe { std::ptr::read_unaligned(data.add(i)) };
                // SAFETY: the kernel installed this descriptor for us
                let owned = unsafe { OwnedFd::from_raw_fd(raw) };
                if attached.is_none() {
                    attached = Some(owned);
                }
            }
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
    }

    Ok((received, attached))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::AsFd;

    fn pair() -> (OwnedFd, OwnedFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap()
    }

    #[test]
    fn test_descriptor_travels_with_message() {
        let (a, b) = pair();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"mirrored").unwrap();

        send_with_fd(a.as_fd(), b"open/7", Some(file.as_fd())).unwrap();

        let mut buf = [0u8; 64];
        let (n, fd) = recv_with_fd(b.as_fd(), &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"open/7");
        let fd = fd.expect("descriptor attached");
        assert_ne!(fd.as_raw_fd(), file.as_raw_fd());

        let mut received = std::fs::File::from(fd);
        received.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = String::new();
        received.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "mirrored");
    }

    #[test]
    fn test_message_without_descriptor() {
        let (a, b) = pair();
        send_with_fd(a.as_fd(), b"close/3", None).unwrap();
        let mut buf = [0u8; 64];
        let (n, fd) = recv_with_fd(b.as_fd(), &mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"close/3");
        assert!(fd.is_none());
    }

    #[test]
    fn test_nonblocking_receive_on_empty_socket() {
        let (_a, b) = pair();
        let mut buf = [0u8; 16];
        let err = recv_with_fd(b.as_fd(), &mut buf, libc::MSG_DONTWAIT).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}
