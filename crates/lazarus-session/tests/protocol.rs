// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Protocol-level tests driving a session over a socket pair that stands in
//! for the kernel side of `/dev/fuse`.

use lazarus_proto::{
    InHeader, Opcode, OutHeader, FUSE_BIG_WRITES, FUSE_MAX_PAGES, IN_HEADER_SIZE, OUT_HEADER_SIZE,
};
use lazarus_session::{
    Channel, ConnectionInfo, EntryParam, Filesystem, MemorySnapshotStore, Request,
    Session, SessionConfig, SessionState,
};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use std::ffi::OsStr;
use std::io::{self, Read};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const OWNER: u32 = 1000;

#[derive(Default)]
struct Recorder {
    destroyed: AtomicUsize,
    lookups: Mutex<Vec<(u64, String)>>,
    held: Mutex<Vec<Request>>,
}

impl Filesystem for Recorder {
    fn init(&self, conn: &mut ConnectionInfo) {
        conn.want |= conn.capable & FUSE_BIG_WRITES;
    }

    fn destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn lookup(&self, req: Request, parent: u64, name: &OsStr) {
        let name = name.to_string_lossy().into_owned();
        self.lookups.lock().expect("lookups lock").push((parent, name.clone()));
        match name.as_str() {
            "held" => self.held.lock().expect("held lock").push(req),
            "dropped" => drop(req),
            _ => req.reply_entry(&EntryParam {
                ino: 42,
                generation: 1,
                attr_timeout: Duration::from_secs(1),
                entry_timeout: Duration::from_secs(1),
                ..EntryParam::default()
            }),
        }
    }
}

struct Harness {
    fs: Arc<Recorder>,
    session: Arc<Session>,
    channel: Arc<Channel>,
    kernel: UnixStream,
}

impl Harness {
    fn new(config: SessionConfig) -> Self {
        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .expect("failed to create socket pair");
        let fs = Arc::new(Recorder::default());
        let session = Arc::new(Session::new(fs.clone(), config).with_owner(OWNER));
        session
            .attach(Channel::from_fd(ours))
            .expect("failed to attach channel");
        let channel = session.channel().expect("channel attached");
        let kernel = UnixStream::from(theirs);
        kernel
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("failed to set read timeout");
        Self {
            fs,
            session,
            channel,
            kernel,
        }
    }

    fn send(&self, opcode: u32, unique: u64, nodeid: u64, uid: u32, args: &[u8]) {
        let header = InHeader {
            len: (IN_HEADER_SIZE + args.len()) as u32,
            opcode,
            unique,
            nodeid,
            uid,
            gid: uid,
            pid: 4242,
        };
        let mut buf = Vec::with_capacity(header.len as usize);
        header.encode(&mut buf);
        buf.extend_from_slice(args);
        self.session.process(&self.channel, &buf);
    }

    fn reply(&mut self) -> (OutHeader, Vec<u8>) {
        let mut buf = vec![0u8; 4096];
        let n = self.kernel.read(&mut buf).expect("expected a reply");
        let header = OutHeader::parse(&buf[..n]).expect("reply header");
        assert_eq!(header.len as usize, n, "reply length must match header");
        (header, buf[OUT_HEADER_SIZE..n].to_vec())
    }

    fn assert_no_reply(&mut self) {
        self.kernel
            .set_nonblocking(true)
            .expect("failed to switch to non-blocking");
        let mut buf = [0u8; 256];
        let err = self
            .kernel
            .read(&mut buf)
            .expect_err("no reply should have been written");
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        self.kernel
            .set_nonblocking(false)
            .expect("failed to switch back to blocking");
    }

    fn init(&mut self, major: u32, minor: u32, flags: u32) -> (OutHeader, Vec<u8>) {
        self.send(
            Opcode::Init as u32,
            1,
            0,
            0,
            &init_args(major, minor, 128 * 1024, flags),
        );
        self.reply()
    }
}

fn init_args(major: u32, minor: u32, max_readahead: u32, flags: u32) -> Vec<u8> {
    let mut args = Vec::new();
    for value in [major, minor, max_readahead, flags] {
        args.extend_from_slice(&value.to_ne_bytes());
    }
    args
}

fn name_arg(name: &str) -> Vec<u8> {
    let mut args = name.as_bytes().to_vec();
    args.push(0);
    args
}

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes(buf[offset..offset + 4].try_into().expect("4 bytes"))
}

fn u64_at(buf: &[u8], offset: usize) -> u64 {
    u64::from_ne_bytes(buf[offset..offset + 8].try_into().expect("8 bytes"))
}

#[test]
fn init_negotiates_and_activates_session() {
    let mut h = Harness::new(SessionConfig::default());
    let (header, body) = h.init(7, 31, FUSE_MAX_PAGES | FUSE_BIG_WRITES);

    assert_eq!(header.error, 0);
    assert_eq!(header.unique, 1);
    assert_eq!(body.len(), 64);
    assert_eq!(u32_at(&body, 0), 7);
    assert_eq!(u32_at(&body, 4), 31);
    let flags = u32_at(&body, 12);
    assert_ne!(flags & FUSE_BIG_WRITES, 0);
    assert_ne!(flags & FUSE_MAX_PAGES, 0);

    assert_eq!(h.session.state(), SessionState::Active);
    let conn = h.session.connection();
    assert_eq!(conn.proto_major, 7);
    assert_eq!(conn.proto_minor, 31);
    assert_eq!(conn.want & FUSE_BIG_WRITES, FUSE_BIG_WRITES);
}

#[test]
fn init_reply_is_truncated_for_old_kernels() {
    let mut h = Harness::new(SessionConfig::default());
    let (header, body) = h.init(7, 22, 0);
    assert_eq!(header.error, 0);
    assert_eq!(body.len(), 24);

    let mut h = Harness::new(SessionConfig::default());
    let (_, body) = h.init(7, 4, 0);
    assert_eq!(body.len(), 8);
}

#[test]
fn requests_before_init_are_rejected() {
    let mut h = Harness::new(SessionConfig::default());
    h.send(Opcode::Lookup as u32, 5, 1, OWNER, &name_arg("a"));
    let (header, _) = h.reply();
    assert_eq!(header.unique, 5);
    assert_eq!(header.error, -libc::EIO);
    assert!(h.fs.lookups.lock().expect("lookups lock").is_empty());
}

#[test]
fn second_init_is_rejected() {
    let mut h = Harness::new(SessionConfig::default());
    h.init(7, 31, 0);
    let (header, _) = h.init(7, 31, 0);
    assert_eq!(header.error, -libc::EIO);
    assert_eq!(h.session.state(), SessionState::Active);
}

#[test]
fn older_major_fails_the_session() {
    let mut h = Harness::new(SessionConfig::default());
    let (header, body) = h.init(6, 0, 0);
    assert_eq!(header.error, -libc::EPROTO);
    assert!(body.is_empty());
    assert!(h.session.exited());
    assert_eq!(h.session.error(), -libc::EPROTO);
    assert!(!h.session.is_inited());
}

#[test]
fn newer_major_gets_our_version_without_activating() {
    let mut h = Harness::new(SessionConfig::default());
    let (header, body) = h.init(8, 0, 0);
    assert_eq!(header.error, 0);
    assert_eq!(u32_at(&body, 0), 7);
    assert_eq!(u32_at(&body, 4), 31);
    assert_eq!(h.session.state(), SessionState::Mounted);

    let (header, _) = h.init(7, 31, 0);
    assert_eq!(header.error, 0);
    assert_eq!(h.session.state(), SessionState::Active);
}

#[test]
fn foreign_callers_get_eacces() {
    let mut h = Harness::new(SessionConfig::default());
    h.init(7, 31, 0);

    h.send(Opcode::Lookup as u32, 10, 1, OWNER + 1, &name_arg("a"));
    assert_eq!(h.reply().0.error, -libc::EACCES);

    h.send(Opcode::Lookup as u32, 11, 1, 0, &name_arg("a"));
    assert_eq!(h.reply().0.error, 0);
}

#[test]
fn allow_other_admits_foreign_callers() {
    let config = SessionConfig {
        allow_other: true,
        ..SessionConfig::default()
    };
    let mut h = Harness::new(config);
    h.init(7, 31, 0);
    h.send(Opcode::Lookup as u32, 10, 1, OWNER + 7, &name_arg("a"));
    assert_eq!(h.reply().0.error, 0);
}

#[test]
fn unsupported_opcodes_get_enosys() {
    let mut h = Harness::new(SessionConfig::default());
    h.init(7, 31, 0);

    h.send(Opcode::Symlink as u32, 20, 1, OWNER, &[]);
    assert_eq!(h.reply().0.error, -libc::ENOSYS);

    h.send(9999, 21, 1, OWNER, &[]);
    assert_eq!(h.reply().0.error, -libc::ENOSYS);

    // Unset table entry
    h.send(Opcode::Getattr as u32, 22, 1, OWNER, &[0u8; 16]);
    assert_eq!(h.reply().0.error, -libc::ENOSYS);
}

#[test]
fn default_open_and_release_succeed() {
    let mut h = Harness::new(SessionConfig::default());
    h.init(7, 31, 0);

    let mut open = Vec::new();
    open.extend_from_slice(&(libc::O_RDONLY as u32).to_ne_bytes());
    open.extend_from_slice(&0u32.to_ne_bytes());
    h.send(Opcode::Open as u32, 30, 5, OWNER, &open);
    let (header, body) = h.reply();
    assert_eq!(header.error, 0);
    assert_eq!(body.len(), 16);

    h.send(Opcode::Release as u32, 31, 5, OWNER, &[0u8; 24]);
    let (header, body) = h.reply();
    assert_eq!(header.error, 0);
    assert!(body.is_empty());

    h.send(Opcode::Forget as u32, 32, 5, OWNER, &1u64.to_ne_bytes());
    h.assert_no_reply();
}

#[test]
fn lookup_entry_size_follows_minor_version() {
    let mut h = Harness::new(SessionConfig::default());
    h.init(7, 31, 0);
    h.send(Opcode::Lookup as u32, 40, 1, OWNER, &name_arg("file"));
    let (header, body) = h.reply();
    assert_eq!(header.error, 0);
    assert_eq!(body.len(), 128);
    assert_eq!(u64_at(&body, 0), 42);
    assert_eq!(
        h.fs.lookups.lock().expect("lookups lock").as_slice(),
        &[(1, "file".to_string())]
    );

    let mut h = Harness::new(SessionConfig::default());
    h.init(7, 8, 0);
    h.send(Opcode::Lookup as u32, 41, 1, OWNER, &name_arg("file"));
    assert_eq!(h.reply().1.len(), 120);
}

#[test]
fn malformed_arguments_get_eio() {
    let mut h = Harness::new(SessionConfig::default());
    h.init(7, 31, 0);
    // Name without its terminator
    h.send(Opcode::Lookup as u32, 50, 1, OWNER, b"abc");
    assert_eq!(h.reply().0.error, -libc::EIO);
    assert_eq!(h.session.outstanding_requests(), 0);
}

#[test]
fn dropped_request_is_answered_eio() {
    let mut h = Harness::new(SessionConfig::default());
    h.init(7, 31, 0);
    h.send(Opcode::Lookup as u32, 60, 1, OWNER, &name_arg("dropped"));
    let (header, _) = h.reply();
    assert_eq!(header.unique, 60);
    assert_eq!(header.error, -libc::EIO);
    assert_eq!(h.session.outstanding_requests(), 0);
}

#[test]
fn interrupt_before_request_cancels_it() {
    let mut h = Harness::new(SessionConfig::default());
    h.init(7, 31, 0);

    h.send(Opcode::Interrupt as u32, 71, 0, OWNER, &70u64.to_ne_bytes());
    assert_eq!(h.session.pending_interrupts(), 1);
    h.assert_no_reply();

    h.send(Opcode::Lookup as u32, 70, 1, OWNER, &name_arg("a"));
    h.assert_no_reply();
    assert_eq!(h.session.pending_interrupts(), 0);
    assert_eq!(h.session.outstanding_requests(), 0);
    assert!(h.fs.lookups.lock().expect("lookups lock").is_empty());
}

#[test]
fn interrupt_after_claim_is_too_late() {
    let mut h = Harness::new(SessionConfig::default());
    h.init(7, 31, 0);

    h.send(Opcode::Lookup as u32, 80, 1, OWNER, &name_arg("held"));
    assert_eq!(h.session.outstanding_requests(), 1);

    h.send(Opcode::Interrupt as u32, 81, 0, OWNER, &80u64.to_ne_bytes());
    h.assert_no_reply();
    assert_eq!(h.session.pending_interrupts(), 0);

    let held = h.fs.held.lock().expect("held lock").pop().expect("held request");
    held.reply_error(libc::ENOENT);
    let (header, _) = h.reply();
    assert_eq!(header.unique, 80);
    assert_eq!(header.error, -libc::ENOENT);
    assert_eq!(h.session.outstanding_requests(), 0);
}

#[test]
fn interrupt_fifo_evicts_oldest_with_eagain() {
    let config = SessionConfig {
        interrupt_queue_capacity: 2,
        ..SessionConfig::default()
    };
    let mut h = Harness::new(config);
    h.init(7, 31, 0);

    h.send(Opcode::Interrupt as u32, 101, 0, OWNER, &900u64.to_ne_bytes());
    h.send(Opcode::Interrupt as u32, 102, 0, OWNER, &901u64.to_ne_bytes());
    h.assert_no_reply();
    h.send(Opcode::Interrupt as u32, 103, 0, OWNER, &902u64.to_ne_bytes());

    let (header, body) = h.reply();
    assert_eq!(header.unique, 101);
    assert_eq!(header.error, -libc::EAGAIN);
    assert!(body.is_empty());
    assert_eq!(h.session.pending_interrupts(), 2);
}

#[test]
fn duplicate_interrupt_is_dropped() {
    let mut h = Harness::new(SessionConfig::default());
    h.init(7, 31, 0);
    h.send(Opcode::Interrupt as u32, 111, 0, OWNER, &500u64.to_ne_bytes());
    h.send(Opcode::Interrupt as u32, 112, 0, OWNER, &500u64.to_ne_bytes());
    assert_eq!(h.session.pending_interrupts(), 1);
    h.assert_no_reply();
}

#[test]
fn destroy_runs_teardown_once() {
    let mut h = Harness::new(SessionConfig::default());
    h.init(7, 31, 0);

    h.send(Opcode::Destroy as u32, 120, 0, OWNER, &[]);
    let (header, _) = h.reply();
    assert_eq!(header.error, 0);
    assert!(h.session.is_destroyed());

    h.session.shutdown();
    assert_eq!(h.fs.destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn shutdown_destroys_an_active_session() {
    let mut h = Harness::new(SessionConfig::default());
    h.init(7, 31, 0);
    h.session.shutdown();
    h.session.shutdown();
    assert_eq!(h.fs.destroyed.load(Ordering::SeqCst), 1);
}

#[test]
fn snapshot_restores_negotiated_state() {
    let store = Arc::new(MemorySnapshotStore::default());

    let mut first = Harness::new(SessionConfig::default());
    first
        .session
        .register_snapshot(store.clone())
        .expect("register snapshot store");
    first.init(7, 26, FUSE_MAX_PAGES);
    let negotiated = first.session.connection();
    let bufsize = first.session.bufsize();

    let mut second = Harness::new(SessionConfig::default());
    second
        .session
        .register_snapshot(store.clone())
        .expect("register snapshot store");
    assert!(second
        .session
        .register_snapshot(Arc::new(MemorySnapshotStore::default()))
        .is_err());
    assert!(second.session.restore().expect("restore"));
    assert_eq!(second.session.connection(), negotiated);
    assert_eq!(second.session.bufsize(), bufsize);
    assert_eq!(second.session.state(), SessionState::Active);

    // The restored session serves requests without a new INIT
    second.send(Opcode::Lookup as u32, 130, 1, OWNER, &name_arg("x"));
    assert_eq!(second.reply().0.error, 0);
}

#[test]
fn restore_without_snapshot_is_a_no_op() {
    let h = Harness::new(SessionConfig::default());
    assert!(!h.session.restore().expect("restore"));
    h.session
        .register_snapshot(Arc::new(MemorySnapshotStore::default()))
        .expect("register snapshot store");
    assert!(!h.session.restore().expect("restore"));
    assert_eq!(h.session.state(), SessionState::Mounted);
}

#[test]
fn receive_reports_closed_peer() {
    let h = Harness::new(SessionConfig::default());
    let Harness {
        session,
        channel,
        kernel,
        ..
    } = h;
    drop(kernel);
    let mut buf = vec![0u8; 8192];
    let received = session.receive(&channel, &mut buf).expect("receive");
    assert_eq!(received, lazarus_session::Received::Closed);
}

#[test]
fn single_loop_serves_until_peer_closes() {
    use std::io::Write;

    let h = Harness::new(SessionConfig::default());
    let Harness {
        session, kernel, ..
    } = h;
    let mut kernel = kernel;

    let runner = Arc::clone(&session);
    let loop_thread = std::thread::spawn(move || lazarus_session::run(&runner));

    let mut init = Vec::new();
    InHeader {
        len: (IN_HEADER_SIZE + 16) as u32,
        opcode: Opcode::Init as u32,
        unique: 1,
        ..InHeader::default()
    }
    .encode(&mut init);
    init.extend_from_slice(&init_args(7, 31, 65536, 0));
    kernel.write_all(&init).expect("send INIT");

    let mut buf = vec![0u8; 4096];
    let n = kernel.read(&mut buf).expect("INIT reply");
    let header = OutHeader::parse(&buf[..n]).expect("reply header");
    assert_eq!(header.error, 0);
    assert_eq!(n, OUT_HEADER_SIZE + 64);

    drop(kernel);
    loop_thread
        .join()
        .expect("loop thread panicked")
        .expect("loop result");
    assert!(session.is_inited());
}
