// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Crash-and-restart scenarios with real forked workers.

use lazarus_proto::{InHeader, Opcode, IN_HEADER_SIZE};
use lazarus_recovery::{
    mirror_channel, MirrorReceiver, MirrorSender, RecoveryError, RecoveryHandlers,
    RecoveryResult, ResourceKind, SharedMapping, ShutdownSignal, SlotRegistry, Supervisor,
};
use lazarus_session::{Channel, ConnectionInfo, Filesystem, Session, SessionConfig};
use nix::sys::signal::{raise, Signal};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

#[derive(Default)]
struct Plain {
    inits: AtomicUsize,
    destroys: AtomicUsize,
}

impl Filesystem for Plain {
    fn init(&self, _conn: &mut ConnectionInfo) {
        self.inits.fetch_add(1, Ordering::SeqCst);
    }

    fn destroy(&self) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
    }
}

/// Handler state modelled on a real filesystem: one slot table whose
/// descriptors are mirrored to the supervisor.
#[derive(Default)]
struct Mirrored {
    table: OnceLock<SlotRegistry<()>>,
    sender: OnceLock<MirrorSender>,
    receiver: OnceLock<Mutex<MirrorReceiver>>,
    inits: AtomicUsize,
    recoveries: AtomicUsize,
    destroys: AtomicUsize,
}

impl Mirrored {
    fn table(&self) -> &SlotRegistry<()> {
        self.table.get().expect("table initialised")
    }

    fn drain(&self) {
        let receiver = self.receiver.get().expect("receiver initialised");
        let receiver = receiver.lock().expect("receiver lock");
        receiver
            .drain(|message, fd| {
                self.table().apply(message, fd).expect("apply mirror message");
            })
            .expect("drain mirror channel");
    }
}

impl RecoveryHandlers for Mirrored {
    fn init(&self) -> RecoveryResult<()> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mirror_channel()?;
        let table = SlotRegistry::new("files", 8, 0)?;
        self.table
            .set(table)
            .map_err(|_| RecoveryError::Init("table already set".into()))?;
        self.sender
            .set(tx)
            .map_err(|_| RecoveryError::Init("sender already set".into()))?;
        self.receiver
            .set(Mutex::new(rx))
            .map_err(|_| RecoveryError::Init("receiver already set".into()))?;
        Ok(())
    }

    fn destroy(&self) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        if let Some(table) = self.table.get() {
            table.close_all_backups();
        }
    }

    fn notify_routine(&self, shutdown: &ShutdownSignal) {
        let receiver = self.receiver.get().expect("receiver initialised");
        while !shutdown.is_triggered() {
            let ready = receiver
                .lock()
                .expect("receiver lock")
                .wait(Duration::from_millis(20))
                .unwrap_or(false);
            if ready {
                self.drain();
            }
        }
    }

    fn recover(&self) -> RecoveryResult<()> {
        self.recoveries.fetch_add(1, Ordering::SeqCst);
        self.drain();
        self.table().splice();
        Ok(())
    }
}

fn attached_session(fs: Arc<dyn Filesystem>) -> (Arc<Session>, OwnedFd) {
    let (ours, theirs) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .expect("failed to create socket pair");
    let session = Arc::new(Session::new(fs, SessionConfig::default()));
    session
        .attach(Channel::from_fd(ours))
        .expect("failed to attach channel");
    (session, theirs)
}

fn init_request(major: u32, minor: u32) -> Vec<u8> {
    let mut args = Vec::new();
    for value in [major, minor, 128 * 1024, 0] {
        args.extend_from_slice(&value.to_ne_bytes());
    }
    let header = InHeader {
        len: (IN_HEADER_SIZE + args.len()) as u32,
        opcode: Opcode::Init as u32,
        unique: 1,
        nodeid: 0,
        uid: 0,
        gid: 0,
        pid: 1,
    };
    let mut buf = Vec::new();
    header.encode(&mut buf);
    buf.extend_from_slice(&args);
    buf
}

#[test]
fn test_restarted_worker_resumes_negotiated_session() {
    let fs = Arc::new(Plain::default());
    let (session, _kernel) = attached_session(fs.clone());
    // [inited, proto_minor, max_write] as observed by the second worker
    let observed: SharedMapping<AtomicU32> = SharedMapping::new(3).expect("shared mapping");

    let supervisor = Supervisor::new(Arc::new(Mirrored::default()));
    let report = supervisor
        .run(
            |_| Ok(Arc::clone(&session)),
            |session, round| {
                if round == 0 {
                    let channel = session.channel()?;
                    session.process(&channel, &init_request(7, 31));
                    raise(Signal::SIGKILL).ok();
                    return Ok(());
                }
                if round > 1 {
                    return Ok(());
                }
                observed[0].store(session.is_inited() as u32, Ordering::SeqCst);
                observed[1].store(session.connection().proto_minor, Ordering::SeqCst);
                observed[2].store(session.connection().max_write, Ordering::SeqCst);
                Ok(())
            },
        )
        .expect("supervision failed");

    assert_eq!(report.recoveries, 1);
    let handlers = supervisor.handlers();
    assert_eq!(handlers.inits.load(Ordering::SeqCst), 1);
    assert_eq!(handlers.recoveries.load(Ordering::SeqCst), 1);
    assert_eq!(handlers.destroys.load(Ordering::SeqCst), 1);

    assert_eq!(observed[0].load(Ordering::SeqCst), 1);
    assert_eq!(observed[1].load(Ordering::SeqCst), 31);
    assert_eq!(observed[2].load(Ordering::SeqCst), session.connection().max_write);
    assert!(session.connection().max_write > 0);

    // The first worker negotiated; the supervisor never ran filesystem init
    // itself, but it does run teardown once for the negotiated session.
    assert_eq!(fs.inits.load(Ordering::SeqCst), 0);
    assert_eq!(fs.destroys.load(Ordering::SeqCst), 1);
}

#[test]
fn test_mirrored_descriptor_survives_crash() {
    let (session, _kernel) = attached_session(Arc::new(Plain::default()));
    let scratch = tempfile::tempdir().expect("failed to create temp dir");
    let path = scratch.path().join("payload");
    std::fs::write(&path, b"still here").expect("failed to write payload");

    // [key used by the first worker, bytes read back by the second]
    let observed: SharedMapping<AtomicU32> = SharedMapping::new(2).expect("shared mapping");

    let supervisor = Supervisor::new(Arc::new(Mirrored::default()));
    let handlers = Arc::clone(supervisor.handlers());
    let report = supervisor
        .run(
            |_| Ok(Arc::clone(&session)),
            |_, round| {
                let table = handlers.table();
                if round == 0 {
                    let key = table.allocate().expect("free slot");
                    let file = File::open(&path)?;
                    let fd = OwnedFd::from(file);
                    let duplicate = fd.try_clone()?;
                    table.set_primary(key, fd)?;
                    handlers
                        .sender
                        .get()
                        .expect("sender initialised")
                        .created(ResourceKind::File, key, duplicate.as_fd())?;
                    observed[0].store(key, Ordering::SeqCst);
                    raise(Signal::SIGKILL).ok();
                    return Ok(());
                }

                if round > 1 {
                    return Ok(());
                }
                let key = observed[0].load(Ordering::SeqCst);
                let slot = table.slot(key).expect("slot in range");
                let Some(primary) = slot.primary().filter(|fd| Some(*fd) == slot.backup()) else {
                    return Ok(());
                };

                // SAFETY: the spliced primary is open in this process
                let borrowed = unsafe { BorrowedFd::borrow_raw(primary) };
                let mut file = File::from(borrowed.try_clone_to_owned()?);
                file.seek(SeekFrom::Start(0))?;
                let mut contents = String::new();
                file.read_to_string(&mut contents)?;
                observed[1].store(contents.len() as u32, Ordering::SeqCst);
                Ok(())
            },
        )
        .expect("supervision failed");

    assert_eq!(report.recoveries, 1);
    assert_eq!(observed[1].load(Ordering::SeqCst), "still here".len() as u32);
}

#[test]
fn test_release_closes_backup_in_supervisor() {
    let (tx, rx) = mirror_channel().expect("mirror channel");
    let table: SlotRegistry<()> = SlotRegistry::new("files", 4, 0).expect("slot table");
    let mut file = tempfile::tempfile().expect("temp file");
    file.write_all(b"x").expect("write");

    let key = table.allocate().expect("free slot");
    tx.created(ResourceKind::File, key, file.as_fd()).expect("send creation");
    rx.drain(|message, fd| table.apply(message, fd).expect("apply"))
        .expect("drain");
    let backup = table.slot(key).and_then(|slot| slot.backup()).expect("backup stored");
    assert!(unsafe { libc::fcntl(backup, libc::F_GETFD) } != -1);

    tx.destroyed(ResourceKind::File, key).expect("send destruction");
    rx.drain(|message, fd| table.apply(message, fd).expect("apply"))
        .expect("drain");
    assert!(table.slot(key).and_then(|slot| slot.backup()).is_none());
    assert_eq!(unsafe { libc::fcntl(backup, libc::F_GETFD) }, -1);
}
