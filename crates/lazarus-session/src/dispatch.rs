// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-opcode entry points
//!
//! Each entry claims the request, decodes its arguments for the negotiated
//! minor version and forwards to the [`Filesystem`](crate::Filesystem).
//! Opcodes without an entry are answered ENOSYS by the session.

use crate::conn::{self, VersionCheck};
use crate::filesystem::{FileInfo, SetAttr};
use crate::queue::{InterruptOutcome, PendingInterrupt};
use crate::request::Request;
use crate::session::SessionState;
use lazarus_proto::{
    ArgReader, CreateIn, DecodeError, FlushIn, ForgetIn, GetattrIn, InitIn, InitOut, InterruptIn,
    IoIn, MkdirIn, OpenIn, Opcode, ReleaseIn, RenameIn, SetattrIn, WriteIn,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub(crate) type Handler = fn(Request, &[u8]);

pub(crate) fn handler_for(op: Opcode) -> Option<Handler> {
    let handler: Handler = match op {
        Opcode::Lookup => do_lookup,
        Opcode::Forget => do_forget,
        Opcode::Getattr => do_getattr,
        Opcode::Setattr => do_setattr,
        Opcode::Mkdir => do_mkdir,
        Opcode::Unlink => do_unlink,
        Opcode::Rmdir => do_rmdir,
        Opcode::Rename => do_rename,
        Opcode::Open => do_open,
        Opcode::Read => do_read,
        Opcode::Write => do_write,
        Opcode::Release => do_release,
        Opcode::Flush => do_flush,
        Opcode::Init => do_init,
        Opcode::Opendir => do_opendir,
        Opcode::Readdir => do_readdir,
        Opcode::Releasedir => do_releasedir,
        Opcode::Create => do_create,
        Opcode::Interrupt => do_interrupt,
        Opcode::Destroy => do_destroy,
        _ => return None,
    };
    Some(handler)
}

/// Claim `req` and decode its arguments; answers EIO on malformed input.
fn enter<'a, T>(
    req: Request,
    args: &'a [u8],
    decode: impl FnOnce(&mut ArgReader<'a>, u32) -> Result<T, DecodeError>,
) -> Option<(Request, T)> {
    let req = req.claim()?;
    let mut reader = ArgReader::new(args);
    match decode(&mut reader, req.proto_minor()) {
        Ok(decoded) => Some((req, decoded)),
        Err(err) => {
            warn!(unique = req.unique(), error = %err, "malformed request arguments");
            req.reply_error(libc::EIO);
            None
        }
    }
}

fn do_lookup(req: Request, args: &[u8]) {
    let Some((req, name)) = enter(req, args, |r, _| r.name()) else {
        return;
    };
    let fs = Arc::clone(req.session().filesystem());
    let parent = req.nodeid();
    fs.lookup(req, parent, name);
}

fn do_forget(req: Request, args: &[u8]) {
    let Some((req, arg)) = enter(req, args, |r, _| ForgetIn::decode(r)) else {
        return;
    };
    let fs = Arc::clone(req.session().filesystem());
    let ino = req.nodeid();
    fs.forget(req, ino, arg.nlookup);
}

fn do_getattr(req: Request, args: &[u8]) {
    let Some((req, arg)) = enter(req, args, GetattrIn::decode) else {
        return;
    };
    let fs = Arc::clone(req.session().filesystem());
    let ino = req.nodeid();
    fs.getattr(req, ino, arg.fh());
}

fn do_setattr(req: Request, args: &[u8]) {
    let Some((req, arg)) = enter(req, args, |r, _| SetattrIn::decode(r)) else {
        return;
    };
    let fs = Arc::clone(req.session().filesystem());
    let ino = req.nodeid();
    fs.setattr(req, ino, SetAttr::from_wire(&arg));
}

fn do_mkdir(req: Request, args: &[u8]) {
    let decoded = enter(req, args, |r, minor| {
        let arg = MkdirIn::decode(r, minor)?;
        Ok((arg, r.name()?))
    });
    let Some((mut req, (arg, name))) = decoded else {
        return;
    };
    if req.proto_minor() >= 12 {
        req.set_umask(arg.umask);
    }
    let fs = Arc::clone(req.session().filesystem());
    let parent = req.nodeid();
    fs.mkdir(req, parent, name, arg.mode);
}

fn do_unlink(req: Request, args: &[u8]) {
    let Some((req, name)) = enter(req, args, |r, _| r.name()) else {
        return;
    };
    let fs = Arc::clone(req.session().filesystem());
    let parent = req.nodeid();
    fs.unlink(req, parent, name);
}

fn do_rmdir(req: Request, args: &[u8]) {
    let Some((req, name)) = enter(req, args, |r, _| r.name()) else {
        return;
    };
    let fs = Arc::clone(req.session().filesystem());
    let parent = req.nodeid();
    fs.rmdir(req, parent, name);
}

fn do_rename(req: Request, args: &[u8]) {
    let Some((req, arg)) = enter(req, args, |r, _| RenameIn::decode(r)) else {
        return;
    };
    let fs = Arc::clone(req.session().filesystem());
    let parent = req.nodeid();
    fs.rename(req, parent, arg.name, arg.newdir, arg.newname);
}

fn do_open(req: Request, args: &[u8]) {
    let Some((req, arg)) = enter(req, args, |r, _| OpenIn::decode(r)) else {
        return;
    };
    let fs = Arc::clone(req.session().filesystem());
    let ino = req.nodeid();
    fs.open(req, ino, FileInfo::with_flags(arg.flags));
}

fn io_info(arg: &IoIn) -> FileInfo {
    FileInfo {
        fh: arg.fh,
        lock_owner: arg.lock_owner,
        flags: arg.flags as i32,
        ..FileInfo::default()
    }
}

fn do_read(req: Request, args: &[u8]) {
    let Some((req, arg)) = enter(req, args, IoIn::decode) else {
        return;
    };
    let fs = Arc::clone(req.session().filesystem());
    let ino = req.nodeid();
    fs.read(req, ino, arg.size, arg.offset, io_info(&arg));
}

fn do_write(req: Request, args: &[u8]) {
    let Some((req, arg)) = enter(req, args, WriteIn::decode) else {
        return;
    };
    let fs = Arc::clone(req.session().filesystem());
    let ino = req.nodeid();
    fs.write(req, ino, arg.data, arg.io.offset, io_info(&arg.io));
}

fn do_release(req: Request, args: &[u8]) {
    let Some((req, arg)) = enter(req, args, ReleaseIn::decode) else {
        return;
    };
    let info = FileInfo {
        flags: arg.flags as i32,
        fh: arg.fh,
        lock_owner: arg.lock_owner,
        flush: arg.flush(),
        ..FileInfo::default()
    };
    let fs = Arc::clone(req.session().filesystem());
    let ino = req.nodeid();
    fs.release(req, ino, info);
}

fn do_flush(req: Request, args: &[u8]) {
    let Some((req, arg)) = enter(req, args, |r, _| FlushIn::decode(r)) else {
        return;
    };
    let info = FileInfo {
        fh: arg.fh,
        lock_owner: arg.lock_owner,
        flush: true,
        ..FileInfo::default()
    };
    let fs = Arc::clone(req.session().filesystem());
    let ino = req.nodeid();
    fs.flush(req, ino, info);
}

fn do_opendir(req: Request, args: &[u8]) {
    let Some((req, arg)) = enter(req, args, |r, _| OpenIn::decode(r)) else {
        return;
    };
    let fs = Arc::clone(req.session().filesystem());
    let ino = req.nodeid();
    fs.opendir(req, ino, FileInfo::with_flags(arg.flags));
}

fn do_readdir(req: Request, args: &[u8]) {
    let Some((req, arg)) = enter(req, args, IoIn::decode) else {
        return;
    };
    let fs = Arc::clone(req.session().filesystem());
    let ino = req.nodeid();
    fs.readdir(req, ino, arg.size, arg.offset, FileInfo::with_handle(arg.fh));
}

fn do_releasedir(req: Request, args: &[u8]) {
    let Some((req, arg)) = enter(req, args, ReleaseIn::decode) else {
        return;
    };
    let info = FileInfo {
        flags: arg.flags as i32,
        fh: arg.fh,
        ..FileInfo::default()
    };
    let fs = Arc::clone(req.session().filesystem());
    let ino = req.nodeid();
    fs.releasedir(req, ino, info);
}

fn do_create(req: Request, args: &[u8]) {
    let decoded = enter(req, args, |r, minor| {
        let arg = CreateIn::decode(r, minor)?;
        Ok((arg, r.name()?))
    });
    let Some((mut req, (arg, name))) = decoded else {
        return;
    };
    if req.proto_minor() >= 12 {
        req.set_umask(arg.umask);
    }
    let fs = Arc::clone(req.session().filesystem());
    let parent = req.nodeid();
    fs.create(req, parent, name, arg.mode, FileInfo::with_flags(arg.flags));
}

fn do_init(req: Request, args: &[u8]) {
    let Some(req) = req.claim() else {
        return;
    };
    let arg = match InitIn::decode(&mut ArgReader::new(args)) {
        Ok(arg) => arg,
        Err(err) => {
            warn!(error = %err, "malformed INIT");
            req.reply_error(libc::EIO);
            return;
        }
    };
    let session = Arc::clone(req.session());
    info!(
        major = arg.major,
        minor = arg.minor,
        flags = %format!("{:#010x}", arg.flags),
        max_readahead = arg.max_readahead,
        "INIT"
    );

    let reply_init = |req: Request, out: &InitOut, size: usize| {
        let mut payload = Vec::with_capacity(64);
        out.encode(&mut payload);
        payload.truncate(size);
        req.reply_data(&payload);
    };

    match conn::check_version(arg.major) {
        VersionCheck::TooOld => {
            error!(
                major = arg.major,
                minor = arg.minor,
                "unsupported kernel protocol version"
            );
            req.reply_error(libc::EPROTO);
            session.fail(libc::EPROTO);
            return;
        }
        VersionCheck::TooNew => {
            // The kernel answers by sending INIT again with our major
            reply_init(req, &conn::version_reply(), InitOut::reply_size(u32::MAX));
            return;
        }
        VersionCheck::Supported => {}
    }

    session.set_state(SessionState::Negotiating);
    let page = conn::page_size();
    let mut out = session.negotiate(&arg, page);

    session.set_state(SessionState::Active);
    let conn_info = session.run_fs_init();

    let unsupported = conn::unsupported_wants(&conn_info);
    if unsupported != 0 {
        error!(
            unsupported = %format!("{:#x}", unsupported),
            "filesystem requested capabilities the kernel does not support"
        );
        req.reply_error(libc::EPROTO);
        session.fail(libc::EPROTO);
        return;
    }

    conn::complete_reply(&conn_info, &arg, &mut out, page);
    debug!(
        major = out.major,
        minor = out.minor,
        flags = %format!("{:#010x}", out.flags),
        max_readahead = out.max_readahead,
        max_write = out.max_write,
        max_background = out.max_background,
        congestion_threshold = out.congestion_threshold,
        time_gran = out.time_gran,
        "INIT reply"
    );

    session.save_snapshot();
    reply_init(req, &out, InitOut::reply_size(arg.minor));
}

fn do_destroy(req: Request, _args: &[u8]) {
    let Some(req) = req.claim() else {
        return;
    };
    let session = Arc::clone(req.session());
    session.destroy_once();
    session.save_snapshot();
    req.reply_ok();
}

fn do_interrupt(req: Request, args: &[u8]) {
    let arg = match InterruptIn::decode(&mut ArgReader::new(args)) {
        Ok(arg) => arg,
        Err(err) => {
            warn!(error = %err, "malformed INTERRUPT");
            req.discard();
            return;
        }
    };
    debug!(target: "lazarus::request", unique = req.unique(), target_unique = arg.unique, "INTERRUPT");

    let session = Arc::clone(req.session());
    let pending = PendingInterrupt {
        unique: req.unique(),
        target: arg.unique,
        channel: Arc::clone(req.channel()),
    };
    // The interrupt itself is never answered
    req.discard();

    match session.interrupt(pending) {
        InterruptOutcome::ForceClaimed(channel) => {
            if let Err(e) = session.send_reply(&channel, arg.unique, -libc::EINTR, &[]) {
                error!(unique = arg.unique, error = %e, "failed to abort interrupted request");
            }
        }
        InterruptOutcome::TooLate | InterruptOutcome::Duplicate => {}
        InterruptOutcome::Pending { evicted } => {
            if let Some(old) = evicted {
                debug!(unique = old.unique, target_unique = old.target, "evicting oldest pending interrupt");
                if let Err(e) = session.send_reply(&old.channel, old.unique, -libc::EAGAIN, &[]) {
                    error!(unique = old.unique, error = %e, "failed to answer evicted interrupt");
                }
            }
        }
    }
}
