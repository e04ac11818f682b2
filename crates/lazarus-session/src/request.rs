// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use crate::channel::Channel;
use crate::session::Session;
use lazarus_proto::InHeader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Credentials of the process that triggered a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    /// Only known for CREATE and MKDIR on 7.12+ kernels
    pub umask: u32,
}

/// One kernel request awaiting its reply.
///
/// Consumed by exactly one reply method. The claim flag is shared with the
/// session's request list so an INTERRUPT can take the request over before
/// a handler does.
pub struct Request {
    session: Arc<Session>,
    channel: Arc<Channel>,
    unique: u64,
    nodeid: u64,
    opcode: u32,
    ctx: RequestContext,
    claim: Arc<AtomicBool>,
    finished: bool,
}

impl Request {
    pub(crate) fn new(session: Arc<Session>, channel: Arc<Channel>, header: &InHeader) -> Self {
        Self {
            session,
            channel,
            unique: header.unique,
            nodeid: header.nodeid,
            opcode: header.opcode,
            ctx: RequestContext {
                uid: header.uid,
                gid: header.gid,
                pid: header.pid,
                umask: 0,
            },
            claim: Arc::new(AtomicBool::new(false)),
            finished: false,
        }
    }

    pub fn unique(&self) -> u64 {
        self.unique
    }

    pub fn nodeid(&self) -> u64 {
        self.nodeid
    }

    pub fn opcode(&self) -> u32 {
        self.opcode
    }

    pub fn context(&self) -> &RequestContext {
        &self.ctx
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Negotiated protocol minor version
    pub fn proto_minor(&self) -> u32 {
        self.session.connection().proto_minor
    }

    pub(crate) fn set_umask(&mut self, umask: u32) {
        self.ctx.umask = umask;
    }

    pub(crate) fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub(crate) fn claim_flag(&self) -> &Arc<AtomicBool> {
        &self.claim
    }

    /// Take ownership of the request for handling.
    ///
    /// Returns `None` when an interrupt already claimed (and answered) it;
    /// the request is then dropped silently.
    pub(crate) fn claim(mut self) -> Option<Self> {
        if self.claim.swap(true, Ordering::AcqRel) {
            self.finished = true;
            None
        } else {
            Some(self)
        }
    }

    /// Drop without any reply and without touching the request list.
    pub(crate) fn discard(mut self) {
        self.finished = true;
    }

    /// Unlink from the request list without writing anything.
    pub(crate) fn finish_silently(&mut self) {
        self.finished = true;
        self.session.complete(self.unique, &self.claim);
    }

    /// Write the reply and unlink the request, whatever the write result.
    pub(crate) fn send(&mut self, error: i32, payload: &[u8]) {
        self.finished = true;
        let res = self
            .session
            .send_reply(&self.channel, self.unique, error, payload);
        self.session.complete(self.unique, &self.claim);
        if let Err(e) = res {
            error!(unique = self.unique, error = %e, "failed to send reply");
        }
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                unique = self.unique,
                opcode = self.opcode,
                "request dropped without reply, answering EIO"
            );
            self.send(-libc::EIO, &[]);
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("unique", &self.unique)
            .field("nodeid", &self.nodeid)
            .field("opcode", &self.opcode)
            .field("ctx", &self.ctx)
            .finish()
    }
}
