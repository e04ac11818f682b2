// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Termination signal handling
//!
//! While a session is served, SIGHUP, SIGINT, SIGQUIT and SIGTERM set its
//! exit flag; the blocking device read returns EINTR and the loop ends
//! gracefully. A supervising process ignores the same signals so that only
//! its worker reacts to them.

use crate::error::{SessionError, SessionResult};
use crate::session::Session;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

const TERMINATION_SIGNALS: [Signal; 4] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
];

static EXIT_FLAG: AtomicPtr<AtomicBool> = AtomicPtr::new(std::ptr::null_mut());

extern "C" fn request_exit(_signal: libc::c_int) {
    let flag = EXIT_FLAG.load(Ordering::Acquire);
    if !flag.is_null() {
        // SAFETY: the pointer is cleared before the guard drops its session
        unsafe { (*flag).store(true, Ordering::Release) };
    }
}

extern "C" fn do_nothing(_signal: libc::c_int) {}

fn set_handler(handler: SigHandler) -> SessionResult<()> {
    // No SA_RESTART: a blocked device read must return EINTR
    let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
    for signal in TERMINATION_SIGNALS {
        // SAFETY: both handlers only touch atomics
        unsafe { sigaction(signal, &action) }
            .map_err(|e| SessionError::Errno(e as i32))?;
    }
    Ok(())
}

/// Restores default dispositions when dropped.
#[derive(Debug)]
pub struct ExitSignalGuard {
    _session: Arc<Session>,
}

impl Drop for ExitSignalGuard {
    fn drop(&mut self) {
        EXIT_FLAG.store(std::ptr::null_mut(), Ordering::Release);
        if let Err(e) = set_handler(SigHandler::SigDfl) {
            tracing::warn!(error = %e, "failed to restore default signal handlers");
        }
    }
}

/// Route termination signals to `session`'s exit flag.
pub fn install_exit_handlers(session: &Arc<Session>) -> SessionResult<ExitSignalGuard> {
    let guard = ExitSignalGuard {
        _session: Arc::clone(session),
    };
    EXIT_FLAG.store(
        session.exit_flag() as *const AtomicBool as *mut AtomicBool,
        Ordering::Release,
    );
    set_handler(SigHandler::Handler(request_exit))?;
    Ok(guard)
}

/// Swallow termination signals in a supervising process.
pub fn ignore_termination_signals() -> SessionResult<()> {
    set_handler(SigHandler::Handler(do_nothing))
}
