// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Receive loops
//!
//! The single-threaded loop reads and dispatches in the calling thread. The
//! multi-threaded loop runs a pool of workers, each polling its own channel
//! (a cloned device handle when requested) so that a stop request is noticed
//! within one poll interval.

use crate::channel::Channel;
use crate::error::{SessionError, SessionResult};
use crate::session::{Received, Session};
use nix::sys::signal::{SigSet, Signal};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long a worker waits for a request before re-checking the exit flag
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Serve the session with the loop selected by its worker config.
pub fn run(session: &Arc<Session>) -> SessionResult<()> {
    if session.config().workers.multithread {
        run_multi(session)
    } else {
        run_single(session)
    }
}

pub fn run_single(session: &Arc<Session>) -> SessionResult<()> {
    let channel = session.channel()?;
    info!(mountpoint = ?session.mountpoint(), "serving requests on a single thread");

    let mut buf = vec![0u8; session.bufsize()];
    let mut result = Ok(());
    while !session.exited() {
        fit_buffer(&mut buf, session.bufsize());
        match session.receive(&channel, &mut buf) {
            Ok(Received::Request(n)) => session.process(&channel, &buf[..n]),
            Ok(Received::Idle) => continue,
            Ok(Received::Closed) => break,
            Err(e) => {
                result = Err(e);
                break;
            }
        }
    }
    finish(session, result)
}

pub fn run_multi(session: &Arc<Session>) -> SessionResult<()> {
    let master = session.channel()?;
    let workers = session.config().workers;
    info!(
        threads = workers.threads,
        clone_fd = workers.clone_fd,
        "serving requests on a worker pool"
    );

    let mut clones = Vec::new();
    let mut handles = Vec::with_capacity(workers.threads);
    for i in 0..workers.threads {
        let channel = if workers.clone_fd {
            match master.clone_device() {
                Ok(clone) => {
                    let clone = Arc::new(clone);
                    clones.push(Arc::clone(&clone));
                    clone
                }
                Err(e) => {
                    warn!(worker = i, error = %e, "cloning fuse device failed, sharing the master channel");
                    Arc::clone(&master)
                }
            }
        } else {
            Arc::clone(&master)
        };
        if let Err(e) = channel.set_nonblocking(true) {
            error!(worker = i, error = %e, "cannot make channel non-blocking");
            session.exit();
            break;
        }

        let worker_session = Arc::clone(session);
        let spawned = thread::Builder::new()
            .name(format!("lazarus-worker-{i}"))
            .spawn(move || worker_loop(&worker_session, &channel));
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                error!(worker = i, error = %e, "failed to start worker thread");
                break;
            }
        }
    }
    session.set_clone_channels(clones);

    let mut result = if handles.is_empty() {
        Err(SessionError::NoWorkers)
    } else {
        Ok(())
    };
    for handle in handles {
        let outcome = match handle.join() {
            Ok(outcome) => outcome,
            Err(_) => Err(SessionError::Errno(libc::EIO)),
        };
        if let Err(e) = outcome {
            if result.is_ok() {
                result = Err(e);
            }
        }
    }

    if let Err(e) = master.set_nonblocking(false) {
        debug!(error = %e, "restoring blocking mode on master channel");
    }
    finish(session, result)
}

fn worker_loop(session: &Arc<Session>, channel: &Arc<Channel>) -> SessionResult<()> {
    block_termination_signals();

    let mut buf = vec![0u8; session.bufsize()];
    while !session.exited() {
        match channel.wait_readable(POLL_INTERVAL) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(error = %e, "polling fuse device");
                session.exit();
                return Err(SessionError::Io(e));
            }
        }

        fit_buffer(&mut buf, session.bufsize());
        match session.receive(channel, &mut buf) {
            Ok(Received::Request(n)) => session.process(channel, &buf[..n]),
            // Another worker took it
            Ok(Received::Idle) => continue,
            Ok(Received::Closed) => {
                session.exit();
                break;
            }
            Err(e) => {
                session.exit();
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Leave process-level termination signals to the main thread.
fn block_termination_signals() {
    let mut set = SigSet::empty();
    for signal in [Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP, Signal::SIGQUIT] {
        set.add(signal);
    }
    if let Err(e) = set.thread_block() {
        warn!(error = %e, "failed to block signals in worker thread");
    }
}

fn fit_buffer(buf: &mut Vec<u8>, bufsize: usize) {
    if buf.len() != bufsize {
        buf.resize(bufsize, 0);
    }
}

fn finish(session: &Session, result: SessionResult<()>) -> SessionResult<()> {
    let sticky = session.error();
    session.reset();
    result?;
    if sticky != 0 {
        return Err(SessionError::Errno(-sticky));
    }
    Ok(())
}
