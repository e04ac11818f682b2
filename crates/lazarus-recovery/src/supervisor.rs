// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fork-and-restart supervision of a session worker
//!
//! The supervisor process owns everything that must outlive a worker: the
//! shared snapshot, the handler state (slot tables and backups) and the
//! notify thread. Each worker is a forked child that serves the session
//! until it exits. A clean exit ends supervision; a crash triggers recovery
//! and a fresh fork that resumes with the same kernel connection.

use crate::error::{RecoveryError, RecoveryResult};
use crate::handlers::{RecoveryHandlers, ShutdownSignal};
use crate::snapshot::SharedSnapshot;
use lazarus_session::{
    ignore_termination_signals, install_exit_handlers, loops, Session, SnapshotStore,
};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Clean,
    Failed(i32),
    Signaled(Signal),
}

impl WorkerExit {
    pub fn is_crash(self) -> bool {
        !matches!(self, WorkerExit::Clean)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    /// Number of crashed workers that were replaced
    pub recoveries: u64,
}

pub struct Supervisor<H: RecoveryHandlers> {
    handlers: Arc<H>,
}

impl<H: RecoveryHandlers> Supervisor<H> {
    pub fn new(handlers: Arc<H>) -> Self {
        Self { handlers }
    }

    pub fn handlers(&self) -> &Arc<H> {
        &self.handlers
    }

    /// Serve `build`'s session with the receive loop it is configured for,
    /// restarting the worker after every crash.
    ///
    /// Termination signals are ignored in the supervisor; in the worker they
    /// ask the loop to exit, which ends supervision cleanly.
    pub fn run_session<B>(&self, build: B) -> RecoveryResult<SupervisorReport>
    where
        B: FnOnce(&Arc<H>) -> RecoveryResult<Arc<Session>>,
    {
        ignore_termination_signals()?;
        self.run(build, |session, _round| {
            let _signals = install_exit_handlers(session)?;
            loops::run(session)?;
            Ok(())
        })
    }

    /// Supervise `worker`, which runs in a forked child once per round.
    ///
    /// `build` runs in the supervisor after handler init, so the session it
    /// returns can reach state the handlers created. The worker's `Ok`
    /// exits the child with status 0, `Err` with status 1.
    pub fn run<B, W>(&self, build: B, mut worker: W) -> RecoveryResult<SupervisorReport>
    where
        B: FnOnce(&Arc<H>) -> RecoveryResult<Arc<Session>>,
        W: FnMut(&Arc<Session>, u64) -> RecoveryResult<()>,
    {
        let snapshot = Arc::new(SharedSnapshot::new()?);

        if let Err(e) = self.handlers.init() {
            error!(error = %e, "recovery handler init failed");
            return Err(e);
        }

        let session = match build(&self.handlers) {
            Ok(session) => session,
            Err(e) => {
                self.handlers.destroy();
                return Err(e);
            }
        };
        let store: Arc<dyn SnapshotStore> = snapshot;
        if let Err(e) = session.register_snapshot(store) {
            self.handlers.destroy();
            return Err(e.into());
        }

        let shutdown = Arc::new(ShutdownSignal::new());
        let notify = match self.spawn_notify(&shutdown) {
            Ok(handle) => handle,
            Err(e) => {
                self.handlers.destroy();
                return Err(e);
            }
        };

        let result = self.fork_loop(&session, &mut worker);

        shutdown.trigger();
        if notify.join().is_err() {
            warn!("notify routine panicked");
        }
        if let Err(e) = session.restore() {
            warn!(error = %e, "failed to restore session state for teardown");
        }
        session.shutdown();
        self.handlers.destroy();

        match &result {
            Ok(report) => info!(recoveries = report.recoveries, "supervision finished"),
            Err(e) => error!(error = %e, "supervision aborted"),
        }
        result
    }

    fn spawn_notify(&self, shutdown: &Arc<ShutdownSignal>) -> RecoveryResult<JoinHandle<()>> {
        let handlers = Arc::clone(&self.handlers);
        let shutdown = Arc::clone(shutdown);
        let handle = thread::Builder::new()
            .name("lazarus-notify".to_string())
            .spawn(move || handlers.notify_routine(&shutdown))?;
        Ok(handle)
    }

    fn fork_loop<W>(&self, session: &Arc<Session>, worker: &mut W) -> RecoveryResult<SupervisorReport>
    where
        W: FnMut(&Arc<Session>, u64) -> RecoveryResult<()>,
    {
        let mut report = SupervisorReport::default();
        loop {
            let round = report.recoveries;
            let pid = spawn_worker(session, round, worker)?;
            info!(pid = pid.as_raw(), round, "worker started");

            let exit = wait_worker(pid)?;
            if !exit.is_crash() {
                info!(pid = pid.as_raw(), "worker exited cleanly");
                return Ok(report);
            }
            warn!(pid = pid.as_raw(), exit = ?exit, "worker crashed, recovering");
            self.recover(session)?;
            report.recoveries += 1;
        }
    }

    fn recover(&self, session: &Session) -> RecoveryResult<()> {
        match session.channel() {
            Ok(channel) => {
                if let Err(e) = channel.request_recovery() {
                    warn!(error = %e, "device recovery request failed");
                }
            }
            Err(e) => warn!(error = %e, "no channel to recover"),
        }
        if !session.restore()? {
            warn!("no session snapshot saved yet, restarting unnegotiated");
        }
        self.handlers.recover()
    }
}

impl<H: RecoveryHandlers> std::fmt::Debug for Supervisor<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor").finish_non_exhaustive()
    }
}

fn spawn_worker<W>(session: &Arc<Session>, round: u64, worker: &mut W) -> RecoveryResult<Pid>
where
    W: FnMut(&Arc<Session>, u64) -> RecoveryResult<()>,
{
    // SAFETY: the child only runs the worker and then exits
    match unsafe { fork() }.map_err(RecoveryError::Fork)? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| worker(session, round)));
            let code = match outcome {
                Ok(Ok(())) => 0,
                Ok(Err(e)) => {
                    error!(error = %e, "worker failed");
                    1
                }
                Err(_) => 101,
            };
            std::process::exit(code)
        }
    }
}

fn wait_worker(pid: Pid) -> RecoveryResult<WorkerExit> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, 0)) => return Ok(WorkerExit::Clean),
            Ok(WaitStatus::Exited(_, code)) => return Ok(WorkerExit::Failed(code)),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(WorkerExit::Signaled(signal)),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(RecoveryError::Wait(e)),
        }
    }
}
