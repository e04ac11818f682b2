// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use crate::error::RecoveryResult;
use std::sync::atomic::{AtomicBool, Ordering};

/// Hooks a filesystem provides to survive worker crashes.
///
/// `init` and `destroy` bracket the whole supervised run and execute in the
/// supervisor. `notify_routine` runs on a dedicated supervisor thread until
/// `shutdown` fires; it is where mirror messages are consumed. `recover`
/// runs in the supervisor after a worker died and before the next one is
/// forked.
pub trait RecoveryHandlers: Send + Sync + 'static {
    fn init(&self) -> RecoveryResult<()> {
        Ok(())
    }

    fn destroy(&self) {}

    fn notify_routine(&self, shutdown: &ShutdownSignal) {
        let _ = shutdown;
    }

    fn recover(&self) -> RecoveryResult<()> {
        Ok(())
    }
}

/// Handlers for a filesystem that keeps no descriptor state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRecovery;

impl RecoveryHandlers for NoRecovery {}

/// Cooperative stop flag for the notify routine.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    flag: AtomicBool,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
