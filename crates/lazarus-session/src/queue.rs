// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Outstanding requests and pending interrupts
//!
//! Both containers sit behind the one session mutex. A request is present in
//! `normal` from the moment it is accepted until its reply has been written
//! (or it was force-claimed by an interrupt). Interrupts whose target has not
//! arrived yet wait in a bounded FIFO.

use crate::channel::Channel;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub(crate) struct QueuedRequest {
    pub(crate) claim: Arc<AtomicBool>,
    pub(crate) channel: Arc<Channel>,
}

#[derive(Debug)]
pub(crate) struct PendingInterrupt {
    pub(crate) unique: u64,
    pub(crate) target: u64,
    pub(crate) channel: Arc<Channel>,
}

/// What happened to a newly arrived, non-interrupt request.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Arrival {
    Queued,
    /// An interrupt for it was already pending and has been consumed
    Cancelled,
}

#[derive(Debug)]
pub(crate) enum InterruptOutcome {
    /// Target was waiting unclaimed; it now belongs to the interrupt
    ForceClaimed(Arc<Channel>),
    /// Target is already being handled
    TooLate,
    /// An identical interrupt is already pending
    Duplicate,
    /// Stored; `evicted` is the oldest entry pushed out to make room
    Pending { evicted: Option<PendingInterrupt> },
}

#[derive(Debug)]
pub(crate) struct RequestQueues {
    normal: BTreeMap<u64, QueuedRequest>,
    interrupts: VecDeque<PendingInterrupt>,
    capacity: usize,
}

impl RequestQueues {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            normal: BTreeMap::new(),
            interrupts: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn arrive(
        &mut self,
        unique: u64,
        claim: &Arc<AtomicBool>,
        channel: &Arc<Channel>,
    ) -> Arrival {
        if let Some(pos) = self.interrupts.iter().position(|i| i.target == unique) {
            self.interrupts.remove(pos);
            return Arrival::Cancelled;
        }
        self.normal.insert(
            unique,
            QueuedRequest {
                claim: Arc::clone(claim),
                channel: Arc::clone(channel),
            },
        );
        Arrival::Queued
    }

    /// Drop a finished request, but only the instance that owns `claim`.
    pub(crate) fn complete(&mut self, unique: u64, claim: &Arc<AtomicBool>) {
        let owned = self
            .normal
            .get(&unique)
            .is_some_and(|entry| Arc::ptr_eq(&entry.claim, claim));
        if owned {
            self.normal.remove(&unique);
        }
    }

    pub(crate) fn interrupt(&mut self, pending: PendingInterrupt) -> InterruptOutcome {
        if let Some(entry) = self.normal.get(&pending.target) {
            if entry.claim.swap(true, Ordering::AcqRel) {
                return InterruptOutcome::TooLate;
            }
            let channel = Arc::clone(&entry.channel);
            self.normal.remove(&pending.target);
            return InterruptOutcome::ForceClaimed(channel);
        }

        if self.interrupts.iter().any(|i| i.target == pending.target) {
            return InterruptOutcome::Duplicate;
        }

        let evicted = if self.interrupts.len() >= self.capacity {
            self.interrupts.pop_front()
        } else {
            None
        };
        self.interrupts.push_back(pending);
        InterruptOutcome::Pending { evicted }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.normal.len()
    }

    pub(crate) fn pending_interrupts(&self) -> usize {
        self.interrupts.len()
    }

    pub(crate) fn is_pending(&self, unique: u64) -> bool {
        self.normal.contains_key(&unique)
    }
}
