// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Lazarus Recovery: keep a FUSE connection alive across worker crashes
//!
//! A [`Supervisor`] forks the process that serves requests and restarts it
//! when it dies. Descriptors the worker opens are mirrored to the supervisor
//! over a [`mirror_channel`] and kept in shared [`SlotRegistry`] tables, so a
//! restarted worker finds them again under the same slot keys. Negotiated
//! session state crosses the restart through a [`SharedSnapshot`].

pub mod ancillary;
pub mod error;
pub mod handlers;
pub mod mirror;
pub mod registry;
pub mod shared;
pub mod snapshot;
pub mod supervisor;

pub use error::{RecoveryError, RecoveryResult};
pub use handlers::{NoRecovery, RecoveryHandlers, ShutdownSignal};
pub use mirror::{
    mirror_channel, MirrorKind, MirrorMessage, MirrorReceiver, MirrorSender, ResourceKind,
};
pub use registry::{Slot, SlotRegistry, SpliceReport};
pub use shared::SharedMapping;
pub use snapshot::SharedSnapshot;
pub use supervisor::{Supervisor, SupervisorReport, WorkerExit};
