// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Lazarus Passthrough: a filesystem that mirrors a source directory
//!
//! [`Passthrough`] implements the session engine's operation table on top of
//! descriptor-relative syscalls. All descriptors it holds live in
//! [`Tables`], which the crash-recovery supervisor maps before forking, so a
//! restarted worker keeps serving the same node ids and file handles.

pub mod dirstream;
pub mod error;
pub mod passthrough;
pub mod sys;
pub mod tables;

pub use error::{PassthroughError, PassthroughResult};
pub use passthrough::Passthrough;
pub use tables::{
    inode_key, node_id, InodeMeta, OpenHandle, PassthroughRecovery, Tables, DIR_CAPACITY,
    FILE_CAPACITY, INODE_CAPACITY, RESERVED_FILE_SLOTS,
};
