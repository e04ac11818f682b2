// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use lazarus_session::SessionError;
use std::io;

/// Errors surfaced by the recovery layer
#[derive(thiserror::Error, Debug)]
pub enum RecoveryError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("malformed mirror message: {0:?}")]
    MalformedMessage(String),
    #[error("{kind} message for slot {key} carries no descriptor")]
    MissingDescriptor { kind: &'static str, key: u32 },
    #[error("slot {key} is out of range for the {table} table")]
    SlotOutOfRange { table: &'static str, key: u32 },
    #[error("recovery handler init failed: {0}")]
    Init(String),
    #[error("recovery handlers are not initialised")]
    NotInitialised,
    #[error("fork failed: {0}")]
    Fork(nix::Error),
    #[error("waiting for worker failed: {0}")]
    Wait(nix::Error),
}

pub type RecoveryResult<T> = Result<T, RecoveryError>;
