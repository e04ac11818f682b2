// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use lazarus_proto::DecodeError;
use std::io;

/// Errors surfaced by the session engine
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed request: {0}")]
    Decode(#[from] DecodeError),
    #[error("short read on fuse device: {0} bytes")]
    ShortRead(usize),
    #[error("session channel is not attached")]
    NotAttached,
    #[error("session channel is already attached")]
    AlreadyAttached,
    #[error("a snapshot store is already registered for this session")]
    SnapshotAlreadyRegistered,
    #[error("snapshot error: {0}")]
    Snapshot(String),
    #[error("session ended with errno {0}")]
    Errno(i32),
    #[error("no worker threads could be started")]
    NoWorkers,
    #[error("config error: {0}")]
    Config(String),
}

impl SessionError {
    /// errno to report for this failure
    pub fn errno(&self) -> i32 {
        match self {
            SessionError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            SessionError::Errno(code) => *code,
            SessionError::Decode(_) | SessionError::ShortRead(_) => libc::EIO,
            SessionError::NotAttached => libc::ENODEV,
            SessionError::NoWorkers => libc::EAGAIN,
            _ => libc::EINVAL,
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
