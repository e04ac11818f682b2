// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use lazarus_recovery::RecoveryError;
use lazarus_session::SessionError;
use std::io;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum PassthroughError {
    #[error("failed to open source {path}: {source}")]
    Source { path: PathBuf, source: io::Error },
    #[error("source {0} is not a directory")]
    SourceNotDirectory(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

pub type PassthroughResult<T> = Result<T, PassthroughError>;
