// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Lazarus Session: the FUSE request engine
//!
//! A [`Session`] is attached to a kernel [`Channel`], negotiates the protocol
//! on INIT and dispatches every later request to a [`Filesystem`]
//! implementation. Replies go out through the methods on [`Request`].
//! Negotiated state can be saved to a [`SnapshotStore`] so a restarted
//! process can pick the connection up again without a new INIT.

pub mod buffer;
pub mod channel;
pub mod config;
pub mod conn;
mod dispatch;
pub mod error;
pub mod filesystem;
pub mod loops;
mod queue;
pub mod reply;
pub mod request;
pub mod session;
pub mod signals;
pub mod snapshot;

pub use buffer::{copy_buf, BufDst, BufSrc, FdRegion};
pub use channel::Channel;
pub use config::{load_config, ConnectionConfig, SessionConfig, WorkerConfig};
pub use conn::ConnectionInfo;
pub use error::{SessionError, SessionResult};
pub use filesystem::{FileInfo, Filesystem, SetAttr, TimeOrNow, TimeSpec};
pub use loops::{run, run_multi, run_single};
pub use reply::{attr_from_stat, EntryParam};
pub use request::{Request, RequestContext};
pub use session::{Received, Session, SessionState};
pub use signals::{ignore_termination_signals, install_exit_handlers, ExitSignalGuard};
pub use snapshot::{MemorySnapshotStore, SessionSnapshot, SnapshotStore};
