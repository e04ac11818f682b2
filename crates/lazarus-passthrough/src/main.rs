// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Lazarus passthrough host
//!
//! Serves a source directory on an already mounted FUSE connection. The
//! mount is made by the caller, which hands over the opened device
//! descriptor with `--device-fd`. With `--recovery` the filesystem runs
//! in a supervised worker process that is restarted after a crash.

use anyhow::{bail, Context, Result};
use clap::Parser;
use lazarus_logging::{CliLogLevel, CliLoggingArgs};
use lazarus_passthrough::{Passthrough, PassthroughRecovery, Tables};
use lazarus_recovery::Supervisor;
use lazarus_session::{install_exit_handlers, load_config, loops, Channel, Session, SessionConfig};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "lazarus-passthrough", about = "Passthrough filesystem with crash recovery")]
struct Args {
    /// Where the connection is mounted
    mountpoint: PathBuf,

    #[command(flatten)]
    logging: CliLoggingArgs,

    /// Session configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory to mirror
    #[arg(long, default_value = "/")]
    source: PathBuf,

    /// Entry and attribute cache timeout, in seconds
    #[arg(long, default_value_t = 0.0)]
    timeout: f64,

    /// Run the filesystem under the crash-recovery supervisor
    #[arg(long)]
    recovery: bool,

    /// Open /dev/fuse descriptor of the mounted connection
    #[arg(long)]
    device_fd: RawFd,

    /// Debug logging, including every request and reply
    #[arg(short, long)]
    debug: bool,

    /// Serve requests from a pool of worker threads
    #[arg(long)]
    multithread: bool,

    /// Give every worker thread its own cloned device channel
    #[arg(long)]
    clone_fd: bool,

    /// Worker thread count for --multithread
    #[arg(long)]
    threads: Option<usize>,

    /// Let users other than the mount owner access the filesystem
    #[arg(long)]
    allow_other: bool,
}

impl Args {
    fn timeout(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.timeout)
            .with_context(|| format!("invalid timeout {}", self.timeout))
    }

    /// Configuration from `--config`, overridden by flags.
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = load_config(self.config.as_deref())?;
        if self.allow_other {
            config.allow_other = true;
        }
        if self.multithread {
            config.workers.multithread = true;
        }
        if self.clone_fd {
            config.workers.clone_fd = true;
        }
        if let Some(threads) = self.threads {
            config.workers.threads = threads;
        }
        config.normalize();
        Ok(config)
    }
}

/// Take ownership of the inherited device descriptor.
fn device_channel(fd: RawFd) -> Result<Channel> {
    if fd < 0 || unsafe { libc::fcntl(fd, libc::F_GETFD) } == -1 {
        bail!("--device-fd {} is not an open descriptor", fd);
    }
    // SAFETY: checked open above; nothing else in this process owns it
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    Ok(Channel::from_fd(fd))
}

fn build_session(args: &Args, config: SessionConfig, fs: Passthrough) -> Arc<Session> {
    let owner = nix::unistd::getuid().as_raw();
    Arc::new(
        Session::new(Arc::new(fs), config)
            .with_mountpoint(&args.mountpoint)
            .with_owner(owner),
    )
}

fn run_plain(args: &Args, config: SessionConfig, channel: Channel, timeout: Duration) -> Result<()> {
    let tables = Arc::new(Tables::new(None)?);
    let fs = Passthrough::new(&args.source, timeout, tables)?;
    let session = build_session(args, config, fs);
    session.attach(channel)?;

    let result = {
        let _signals = install_exit_handlers(&session)?;
        loops::run(&session)
    };
    session.shutdown();
    result?;
    info!("session ended");
    Ok(())
}

fn run_supervised(args: &Args, config: SessionConfig, channel: Channel, timeout: Duration) -> Result<()> {
    let supervisor = Supervisor::new(Arc::new(PassthroughRecovery::new()));
    let report = supervisor.run_session(|handlers| {
        let fs = Passthrough::new(&args.source, timeout, handlers.tables()?)
            .map_err(|e| lazarus_recovery::RecoveryError::Init(e.to_string()))?;
        let session = build_session(args, config, fs);
        session.attach(channel)?;
        Ok(session)
    })?;
    if report.recoveries > 0 {
        warn!(recoveries = report.recoveries, "session survived worker crashes");
    }
    info!("supervised session ended");
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut logging = args.logging.clone();
    if args.debug {
        logging.log_level = Some(debug_level(logging.log_level));
    }
    logging.init("lazarus-passthrough", args.debug)?;

    let config = args.session_config()?;
    let timeout = args.timeout()?;
    info!(
        mountpoint = %args.mountpoint.display(),
        source = %args.source.display(),
        recovery = args.recovery,
        multithread = config.workers.multithread,
        "starting lazarus passthrough"
    );

    let channel = device_channel(args.device_fd)?;
    let result = if args.recovery {
        run_supervised(&args, config, channel, timeout)
    } else {
        run_plain(&args, config, channel, timeout)
    };
    if let Err(e) = &result {
        error!(error = %e, "lazarus passthrough failed");
    }
    result
}

/// `--debug` never lowers an explicitly more verbose level.
fn debug_level(requested: Option<CliLogLevel>) -> CliLogLevel {
    match requested {
        Some(CliLogLevel::Trace) => CliLogLevel::Trace,
        _ => CliLogLevel::Debug,
    }
}
