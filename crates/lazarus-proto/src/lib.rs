// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Lazarus Protocol: FUSE kernel wire structures
//!
//! This crate defines the binary request/response layouts exchanged with the
//! kernel over `/dev/fuse`, including the version-dependent argument shapes
//! older kernels still send.

pub mod abi;
pub mod decode;
pub mod dirent;
pub mod opcode;

pub use abi::*;
pub use decode::{ArgReader, DecodeError};
pub use dirent::DirentBuf;
pub use opcode::Opcode;

/// Major protocol version spoken by this implementation
pub const KERNEL_VERSION: u32 = 7;

/// Highest minor protocol version this implementation understands
pub const KERNEL_MINOR_VERSION: u32 = 31;

/// Node id the kernel uses for the mount root
pub const ROOT_ID: u64 = 1;

/// Smallest receive buffer the kernel accepts for a read on the device
pub const MIN_READ_BUFFER: usize = 8192;

/// Space reserved in every receive buffer for headers and non-data arguments
pub const BUFFER_HEADER_SIZE: usize = 0x1000;

/// Upper bound on pages per request when the kernel offers `FUSE_MAX_PAGES`
pub const MAX_MAX_PAGES: usize = 256;

/// Pages per request when the kernel does not negotiate `FUSE_MAX_PAGES`
pub const DEFAULT_MAX_PAGES_PER_REQ: usize = 32;
