// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Multi-process arbitration for shared hardware media-acceleration kernels.
//!
//! Several independent processes share a fixed pool of encode, decode, scale
//! and filter units spread across physical devices, with no central daemon.
//! Coordination happens through a memory-mapped resource database guarded by
//! a crash-tolerant process-shared lock: allocation scans reclaim whatever a
//! dead process left behind, channel allocation balances load within a
//! kernel instance, commands flow to hardware through per-device pools of
//! reusable execution buffers, and adjacent pipeline stages can negotiate
//! zero-copy hand-off of device buffers.
//!
//! The entry point is [`ResourceManager`], constructed once per process from
//! the parsed system configuration, the probed hardware inventory, and the
//! plugin catalog:
//!
//! ```ignore
//! let manager = ResourceManager::new(config, inventory, plugins, DbOptions::default(), &queues)?;
//! let mut session = manager.create_session(SessionKind::Encoder);
//! manager.alloc_kernel(&mut session, KernelClass::Encoder(1), "acme", false)?;
//! let cmd = manager.submit_command(&session, &regmap)?;
//! ```

pub mod core;

pub use core::*;
