// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Process-shared resource database: record layout, robust locking, and the
//! create-or-attach lifecycle.

pub mod db;
pub mod layout;
pub mod mutex;

pub use db::{DbGuard, DbOptions, SharedDatabase};
pub use layout::{
    ChannelRecord, DbLayout, DeviceRecord, ImageRecord, KernelInstanceRecord, KernelSpecRecord,
    MAX_CHAN_LOAD, MAX_CLIENT_REFS, MAX_DEVICES, MAX_DEVICE_KERNELS, MAX_IMAGES,
    MAX_KERNEL_CHANNELS, NAME_LEN,
};
pub use mutex::{SharedMutex, LOCK_TIMEOUT};
