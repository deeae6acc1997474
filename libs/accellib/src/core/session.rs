// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Session handles.
//!
//! A session is the user-visible binding between one pipeline stage and one
//! arbitrated kernel channel. The per-media-type façades (create/send/recv
//! wrappers over plugin callbacks) live above this crate; the core only needs
//! the identity, the kernel resource, and the dispatch bookkeeping defined
//! here.

use crate::core::allocator::KernelResource;
use crate::core::command::SessionCommands;

pub type SessionId = u32;

/// What kind of pipeline stage a session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Decoder,
    Encoder,
    Scaler,
    Filter,
    Kernel,
    /// Maintenance sessions; never bound to a kernel channel and never
    /// allowed on the command dispatch path.
    Admin,
}

/// References into per-device hardware state, filled in when a kernel is
/// bound to the session.
#[derive(Debug, Clone, Copy)]
pub struct HwBinding {
    pub dev_index: u32,
    /// Opaque driver handle of the device.
    pub dev_handle: u64,
    /// Compute unit driven by this session, in base-address order.
    pub cu_index: u32,
    /// The unit multiplexes independent channels.
    pub multi_channel: bool,
    pub soft_kernel: bool,
    pub default_bank: i32,
}

pub struct Session {
    id: SessionId,
    kind: SessionKind,
    /// Random value stamped into every command handle; a mismatch on any
    /// dispatcher entry is an integrity failure, not a recoverable state.
    signature: u64,
    /// Assigned channel, -1 until allocation succeeds.
    pub chan_id: i32,
    pub(crate) kern_res: Option<KernelResource>,
    pub(crate) hw: Option<HwBinding>,
    pub(crate) commands: SessionCommands,
}

impl Session {
    pub(crate) fn new(id: SessionId, kind: SessionKind) -> Self {
        Self {
            id,
            kind,
            signature: fastrand::u64(1..u64::MAX),
            chan_id: -1,
            kern_res: None,
            hw: None,
            commands: SessionCommands::default(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn signature(&self) -> u64 {
        self.signature
    }

    /// The kernel resource currently bound, if any.
    pub fn kernel_resource(&self) -> Option<&KernelResource> {
        self.kern_res.as_ref()
    }

    pub fn hw_binding(&self) -> Option<&HwBinding> {
        self.hw.as_ref()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("chan_id", &self.chan_id)
            .field("kern_res", &self.kern_res)
            .finish_non_exhaustive()
    }
}
