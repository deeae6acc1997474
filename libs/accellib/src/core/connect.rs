// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Zero-copy connection negotiation between pipeline stages.
//!
//! An upstream session registers its output as a sender endpoint; a
//! downstream session registering a compatible receiver endpoint turns the
//! slot into an active connection, letting the downstream kernel read the
//! upstream kernel's device buffer directly. Registration order matters:
//! senders claim slots first, so pipelines built upstream-to-downstream
//! negotiate zero-copy and anything else silently falls back to host copies.
//!
//! Compatibility compares device, memory bank, bit depth, width and height.
//! The pixel format is deliberately not compared; sessions that agree on
//! geometry but not layout still match. Tightening this would change which
//! pipelines get zero-copy, so the looseness is kept and pinned by tests.

use crate::core::session::SessionId;

pub const MAX_CONNECTIONS: usize = 32;

/// Pixel layouts sessions advertise on their endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuv420,
    Yuv422,
    Nv12,
    Rgb24,
    Rgba32,
}

/// One side of a potential zero-copy connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub session_id: SessionId,
    pub device: u32,
    pub bank: i32,
    pub format: PixelFormat,
    pub bits_per_pixel: u32,
    pub width: u32,
    pub height: u32,
}

impl Endpoint {
    /// Whether a receiver endpoint can consume this sender's output without
    /// a host round trip. Format intentionally absent from the comparison.
    fn compatible(&self, other: &Endpoint) -> bool {
        self.device == other.device
            && self.bank == other.bank
            && self.bits_per_pixel == other.bits_per_pixel
            && self.width == other.width
            && self.height == other.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Unused,
    /// Sender registered, waiting for a compatible receiver.
    PendingActive,
    /// Both endpoints matched; the stages share device buffers.
    Active,
    /// One side released; the slot drains until the other follows.
    PendingDelete,
}

pub type ConnectionHandle = usize;

#[derive(Default)]
struct ConnectionSlot {
    state: ConnectionState,
    sender: Option<Endpoint>,
    receiver: Option<Endpoint>,
}

/// Bounded table of connection slots.
pub struct ConnectionTable {
    slots: Vec<ConnectionSlot>,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_CONNECTIONS).map(|_| ConnectionSlot::default()).collect(),
        }
    }

    /// Registers an endpoint. Senders claim the first unused slot; receivers
    /// match the first compatible pending sender. `None` means no slot or no
    /// match, and the caller falls back to host copies.
    pub fn register(&mut self, endpoint: Endpoint, role: ConnectionRole) -> Option<ConnectionHandle> {
        match role {
            ConnectionRole::Sender => {
                let idx = self
                    .slots
                    .iter()
                    .position(|s| s.state == ConnectionState::Unused)?;
                let slot = &mut self.slots[idx];
                slot.state = ConnectionState::PendingActive;
                slot.sender = Some(endpoint);
                slot.receiver = None;
                tracing::debug!(handle = idx, "sender endpoint registered");
                Some(idx)
            }
            ConnectionRole::Receiver => {
                let idx = self.slots.iter().position(|s| {
                    s.state == ConnectionState::PendingActive
                        && s.sender
                            .as_ref()
                            .is_some_and(|snd| snd.compatible(&endpoint))
                })?;
                let slot = &mut self.slots[idx];
                slot.state = ConnectionState::Active;
                slot.receiver = Some(endpoint);
                tracing::debug!(handle = idx, "connection active");
                Some(idx)
            }
        }
    }

    /// Releases one side of a connection. The slot returns to unused once
    /// both sides are gone (or was never matched).
    pub fn release(&mut self, handle: ConnectionHandle, role: ConnectionRole) {
        let Some(slot) = self.slots.get_mut(handle) else {
            tracing::warn!(handle, "release of out-of-range connection handle");
            return;
        };
        match role {
            ConnectionRole::Sender => slot.sender = None,
            ConnectionRole::Receiver => slot.receiver = None,
        }
        slot.state = match (slot.sender.is_some(), slot.receiver.is_some()) {
            (false, false) => ConnectionState::Unused,
            _ => match slot.state {
                ConnectionState::Unused => ConnectionState::Unused,
                _ => ConnectionState::PendingDelete,
            },
        };
        tracing::debug!(handle, state = ?slot.state, "connection endpoint released");
    }

    pub fn state(&self, handle: ConnectionHandle) -> ConnectionState {
        self.slots
            .get(handle)
            .map(|s| s.state)
            .unwrap_or(ConnectionState::Unused)
    }

    /// The matched peer of `session_id` on an active connection, if any.
    pub fn peer(&self, handle: ConnectionHandle, session_id: SessionId) -> Option<&Endpoint> {
        let slot = self.slots.get(handle)?;
        if slot.state != ConnectionState::Active {
            return None;
        }
        match (&slot.sender, &slot.receiver) {
            (Some(s), Some(r)) if s.session_id == session_id => Some(r),
            (Some(s), Some(r)) if r.session_id == session_id => Some(s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(session: u32, h: u32) -> Endpoint {
        Endpoint {
            session_id: session,
            device: 0,
            bank: 1,
            format: PixelFormat::Nv12,
            bits_per_pixel: 8,
            width: 1920,
            height: h,
        }
    }

    #[test]
    fn test_sender_then_matching_receiver_goes_active() {
        let mut table = ConnectionTable::new();
        let h = table
            .register(endpoint(1, 1080), ConnectionRole::Sender)
            .unwrap();
        assert_eq!(table.state(h), ConnectionState::PendingActive);

        let h2 = table
            .register(endpoint(2, 1080), ConnectionRole::Receiver)
            .unwrap();
        assert_eq!(h, h2);
        assert_eq!(table.state(h), ConnectionState::Active);
        assert_eq!(table.peer(h, 1).unwrap().session_id, 2);
    }

    #[test]
    fn test_geometry_mismatch_stays_pending() {
        let mut table = ConnectionTable::new();
        let h = table
            .register(endpoint(1, 1080), ConnectionRole::Sender)
            .unwrap();
        assert!(table
            .register(endpoint(2, 1081), ConnectionRole::Receiver)
            .is_none());
        assert_eq!(table.state(h), ConnectionState::PendingActive);
    }

    #[test]
    fn test_format_is_not_compared() {
        // Known looseness kept on purpose: geometry agrees, formats differ,
        // and the connection still activates.
        let mut table = ConnectionTable::new();
        let h = table
            .register(endpoint(1, 1080), ConnectionRole::Sender)
            .unwrap();
        let mut recv = endpoint(2, 1080);
        recv.format = PixelFormat::Yuv420;
        assert_eq!(table.register(recv, ConnectionRole::Receiver), Some(h));
        assert_eq!(table.state(h), ConnectionState::Active);
    }

    #[test]
    fn test_receiver_without_sender_finds_nothing() {
        let mut table = ConnectionTable::new();
        assert!(table
            .register(endpoint(1, 1080), ConnectionRole::Receiver)
            .is_none());
    }

    #[test]
    fn test_release_lifecycle() {
        let mut table = ConnectionTable::new();
        let h = table
            .register(endpoint(1, 1080), ConnectionRole::Sender)
            .unwrap();
        table
            .register(endpoint(2, 1080), ConnectionRole::Receiver)
            .unwrap();

        table.release(h, ConnectionRole::Sender);
        assert_eq!(table.state(h), ConnectionState::PendingDelete);
        assert!(table.peer(h, 2).is_none());

        table.release(h, ConnectionRole::Receiver);
        assert_eq!(table.state(h), ConnectionState::Unused);

        // The drained slot is reusable.
        assert_eq!(
            table.register(endpoint(3, 720), ConnectionRole::Sender),
            Some(h)
        );
    }

    #[test]
    fn test_unmatched_sender_release_returns_slot() {
        let mut table = ConnectionTable::new();
        let h = table
            .register(endpoint(1, 1080), ConnectionRole::Sender)
            .unwrap();
        table.release(h, ConnectionRole::Sender);
        assert_eq!(table.state(h), ConnectionState::Unused);
    }

    #[test]
    fn test_table_bounded() {
        let mut table = ConnectionTable::new();
        for i in 0..MAX_CONNECTIONS {
            assert!(table
                .register(endpoint(i as u32, 1080), ConnectionRole::Sender)
                .is_some());
        }
        assert!(table
            .register(endpoint(99, 1080), ConnectionRole::Sender)
            .is_none());
    }
}
