// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Probed hardware inventory.
//!
//! The probe runs once at configuration time (an external collaborator owns
//! the actual driver calls); the core reads the result to derive per-kernel
//! compute-unit masks and per-device execution-buffer pool sizes.

use serde::{Deserialize, Serialize};

/// Minimum number of execution buffers in a device pool.
pub const MIN_EXEC_BUFFERS: usize = 16;

/// One on-card memory bank.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HwBank {
    pub name: String,
    pub base_address: u64,
    pub size_kb: u64,
    pub in_use: bool,
}

/// One compute unit as reported by the device probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HwComputeUnit {
    pub name: String,
    pub base_address: u64,
    /// Soft (firmware-scheduled) units take a different start opcode.
    pub soft_kernel: bool,
    /// Whether the unit multiplexes independent channels.
    pub channels: bool,
    /// Highest channel id the unit accepts.
    pub max_channel_id: i32,
    /// Bitmap of banks this unit can address.
    pub bank_connectivity: u64,
    /// Default bank for session buffers, -1 when unconnected.
    pub default_bank: i32,
    /// Index in base-address order, assigned by [`HwDevice::finalize`].
    #[serde(default)]
    pub cu_index: u32,
    /// Command mask words derived from `cu_index` (128 units addressable).
    #[serde(default)]
    pub cu_masks: [u32; 4],
}

impl HwComputeUnit {
    fn derive_masks(&mut self, index: u32) {
        self.cu_index = index;
        self.cu_masks = [0; 4];
        let word = (index / 32) as usize;
        self.cu_masks[word] = 1 << (index % 32);
    }
}

/// One probed device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HwDevice {
    pub index: u32,
    /// Opaque driver handle, stable for the device lifetime.
    pub handle: u64,
    pub compute_units: Vec<HwComputeUnit>,
    pub banks: Vec<HwBank>,
}

impl HwDevice {
    /// Orders compute units by base address and derives their command masks.
    ///
    /// Must run once before any session dispatches against this device; the
    /// scheduler addresses units by their position in this ordering, not by
    /// probe order.
    pub fn finalize(&mut self) {
        self.compute_units
            .sort_by_key(|cu| cu.base_address);
        for (idx, cu) in self.compute_units.iter_mut().enumerate() {
            cu.derive_masks(idx as u32);
        }
    }

    /// Execution-buffer pool size for this device.
    pub fn exec_pool_size(&self) -> usize {
        MIN_EXEC_BUFFERS.max(self.compute_units.len() * 2)
    }

    pub fn compute_unit(&self, cu_index: u32) -> Option<&HwComputeUnit> {
        self.compute_units.get(cu_index as usize)
    }
}

/// Full probed inventory, indexed by device id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HwInventory {
    pub devices: Vec<HwDevice>,
}

impl HwInventory {
    pub fn finalize(&mut self) {
        for dev in &mut self.devices {
            dev.finalize();
        }
    }

    pub fn device(&self, index: u32) -> Option<&HwDevice> {
        self.devices.iter().find(|d| d.index == index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cu(name: &str, base: u64) -> HwComputeUnit {
        HwComputeUnit {
            name: name.into(),
            base_address: base,
            soft_kernel: false,
            channels: false,
            max_channel_id: 0,
            bank_connectivity: 0b1,
            default_bank: 0,
            cu_index: 0,
            cu_masks: [0; 4],
        }
    }

    #[test]
    fn test_masks_follow_base_address_order() {
        let mut dev = HwDevice {
            index: 0,
            handle: 0xd00d,
            compute_units: vec![cu("b", 0x2000), cu("a", 0x1000)],
            banks: vec![],
        };
        dev.finalize();
        assert_eq!(dev.compute_units[0].name, "a");
        assert_eq!(dev.compute_units[0].cu_masks[0], 0b01);
        assert_eq!(dev.compute_units[1].cu_masks[0], 0b10);
    }

    #[test]
    fn test_mask_word_rollover() {
        let mut unit = cu("far", 0);
        unit.derive_masks(37);
        assert_eq!(unit.cu_masks[0], 0);
        assert_eq!(unit.cu_masks[1], 1 << 5);
    }

    #[test]
    fn test_pool_size_floor() {
        let dev = HwDevice {
            index: 0,
            handle: 0,
            compute_units: vec![cu("only", 0)],
            banks: vec![],
        };
        assert_eq!(dev.exec_pool_size(), MIN_EXEC_BUFFERS);
    }
}
