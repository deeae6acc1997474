// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Fixed-capacity record layout of the shared resource database.
//!
//! Every participating process maps the same file, so all records are
//! `#[repr(C)]`, hold no pointers, and use fixed-size byte arrays for names.
//! Indices into these tables are the only handles that cross the process
//! boundary. Mutation happens in place, under the database lock or the
//! per-kernel lock, through the methods defined here.

use crate::core::config::KernelFunction;
use crate::core::shm::mutex::SharedMutex;

pub const MAX_DEVICES: usize = 16;
pub const MAX_IMAGES: usize = 16;
/// Kernel instances per device, and also device owner slots.
pub const MAX_DEVICE_KERNELS: usize = 16;
pub const MAX_KERNEL_CHANNELS: usize = 8;
pub const MAX_CLIENT_REFS: usize = MAX_DEVICES * MAX_DEVICE_KERNELS;
pub const NAME_LEN: usize = 64;

/// Aggregate kernel load unit: 1000 represents 100.0%.
pub const MAX_CHAN_LOAD: u16 = 1000;

fn write_name(dst: &mut [u8; NAME_LEN], src: &str) {
    dst.fill(0);
    let bytes = src.as_bytes();
    let n = bytes.len().min(NAME_LEN - 1);
    dst[..n].copy_from_slice(&bytes[..n]);
}

fn read_name(src: &[u8; NAME_LEN]) -> &str {
    let end = src.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    std::str::from_utf8(&src[..end]).unwrap_or("")
}

/// One kernel type entry of an image.
#[repr(C)]
pub struct KernelSpecRecord {
    name: [u8; NAME_LEN],
    vendor: [u8; NAME_LEN],
    function: u8,
    pub type_tag: u32,
    pub plugin_handle: i32,
}

impl KernelSpecRecord {
    pub fn set(
        &mut self,
        name: &str,
        vendor: &str,
        function: KernelFunction,
        type_tag: u32,
        plugin_handle: i32,
    ) {
        write_name(&mut self.name, name);
        write_name(&mut self.vendor, vendor);
        self.function = function as u8;
        self.type_tag = type_tag;
        self.plugin_handle = plugin_handle;
    }

    pub fn name(&self) -> &str {
        read_name(&self.name)
    }

    pub fn vendor(&self) -> &str {
        read_name(&self.vendor)
    }

    pub fn function(&self) -> KernelFunction {
        match self.function {
            0 => KernelFunction::Decoder,
            1 => KernelFunction::Encoder,
            2 => KernelFunction::Scaler,
            3 => KernelFunction::Filter,
            _ => KernelFunction::Kernel,
        }
    }
}

#[repr(C)]
pub struct ImageRecord {
    name: [u8; NAME_LEN],
    pub kernel_cnt: u32,
    pub kernels: [KernelSpecRecord; MAX_DEVICE_KERNELS],
}

impl ImageRecord {
    pub fn set_name(&mut self, name: &str) {
        write_name(&mut self.name, name);
    }

    pub fn name(&self) -> &str {
        read_name(&self.name)
    }
}

/// One live channel on a kernel instance.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ChannelRecord {
    pub client_pid: u32,
    pub session_id: u32,
    pub chan_id: i32,
    pub load: u16,
}

impl ChannelRecord {
    pub fn clear(&mut self) {
        self.client_pid = 0;
        self.session_id = 0;
        self.chan_id = 0;
        self.load = 0;
    }

    pub fn occupied(&self) -> bool {
        self.client_pid != 0
    }
}

/// One physical kernel instance on a device.
#[repr(C)]
pub struct KernelInstanceRecord {
    /// Index into the owning image's kernel spec table.
    pub kernel_id: u32,
    /// Serializes register-map access to this kernel across processes.
    pub lock: SharedMutex,
    pub lock_initialized: bool,
    /// Processes currently holding channels here. Bounded, defragmented.
    clients: [u32; MAX_KERNEL_CHANNELS],
    pub client_cnt: u8,
    pub chan_cnt: u8,
    /// Set when the kernel cannot accept further channels.
    pub no_chan_cap: bool,
    /// Aggregate load of live channels, 0..=[`MAX_CHAN_LOAD`].
    pub curr_load: u16,
    pub channels: [ChannelRecord; MAX_KERNEL_CHANNELS],
}

impl KernelInstanceRecord {
    pub fn client_index(&self, pid: u32) -> Option<usize> {
        self.clients[..self.client_cnt as usize]
            .iter()
            .position(|&p| p == pid)
    }

    /// Processes currently attached to this kernel, in registration order.
    pub fn client_pids(&self) -> &[u32] {
        &self.clients[..self.client_cnt as usize]
    }

    /// Registers `pid` as a client, once.
    pub fn add_client(&mut self, pid: u32) {
        if self.client_index(pid).is_some() {
            return;
        }
        let slot = self.clients.iter().position(|&p| p == 0);
        if let Some(i) = slot {
            self.clients[i] = pid;
            self.client_cnt += 1;
        }
    }

    /// Drops `pid` from the client set, compacting the list.
    pub fn remove_client(&mut self, pid: u32) {
        let Some(mut i) = self.client_index(pid) else {
            return;
        };
        while i + 1 < self.client_cnt as usize {
            self.clients[i] = self.clients[i + 1];
            i += 1;
        }
        self.clients[i] = 0;
        self.client_cnt -= 1;
    }

    /// Live channel ids, unsorted, in slot order.
    pub fn channel_ids(&self) -> Vec<i32> {
        self.channels[..self.chan_cnt as usize]
            .iter()
            .filter(|c| c.occupied())
            .map(|c| c.chan_id)
            .collect()
    }

    /// Appends a channel record. Caller has verified capacity and load.
    pub fn push_channel(&mut self, rec: ChannelRecord) {
        let slot = self.chan_cnt as usize;
        self.channels[slot] = rec;
        self.curr_load += rec.load;
        self.chan_cnt += 1;
        self.add_client(rec.client_pid);
    }

    /// Removes the channel matching `(pid, session_id, chan_id)`, compacting
    /// the list and releasing the pid's client slot when its last channel
    /// goes away. Returns false when no channel matched.
    pub fn remove_channel(&mut self, pid: u32, session_id: u32, chan_id: i32) -> bool {
        let count = self.chan_cnt as usize;
        let mut proc_chan_cnt = 0;
        let mut found = None;
        for i in 0..count {
            let ch = &self.channels[i];
            if ch.client_pid == pid && ch.session_id == session_id && ch.chan_id == chan_id {
                found = Some(i);
            } else if ch.client_pid == pid {
                proc_chan_cnt += 1;
            }
        }
        let Some(mut i) = found else {
            return false;
        };

        self.curr_load -= self.channels[i].load;
        self.chan_cnt -= 1;
        self.no_chan_cap = false;
        self.channels[i].clear();

        // Compact the in-use prefix.
        while i + 1 < count {
            self.channels[i] = self.channels[i + 1];
            i += 1;
        }
        if i > 0 || count > 1 {
            self.channels[i].clear();
        }

        if proc_chan_cnt == 0 {
            self.remove_client(pid);
        }
        true
    }

    /// Clears every channel owned by `pid` (0 clears all), compacting the
    /// remainder. Used for crash reclamation and process teardown.
    pub fn clear_channels_for(&mut self, pid: u32) {
        let init_cnt = self.chan_cnt as usize;
        if pid == 0 {
            self.clients = [0; MAX_KERNEL_CHANNELS];
            self.client_cnt = 0;
        } else {
            if self.client_index(pid).is_none() {
                return;
            }
            self.remove_client(pid);
        }

        for ch in self.channels[..init_cnt].iter_mut() {
            if pid != 0 && ch.client_pid != pid {
                continue;
            }
            if !ch.occupied() {
                continue;
            }
            self.curr_load -= ch.load;
            self.chan_cnt -= 1;
            self.no_chan_cap = false;
            ch.clear();
        }

        // Defragment: move occupied entries down over the holes.
        let mut z = 0;
        for p in 0..init_cnt {
            if self.channels[p].occupied() {
                if p != z {
                    self.channels[z] = self.channels[p];
                    self.channels[p].clear();
                }
                z += 1;
            }
        }
    }
}

#[repr(C)]
pub struct DeviceRecord {
    /// Device exists within the configured system.
    pub exists: bool,
    /// Image download has completed for this device.
    pub configured: bool,
    /// Device is held for exclusive use by `client_procs[0]`.
    pub excl: bool,
    pub image_id: u32,
    /// Processes sharing this device. Slot 0 is the exclusive holder.
    pub client_procs: [u32; MAX_DEVICE_KERNELS],
    pub kernel_cnt: u32,
    pub kernels: [KernelInstanceRecord; MAX_DEVICE_KERNELS],
}

impl DeviceRecord {
    pub fn owner_index(&self, pid: u32) -> Option<usize> {
        self.client_procs.iter().position(|&p| p == pid && p != 0)
    }

    /// Releases `pid`'s hold on the device. Exclusive holds clear slot 0.
    pub fn release_for(&mut self, pid: u32) -> bool {
        if self.excl {
            self.excl = false;
            self.client_procs[0] = 0;
            return true;
        }
        if let Some(i) = self.owner_index(pid) {
            self.client_procs[i] = 0;
            return true;
        }
        false
    }

    /// Clears every kernel channel owned by `pid` on this device.
    pub fn clear_kernel_channels_for(&mut self, pid: u32) {
        let count = (self.kernel_cnt as usize).min(MAX_DEVICE_KERNELS);
        for kern in self.kernels[..count].iter_mut() {
            kern.clear_channels_for(pid);
        }
    }
}

/// The complete mapped database.
#[repr(C)]
pub struct DbLayout {
    /// Guards every record below across processes and threads.
    pub lock: SharedMutex,
    /// Hardware configuration has completed for all devices.
    pub ready: bool,
    /// Process responsible for completing configuration; 0 when orphaned.
    pub config_owner: u32,
    pub ref_cnt: u32,
    clients: [u32; MAX_CLIENT_REFS],
    pub devices: [DeviceRecord; MAX_DEVICES],
    pub images: [ImageRecord; MAX_IMAGES],
}

impl DbLayout {
    pub fn clients(&self) -> &[u32] {
        &self.clients[..self.ref_cnt as usize]
    }

    /// Adds `pid` to the reference list, once. Fails when the list is full.
    pub fn add_client_ref(&mut self, pid: u32, config_owner: bool) -> bool {
        if config_owner {
            self.config_owner = pid;
        }
        if self.ref_cnt as usize + 1 > MAX_CLIENT_REFS {
            return false;
        }
        if self.clients[..self.ref_cnt as usize].contains(&pid) {
            return true;
        }
        self.clients[self.ref_cnt as usize] = pid;
        self.ref_cnt += 1;
        true
    }

    /// Removes one reference-list entry by index, compacting the list.
    pub fn remove_client_ref_at(&mut self, i: usize) {
        let pid = self.clients[i];
        self.clients[i] = 0;
        self.ref_cnt -= 1;
        if self.config_owner == pid {
            self.config_owner = 0;
        }
        let mut j = i;
        while j + 1 < MAX_CLIENT_REFS && self.clients[j + 1] != 0 {
            self.clients[j] = self.clients[j + 1];
            j += 1;
        }
        if j != i {
            self.clients[j] = 0;
        }
    }

    /// Removes `pid` from the reference list if present.
    pub fn remove_client_ref(&mut self, pid: u32) {
        if let Some(i) = self.clients[..self.ref_cnt as usize]
            .iter()
            .position(|&p| p == pid)
        {
            self.remove_client_ref_at(i);
        }
    }

    /// Releases every device hold and kernel channel owned by `pid`.
    pub fn release_all_for(&mut self, pid: u32) {
        for dev in self.devices.iter_mut() {
            if !dev.exists {
                continue;
            }
            if dev.owner_index(pid).is_some() || (dev.excl && dev.client_procs[0] == pid) {
                dev.release_for(pid);
            }
            dev.clear_kernel_channels_for(pid);
        }
    }
}
