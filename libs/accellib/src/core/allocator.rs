// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Device and kernel arbitration over the shared database.
//!
//! Device allocation scans forward from the last examined index so repeated
//! requests spread across the system instead of piling onto device 0. A dead
//! recorded owner is reclaimed in place during the scan; this is the normal
//! crash-recovery path, never surfaced to the caller.
//!
//! Kernel allocation runs two passes over each reserved device: the first
//! only considers kernel instances this process already uses (keeping one
//! process's channels together instead of fragmenting them across kernels),
//! the second opens the search to untouched instances. A device that yields
//! no matching kernel is released and the scan moves on.

use crate::core::channel::allocate_channel;
use crate::core::config::KernelClass;
use crate::core::error::{AccelError, Result};
use crate::core::plugin::PluginCatalog;
use crate::core::process::is_alive;
use crate::core::session::Session;
use crate::core::shm::db::SharedDatabase;
use crate::core::shm::layout::{DbLayout, MAX_DEVICES, MAX_DEVICE_KERNELS};
use crate::core::shm::mutex::SharedMutex;

/// A reserved kernel instance: the handle triple the rest of the system uses
/// to reach the device, the kernel, and its plugin table.
///
/// Owned by the session that allocated it until explicitly freed.
#[derive(Debug, Clone)]
pub struct KernelResource {
    pub class: KernelClass,
    pub vendor: String,
    pub dev_excl: bool,
    dev_handle: i32,
    kern_handle: i32,
    plugin_handle: i32,
}

impl KernelResource {
    pub fn dev_handle(&self) -> i32 {
        self.dev_handle
    }

    pub fn kern_handle(&self) -> i32 {
        self.kern_handle
    }

    pub fn plugin_handle(&self) -> i32 {
        self.plugin_handle
    }
}

/// Allocates any free device. Equivalent to scanning from the start.
pub fn alloc_device(db: &SharedDatabase, pid: u32, excl: bool) -> Result<i32> {
    alloc_next_device(db, pid, -1, excl)
}

/// Allocates the next suitable device after `after` (-1 to start over).
pub fn alloc_next_device(db: &SharedDatabase, pid: u32, after: i32, excl: bool) -> Result<i32> {
    let mut handle = after;
    while handle < MAX_DEVICES as i32 {
        let mut guard = db.lock()?;
        next_free_device(&mut guard, pid, &mut handle)?;
        match reserve_device(&mut guard, pid, handle, excl) {
            Ok(()) => return Ok(handle),
            Err(e) if e.is_exhaustion() => continue,
            Err(e) => return Err(e),
        }
    }
    Err(AccelError::NoDevice("device scan exhausted".into()))
}

/// Finds the next candidate device at or after `handle + 1`.
///
/// A device exclusively held by a dead process is reclaimed here: its
/// ownership and every kernel channel it recorded are cleared, and the
/// device is returned as free.
fn next_free_device(db: &mut DbLayout, pid: u32, handle: &mut i32) -> Result<()> {
    let start = if *handle >= 0 { *handle + 1 } else { 0 } as usize;
    for dev_id in start..MAX_DEVICES {
        let dev = &mut db.devices[dev_id];
        if !dev.exists {
            continue;
        }
        if dev.excl {
            let owner = dev.client_procs[0];
            if !is_alive(owner) {
                tracing::debug!(dev_id, owner, "reclaiming exclusive device from dead owner");
                dev.clear_kernel_channels_for(0);
                dev.excl = false;
                dev.client_procs[0] = 0;
                *handle = dev_id as i32;
                return Ok(());
            }
            if owner == pid {
                *handle = dev_id as i32;
                return Ok(());
            }
            continue;
        }
        *handle = dev_id as i32;
        return Ok(());
    }
    Err(AccelError::NoDevice("no further devices".into()))
}

/// Registers `pid` on an existing device, exclusively or shared.
/// Idempotent per pid in both modes.
fn reserve_device(db: &mut DbLayout, pid: u32, handle: i32, excl: bool) -> Result<()> {
    let dev = &mut db.devices[handle as usize];

    if dev.excl {
        if dev.client_procs[0] == pid {
            return Ok(());
        }
        return Err(AccelError::NoDevice(format!(
            "device {handle} exclusively held by {}",
            dev.client_procs[0]
        )));
    }

    if excl {
        for &owner in dev.client_procs.iter() {
            if owner != 0 && owner != pid {
                tracing::error!(
                    handle,
                    owner,
                    "cannot allocate exclusively, device already shared"
                );
                return Err(AccelError::NoDevice(format!(
                    "device {handle} already in use by {owner}"
                )));
            }
        }
        dev.excl = true;
        dev.client_procs[0] = pid;
        return Ok(());
    }

    if dev.owner_index(pid).is_some() {
        tracing::debug!(handle, pid, "device already registered to process");
        return Ok(());
    }
    for slot in dev.client_procs.iter_mut() {
        if *slot == 0 {
            *slot = pid;
            tracing::debug!(handle, pid, "registered process with device");
            return Ok(());
        }
    }
    Err(AccelError::NoDevice(format!(
        "device {handle} owner slots exhausted"
    )))
}

/// Releases `pid`'s hold on a device.
pub fn free_device(db: &SharedDatabase, pid: u32, handle: i32) -> Result<()> {
    if !(0..MAX_DEVICES as i32).contains(&handle) {
        return Err(AccelError::Invalid(format!("device handle {handle}")));
    }
    let mut guard = db.lock()?;
    let dev = &mut guard.devices[handle as usize];
    if !dev.exists {
        return Err(AccelError::NoDevice(format!("device {handle} not present")));
    }
    if dev.release_for(pid) {
        Ok(())
    } else {
        tracing::debug!(handle, pid, "device not held by process");
        Err(AccelError::Invalid(format!(
            "device {handle} not held by process {pid}"
        )))
    }
}

/// Reserves a device and a matching kernel instance for `session`, assigning
/// a channel along the way. On success the session's channel id is set and
/// the returned resource records the handle triple.
pub fn alloc_kernel(
    db: &SharedDatabase,
    catalog: &PluginCatalog,
    pid: u32,
    session: &mut Session,
    class: KernelClass,
    vendor: &str,
    dev_excl: bool,
) -> Result<KernelResource> {
    if vendor.is_empty() {
        return Err(AccelError::Invalid("empty vendor string".into()));
    }

    // First pass restricts the search to kernels this process already uses.
    for affinity_pass in [true, false] {
        let mut dev_id: i32 = -1;
        loop {
            dev_id = match alloc_next_device(db, pid, dev_id, dev_excl) {
                Ok(id) => id,
                Err(e) if e.is_exhaustion() => break,
                Err(e) => return Err(e),
            };

            let mut guard = db.lock()?;
            match try_device(
                &mut guard,
                catalog,
                pid,
                session,
                dev_id,
                affinity_pass,
                class,
                vendor,
            )? {
                Some(kern_handle) => {
                    let plugin_handle = {
                        let dev = &guard.devices[dev_id as usize];
                        let kern_id = dev.kernels[kern_handle as usize].kernel_id;
                        guard.images[dev.image_id as usize].kernels[kern_id as usize].plugin_handle
                    };
                    return Ok(KernelResource {
                        class,
                        vendor: vendor.to_string(),
                        dev_excl,
                        dev_handle: dev_id,
                        kern_handle,
                        plugin_handle,
                    });
                }
                None => {
                    tracing::debug!(
                        dev_id,
                        vendor,
                        function = class.function().as_str(),
                        "no matching kernel on device, releasing"
                    );
                    let dev = &mut guard.devices[dev_id as usize];
                    dev.release_for(pid);
                }
            }
        }
    }

    tracing::error!(
        vendor,
        function = class.function().as_str(),
        "no available kernels of requested type"
    );
    Err(AccelError::NoKernel(format!(
        "no {} kernel from vendor {vendor}",
        class.function().as_str()
    )))
}

/// Scans one reserved device for a matching kernel instance and allocates a
/// channel on it. Returns the kernel handle on success, `None` when the
/// device has nothing usable.
#[allow(clippy::too_many_arguments)]
fn try_device(
    db: &mut DbLayout,
    catalog: &PluginCatalog,
    pid: u32,
    session: &mut Session,
    dev_id: i32,
    affinity_pass: bool,
    class: KernelClass,
    vendor: &str,
) -> Result<Option<i32>> {
    let dev_idx = dev_id as usize;
    let kernel_cnt = (db.devices[dev_idx].kernel_cnt as usize).min(MAX_DEVICE_KERNELS);

    for kern_idx in 0..kernel_cnt {
        let dev = &db.devices[dev_idx];
        let kern = &dev.kernels[kern_idx];

        // Affinity: reuse kernels this process already populates before
        // touching untouched ones.
        let used = kern.client_cnt > 0;
        if affinity_pass != used {
            continue;
        }

        let kern_id = kern.kernel_id as usize;
        let spec = &db.images[dev.image_id as usize].kernels[kern_id];
        if spec.vendor() != vendor || spec.function() != class.function() {
            continue;
        }
        let Some(entry) = catalog.entry(spec.function(), spec.plugin_handle) else {
            tracing::debug!(
                plugin = spec.plugin_handle,
                function = spec.function().as_str(),
                "kernel spec references unloaded plugin"
            );
            continue;
        };
        if entry.type_tag != class.type_tag() {
            continue;
        }

        let strategy = entry.strategy();
        let kern = &mut db.devices[dev_idx].kernels[kern_idx];
        if !kern.lock_initialized {
            unsafe {
                SharedMutex::init(&raw mut kern.lock, true)?;
            }
            kern.lock_initialized = true;
        }

        match allocate_channel(kern, session, strategy.as_ref(), pid) {
            Ok(chan_id) => {
                session.chan_id = chan_id;
                return Ok(Some(kern_idx as i32));
            }
            Err(
                e @ (AccelError::Timeout(_)
                | AccelError::Integrity(_)
                | AccelError::Os { .. }
                | AccelError::Io(_)),
            ) => return Err(e),
            Err(_) => continue,
        }
    }
    Ok(None)
}

/// Releases the kernel channel held by `session`, leaving the device
/// reservation in place for the process's other sessions.
pub fn free_kernel(
    db: &SharedDatabase,
    pid: u32,
    session: &Session,
    res: &KernelResource,
) -> Result<()> {
    let dev_handle = res.dev_handle();
    let kern_handle = res.kern_handle();
    if !(0..MAX_DEVICES as i32).contains(&dev_handle)
        || !(0..MAX_DEVICE_KERNELS as i32).contains(&kern_handle)
    {
        return Err(AccelError::Invalid("kernel resource out of range".into()));
    }

    let mut guard = db.lock()?;
    let kern = &mut guard.devices[dev_handle as usize].kernels[kern_handle as usize];
    if kern.remove_channel(pid, session.id(), session.chan_id) {
        Ok(())
    } else {
        Err(AccelError::Invalid(format!(
            "no channel {} owned by session {} on kernel {kern_handle}",
            session.chan_id,
            session.id()
        )))
    }
}

/// The per-kernel lock of a bound resource, for callers that need exclusive
/// register-map access during a command burst. Crash-tolerant like the
/// database lock.
pub fn kernel_mutex<'a>(
    db: &'a SharedDatabase,
    res: &KernelResource,
) -> Result<&'a SharedMutex> {
    db.kernel_mutex(res.dev_handle() as usize, res.kern_handle() as usize)
}

/// RAII acquisition of a kernel's register-map lock.
pub struct KernelGuard<'a> {
    mutex: &'a SharedMutex,
}

impl Drop for KernelGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.mutex.unlock() {
            tracing::warn!("failed to release kernel lock: {e}");
        }
    }
}

/// Locks the kernel bound to `res` for exclusive register-map access.
pub fn lock_kernel<'a>(db: &'a SharedDatabase, res: &KernelResource) -> Result<KernelGuard<'a>> {
    let mutex = kernel_mutex(db, res)?;
    mutex.lock()?;
    Ok(KernelGuard { mutex })
}
