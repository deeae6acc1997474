// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The per-process resource manager.
//!
//! One `ResourceManager` exists per process. It owns the shared database
//! handle, the probed hardware inventory, the plugin catalog, per-device
//! dispatch state and the connection table, and every core operation flows
//! through it. There is no process-global state; callers hold the manager
//! and pass sessions to it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::allocator::{self, KernelGuard, KernelResource};
use crate::core::command::{CommandHandle, CommandStatus, DeviceDispatch, HwQueue};
use crate::core::config::{KernelClass, SystemConfig};
use crate::core::connect::{
    ConnectionHandle, ConnectionRole, ConnectionState, ConnectionTable, Endpoint, PixelFormat,
};
use crate::core::error::{AccelError, Result};
use crate::core::hw::{HwDevice, HwInventory};
use crate::core::plugin::PluginCatalog;
use crate::core::session::{HwBinding, Session, SessionId, SessionKind};
use crate::core::shm::db::{DbOptions, SharedDatabase};

/// Video geometry a session advertises when negotiating zero-copy.
#[derive(Debug, Clone, Copy)]
pub struct EndpointParams {
    pub format: PixelFormat,
    pub bits_per_pixel: u32,
    pub width: u32,
    pub height: u32,
}

pub struct ResourceManager {
    config: SystemConfig,
    hw: HwInventory,
    plugins: PluginCatalog,
    db: SharedDatabase,
    dispatch: HashMap<u32, DeviceDispatch>,
    connections: Mutex<ConnectionTable>,
    next_session: AtomicU32,
    pid: u32,
}

impl ResourceManager {
    /// Builds the manager: opens or attaches the shared database and sets up
    /// per-device dispatch state.
    ///
    /// `queue_factory` supplies the hardware queue for each probed device.
    /// When this process won the configuration race, the database is marked
    /// ready here; the caller has already downloaded images and probed the
    /// inventory by the time it can call this.
    pub fn new(
        config: SystemConfig,
        mut hw: HwInventory,
        plugins: PluginCatalog,
        db_opts: DbOptions,
        queue_factory: &dyn Fn(&HwDevice) -> Arc<dyn HwQueue>,
    ) -> Result<Self> {
        hw.finalize();
        let db = SharedDatabase::open(&config, db_opts)?;

        let mut dispatch = HashMap::new();
        for dev in &hw.devices {
            dispatch.insert(
                dev.index,
                DeviceDispatch::new(dev.exec_pool_size(), queue_factory(dev)),
            );
        }

        let manager = Self {
            config,
            hw,
            plugins,
            db,
            dispatch,
            connections: Mutex::new(ConnectionTable::new()),
            next_session: AtomicU32::new(1),
            pid: std::process::id(),
        };

        if manager.db.is_config_owner() {
            manager.db.mark_ready()?;
            tracing::info!("resource database configured and marked ready");
        }
        Ok(manager)
    }

    pub fn database(&self) -> &SharedDatabase {
        &self.db
    }

    pub fn plugins(&self) -> &PluginCatalog {
        &self.plugins
    }

    pub fn inventory(&self) -> &HwInventory {
        &self.hw
    }

    /// Dispatch state of one device, for diagnostics.
    pub fn device_dispatch(&self, device: u32) -> Option<&DeviceDispatch> {
        self.dispatch.get(&device)
    }

    /// Creates an unbound session handle.
    pub fn create_session(&self, kind: SessionKind) -> Session {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        Session::new(id, kind)
    }

    // ---- device arbitration -------------------------------------------------

    pub fn alloc_device(&self, excl: bool) -> Result<i32> {
        allocator::alloc_device(&self.db, self.pid, excl)
    }

    pub fn alloc_next_device(&self, after: i32, excl: bool) -> Result<i32> {
        allocator::alloc_next_device(&self.db, self.pid, after, excl)
    }

    pub fn free_device(&self, handle: i32) -> Result<()> {
        allocator::free_device(&self.db, self.pid, handle)
    }

    // ---- kernel arbitration -------------------------------------------------

    /// Reserves a matching kernel and channel for `session`.
    pub fn alloc_kernel(
        &self,
        session: &mut Session,
        class: KernelClass,
        vendor: &str,
        dev_excl: bool,
    ) -> Result<()> {
        if session.kind() == SessionKind::Admin {
            return Err(AccelError::Invalid(
                "admin sessions cannot hold kernels".into(),
            ));
        }
        if session.kern_res.is_some() {
            return Err(AccelError::Invalid(
                "session already holds a kernel resource".into(),
            ));
        }

        let res =
            allocator::alloc_kernel(&self.db, &self.plugins, self.pid, session, class, vendor, dev_excl)?;
        session.hw = self.binding_for(&res);
        if session.hw.is_none() {
            tracing::debug!(
                dev = res.dev_handle(),
                kern = res.kern_handle(),
                "no probed hardware behind allocated kernel; dispatch disabled"
            );
        }
        tracing::debug!(
            session = session.id(),
            dev = res.dev_handle(),
            kern = res.kern_handle(),
            chan = session.chan_id,
            "kernel allocated"
        );
        session.kern_res = Some(res);
        Ok(())
    }

    fn binding_for(&self, res: &KernelResource) -> Option<HwBinding> {
        let dev = self.hw.device(res.dev_handle() as u32)?;
        let cu = dev.compute_unit(res.kern_handle() as u32)?;
        Some(HwBinding {
            dev_index: dev.index,
            dev_handle: dev.handle,
            cu_index: cu.cu_index,
            multi_channel: cu.channels,
            soft_kernel: cu.soft_kernel,
            default_bank: cu.default_bank,
        })
    }

    /// Releases the kernel and channel held by `session`.
    pub fn free_kernel(&self, session: &mut Session) -> Result<()> {
        let res = session
            .kern_res
            .take()
            .ok_or_else(|| AccelError::Invalid("session holds no kernel resource".into()))?;
        let result = allocator::free_kernel(&self.db, self.pid, session, &res);
        session.chan_id = -1;
        session.hw = None;
        result
    }

    /// Exclusive register-map access to the session's kernel, across
    /// processes. Crash-tolerant like every shared lock here.
    pub fn lock_kernel(&self, session: &Session) -> Result<KernelGuard<'_>> {
        let res = session
            .kernel_resource()
            .ok_or_else(|| AccelError::Invalid("session holds no kernel resource".into()))?;
        allocator::lock_kernel(&self.db, res)
    }

    // ---- command dispatch ---------------------------------------------------

    fn dispatch_for(&self, session: &Session) -> Result<(&DeviceDispatch, HwBinding)> {
        if session.kind() == SessionKind::Admin {
            return Err(AccelError::Invalid(
                "admin sessions cannot dispatch commands".into(),
            ));
        }
        let hw = session
            .hw_binding()
            .copied()
            .ok_or_else(|| AccelError::Invalid("session has no hardware binding".into()))?;
        let dispatch = self.dispatch.get(&hw.dev_index).ok_or_else(|| {
            AccelError::Invalid(format!("no dispatch state for device {}", hw.dev_index))
        })?;
        Ok((dispatch, hw))
    }

    /// Submits a register map to the session's kernel.
    pub fn submit_command(&self, session: &Session, regmap: &[u8]) -> Result<CommandHandle> {
        let (dispatch, hw) = self.dispatch_for(session)?;
        let cu = self
            .hw
            .device(hw.dev_index)
            .and_then(|d| d.compute_unit(hw.cu_index))
            .ok_or_else(|| AccelError::Invalid("bound compute unit vanished".into()))?;
        dispatch.submit(
            session,
            cu.cu_masks,
            hw.cu_index,
            hw.soft_kernel,
            hw.multi_channel,
            regmap,
        )
    }

    /// Polls command completion; see [`DeviceDispatch::poll`].
    pub fn poll_commands(
        &self,
        session: &Session,
        commands: &mut [CommandStatus],
        wait: Option<Duration>,
    ) -> Result<usize> {
        let (dispatch, _) = self.dispatch_for(session)?;
        dispatch.poll(session, commands, wait)
    }

    /// Blocks until any one command of the session completes, bounded.
    pub fn is_any_command_done(&self, session: &Session, timeout: Duration) -> Result<()> {
        let (dispatch, _) = self.dispatch_for(session)?;
        dispatch.wait_any(session, timeout)
    }

    /// Hardware return codes for completed commands.
    pub fn command_return_codes(
        &self,
        session: &Session,
        commands: &mut [CommandStatus],
    ) -> Result<u32> {
        let (dispatch, _) = self.dispatch_for(session)?;
        dispatch.return_codes(session, commands)
    }

    // ---- zero-copy negotiation ----------------------------------------------

    /// Registers `session` as one side of a zero-copy connection.
    ///
    /// Returns `None` when the session's device does not enable zero-copy or
    /// no slot/peer is available; the pipeline falls back to host copies.
    pub fn register_endpoint(
        &self,
        session: &Session,
        role: ConnectionRole,
        params: EndpointParams,
    ) -> Option<ConnectionHandle> {
        let res = session.kernel_resource()?;
        let device = res.dev_handle() as u32;
        if !self.config.zerocopy_enabled(device) {
            tracing::debug!(device, "zero-copy disabled for device image");
            return None;
        }
        let bank = session.hw_binding().map(|hw| hw.default_bank).unwrap_or(-1);
        let endpoint = Endpoint {
            session_id: session.id(),
            device,
            bank,
            format: params.format,
            bits_per_pixel: params.bits_per_pixel,
            width: params.width,
            height: params.height,
        };
        self.connections.lock().register(endpoint, role)
    }

    pub fn release_endpoint(&self, handle: ConnectionHandle, role: ConnectionRole) {
        self.connections.lock().release(handle, role);
    }

    pub fn connection_state(&self, handle: ConnectionHandle) -> ConnectionState {
        self.connections.lock().state(handle)
    }

    /// The matched peer endpoint of an active connection.
    pub fn connection_peer(
        &self,
        handle: ConnectionHandle,
        session_id: SessionId,
    ) -> Option<Endpoint> {
        self.connections.lock().peer(handle, session_id).cloned()
    }

    /// Tears the session down: channel, kernel, and device bookkeeping.
    pub fn close_session(&self, mut session: Session) -> Result<()> {
        if session.kern_res.is_some() {
            self.free_kernel(&mut session)?;
        }
        Ok(())
    }
}
