// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Hardware command dispatch and completion.
//!
//! Commands are register maps carried to the hardware queue in fixed-size
//! execution buffers drawn from a per-device pool. The pool sits behind an
//! atomic spinlock rather than a mutex: the critical sections are a bitmap
//! flip and a bounded memcpy, short enough that parking a thread would cost
//! more than the spin.
//!
//! Every submitted command is identified by a monotonically increasing
//! counter plus a random nonce. Completion validates the full
//! (session, counter, nonce, unit) tuple against what the buffer recorded;
//! a mismatch means a stale handle or corrupted memory and is surfaced as an
//! integrity failure, never retried.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::error::{AccelError, Result};
use crate::core::session::Session;

/// Execution buffers are one page; the queue packet header uses the rest.
pub const EXEC_BUFFER_SIZE: usize = 4096;
/// Largest register map one buffer carries.
pub const MAX_REGMAP_SIZE: usize = 4032;
/// Register-map word where multi-channel kernels read their channel id.
pub const REGMAP_CHANNEL_WORD: usize = 7;
/// Submission retries before pool exhaustion is reported to the caller.
const SUBMIT_RETRIES: u32 = 15;
/// Completed-command error codes kept per session before eviction.
const MAX_ERROR_CODES: usize = 512;

/// Hardware-reported state of one execution buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwCmdState {
    Idle,
    Queued,
    Running,
    Completed,
    Error,
}

/// Start opcode selected by the target unit's classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOpcode {
    StartCu,
    StartSoftKernel,
}

/// One reusable execution buffer.
pub struct ExecSlot {
    pub in_use: bool,
    pub session_id: u32,
    pub cmd_counter: u32,
    pub cmd_nonce: u32,
    pub cu_index: u32,
    pub opcode: StartOpcode,
    pub cu_masks: [u32; 4],
    pub state: HwCmdState,
    pub return_code: i32,
    payload: Vec<u8>,
}

impl ExecSlot {
    fn new() -> Self {
        Self {
            in_use: false,
            session_id: 0,
            cmd_counter: 0,
            cmd_nonce: 0,
            cu_index: 0,
            opcode: StartOpcode::StartCu,
            cu_masks: [0; 4],
            state: HwCmdState::Idle,
            return_code: 0,
            payload: Vec::with_capacity(MAX_REGMAP_SIZE),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn reset(&mut self) {
        self.in_use = false;
        self.session_id = 0;
        self.cmd_counter = 0;
        self.cmd_nonce = 0;
        self.cu_index = 0;
        self.state = HwCmdState::Idle;
        self.return_code = 0;
        self.payload.clear();
    }
}

/// Pool state guarded by the spinlock: the buffers plus the per-device
/// command-identity counters.
pub struct PoolState {
    pub slots: Vec<ExecSlot>,
    cmd_counter: u32,
    cmd_nonce: u32,
}

impl PoolState {
    fn new(size: usize) -> Self {
        Self {
            slots: (0..size).map(|_| ExecSlot::new()).collect(),
            cmd_counter: 0,
            cmd_nonce: fastrand::u32(..),
        }
    }

    /// Next command identity. The counter skips 0 so a zeroed handle can
    /// never validate; the nonce sequence re-seeds on wrap.
    fn next_identity(&mut self) -> (u32, u32) {
        self.cmd_counter = self.cmd_counter.wrapping_add(1);
        if self.cmd_counter == 0 {
            self.cmd_counter = 1;
            self.cmd_nonce = fastrand::u32(..);
        } else {
            self.cmd_nonce = self.cmd_nonce.wrapping_add(1);
        }
        (self.cmd_counter, self.cmd_nonce)
    }
}

/// Minimal spinlock for the execution-buffer pool.
pub struct Spinlock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Spinlock<T> {}
unsafe impl<T: Send> Sync for Spinlock<T> {}

pub struct SpinGuard<'a, T> {
    lock: &'a Spinlock<T>,
}

impl<T> Spinlock<T> {
    pub fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::thread::yield_now();
        }
        SpinGuard { lock: self }
    }
}

impl<T> std::ops::Deref for SpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> std::ops::DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// The underlying hardware command queue.
///
/// The production implementation wraps the vendor driver; tests drive a
/// simulated device. `refresh` runs with the pool spinlock held and must
/// only flip slot states.
pub trait HwQueue: Send + Sync {
    /// Hands a populated buffer to the hardware. Slot state is `Queued`.
    fn enqueue(&self, slot_index: usize) -> Result<()>;

    /// Folds hardware progress back into the slot states.
    fn refresh(&self, slots: &mut [ExecSlot]);

    /// Blocks until hardware signals progress or `timeout` expires.
    fn wait(&self, timeout: Duration);
}

/// Dispatch state for one device: the buffer pool and its queue.
pub struct DeviceDispatch {
    pool: Spinlock<PoolState>,
    queue: Arc<dyn HwQueue>,
}

/// Handle returned from submission, needed to poll completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHandle {
    pub counter: u32,
    pub nonce: u32,
    pub cu_index: u32,
    pub(crate) session_signature: u64,
}

/// Per-command poll result.
#[derive(Debug, Clone, Copy)]
pub struct CommandStatus {
    pub handle: CommandHandle,
    pub finished: bool,
    pub return_code: i32,
}

impl CommandStatus {
    pub fn new(handle: CommandHandle) -> Self {
        Self {
            handle,
            finished: false,
            return_code: 0,
        }
    }
}

struct PendingCommand {
    nonce: u32,
    cu_index: u32,
    slot: usize,
}

/// Session-local dispatch bookkeeping. Process-local; guarded by ordinary
/// locks because only threads of this process share a session.
#[derive(Default)]
pub struct SessionCommands {
    pending: Mutex<HashMap<u32, PendingCommand>>,
    error_codes: Mutex<HashMap<u32, i32>>,
    complete_credits: AtomicU32,
}

impl SessionCommands {
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl DeviceDispatch {
    pub fn new(pool_size: usize, queue: Arc<dyn HwQueue>) -> Self {
        Self {
            pool: Spinlock::new(PoolState::new(pool_size)),
            queue,
        }
    }

    pub fn queue(&self) -> &Arc<dyn HwQueue> {
        &self.queue
    }

    /// Submits a register map against the session's bound compute unit.
    ///
    /// Pool exhaustion after bounded retries is a retryable [`AccelError::NoBuffer`];
    /// everything else the caller did wrong fails the single call.
    pub fn submit(
        &self,
        session: &Session,
        cu_masks: [u32; 4],
        cu_index: u32,
        soft_kernel: bool,
        multi_channel: bool,
        regmap: &[u8],
    ) -> Result<CommandHandle> {
        if regmap.is_empty() {
            return Err(AccelError::Invalid("register map is empty".into()));
        }
        if regmap.len() > MAX_REGMAP_SIZE {
            return Err(AccelError::Invalid(format!(
                "register map of {} exceeds {MAX_REGMAP_SIZE} bytes",
                regmap.len()
            )));
        }
        if regmap.len() % 4 != 0 {
            return Err(AccelError::Invalid(format!(
                "register map of {} bytes is not a multiple of four",
                regmap.len()
            )));
        }

        let mut attempt = 0;
        loop {
            {
                let mut pool = self.pool.lock();
                let free = pool.slots.iter().position(|s| !s.in_use);
                if let Some(idx) = free {
                    let (counter, nonce) = pool.next_identity();
                    let slot = &mut pool.slots[idx];
                    slot.in_use = true;
                    slot.session_id = session.id();
                    slot.cmd_counter = counter;
                    slot.cmd_nonce = nonce;
                    slot.cu_index = cu_index;
                    slot.cu_masks = cu_masks;
                    slot.opcode = if soft_kernel {
                        StartOpcode::StartSoftKernel
                    } else {
                        StartOpcode::StartCu
                    };
                    slot.payload.clear();
                    slot.payload.extend_from_slice(regmap);
                    if multi_channel && session.chan_id >= 0 {
                        // Multi-channel units read their channel id out of
                        // the register map; the completion word next to it
                        // starts cleared.
                        let base = REGMAP_CHANNEL_WORD * 4;
                        if slot.payload.len() >= base + 8 {
                            slot.payload[base..base + 4]
                                .copy_from_slice(&(session.chan_id as u32).to_le_bytes());
                            slot.payload[base + 4..base + 8].fill(0);
                        }
                    }
                    slot.state = HwCmdState::Queued;

                    if let Err(e) = self.queue.enqueue(idx) {
                        tracing::error!("failed to submit command to hardware queue: {e}");
                        pool.slots[idx].reset();
                        return Err(e);
                    }

                    let handle = CommandHandle {
                        counter,
                        nonce,
                        cu_index,
                        session_signature: session.signature(),
                    };
                    session.commands.pending.lock().insert(
                        counter,
                        PendingCommand {
                            nonce,
                            cu_index,
                            slot: idx,
                        },
                    );
                    return Ok(handle);
                }
            }

            tracing::debug!(session = session.id(), "no available execution buffer");
            if attempt >= SUBMIT_RETRIES {
                return Err(AccelError::NoBuffer(
                    "execution buffer pool exhausted".into(),
                ));
            }
            self.queue.wait(Duration::from_millis(10));
            attempt += 1;
        }
    }

    /// Folds hardware completions for `session` back into its pending map.
    ///
    /// Every completed buffer is validated against the identity recorded at
    /// submission; a mismatch is an integrity failure and poisons nothing
    /// else, but the call reports it instead of the completion.
    fn reap_completions(&self, session: &Session) -> Result<()> {
        let mut pool = self.pool.lock();
        let mut pending = session.commands.pending.lock();

        self.queue.refresh(&mut pool.slots);

        for idx in 0..pool.slots.len() {
            let slot = &pool.slots[idx];
            if !slot.in_use || slot.session_id != session.id() {
                continue;
            }
            if !matches!(slot.state, HwCmdState::Completed | HwCmdState::Error) {
                continue;
            }

            let Some(cmd) = pending.get(&slot.cmd_counter) else {
                tracing::error!(
                    counter = slot.cmd_counter,
                    session = session.id(),
                    "completed buffer has no pending command"
                );
                return Err(AccelError::Integrity(
                    "completion for unknown command".into(),
                ));
            };
            if cmd.nonce != slot.cmd_nonce || cmd.cu_index != slot.cu_index || cmd.slot != idx {
                tracing::error!(
                    counter = slot.cmd_counter,
                    session = session.id(),
                    "completed buffer does not match its recorded command identity"
                );
                return Err(AccelError::Integrity(
                    "command identity mismatch on completion".into(),
                ));
            }

            if slot.state == HwCmdState::Error {
                let mut errors = session.commands.error_codes.lock();
                if errors.len() >= MAX_ERROR_CODES {
                    tracing::warn!("command error-code table full; dropping oldest entries");
                    errors.clear();
                }
                errors.insert(slot.cmd_counter, slot.return_code);
            }

            pending.remove(&slot.cmd_counter);
            pool.slots[idx].reset();
            session
                .commands
                .complete_credits
                .fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Polls the given commands, optionally blocking until all of them have
    /// completed or `wait` expires (expiry is an error, not a silent hang).
    ///
    /// Returns how many of the commands finished during this call. A command
    /// already reported finished stays `finished` but is never counted again.
    pub fn poll(
        &self,
        session: &Session,
        commands: &mut [CommandStatus],
        wait: Option<Duration>,
    ) -> Result<usize> {
        if commands.is_empty() {
            return Err(AccelError::Invalid("no commands to poll".into()));
        }
        for status in commands.iter() {
            if status.handle.session_signature != session.signature() {
                tracing::error!(
                    session = session.id(),
                    "command handle does not belong to this session"
                );
                return Err(AccelError::Integrity(
                    "command handle signature mismatch".into(),
                ));
            }
            if status.handle.counter == 0 {
                return Err(AccelError::Invalid(
                    "command handle from failed submission".into(),
                ));
            }
        }

        let deadline = wait.map(|d| Instant::now() + d);
        let was_pending: Vec<bool> = {
            let pending = session.commands.pending.lock();
            commands
                .iter()
                .map(|c| pending.contains_key(&c.handle.counter))
                .collect()
        };

        loop {
            self.reap_completions(session)?;

            let all_done = {
                let pending = session.commands.pending.lock();
                let errors = session.commands.error_codes.lock();
                let mut done = true;
                for status in commands.iter_mut() {
                    status.finished = !pending.contains_key(&status.handle.counter);
                    if let Some(rc) = errors.get(&status.handle.counter) {
                        status.return_code = *rc;
                    }
                    done &= status.finished;
                }
                done
            };

            match (all_done, deadline) {
                (true, _) | (false, None) => break,
                (false, Some(d)) => {
                    if Instant::now() >= d {
                        return Err(AccelError::Timeout(
                            "commands still pending at poll deadline".into(),
                        ));
                    }
                    self.queue.wait(Duration::from_millis(10));
                }
            }
        }

        let newly = {
            let pending = session.commands.pending.lock();
            commands
                .iter()
                .zip(was_pending)
                .filter(|(c, was)| *was && !pending.contains_key(&c.handle.counter))
                .count()
        };
        Ok(newly)
    }

    /// Waits for any one of the session's commands to complete.
    ///
    /// Each completion is consumed exactly once across all calls. Expiry of
    /// `timeout` is a [`AccelError::Timeout`], distinguishing a busy device
    /// from a broken one.
    pub fn wait_any(&self, session: &Session, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let credits = &session.commands.complete_credits;
            let mut current = credits.load(Ordering::Acquire);
            while current > 0 {
                match credits.compare_exchange_weak(
                    current,
                    current - 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        if current > 256 {
                            tracing::warn!(
                                "completion backlog above 256; caller is slow to reap output"
                            );
                        }
                        return Ok(());
                    }
                    Err(seen) => current = seen,
                }
            }

            if session.commands.pending_count() == 0 {
                tracing::warn!(
                    session = session.id(),
                    "waiting with no outstanding commands"
                );
            }

            self.reap_completions(session)?;
            if session.commands.complete_credits.load(Ordering::Acquire) > 0 {
                continue;
            }
            if Instant::now() >= deadline {
                return Err(AccelError::Timeout(
                    "no command completed within bound".into(),
                ));
            }
            self.queue.wait(Duration::from_millis(10));
        }
    }

    /// Per-command hardware return codes, valid only after completion.
    ///
    /// Returns the number of commands that completed with an error and fills
    /// each status's `return_code`. Asking before completion is an error.
    pub fn return_codes(&self, session: &Session, commands: &mut [CommandStatus]) -> Result<u32> {
        if commands.is_empty() {
            return Err(AccelError::Invalid("no commands to query".into()));
        }
        let pending = session.commands.pending.lock();
        let mut errors = session.commands.error_codes.lock();
        let mut error_count = 0;
        for status in commands.iter() {
            if status.handle.session_signature != session.signature() {
                return Err(AccelError::Integrity(
                    "command handle signature mismatch".into(),
                ));
            }
            if pending.contains_key(&status.handle.counter) {
                return Err(AccelError::Invalid(
                    "return code requested before command completion".into(),
                ));
            }
        }
        for status in commands.iter_mut() {
            status.finished = true;
            status.return_code = match errors.remove(&status.handle.counter) {
                Some(rc) => {
                    error_count += 1;
                    rc
                }
                None => 0,
            };
        }
        Ok(error_count)
    }

    /// In-use buffer count, for diagnostics and tests.
    pub fn buffers_in_use(&self) -> usize {
        self.pool.lock().slots.iter().filter(|s| s.in_use).count()
    }

    pub fn pool_size(&self) -> usize {
        self.pool.lock().slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::SessionKind;
    use crate::core::sim::SimQueue;

    fn dispatch() -> (DeviceDispatch, Arc<SimQueue>) {
        let queue = Arc::new(SimQueue::new());
        (DeviceDispatch::new(4, queue.clone()), queue)
    }

    fn session() -> Session {
        Session::new(7, SessionKind::Encoder)
    }

    #[test]
    fn test_spinlock_serializes_access() {
        let lock = Arc::new(Spinlock::new(0u64));
        std::thread::scope(|s| {
            for _ in 0..4 {
                let lock = lock.clone();
                s.spawn(move || {
                    for _ in 0..1000 {
                        *lock.lock() += 1;
                    }
                });
            }
        });
        assert_eq!(*lock.lock(), 4000);
    }

    #[test]
    fn test_channel_id_written_into_dataflow_word() {
        let (dispatch, _queue) = dispatch();
        let mut session = session();
        session.chan_id = 3;

        let regmap = vec![0xAAu8; 64];
        dispatch
            .submit(&session, [1, 0, 0, 0], 0, false, true, &regmap)
            .unwrap();

        let pool = dispatch.pool.lock();
        let slot = pool.slots.iter().find(|s| s.in_use).unwrap();
        let base = REGMAP_CHANNEL_WORD * 4;
        assert_eq!(&slot.payload()[base..base + 4], &3u32.to_le_bytes());
        assert_eq!(&slot.payload()[base + 4..base + 8], &[0, 0, 0, 0]);
        // Bytes outside the dataflow words are untouched.
        assert_eq!(slot.payload()[0], 0xAA);
    }

    #[test]
    fn test_single_channel_kernel_regmap_untouched() {
        let (dispatch, _queue) = dispatch();
        let session = session();

        let regmap = vec![0xAAu8; 64];
        dispatch
            .submit(&session, [1, 0, 0, 0], 0, false, false, &regmap)
            .unwrap();

        let pool = dispatch.pool.lock();
        let slot = pool.slots.iter().find(|s| s.in_use).unwrap();
        assert!(slot.payload().iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_command_counters_are_distinct() {
        let (dispatch, _queue) = dispatch();
        let session = session();
        let a = dispatch
            .submit(&session, [1, 0, 0, 0], 0, false, false, &[0; 8])
            .unwrap();
        let b = dispatch
            .submit(&session, [1, 0, 0, 0], 0, false, false, &[0; 8])
            .unwrap();
        assert_ne!(a.counter, b.counter);
        assert_ne!(a.nonce, b.nonce);
        assert!(a.counter > 0 && b.counter > 0);
    }

    #[test]
    fn test_corrupted_slot_identity_trips_integrity_check() {
        let (dispatch, queue) = dispatch();
        let session = session();
        let handle = dispatch
            .submit(&session, [1, 0, 0, 0], 0, false, false, &[0; 8])
            .unwrap();
        queue.complete_all();

        // Simulate memory corruption of the recorded nonce.
        {
            let mut pool = dispatch.pool.lock();
            let slot = pool.slots.iter_mut().find(|s| s.in_use).unwrap();
            slot.cmd_nonce = slot.cmd_nonce.wrapping_add(1);
        }

        let mut statuses = [CommandStatus::new(handle)];
        let err = dispatch.poll(&session, &mut statuses, None).unwrap_err();
        assert!(matches!(err, AccelError::Integrity(_)));
    }
}
