// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Simulated hardware queue.
//!
//! Stands in for the vendor driver wherever no card is present: unit and
//! integration tests, and development hosts. Commands complete only when the
//! test harness says so, which makes completion-ordering behavior
//! observable and deterministic.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::core::command::{ExecSlot, HwCmdState, HwQueue};
use crate::core::error::Result;

#[derive(Default)]
struct SimState {
    /// Slot indices in submission order, not yet completed.
    queued: VecDeque<usize>,
    /// Completions waiting to be folded into slot state on next refresh.
    finished: Vec<(usize, i32)>,
}

/// A device that completes commands on request.
#[derive(Default)]
pub struct SimQueue {
    state: Mutex<SimState>,
    progress: Condvar,
}

impl SimQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the oldest queued command complete, FIFO. Returns false when
    /// nothing is in flight.
    pub fn complete_next(&self) -> bool {
        self.complete_next_with(0)
    }

    /// Completes the oldest queued command with a hardware return code;
    /// nonzero reports the command as errored.
    pub fn complete_next_with(&self, return_code: i32) -> bool {
        let mut state = self.state.lock();
        match state.queued.pop_front() {
            Some(idx) => {
                state.finished.push((idx, return_code));
                self.progress.notify_all();
                true
            }
            None => false,
        }
    }

    /// Completes everything currently queued, in order.
    pub fn complete_all(&self) -> usize {
        let mut state = self.state.lock();
        let mut n = 0;
        while let Some(idx) = state.queued.pop_front() {
            state.finished.push((idx, 0));
            n += 1;
        }
        if n > 0 {
            self.progress.notify_all();
        }
        n
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().queued.len()
    }
}

impl HwQueue for SimQueue {
    fn enqueue(&self, slot_index: usize) -> Result<()> {
        let mut state = self.state.lock();
        state.queued.push_back(slot_index);
        Ok(())
    }

    fn refresh(&self, slots: &mut [ExecSlot]) {
        let mut state = self.state.lock();
        for (idx, return_code) in state.finished.drain(..) {
            if let Some(slot) = slots.get_mut(idx) {
                slot.state = if return_code == 0 {
                    HwCmdState::Completed
                } else {
                    HwCmdState::Error
                };
                slot.return_code = return_code;
            }
        }
    }

    fn wait(&self, timeout: Duration) {
        let mut state = self.state.lock();
        if state.finished.is_empty() {
            let _ = self.progress.wait_for(&mut state, timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_completion_order() {
        let q = SimQueue::new();
        q.enqueue(3).unwrap();
        q.enqueue(1).unwrap();
        q.enqueue(2).unwrap();
        assert!(q.complete_next());
        assert!(q.complete_next());

        let state = q.state.lock();
        let order: Vec<usize> = state.finished.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![3, 1]);
    }

    #[test]
    fn test_complete_next_empty() {
        let q = SimQueue::new();
        assert!(!q.complete_next());
    }
}
