// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Crash-tolerant process-shared lock.
//!
//! Rust's standard library has no robust process-shared mutex, so this wraps
//! a `pthread_mutex_t` living inside the shared mapping. The robust attribute
//! is what makes crash recovery work: if the previous holder died while
//! holding the lock, acquisition returns `EOWNERDEAD`, the new holder marks
//! the mutex consistent and proceeds, and the resources the dead process
//! recorded become reclaimable. All unsafe FFI stays inside this module.

use std::cell::UnsafeCell;
use std::time::Duration;

use crate::core::error::{AccelError, Result};

/// Bound on every lock acquisition. Expiry is an error, never a silent wait.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// A robust, process-shared mutex embedded in shared memory.
///
/// The structure is only ever viewed in place inside a `MAP_SHARED` mapping;
/// it is never moved after [`SharedMutex::init`] runs.
#[repr(C)]
pub struct SharedMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

unsafe impl Send for SharedMutex {}
unsafe impl Sync for SharedMutex {}

fn os_err(errno: i32, context: &str) -> AccelError {
    AccelError::Os {
        errno,
        context: context.to_string(),
    }
}

impl SharedMutex {
    /// Initializes the mutex in place.
    ///
    /// # Safety
    ///
    /// `this` must point to writable shared memory that outlives every
    /// process attached to it, and must be initialized at most once per
    /// backing-store lifetime.
    pub unsafe fn init(this: *mut SharedMutex, prio_inherit: bool) -> Result<()> {
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            let rc = libc::pthread_mutexattr_init(&mut attr);
            if rc != 0 {
                return Err(os_err(rc, "pthread_mutexattr_init"));
            }
            libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            libc::pthread_mutexattr_setrobust(&mut attr, libc::PTHREAD_MUTEX_ROBUST);
            if prio_inherit {
                libc::pthread_mutexattr_setprotocol(&mut attr, libc::PTHREAD_PRIO_INHERIT);
            }
            let rc = libc::pthread_mutex_init((*this).inner.get(), &attr);
            libc::pthread_mutexattr_destroy(&mut attr);
            if rc != 0 {
                return Err(os_err(rc, "pthread_mutex_init"));
            }
        }
        Ok(())
    }

    /// Acquires the lock with the default bound.
    ///
    /// Returns `true` when the previous owner died holding the lock and the
    /// mutex was recovered; shared state may need dead-client verification.
    pub fn lock(&self) -> Result<bool> {
        self.lock_timed(LOCK_TIMEOUT)
    }

    /// Acquires the lock, waiting at most `timeout`.
    pub fn lock_timed(&self, timeout: Duration) -> Result<bool> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
        }
        ts.tv_sec += timeout.as_secs() as libc::time_t;
        ts.tv_nsec += timeout.subsec_nanos() as libc::c_long;
        if ts.tv_nsec >= 1_000_000_000 {
            ts.tv_sec += 1;
            ts.tv_nsec -= 1_000_000_000;
        }

        let rc = unsafe { libc::pthread_mutex_timedlock(self.inner.get(), &ts) };
        match rc {
            0 => Ok(false),
            libc::ETIMEDOUT => Err(AccelError::Timeout(
                "shared lock not acquired within bound".into(),
            )),
            libc::EOWNERDEAD => {
                tracing::info!("shared lock owner died; marking mutex consistent");
                let rc = unsafe { libc::pthread_mutex_consistent(self.inner.get()) };
                if rc != 0 {
                    tracing::error!(errno = rc, "failed to make shared lock consistent");
                    return Err(os_err(rc, "pthread_mutex_consistent"));
                }
                Ok(true)
            }
            other => Err(os_err(other, "pthread_mutex_timedlock")),
        }
    }

    pub fn unlock(&self) -> Result<()> {
        let rc = unsafe { libc::pthread_mutex_unlock(self.inner.get()) };
        if rc != 0 {
            return Err(os_err(rc, "pthread_mutex_unlock"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_unlock_roundtrip() {
        // Aligned heap memory stands in for a mapping here.
        let boxed: Box<SharedMutex> = Box::new(SharedMutex {
            inner: UnsafeCell::new(unsafe { std::mem::zeroed() }),
        });
        let ptr = Box::into_raw(boxed);
        unsafe {
            SharedMutex::init(ptr, false).unwrap();
            let m = &*ptr;
            assert!(!m.lock().unwrap());
            m.unlock().unwrap();
            drop(Box::from_raw(ptr));
        }
    }

    #[test]
    fn test_contended_lock_times_out() {
        let boxed: Box<SharedMutex> = Box::new(SharedMutex {
            inner: UnsafeCell::new(unsafe { std::mem::zeroed() }),
        });
        let ptr = Box::into_raw(boxed);
        unsafe {
            SharedMutex::init(ptr, false).unwrap();
            let m = &*ptr;
            assert!(!m.lock().unwrap());

            let held = std::sync::atomic::AtomicBool::new(true);
            std::thread::scope(|s| {
                let handle = s.spawn(|| {
                    let err = m.lock_timed(Duration::from_millis(50)).unwrap_err();
                    assert!(matches!(err, AccelError::Timeout(_)));
                    held.store(false, std::sync::atomic::Ordering::SeqCst);
                });
                handle.join().unwrap();
            });
            assert!(!held.load(std::sync::atomic::Ordering::SeqCst));
            m.unlock().unwrap();
            drop(Box::from_raw(ptr));
        }
    }
}
