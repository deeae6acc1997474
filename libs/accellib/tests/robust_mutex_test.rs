//! Direct owner-dead recovery test for the crash-tolerant shared lock,
//! over an anonymous shared mapping and a real child process death.

#![cfg(target_os = "linux")]

use std::time::Duration;

use accellib::core::shm::SharedMutex;
use serial_test::serial;

fn map_shared_mutex() -> *mut SharedMutex {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            std::mem::size_of::<SharedMutex>(),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    assert_ne!(ptr, libc::MAP_FAILED);
    ptr as *mut SharedMutex
}

#[test]
#[serial]
fn test_owner_death_reported_and_recovered() {
    let ptr = map_shared_mutex();
    unsafe { SharedMutex::init(ptr, false).unwrap() };
    let mutex = unsafe { &*ptr };

    let child = unsafe { libc::fork() };
    assert!(child >= 0);
    if child == 0 {
        // Die while holding the lock.
        let _ = mutex.lock();
        unsafe { libc::_exit(0) };
    }
    let mut status = 0;
    unsafe { libc::waitpid(child, &mut status, 0) };

    // Acquisition reports the dead owner, marks the mutex consistent, and
    // proceeds; a subsequent acquisition is ordinary.
    let recovered = mutex.lock_timed(Duration::from_secs(2)).unwrap();
    assert!(recovered);
    mutex.unlock().unwrap();

    let recovered = mutex.lock_timed(Duration::from_secs(2)).unwrap();
    assert!(!recovered);
    mutex.unlock().unwrap();
}
