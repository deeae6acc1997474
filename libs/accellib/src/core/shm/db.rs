// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Create-or-attach lifecycle of the shared resource database.
//!
//! The first process wins an exclusive create on the backing file,
//! initializes every record and the robust lock, and later drops a
//! zero-length ready marker once hardware configuration has completed. Late
//! joiners attach to the existing mapping, verify the recorded clients are
//! still alive (reclaiming anything a crashed process left behind), and wait
//! for the ready marker instead of re-running configuration.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::time::{Duration, Instant};

use crate::core::config::SystemConfig;
use crate::core::error::{AccelError, Result};
use crate::core::process::is_alive;
use crate::core::shm::layout::{DbLayout, MAX_DEVICES, MAX_DEVICE_KERNELS, MAX_IMAGES};
use crate::core::shm::mutex::SharedMutex;

/// How long an attaching process waits for the creator to finish
/// configuration before giving up.
const READY_WAIT: Duration = Duration::from_secs(30);

/// Backing-store locations for one database instance.
#[derive(Debug, Clone)]
pub struct DbOptions {
    pub db_path: PathBuf,
    pub ready_path: PathBuf,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/tmp/accel_shm_db"),
            ready_path: PathBuf::from("/tmp/accel_shm_db_ready"),
        }
    }
}

impl DbOptions {
    /// Paths rooted in `dir`, used by tests to isolate databases.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            db_path: dir.join("accel_shm_db"),
            ready_path: dir.join("accel_shm_db_ready"),
        }
    }
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| AccelError::Invalid(format!("path contains NUL: {}", path.display())))
}

fn last_os_err(context: &str) -> AccelError {
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    AccelError::Os {
        errno,
        context: context.to_string(),
    }
}

/// Handle to the mapped database. One per process.
pub struct SharedDatabase {
    ptr: NonNull<DbLayout>,
    opts: DbOptions,
    owner: bool,
}

unsafe impl Send for SharedDatabase {}
unsafe impl Sync for SharedDatabase {}

/// RAII view of the records, valid while the database lock is held.
pub struct DbGuard<'a> {
    db: &'a SharedDatabase,
}

impl std::ops::Deref for DbGuard<'_> {
    type Target = DbLayout;
    fn deref(&self) -> &DbLayout {
        unsafe { self.db.ptr.as_ref() }
    }
}

impl std::ops::DerefMut for DbGuard<'_> {
    fn deref_mut(&mut self) -> &mut DbLayout {
        // The process-shared lock is held for the guard's lifetime, so no
        // other view of the mapping exists.
        unsafe { &mut *self.db.ptr.as_ptr() }
    }
}

impl Drop for DbGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = unsafe { self.db.ptr.as_ref() }.lock.unlock() {
            tracing::warn!("failed to release database lock: {e}");
        }
    }
}

impl SharedDatabase {
    /// Creates or attaches the database described by `config`.
    ///
    /// Exactly one returned handle per backing store reports
    /// [`is_config_owner`](Self::is_config_owner) = true; that process must
    /// run hardware configuration and then call [`mark_ready`](Self::mark_ready).
    pub fn open(config: &SystemConfig, opts: DbOptions) -> Result<SharedDatabase> {
        let path = c_path(&opts.db_path)?;
        let fd = unsafe {
            libc::open(
                path.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL | libc::O_CLOEXEC,
                0o666,
            )
        };
        if fd >= 0 {
            return Self::create(fd, config, opts);
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno != libc::EEXIST {
            return Err(AccelError::Os {
                errno,
                context: format!("open {}", opts.db_path.display()),
            });
        }
        tracing::debug!("resource database already exists; attaching");
        Self::attach(config, opts)
    }

    fn map(fd: i32) -> Result<NonNull<DbLayout>> {
        let len = std::mem::size_of::<DbLayout>();
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if ptr == libc::MAP_FAILED {
            return Err(last_os_err("mmap resource database"));
        }
        Ok(NonNull::new(ptr as *mut DbLayout).expect("mmap returned a non-null mapping"))
    }

    fn create(fd: i32, config: &SystemConfig, opts: DbOptions) -> Result<SharedDatabase> {
        unsafe {
            libc::fchmod(fd, 0o666);
            if libc::ftruncate(fd, std::mem::size_of::<DbLayout>() as libc::off_t) != 0 {
                let err = last_os_err("ftruncate resource database");
                libc::close(fd);
                return Err(err);
            }
        }
        let ptr = Self::map(fd)?;
        unsafe {
            SharedMutex::init(&raw mut (*ptr.as_ptr()).lock, false)?;
        }
        // A marker surviving from a previous boot must not convince joiners
        // that this fresh database is configured.
        let _ = std::fs::remove_file(&opts.ready_path);

        let db = SharedDatabase {
            ptr,
            opts,
            owner: true,
        };
        {
            let mut guard = db.lock()?;
            initialize_records(&mut guard, config, std::process::id());
        }
        tracing::info!("created resource database at {}", db.opts.db_path.display());
        Ok(db)
    }

    fn attach(config: &SystemConfig, opts: DbOptions) -> Result<SharedDatabase> {
        let path = c_path(&opts.db_path)?;
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(last_os_err("open existing resource database"));
        }
        let ptr = Self::map(fd)?;
        let mut db = SharedDatabase {
            ptr,
            opts,
            owner: false,
        };

        let reinitialized = db.verify_clients(config)?;
        if reinitialized {
            // The previous configuration was orphaned; this process takes
            // over as config owner and must re-run hardware setup.
            db.owner = true;
            tracing::info!("reinitialized orphaned resource database");
            return Ok(db);
        }

        let deadline = Instant::now() + READY_WAIT;
        while !db.init_completed() {
            if !db.opts.db_path.exists() {
                return Err(AccelError::Invalid(
                    "resource database removed while waiting for configuration".into(),
                ));
            }
            if Instant::now() >= deadline {
                return Err(AccelError::Timeout(
                    "configuration not marked ready within bound".into(),
                ));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(db)
    }

    /// Whether this process is responsible for hardware configuration.
    pub fn is_config_owner(&self) -> bool {
        self.owner
    }

    /// Acquires the database lock, bounded. Owner-dead recovery is silent:
    /// the next allocation scan reclaims whatever the dead holder recorded.
    pub fn lock(&self) -> Result<DbGuard<'_>> {
        unsafe { self.ptr.as_ref() }.lock.lock()?;
        Ok(DbGuard { db: self })
    }

    /// Signals that hardware configuration has completed.
    ///
    /// Creates the zero-length marker exactly once; losing the create race is
    /// not an error.
    pub fn mark_ready(&self) -> Result<()> {
        {
            let mut guard = self.lock()?;
            guard.ready = true;
        }
        let path = c_path(&self.opts.ready_path)?;
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_CREAT | libc::O_EXCL, 0o644) };
        if fd < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EEXIST {
                return Ok(());
            }
            return Err(AccelError::Os {
                errno,
                context: format!("create ready marker {}", self.opts.ready_path.display()),
            });
        }
        unsafe {
            libc::fchmod(fd, 0o644);
            libc::close(fd);
        }
        Ok(())
    }

    /// Whether configuration has been marked complete.
    pub fn init_completed(&self) -> bool {
        self.opts.ready_path.exists()
    }

    /// The per-kernel register-map lock, reachable without taking the
    /// database lock. Only valid for kernels a prior allocation initialized;
    /// requesting an uninitialized lock is a caller error.
    pub fn kernel_mutex(&self, dev: usize, kern: usize) -> Result<&SharedMutex> {
        if dev >= MAX_DEVICES || kern >= MAX_DEVICE_KERNELS {
            return Err(AccelError::Invalid(format!(
                "kernel reference {dev}/{kern} out of range"
            )));
        }
        // Mutex operations are process-shared and atomic at the OS level;
        // the reference never escapes the mapping's lifetime.
        unsafe {
            let base = self.ptr.as_ptr();
            let kern_ptr = &raw const (*base).devices[dev].kernels[kern];
            if !std::ptr::read(&raw const (*kern_ptr).lock_initialized) {
                return Err(AccelError::Invalid(format!(
                    "kernel {dev}/{kern} lock not initialized"
                )));
            }
            Ok(&(*kern_ptr).lock)
        }
    }

    /// Drops dead clients and their resources; reinitializes the records when
    /// no live client remains or configuration was interrupted. Registers the
    /// calling process either way. Returns true on reinitialization.
    fn verify_clients(&self, config: &SystemConfig) -> Result<bool> {
        let my_pid = std::process::id();
        let mut guard = self.lock()?;

        let mut i = guard.ref_cnt as i64 - 1;
        while i >= 0 {
            let pid = guard.clients()[i as usize];
            if !is_alive(pid) {
                tracing::debug!(pid, "dropping dead resource database client");
                guard.remove_client_ref_at(i as usize);
                guard.release_all_for(pid);
            }
            i -= 1;
        }

        let interrupted = guard.config_owner == 0 && !guard.ready;
        if guard.ref_cnt == 0 || interrupted {
            initialize_records(&mut guard, config, my_pid);
            drop(guard);
            let _ = std::fs::remove_file(&self.opts.ready_path);
            return Ok(true);
        }

        if !guard.add_client_ref(my_pid, false) {
            return Err(AccelError::Invalid(
                "resource database client list is full".into(),
            ));
        }
        Ok(false)
    }

    fn close_impl(&mut self) {
        let my_pid = std::process::id();
        let remove = match self.lock() {
            Ok(mut guard) => {
                guard.remove_client_ref(my_pid);
                guard.release_all_for(my_pid);
                guard.ref_cnt == 0
            }
            Err(e) => {
                tracing::warn!("could not lock database during close: {e}");
                false
            }
        };

        unsafe {
            libc::munmap(
                self.ptr.as_ptr() as *mut libc::c_void,
                std::mem::size_of::<DbLayout>(),
            );
        }

        if remove {
            let _ = std::fs::remove_file(&self.opts.db_path);
            let _ = std::fs::remove_file(&self.opts.ready_path);
            tracing::debug!("removed resource database backing store");
        }
    }
}

impl Drop for SharedDatabase {
    fn drop(&mut self) {
        self.close_impl();
    }
}

/// Populates the device and image tables from configuration.
///
/// Runs under the database lock, both at first creation and when a dead
/// configuration owner forces reinitialization.
fn initialize_records(db: &mut DbLayout, config: &SystemConfig, my_pid: u32) {
    unsafe {
        std::ptr::write_bytes(&raw mut db.devices, 0, 1);
        std::ptr::write_bytes(&raw mut db.images, 0, 1);
    }
    db.ready = false;

    for dev_id in config.device_ids() {
        let Some(dev) = db.devices.get_mut(dev_id as usize) else {
            tracing::warn!(dev_id, max = MAX_DEVICES, "configured device out of range");
            continue;
        };
        dev.exists = true;
        dev.configured = true;
        dev.excl = false;
    }

    // Plugin handles number each function class independently, matching the
    // order the registry loads plugin tables in.
    let mut per_function = [0i32; 5];

    for (img_id, img) in config.images.iter().take(MAX_IMAGES).enumerate() {
        let image = &mut db.images[img_id];
        image.set_name(&img.name);
        let kern_count = img.kernels.len().min(MAX_DEVICE_KERNELS);
        image.kernel_cnt = kern_count as u32;
        for (k, kc) in img.kernels.iter().take(kern_count).enumerate() {
            let func_slot = kc.function as usize;
            let handle = per_function[func_slot];
            per_function[func_slot] += 1;
            image.kernels[k].set(&kc.name, &kc.vendor, kc.function, kc.type_tag, handle);
        }

        for &dev_id in &img.devices {
            let Some(dev) = db.devices.get_mut(dev_id as usize) else {
                continue;
            };
            dev.image_id = img_id as u32;
            let mut tot = 0usize;
            for (k, kc) in img.kernels.iter().take(kern_count).enumerate() {
                for _ in 0..kc.instances {
                    if tot >= MAX_DEVICE_KERNELS {
                        tracing::warn!(
                            dev_id,
                            image = %img.name,
                            "kernel instance table full; remaining instances dropped"
                        );
                        break;
                    }
                    dev.kernels[tot].kernel_id = k as u32;
                    tot += 1;
                }
            }
            dev.kernel_cnt = tot as u32;
        }
    }

    db.add_client_ref(my_pid, true);
}
