//! A lock embedded inside a shared-memory region, usable from every
//! process that maps it.
//!
//! The default flavor is a counting semaphore initialized to one, which is
//! the cheapest primitive POSIX guarantees to work in process-shared
//! memory.  With the `rwlock` feature the flavor is a process-shared
//! rwlock instead, which lets readers of a registry walk it concurrently.
//! Both flavors expose the same guard API; under the semaphore a shared
//! acquisition is simply exclusive.

use std::cell::UnsafeCell;
use std::io;

/// The lock.  Exactly one of these lives at a fixed offset inside every
/// registry region; it is operated on in place and never moved or copied.
#[repr(C)]
pub struct RegionLock {
    #[cfg(not(feature = "rwlock"))]
    inner: UnsafeCell<libc::sem_t>,
    #[cfg(feature = "rwlock")]
    inner: UnsafeCell<libc::pthread_rwlock_t>,
}

// Operated on only through the process-shared primitive inside.
unsafe impl Sync for RegionLock {}
unsafe impl Send for RegionLock {}

/// Releases the lock when dropped.
pub struct RegionLockGuard<'a> {
    lock: &'a RegionLock,
    #[cfg(feature = "rwlock")]
    shared: bool,
}

impl RegionLock {
    /// Initializes the lock in place.  Must be called exactly once, by the
    /// creator of the region, before any other process maps it.
    ///
    /// # Safety
    ///
    /// `this` must point into a shared mapping with room for a
    /// `RegionLock`, and no other process may touch the lock until this
    /// returns.
    pub unsafe fn init_in_place(this: *mut RegionLock) -> io::Result<()> {
        #[cfg(not(feature = "rwlock"))]
        {
            if libc::sem_init((*this).inner.get(), 1, 1) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        #[cfg(feature = "rwlock")]
        {
            let mut attr = std::mem::zeroed::<libc::pthread_rwlockattr_t>();
            let rc = libc::pthread_rwlockattr_init(&mut attr);
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            libc::pthread_rwlockattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED);
            let rc = libc::pthread_rwlock_init((*this).inner.get(), &attr);
            libc::pthread_rwlockattr_destroy(&mut attr);
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
        }
        Ok(())
    }

    /// Destroys the lock in place.  Only the creator calls this, after all
    /// other processes have unmapped the region.
    ///
    /// # Safety
    ///
    /// The lock must be initialized and unheld.
    pub unsafe fn destroy_in_place(this: *mut RegionLock) {
        #[cfg(not(feature = "rwlock"))]
        libc::sem_destroy((*this).inner.get());
        #[cfg(feature = "rwlock")]
        libc::pthread_rwlock_destroy((*this).inner.get());
    }

    /// Acquires the lock exclusively.
    pub fn acquire(&self) -> io::Result<RegionLockGuard<'_>> {
        #[cfg(not(feature = "rwlock"))]
        loop {
            if unsafe { libc::sem_wait(self.inner.get()) } == 0 {
                return Ok(RegionLockGuard { lock: self });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
        #[cfg(feature = "rwlock")]
        {
            let rc = unsafe { libc::pthread_rwlock_wrlock(self.inner.get()) };
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            Ok(RegionLockGuard {
                lock: self,
                shared: false,
            })
        }
    }

    /// Acquires the lock for reading.  With the semaphore flavor this is
    /// the same as [`RegionLock::acquire`].
    pub fn acquire_shared(&self) -> io::Result<RegionLockGuard<'_>> {
        #[cfg(not(feature = "rwlock"))]
        {
            self.acquire()
        }
        #[cfg(feature = "rwlock")]
        {
            let rc = unsafe { libc::pthread_rwlock_rdlock(self.inner.get()) };
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }
            Ok(RegionLockGuard {
                lock: self,
                shared: true,
            })
        }
    }
}

impl Drop for RegionLockGuard<'_> {
    fn drop(&mut self) {
        #[cfg(not(feature = "rwlock"))]
        {
            if unsafe { libc::sem_post(self.lock.inner.get()) } < 0 {
                log::error!("sem_post failed: {}", io::Error::last_os_error());
            }
        }
        #[cfg(feature = "rwlock")]
        {
            let _ = self.shared;
            let rc = unsafe { libc::pthread_rwlock_unlock(self.lock.inner.get()) };
            if rc != 0 {
                log::error!("rwlock unlock failed: {}", io::Error::from_raw_os_error(rc));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Aligned(MaybeUninit<RegionLock>);

    fn new_lock() -> Arc<Aligned> {
        let cell = Arc::new(Aligned(MaybeUninit::uninit()));
        unsafe {
            RegionLock::init_in_place(cell.0.as_ptr() as *mut RegionLock).unwrap();
        }
        cell
    }

    unsafe impl Send for Aligned {}
    unsafe impl Sync for Aligned {}

    #[test]
    fn lock_excludes_racing_threads() {
        let cell = new_lock();
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let cell = Arc::clone(&cell);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                let lock = unsafe { &*cell.0.as_ptr() };
                for _ in 0..1000 {
                    let _guard = lock.acquire().unwrap();
                    // Non-atomic-looking increment under the lock.
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
        unsafe { RegionLock::destroy_in_place(cell.0.as_ptr() as *mut RegionLock) };
    }

    #[test]
    fn guard_releases_on_drop() {
        let cell = new_lock();
        let lock = unsafe { &*cell.0.as_ptr() };
        drop(lock.acquire().unwrap());
        drop(lock.acquire_shared().unwrap());
        // A third acquisition still succeeds, so both guards released.
        drop(lock.acquire().unwrap());
        unsafe { RegionLock::destroy_in_place(cell.0.as_ptr() as *mut RegionLock) };
    }
}
