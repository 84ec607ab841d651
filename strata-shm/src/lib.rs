//! POSIX shared-memory objects and the cross-process locks embedded in
//! them.
//!
//! Every z-order registry and every window surface lives in a named
//! shared-memory object.  The server creates and owns each object; clients
//! open the name (or receive the descriptor over the socket) and map it
//! read-write.  The object is unlinked when its owner drops it, so the
//! mapping disappears with the last process that holds it.

use std::ffi::CString;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::ptr;

use thiserror::Error;

pub mod lock;
pub mod surface;

pub use lock::{RegionLock, RegionLockGuard};
pub use surface::Surface;

/// Errors from creating or mapping a shared-memory object.
#[derive(Debug, Error)]
pub enum ShmError {
    /// The object name was empty, too long, or contained a NUL byte.
    #[error("invalid shared-memory object name {0:?}")]
    BadName(String),
    /// A zero-sized object was requested.
    #[error("shared-memory object must not be empty")]
    BadSize,
    /// `shm_open` failed.
    #[error("cannot open shared-memory object {name:?}: {source}")]
    Open {
        /// The object name.
        name: String,
        /// The underlying error.
        source: io::Error,
    },
    /// `ftruncate` failed.
    #[error("cannot size shared-memory object: {0}")]
    Truncate(#[source] io::Error),
    /// `mmap` failed.
    #[error("cannot map shared-memory object: {0}")]
    Map(#[source] io::Error),
    /// The object on disk is smaller than the caller expects.
    #[error("shared-memory object is {actual} bytes, expected at least {expected}")]
    Undersized {
        /// Size reported by `fstat`.
        actual: u64,
        /// Size the caller requires.
        expected: usize,
    },
}

/// A mapped POSIX shared-memory object.
///
/// The creator owns the name and unlinks it on drop.  Openers only unmap.
/// The mapping itself stays valid for the lifetime of this value; it is
/// shared with other processes, so all access to its contents must go
/// through volatile or locked accessors provided by higher layers.
pub struct ShmObject {
    ptr: *mut u8,
    len: usize,
    fd: RawFd,
    name: CString,
    owner: bool,
}

// The raw pointer is to a shared mapping that this type never aliases
// mutably itself; synchronization is the embedded region lock's job.
unsafe impl Send for ShmObject {}
unsafe impl Sync for ShmObject {}

fn check_name(name: &str) -> Result<CString, ShmError> {
    if name.is_empty() || name.len() > 255 || !name.starts_with('/') {
        return Err(ShmError::BadName(name.to_owned()));
    }
    CString::new(name).map_err(|_| ShmError::BadName(name.to_owned()))
}

fn map_fd(fd: RawFd, len: usize) -> Result<*mut u8, ShmError> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(ShmError::Map(io::Error::last_os_error()));
    }
    Ok(ptr.cast())
}

impl ShmObject {
    /// Creates a new object of `len` bytes under `name` and maps it.  The
    /// name must not already exist; the object is zero-filled.
    pub fn create(name: &str, len: usize) -> Result<ShmObject, ShmError> {
        if len == 0 {
            return Err(ShmError::BadSize);
        }
        let cname = check_name(name)?;
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(ShmError::Open {
                name: name.to_owned(),
                source: io::Error::last_os_error(),
            });
        }
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } < 0 {
            let err = ShmError::Truncate(io::Error::last_os_error());
            unsafe {
                libc::close(fd);
                libc::shm_unlink(cname.as_ptr());
            }
            return Err(err);
        }
        let ptr = match map_fd(fd, len) {
            Ok(ptr) => ptr,
            Err(err) => {
                unsafe {
                    libc::close(fd);
                    libc::shm_unlink(cname.as_ptr());
                }
                return Err(err);
            }
        };
        log::debug!("created shm object {} ({} bytes)", name, len);
        Ok(ShmObject {
            ptr,
            len,
            fd,
            name: cname,
            owner: true,
        })
    }

    /// Opens and maps an existing object.  Fails if the object is smaller
    /// than `len`.
    pub fn open(name: &str, len: usize) -> Result<ShmObject, ShmError> {
        if len == 0 {
            return Err(ShmError::BadSize);
        }
        let cname = check_name(name)?;
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(ShmError::Open {
                name: name.to_owned(),
                source: io::Error::last_os_error(),
            });
        }
        let mut st = unsafe { std::mem::zeroed::<libc::stat>() };
        if unsafe { libc::fstat(fd, &mut st) } < 0 {
            let err = ShmError::Open {
                name: name.to_owned(),
                source: io::Error::last_os_error(),
            };
            unsafe { libc::close(fd) };
            return Err(err);
        }
        if (st.st_size as u64) < len as u64 {
            unsafe { libc::close(fd) };
            return Err(ShmError::Undersized {
                actual: st.st_size as u64,
                expected: len,
            });
        }
        let ptr = match map_fd(fd, len) {
            Ok(ptr) => ptr,
            Err(err) => {
                unsafe { libc::close(fd) };
                return Err(err);
            }
        };
        Ok(ShmObject {
            ptr,
            len,
            fd,
            name: cname,
            owner: false,
        })
    }

    /// Maps `len` bytes from a descriptor received over the socket.
    pub fn from_fd(fd: RawFd, len: usize) -> Result<ShmObject, ShmError> {
        if len == 0 {
            return Err(ShmError::BadSize);
        }
        let ptr = map_fd(fd, len)?;
        Ok(ShmObject {
            ptr,
            len,
            fd,
            name: CString::default(),
            owner: false,
        })
    }

    /// Base of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty.  Never true for a live object.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Name of the object, empty when mapped from a bare descriptor.
    pub fn name(&self) -> &str {
        self.name.to_str().unwrap_or("")
    }

    /// Whether this handle created (and will unlink) the object.
    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl AsRawFd for ShmObject {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for ShmObject {
    fn drop(&mut self) {
        unsafe {
            if libc::munmap(self.ptr.cast(), self.len) < 0 {
                log::error!(
                    "munmap of {:?} failed: {}",
                    self.name,
                    io::Error::last_os_error()
                );
            }
            libc::close(self.fd);
            if self.owner {
                if libc::shm_unlink(self.name.as_ptr()) < 0 {
                    log::error!(
                        "shm_unlink of {:?} failed: {}",
                        self.name,
                        io::Error::last_os_error()
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/strata-test-{}-{}", tag, std::process::id())
    }

    #[test]
    fn create_map_and_reopen() {
        let name = unique_name("roundtrip");
        let obj = ShmObject::create(&name, 4096).unwrap();
        assert!(obj.is_owner());
        unsafe { obj.as_ptr().write(0xA5) };

        let other = ShmObject::open(&name, 4096).unwrap();
        assert!(!other.is_owner());
        assert_eq!(unsafe { other.as_ptr().read() }, 0xA5);
    }

    #[test]
    fn create_rejects_existing_name() {
        let name = unique_name("exclusive");
        let _obj = ShmObject::create(&name, 64).unwrap();
        assert!(matches!(
            ShmObject::create(&name, 64),
            Err(ShmError::Open { .. })
        ));
    }

    #[test]
    fn open_rejects_undersized_object() {
        let name = unique_name("undersized");
        let _obj = ShmObject::create(&name, 128).unwrap();
        assert!(matches!(
            ShmObject::open(&name, 4096),
            Err(ShmError::Undersized { .. })
        ));
    }

    #[test]
    fn bad_names_are_rejected() {
        assert!(matches!(
            ShmObject::create("no-slash", 64),
            Err(ShmError::BadName(_))
        ));
        assert!(matches!(ShmObject::create("", 64), Err(ShmError::BadName(_))));
        assert!(matches!(
            ShmObject::create("/zero", 0),
            Err(ShmError::BadSize)
        ));
    }

    #[test]
    fn unlink_happens_on_owner_drop() {
        let name = unique_name("unlink");
        {
            let _obj = ShmObject::create(&name, 64).unwrap();
        }
        assert!(matches!(
            ShmObject::open(&name, 64),
            Err(ShmError::Open { .. })
        ));
    }
}
