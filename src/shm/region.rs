//! SegmentRegion - POSIX shared memory wrapper.
//!
//! Provides a safe abstraction over shm_open and mmap for the segment
//! backing one queue. All unsafe operations are encapsulated with bounds
//! checking. Each process maps the segment at its own base address, so
//! everything inside addresses payloads by offset, never by pointer.

use std::ffi::CString;
use std::ptr::NonNull;

use crate::error::{ShqError, ShqResult};
use crate::types::QueueName;

/// Represents a mapped shared memory segment.
///
/// The struct owns the mapping and will unmap it on drop. Dropping never
/// unlinks: the segment and its contents persist across process exits and
/// are removed only by an explicit `unlink`.
pub struct SegmentRegion {
    /// Name of the backing queue.
    name: QueueName,
    /// Pointer to the mapped memory.
    ptr: NonNull<u8>,
    /// Size of the mapped region in bytes.
    size: usize,
    /// File descriptor for the shared memory object.
    fd: i32,
}

// SAFETY: SegmentRegion can be sent between threads as it owns its mapping.
unsafe impl Send for SegmentRegion {}

// SAFETY: SegmentRegion can be shared between threads; all access to the
// contents goes through in-segment atomics or the cross-process lock.
unsafe impl Sync for SegmentRegion {}

impl SegmentRegion {
    /// Minimum size for a segment.
    pub const MIN_SIZE: usize = 4096;

    /// Maximum size for a segment (1 GB).
    pub const MAX_SIZE: usize = 1024 * 1024 * 1024;

    /// Create a new shared memory segment.
    ///
    /// Exactly one of several racing creators wins `O_EXCL`; losers get
    /// `ShqError::AlreadyExists` and may fall back to `open`.
    ///
    /// # Errors
    /// Returns `AlreadyExists` if the name is taken, `AccessDenied` on
    /// permission failures, or `System` for other syscall errors.
    pub fn create(name: &QueueName, size: usize) -> ShqResult<Self> {
        if !(Self::MIN_SIZE..=Self::MAX_SIZE).contains(&size) {
            return Err(ShqError::InvalidArgument {
                reason: format!(
                    "segment size {} out of bounds ({}..={})",
                    size,
                    Self::MIN_SIZE,
                    Self::MAX_SIZE
                ),
            });
        }

        let c_name = Self::c_name(name)?;

        // SAFETY: c_name is a valid CString, flags are valid POSIX flags
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };

        if fd < 0 {
            let errno = std::io::Error::last_os_error();
            return Err(match errno.raw_os_error() {
                Some(libc::EEXIST) => ShqError::AlreadyExists {
                    name: name.to_string(),
                },
                Some(libc::EACCES) => ShqError::AccessDenied {
                    name: name.to_string(),
                    reason: errno.to_string(),
                },
                _ => ShqError::System {
                    op: "shm_open",
                    source: errno,
                },
            });
        }

        // SAFETY: fd is a valid file descriptor
        let result = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if result < 0 {
            let err = ShqError::last_os("ftruncate");
            unsafe { libc::close(fd) };
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(err);
        }

        let ptr = Self::map(fd, size).inspect_err(|_| {
            // SAFETY: fd came from the shm_open above
            unsafe { libc::close(fd) };
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
        })?;

        // Zero-initialize so the header starts from a known state
        // SAFETY: ptr is valid, size is the mapped length
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0, size);
        }

        tracing::debug!(name = %name, size = size, "created shared memory segment");

        Ok(Self {
            name: name.clone(),
            ptr,
            size,
            fd,
        })
    }

    /// Open an existing shared memory segment.
    ///
    /// The size is discovered from the object itself with `fstat`.
    pub fn open(name: &QueueName) -> ShqResult<Self> {
        let c_name = Self::c_name(name)?;

        // SAFETY: c_name is a valid CString
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };

        if fd < 0 {
            let errno = std::io::Error::last_os_error();
            return Err(match errno.raw_os_error() {
                Some(libc::ENOENT) => ShqError::NotFound {
                    name: name.to_string(),
                },
                Some(libc::EACCES) => ShqError::AccessDenied {
                    name: name.to_string(),
                    reason: errno.to_string(),
                },
                _ => ShqError::System {
                    op: "shm_open",
                    source: errno,
                },
            });
        }

        // SAFETY: fd is valid, stat is zeroed storage for the result
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let result = unsafe { libc::fstat(fd, &mut stat) };
        if result < 0 {
            let err = ShqError::last_os("fstat");
            unsafe { libc::close(fd) };
            return Err(err);
        }

        let size = stat.st_size as usize;
        if size < Self::MIN_SIZE {
            unsafe { libc::close(fd) };
            return Err(ShqError::InvalidState {
                reason: format!("segment '{}' is truncated ({} bytes)", name, size),
            });
        }

        let ptr = Self::map(fd, size).inspect_err(|_| {
            // SAFETY: fd came from the shm_open above
            unsafe { libc::close(fd) };
        })?;

        tracing::debug!(name = %name, size = size, "opened shared memory segment");

        Ok(Self {
            name: name.clone(),
            ptr,
            size,
            fd,
        })
    }

    /// Non-blocking existence probe.
    pub fn exists(name: &QueueName) -> bool {
        let Ok(c_name) = Self::c_name(name) else {
            return false;
        };
        // SAFETY: c_name is a valid CString
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd < 0 {
            return false;
        }
        // SAFETY: fd is valid, it was just opened
        unsafe { libc::close(fd) };
        true
    }

    /// Remove the name from the system.
    ///
    /// Existing mappings stay usable until their processes unmap (POSIX
    /// semantics); a subsequent `open` by name fails with `NotFound`.
    pub fn unlink(name: &QueueName) -> ShqResult<()> {
        let c_name = Self::c_name(name)?;
        // SAFETY: c_name is a valid CString
        let result = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if result < 0 {
            let errno = std::io::Error::last_os_error();
            return Err(match errno.raw_os_error() {
                Some(libc::ENOENT) => ShqError::NotFound {
                    name: name.to_string(),
                },
                _ => ShqError::System {
                    op: "shm_unlink",
                    source: errno,
                },
            });
        }
        tracing::debug!(name = %name, "unlinked shared memory segment");
        Ok(())
    }

    fn c_name(name: &QueueName) -> ShqResult<CString> {
        CString::new(name.shm_path()).map_err(|_| ShqError::InvalidPath {
            name: name.to_string(),
            reason: "queue name contains an interior NUL".to_string(),
        })
    }

    fn map(fd: i32, size: usize) -> ShqResult<NonNull<u8>> {
        // SAFETY: fd is valid, size is validated, offset 0 is valid
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(ShqError::last_os("mmap"));
        }

        Ok(NonNull::new(ptr as *mut u8).expect("mmap returned null but not MAP_FAILED"))
    }

    /// Get the name of the backing queue.
    pub fn name(&self) -> &QueueName {
        &self.name
    }

    /// Get the size of this segment.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get a raw pointer to the segment base.
    ///
    /// # Safety
    /// Caller must ensure proper synchronization when accessing the memory.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for SegmentRegion {
    fn drop(&mut self) {
        // SAFETY: ptr and size were set during creation
        let result = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size) };
        if result < 0 {
            tracing::error!(
                name = %self.name,
                error = %std::io::Error::last_os_error(),
                "failed to unmap shared memory segment"
            );
        }

        // SAFETY: fd was opened during creation
        unsafe { libc::close(self.fd) };
    }
}
