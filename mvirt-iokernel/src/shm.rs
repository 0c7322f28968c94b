//! Shared memory regions backing the ingress packet pool.
//!
//! The production backing is a SysV shared memory segment identified by an
//! integer key, so runtime processes can attach the same segment and resolve
//! the offsets ([`ShmPtr`]) the dataplane hands them. An anonymous
//! `MAP_SHARED` mapping is available for tests and development runs where no
//! segment key or hugepage reservation exists.

use std::io;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::libc;
use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};
use thiserror::Error;
use tracing::{info, warn};

/// Regular page size
pub const PGSIZE_4KB: usize = 4096;

/// Hugepage size used for the ingress region
pub const PGSIZE_2MB: usize = 2 * 1024 * 1024;

/// `MPOL_PREFERRED` from `<linux/mempolicy.h>`
const MPOL_PREFERRED: libc::c_int = 1;

/// Offset of a byte inside a shared region.
///
/// This is the only form in which buffer addresses cross the process
/// boundary; each process translates it against its own attachment address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ShmPtr(u64);

impl ShmPtr {
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    pub const fn offset(self) -> u64 {
        self.0
    }
}

impl From<ShmPtr> for u64 {
    fn from(ptr: ShmPtr) -> u64 {
        ptr.0
    }
}

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shmget failed for key {key:#x}: {source}")]
    Get { key: i32, source: io::Error },

    #[error("shmat failed for key {key:#x}: {source}")]
    Attach { key: i32, source: io::Error },

    #[error("mmap failed: {0}")]
    Mmap(#[from] nix::errno::Errno),

    #[error("region length {len} is not a non-zero multiple of the page size {page_size}")]
    InvalidLength { len: usize, page_size: usize },
}

enum Backing {
    SysV { key: i32 },
    Anonymous,
}

/// A mapped shared memory region.
///
/// The mapping lives exactly as long as this value; every pointer derived from
/// it must be dropped first.
pub struct ShmRegion {
    base: NonNull<u8>,
    len: usize,
    page_size: usize,
    backing: Backing,
}

// SAFETY: the region is plain shared memory; synchronisation of its contents
// is the responsibility of the structures placed inside it.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Create (or attach to) the SysV segment `key` of `len` bytes.
    ///
    /// With `hugepages` set, `SHM_HUGETLB` is tried first and regular pages
    /// are used when no hugepages are reserved.
    pub fn create_sysv(key: i32, len: usize, hugepages: bool) -> Result<Self, ShmError> {
        let page_size = if hugepages { PGSIZE_2MB } else { PGSIZE_4KB };
        check_len(len, page_size)?;

        let base_flags = libc::IPC_CREAT | 0o660;
        let (shmid, using_hugepages) = if hugepages {
            match shmget(key, len, base_flags | libc::SHM_HUGETLB) {
                Ok(id) => (id, true),
                Err(e) => {
                    warn!(key, error = %e, "Hugepage segment unavailable, falling back to regular pages");
                    (shmget(key, len, base_flags).map_err(|source| ShmError::Get { key, source })?, false)
                }
            }
        } else {
            (shmget(key, len, base_flags).map_err(|source| ShmError::Get { key, source })?, false)
        };

        // SAFETY: shmid refers to a segment of at least `len` bytes
        let addr = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
        if addr as isize == -1 {
            return Err(ShmError::Attach {
                key,
                source: io::Error::last_os_error(),
            });
        }
        let base = NonNull::new(addr.cast::<u8>()).ok_or_else(|| ShmError::Attach {
            key,
            source: io::Error::other("shmat returned null"),
        })?;

        info!(
            key,
            size_mb = len / (1024 * 1024),
            hugepages = using_hugepages,
            "Attached shared memory segment"
        );

        Ok(Self {
            base,
            len,
            page_size,
            backing: Backing::SysV { key },
        })
    }

    /// Map an anonymous shared region of `len` bytes (regular pages).
    pub fn anonymous(len: usize) -> Result<Self, ShmError> {
        check_len(len, PGSIZE_4KB)?;
        let size = NonZeroUsize::new(len).ok_or(ShmError::InvalidLength {
            len,
            page_size: PGSIZE_4KB,
        })?;

        // SAFETY: a fresh anonymous mapping aliases no existing memory
        let ptr = unsafe {
            mmap_anonymous(
                None,
                size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )?
        };

        Ok(Self {
            base: ptr.cast(),
            len,
            page_size: PGSIZE_4KB,
            backing: Backing::Anonymous,
        })
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// SysV key of the segment, if the region is keyed.
    pub fn key(&self) -> Option<i32> {
        match self.backing {
            Backing::SysV { key } => Some(key),
            Backing::Anonymous => None,
        }
    }

    /// Translate an address inside the region into an offset.
    ///
    /// Returns `None` unless the whole range `[ptr, ptr + len)` lies inside.
    pub fn ptr_to_shmptr(&self, ptr: *const u8, len: usize) -> Option<ShmPtr> {
        let base = self.base.as_ptr() as usize;
        let addr = ptr as usize;
        let end = addr.checked_add(len)?;
        if addr < base || end > base + self.len {
            return None;
        }
        Some(ShmPtr((addr - base) as u64))
    }

    /// Translate an offset back into an address, bounds-checked for `len` bytes.
    pub fn shmptr_to_ptr(&self, ptr: ShmPtr, len: usize) -> Option<*mut u8> {
        let off = usize::try_from(ptr.0).ok()?;
        if off.checked_add(len)? > self.len {
            return None;
        }
        // SAFETY: off + len is within the mapping
        Some(unsafe { self.base.as_ptr().add(off) })
    }

    /// Prefer allocating the region's pages on NUMA node `node`.
    pub fn bind_numa(&self, node: u32) -> io::Result<()> {
        if node >= u64::BITS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("NUMA node {node} out of range"),
            ));
        }
        let mask: u64 = 1 << node;
        // SAFETY: mbind only reads `mask` and updates the policy of our own mapping
        let ret = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                self.base.as_ptr(),
                self.len,
                MPOL_PREFERRED,
                &mask as *const u64,
                u64::BITS as libc::c_ulong,
                0 as libc::c_uint,
            )
        };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        match self.backing {
            Backing::SysV { key } => {
                // SAFETY: base was returned by shmat in create_sysv
                if unsafe { libc::shmdt(self.base.as_ptr().cast()) } != 0 {
                    warn!(
                        key,
                        error = %io::Error::last_os_error(),
                        "Failed to detach shared memory segment"
                    );
                }
            }
            Backing::Anonymous => {
                // SAFETY: base and len describe the mapping created in anonymous()
                let _ = unsafe { munmap(self.base.cast(), self.len) };
            }
        }
    }
}

/// Round `value` up to the next multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn check_len(len: usize, page_size: usize) -> Result<(), ShmError> {
    if len == 0 || len % page_size != 0 {
        return Err(ShmError::InvalidLength { len, page_size });
    }
    Ok(())
}

fn shmget(key: i32, len: usize, flags: libc::c_int) -> io::Result<libc::c_int> {
    // SAFETY: plain syscall wrapper
    let id = unsafe { libc::shmget(key, len, flags) };
    if id < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, PGSIZE_4KB), 0);
        assert_eq!(align_up(1, PGSIZE_4KB), PGSIZE_4KB);
        assert_eq!(align_up(PGSIZE_2MB + 1, PGSIZE_2MB), 2 * PGSIZE_2MB);
    }

    #[test]
    fn test_anonymous_region_translation() {
        let region = ShmRegion::anonymous(2 * PGSIZE_4KB).unwrap();
        assert_eq!(region.len(), 2 * PGSIZE_4KB);
        assert!(region.key().is_none());

        let inner = unsafe { region.base().add(100) };
        let ptr = region.ptr_to_shmptr(inner, 16).unwrap();
        assert_eq!(ptr.offset(), 100);
        assert_eq!(region.shmptr_to_ptr(ptr, 16), Some(inner));
    }

    #[test]
    fn test_translation_bounds() {
        let region = ShmRegion::anonymous(PGSIZE_4KB).unwrap();
        let last = unsafe { region.base().add(PGSIZE_4KB - 4) };
        assert!(region.ptr_to_shmptr(last, 4).is_some());
        assert!(region.ptr_to_shmptr(last, 8).is_none());
        assert!(region.shmptr_to_ptr(ShmPtr::new(PGSIZE_4KB as u64), 1).is_none());

        let outside = [0u8; 4];
        assert!(region.ptr_to_shmptr(outside.as_ptr(), 4).is_none());
    }

    #[test]
    fn test_invalid_length() {
        assert!(matches!(
            ShmRegion::anonymous(100),
            Err(ShmError::InvalidLength { len: 100, .. })
        ));
        assert!(ShmRegion::anonymous(0).is_err());
    }

    #[test]
    fn test_region_is_writable() {
        let region = ShmRegion::anonymous(PGSIZE_4KB).unwrap();
        unsafe {
            region.base().write(0xab);
            assert_eq!(region.base().read(), 0xab);
        }
    }
}
