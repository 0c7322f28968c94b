//! Zero-copy ingress packet pool in shared memory
//!
//! Every element of the pool lives inside one [`ShmRegion`] so that runtime
//! processes attached to the same region can read packets in place. An element
//! is laid out as
//!
//! ```text
//! | BufHeader (64 B) | headroom | data room ... |
//! ```
//!
//! The header carries the reference count, data offset and length, and the
//! checksum flag reported by the NIC. The free list is a lock-free queue of
//! element indices.
//!
//! Ownership is expressed with two handle types: [`PacketBuf`] is the single
//! owner of a freshly allocated buffer and may mutate it; [`SharedBuf`] is a
//! counted reference whose `Clone` shares the buffer and whose `Drop` releases
//! it. A buffer returns to the free list exactly when its count reaches zero.

use std::mem::{self, ManuallyDrop};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering, fence};
use std::{ptr, slice};

use crossbeam_queue::ArrayQueue;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::shm::{PGSIZE_2MB, PGSIZE_4KB, ShmError, ShmPtr, ShmRegion, align_up};

/// Size of the in-place buffer header
pub const BUF_HDR_SIZE: usize = mem::size_of::<BufHeader>();

/// Element alignment inside the region
const ELEMENT_ALIGN: usize = 64;

/// NIC validated the IP checksum
const OL_RX_IP_CKSUM_GOOD: u32 = 1 << 0;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("packet pool exhausted")]
    Exhausted,

    #[error("insufficient headroom: need {needed} bytes, {available} available")]
    InsufficientHeadroom { needed: usize, available: usize },

    #[error("header at data offset {offset} would be misaligned")]
    Misaligned { offset: usize },

    #[error("shared memory window too small: need {required} bytes, window is {window}")]
    RegionTooSmall { required: usize, window: usize },

    #[error("invalid pool parameters: {0}")]
    InvalidParams(&'static str),

    #[error("shared memory mapping failed: {0}")]
    Map(#[from] ShmError),

    #[error("{0:?} does not point into a pool buffer")]
    InvalidPointer(ShmPtr),

    #[error("buffer at {0:?} is not in use")]
    NotInUse(ShmPtr),
}

/// Where the pool's shared region comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmBacking {
    /// SysV segment attachable by runtimes through `key`
    SysV { key: i32, hugepages: bool },
    /// Anonymous shared mapping (tests, development)
    Anonymous,
}

/// Pool construction parameters.
#[derive(Debug, Clone)]
pub struct PoolParams {
    /// Number of buffers
    pub capacity: usize,
    /// Bytes per buffer after the header (headroom + data room)
    pub buf_size: usize,
    /// Headroom reserved in front of received data
    pub headroom: usize,
    /// Upper bound for the region size
    pub shm_window: usize,
    pub backing: ShmBacking,
    pub numa_node: Option<u32>,
}

impl PoolParams {
    /// Small anonymous pool with standard buffer geometry.
    pub fn anonymous(capacity: usize) -> Self {
        Self {
            capacity,
            buf_size: 2176,
            headroom: 128,
            shm_window: 64 * 1024 * 1024,
            backing: ShmBacking::Anonymous,
            numa_node: None,
        }
    }
}

/// In-place metadata at the start of every pool element.
#[repr(C, align(64))]
struct BufHeader {
    refcnt: AtomicU32,
    index: u32,
    data_off: u32,
    data_len: u32,
    ol_flags: u32,
}

/// Plain-old-data header that can be written into buffer headroom.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain no pointers or references, and
/// be valid for any bit pattern, because runtimes read them from shared memory.
pub unsafe trait Preamble: Copy + Default {}

/// Fixed-capacity packet buffer pool inside a shared memory region.
pub struct PacketPool {
    region: ShmRegion,
    capacity: usize,
    /// Distance between consecutive elements
    stride: usize,
    buf_size: usize,
    headroom: usize,
    free: ArrayQueue<u32>,
}

impl PacketPool {
    /// Map the shared region and populate every buffer header in place.
    pub fn create(params: PoolParams) -> Result<Arc<Self>, PoolError> {
        if params.capacity == 0 || params.capacity > u32::MAX as usize {
            return Err(PoolError::InvalidParams("capacity must be in 1..=u32::MAX"));
        }
        if params.headroom >= params.buf_size {
            return Err(PoolError::InvalidParams("headroom must be smaller than the buffer"));
        }

        let stride = align_up(BUF_HDR_SIZE + params.buf_size, ELEMENT_ALIGN);
        let page_size = match params.backing {
            ShmBacking::SysV { .. } => PGSIZE_2MB,
            ShmBacking::Anonymous => PGSIZE_4KB,
        };
        let required = params
            .capacity
            .checked_mul(stride)
            .map(|len| align_up(len, page_size))
            .ok_or(PoolError::InvalidParams("pool size overflows"))?;
        if required > params.shm_window {
            return Err(PoolError::RegionTooSmall {
                required,
                window: params.shm_window,
            });
        }

        let region = match params.backing {
            ShmBacking::SysV { key, hugepages } => ShmRegion::create_sysv(key, required, hugepages)?,
            ShmBacking::Anonymous => ShmRegion::anonymous(required)?,
        };

        if let Some(node) = params.numa_node
            && let Err(e) = region.bind_numa(node)
        {
            warn!(numa_node = node, error = %e, "Failed to bind packet pool to NUMA node");
        }

        let free = ArrayQueue::new(params.capacity);
        for index in 0..params.capacity {
            // SAFETY: element `index` lies inside the region (required >= capacity * stride)
            unsafe {
                let hdr = region.base().add(index * stride).cast::<BufHeader>();
                ptr::write(
                    hdr,
                    BufHeader {
                        refcnt: AtomicU32::new(0),
                        index: index as u32,
                        data_off: params.headroom as u32,
                        data_len: 0,
                        ol_flags: 0,
                    },
                );
            }
            // Cannot fail: the queue holds exactly `capacity` entries
            let _ = free.push(index as u32);
        }

        info!(
            buffers = params.capacity,
            buf_size = params.buf_size,
            region_mb = required / (1024 * 1024),
            "Packet pool created"
        );

        Ok(Arc::new(Self {
            region,
            capacity: params.capacity,
            stride,
            buf_size: params.buf_size,
            headroom: params.headroom,
            free,
        }))
    }

    /// Take a buffer from the free list with a reference count of one.
    #[inline]
    pub fn allocate(self: &Arc<Self>) -> Result<PacketBuf, PoolError> {
        let index = self.free.pop().ok_or(PoolError::Exhausted)?;
        let hdr = self.header(index);
        // SAFETY: the index came off the free list, so no other handle exists
        unsafe {
            (*hdr).data_off = self.headroom as u32;
            (*hdr).data_len = 0;
            (*hdr).ol_flags = 0;
            (*hdr).refcnt.store(1, Ordering::Relaxed);
        }
        Ok(PacketBuf {
            pool: Arc::clone(self),
            index,
        })
    }

    /// Turn a raw reference produced by [`SharedBuf::into_raw`] back into a handle.
    ///
    /// # Safety
    ///
    /// The caller must own the reference behind `ptr`, and must not reclaim
    /// the same reference twice.
    pub unsafe fn reclaim(self: &Arc<Self>, ptr: ShmPtr) -> Result<SharedBuf, PoolError> {
        let index = self.index_of(ptr).ok_or(PoolError::InvalidPointer(ptr))?;
        // SAFETY: index_of validated the index
        if unsafe { (*self.header(index)).refcnt.load(Ordering::Acquire) } == 0 {
            return Err(PoolError::NotInUse(ptr));
        }
        Ok(SharedBuf {
            pool: Arc::clone(self),
            index,
        })
    }

    /// Current reference count of the buffer `ptr` points into.
    pub fn ref_count(&self, ptr: ShmPtr) -> Option<u32> {
        let index = self.index_of(ptr)?;
        // SAFETY: index_of validated the index
        Some(unsafe { (*self.header(index)).refcnt.load(Ordering::Acquire) })
    }

    /// Number of buffers on the free list
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn headroom(&self) -> usize {
        self.headroom
    }

    /// The region runtimes attach to
    pub fn region(&self) -> &ShmRegion {
        &self.region
    }

    #[inline]
    fn element_offset(&self, index: u32) -> usize {
        index as usize * self.stride
    }

    #[inline]
    fn header(&self, index: u32) -> *mut BufHeader {
        // SAFETY: every index handed out is < capacity
        unsafe {
            self.region
                .base()
                .add(self.element_offset(index))
                .cast::<BufHeader>()
        }
    }

    #[inline]
    fn buf_ptr(&self, index: u32) -> *mut u8 {
        // SAFETY: the buffer follows its header inside the element
        unsafe { self.header(index).cast::<u8>().add(BUF_HDR_SIZE) }
    }

    fn index_of(&self, ptr: ShmPtr) -> Option<u32> {
        let off = usize::try_from(ptr.offset()).ok()?;
        let index = off / self.stride;
        let within = off % self.stride;
        if index >= self.capacity || within < BUF_HDR_SIZE || within >= BUF_HDR_SIZE + self.buf_size {
            return None;
        }
        Some(index as u32)
    }

    #[inline]
    fn share(&self, index: u32) {
        // SAFETY: caller holds a live reference
        unsafe { (*self.header(index)).refcnt.fetch_add(1, Ordering::Relaxed) };
    }

    fn release(&self, index: u32) {
        let hdr = self.header(index);
        // SAFETY: caller holds a live reference
        debug_assert_eq!(unsafe { (*hdr).index }, index);
        // SAFETY: as above
        let prev = unsafe { (*hdr).refcnt.fetch_sub(1, Ordering::Release) };
        debug_assert!(prev != 0, "double release of buffer {index}");
        match prev {
            1 => {
                fence(Ordering::Acquire);
                if self.free.push(index).is_err() {
                    error!(index, "Free list overflow on release");
                }
            }
            0 => {
                // SAFETY: restore the count we just underflowed
                unsafe { (*hdr).refcnt.store(0, Ordering::Relaxed) };
                error!(index, "Released buffer that was not in use");
            }
            _ => {}
        }
    }
}

/// Exclusively owned packet buffer.
///
/// Returned to the pool when dropped.
pub struct PacketBuf {
    pool: Arc<PacketPool>,
    index: u32,
}

// SAFETY: the handle is the only accessor of its element while it exists
unsafe impl Send for PacketBuf {}

impl PacketBuf {
    #[inline]
    fn hdr(&self) -> &BufHeader {
        // SAFETY: the header stays valid while the pool is alive
        unsafe { &*self.pool.header(self.index) }
    }

    #[inline]
    fn hdr_mut(&mut self) -> &mut BufHeader {
        // SAFETY: exclusive ownership of the element
        unsafe { &mut *self.pool.header(self.index) }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.hdr().data_len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes available in front of the data
    #[inline]
    pub fn headroom(&self) -> usize {
        self.hdr().data_off as usize
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        let hdr = self.hdr();
        // SAFETY: data_off + data_len never exceeds buf_size
        unsafe {
            slice::from_raw_parts(
                self.pool.buf_ptr(self.index).add(hdr.data_off as usize),
                hdr.data_len as usize,
            )
        }
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        let (off, len) = (self.hdr().data_off as usize, self.hdr().data_len as usize);
        // SAFETY: exclusive ownership; bounds as in data()
        unsafe { slice::from_raw_parts_mut(self.pool.buf_ptr(self.index).add(off), len) }
    }

    /// Writable space from the data offset to the end of the buffer.
    ///
    /// Receive paths fill this and then call [`set_len`](Self::set_len).
    #[inline]
    pub fn write_area(&mut self) -> &mut [u8] {
        let off = self.hdr().data_off as usize;
        let room = self.pool.buf_size - off;
        // SAFETY: exclusive ownership; off <= buf_size
        unsafe { slice::from_raw_parts_mut(self.pool.buf_ptr(self.index).add(off), room) }
    }

    #[inline]
    pub fn set_len(&mut self, len: usize) {
        let room = self.pool.buf_size - self.headroom();
        assert!(len <= room, "length {len} exceeds data room {room}");
        self.hdr_mut().data_len = len as u32;
    }

    /// Whether the NIC reported a valid IP checksum
    #[inline]
    pub fn checksum_good(&self) -> bool {
        self.hdr().ol_flags & OL_RX_IP_CKSUM_GOOD != 0
    }

    #[inline]
    pub fn set_checksum_good(&mut self, good: bool) {
        let hdr = self.hdr_mut();
        if good {
            hdr.ol_flags |= OL_RX_IP_CKSUM_GOOD;
        } else {
            hdr.ol_flags &= !OL_RX_IP_CKSUM_GOOD;
        }
    }

    /// Grow the data region to the front by `size_of::<H>()` bytes and
    /// initialise a header there. The payload is not moved.
    pub fn prepend_header<H: Preamble>(&mut self) -> Result<&mut H, PoolError> {
        let size = mem::size_of::<H>();
        let off = self.headroom();
        if off < size {
            return Err(PoolError::InsufficientHeadroom {
                needed: size,
                available: off,
            });
        }
        let new_off = off - size;
        // SAFETY: new_off is inside the buffer
        let ptr = unsafe { self.pool.buf_ptr(self.index).add(new_off) };
        if ptr as usize % mem::align_of::<H>() != 0 {
            return Err(PoolError::Misaligned { offset: new_off });
        }

        let hdr = self.hdr_mut();
        hdr.data_off = new_off as u32;
        hdr.data_len += size as u32;

        let ptr = ptr.cast::<H>();
        // SAFETY: aligned, in bounds and exclusively owned; H is plain data
        unsafe {
            ptr::write(ptr, H::default());
            Ok(&mut *ptr)
        }
    }

    /// Offset of the first data byte inside the shared region
    #[inline]
    pub fn shm_ptr(&self) -> ShmPtr {
        data_shm_ptr(&self.pool, self.index)
    }

    /// Give up exclusive access; the buffer becomes read-only and shareable.
    #[inline]
    pub fn into_shared(self) -> SharedBuf {
        let this = ManuallyDrop::new(self);
        SharedBuf {
            // SAFETY: `this` is never dropped, so the Arc moves exactly once
            pool: unsafe { ptr::read(&this.pool) },
            index: this.index,
        }
    }
}

impl Drop for PacketBuf {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

impl std::fmt::Debug for PacketBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketBuf")
            .field("index", &self.index)
            .field("headroom", &self.headroom())
            .field("len", &self.len())
            .finish()
    }
}

/// Counted, read-only reference to a pool buffer.
pub struct SharedBuf {
    pool: Arc<PacketPool>,
    index: u32,
}

// SAFETY: shared buffers are immutable; the count is atomic
unsafe impl Send for SharedBuf {}
unsafe impl Sync for SharedBuf {}

impl SharedBuf {
    #[inline]
    fn hdr(&self) -> &BufHeader {
        // SAFETY: the header stays valid while the pool is alive
        unsafe { &*self.pool.header(self.index) }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.hdr().data_len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        let hdr = self.hdr();
        // SAFETY: data_off + data_len never exceeds buf_size
        unsafe {
            slice::from_raw_parts(
                self.pool.buf_ptr(self.index).add(hdr.data_off as usize),
                hdr.data_len as usize,
            )
        }
    }

    #[inline]
    pub fn checksum_good(&self) -> bool {
        self.hdr().ol_flags & OL_RX_IP_CKSUM_GOOD != 0
    }

    pub fn ref_count(&self) -> u32 {
        self.hdr().refcnt.load(Ordering::Acquire)
    }

    #[inline]
    pub fn shm_ptr(&self) -> ShmPtr {
        data_shm_ptr(&self.pool, self.index)
    }

    /// Hand this reference across the process boundary without releasing it.
    ///
    /// The receiver gives it back through [`PacketPool::reclaim`].
    #[inline]
    pub fn into_raw(self) -> ShmPtr {
        let shm_ptr = self.shm_ptr();
        let mut this = ManuallyDrop::new(self);
        // SAFETY: drop only the pool handle; the buffer reference stays counted
        unsafe { ptr::drop_in_place(&mut this.pool) };
        shm_ptr
    }
}

impl Clone for SharedBuf {
    #[inline]
    fn clone(&self) -> Self {
        self.pool.share(self.index);
        Self {
            pool: Arc::clone(&self.pool),
            index: self.index,
        }
    }
}

impl Drop for SharedBuf {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

impl std::fmt::Debug for SharedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuf")
            .field("index", &self.index)
            .field("len", &self.len())
            .field("refcnt", &self.ref_count())
            .finish()
    }
}

#[inline]
fn data_shm_ptr(pool: &PacketPool, index: u32) -> ShmPtr {
    // SAFETY: header is valid for any handed-out index
    let data_off = unsafe { (*pool.header(index)).data_off } as usize;
    ShmPtr::new((pool.element_offset(index) + BUF_HDR_SIZE + data_off) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    struct TestHdr {
        a: u32,
        b: u32,
    }

    unsafe impl Preamble for TestHdr {}

    fn pool(capacity: usize) -> Arc<PacketPool> {
        PacketPool::create(PoolParams::anonymous(capacity)).unwrap()
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(BUF_HDR_SIZE, 64);
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        let pool = pool(4);
        let bufs: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.available(), 0);
        assert!(matches!(pool.allocate(), Err(PoolError::Exhausted)));

        drop(bufs);
        assert_eq!(pool.available(), 4);
        assert!(pool.allocate().is_ok());
    }

    #[test]
    fn test_write_and_read() {
        let pool = pool(2);
        let mut buf = pool.allocate().unwrap();
        assert_eq!(buf.headroom(), 128);
        assert!(buf.is_empty());

        buf.write_area()[..5].copy_from_slice(b"hello");
        buf.set_len(5);
        assert_eq!(buf.data(), b"hello");

        buf.data_mut()[0] = b'j';
        assert_eq!(buf.data(), b"jello");
        assert_eq!(buf.write_area().len(), 2176 - 128);
    }

    #[test]
    #[should_panic]
    fn test_set_len_beyond_room() {
        let pool = pool(1);
        let mut buf = pool.allocate().unwrap();
        buf.set_len(4096);
    }

    #[test]
    fn test_prepend_header_keeps_payload() {
        let pool = pool(1);
        let mut buf = pool.allocate().unwrap();
        buf.write_area()[..3].copy_from_slice(&[1, 2, 3]);
        buf.set_len(3);
        let before = buf.shm_ptr();

        let hdr = buf.prepend_header::<TestHdr>().unwrap();
        hdr.a = 7;
        hdr.b = 9;

        assert_eq!(buf.headroom(), 128 - 8);
        assert_eq!(buf.len(), 11);
        assert_eq!(&buf.data()[8..], &[1, 2, 3]);
        assert_eq!(buf.shm_ptr().offset() + 8, before.offset());
    }

    #[test]
    fn test_prepend_header_insufficient_headroom() {
        let mut params = PoolParams::anonymous(1);
        params.headroom = 4;
        let pool = PacketPool::create(params).unwrap();
        let mut buf = pool.allocate().unwrap();

        let err = buf.prepend_header::<TestHdr>().unwrap_err();
        assert!(matches!(
            err,
            PoolError::InsufficientHeadroom {
                needed: 8,
                available: 4
            }
        ));
        assert_eq!(buf.headroom(), 4);
    }

    #[test]
    fn test_prepend_header_misaligned() {
        let mut params = PoolParams::anonymous(1);
        params.headroom = 10;
        let pool = PacketPool::create(params).unwrap();
        let mut buf = pool.allocate().unwrap();
        assert!(matches!(
            buf.prepend_header::<TestHdr>(),
            Err(PoolError::Misaligned { offset: 2 })
        ));
    }

    #[test]
    fn test_shared_refcount() {
        let pool = pool(2);
        let shared = pool.allocate().unwrap().into_shared();
        assert_eq!(shared.ref_count(), 1);

        let a = shared.clone();
        let b = shared.clone();
        assert_eq!(shared.ref_count(), 3);

        drop(a);
        drop(shared);
        assert_eq!(b.ref_count(), 1);
        assert_eq!(pool.available(), 1);

        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_into_raw_and_reclaim() {
        let pool = pool(2);
        let mut buf = pool.allocate().unwrap();
        buf.write_area()[0] = 0x42;
        buf.set_len(1);
        buf.set_checksum_good(true);

        let ptr = buf.into_shared().into_raw();
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.ref_count(ptr), Some(1));

        let shared = unsafe { pool.reclaim(ptr) }.unwrap();
        assert_eq!(shared.data(), &[0x42]);
        assert!(shared.checksum_good());
        drop(shared);

        assert_eq!(pool.available(), 2);
        assert_eq!(pool.ref_count(ptr), Some(0));
        assert!(matches!(unsafe { pool.reclaim(ptr) }, Err(PoolError::NotInUse(_))));
    }

    #[test]
    fn test_reclaim_rejects_foreign_pointer() {
        let pool = pool(1);
        // Points into the header, not the buffer
        assert!(matches!(
            unsafe { pool.reclaim(ShmPtr::new(0)) },
            Err(PoolError::InvalidPointer(_))
        ));
        assert!(matches!(
            unsafe { pool.reclaim(ShmPtr::new(1 << 40)) },
            Err(PoolError::InvalidPointer(_))
        ));
    }

    #[test]
    fn test_allocate_resets_metadata() {
        let pool = pool(1);
        let mut buf = pool.allocate().unwrap();
        buf.set_len(10);
        buf.set_checksum_good(true);
        let _ = buf.prepend_header::<TestHdr>().unwrap();
        drop(buf);

        let buf = pool.allocate().unwrap();
        assert_eq!(buf.headroom(), 128);
        assert_eq!(buf.len(), 0);
        assert!(!buf.checksum_good());
    }

    #[test]
    fn test_region_too_small() {
        let mut params = PoolParams::anonymous(1024);
        params.shm_window = 1024 * 1024;
        match PacketPool::create(params) {
            Err(PoolError::RegionTooSmall { required, window }) => {
                assert!(required > window);
                assert_eq!(window, 1024 * 1024);
            }
            other => panic!("expected RegionTooSmall, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_invalid_params() {
        assert!(matches!(
            PacketPool::create(PoolParams::anonymous(0)),
            Err(PoolError::InvalidParams(_))
        ));
        let mut params = PoolParams::anonymous(1);
        params.headroom = params.buf_size;
        assert!(matches!(PacketPool::create(params), Err(PoolError::InvalidParams(_))));
    }

    #[test]
    fn test_buffers_are_distinct() {
        let pool = pool(3);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        let mut offsets = [a.shm_ptr(), b.shm_ptr(), c.shm_ptr()];
        offsets.sort();
        assert!(offsets.windows(2).all(|w| w[0] != w[1]));
        for ptr in offsets {
            assert!(pool.region().shmptr_to_ptr(ptr, 1).is_some());
        }
    }
}
