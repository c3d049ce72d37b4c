//! Three-tier shared memory regions.
//!
//! A [`SharedRegion`] is one block of bytes shared between a coordinator and
//! its children or siblings. How much synchronization a read or write costs
//! depends on the region's [`AccessMode`]:
//!
//! - [`AccessMode::ReadOnly`]: immutable after construction. Reads never
//!   lock and writes are rejected.
//! - [`AccessMode::CopyOnWrite`]: reads take a shared lock. The first write
//!   duplicates the buffer through the region's [`BufferOps`], after which
//!   the region behaves like `LockedWrite`.
//! - [`AccessMode::LockedWrite`]: reads take a shared lock, writes take the
//!   exclusive lock. Only this mode may be resized.
//!
//! Access is handed out as RAII guards. Dropping a [`RegionReadGuard`]
//! releases read access, dropping a [`RegionWriteGuard`] releases write
//! access and bumps the region version.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard};

use crate::error::RegionError;

/// How a region may be accessed once it exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Immutable after creation, no locks.
    ReadOnly,
    /// Duplicated lazily on the first write.
    CopyOnWrite,
    /// Every write takes the exclusive lock.
    LockedWrite,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AccessMode::ReadOnly => "read-only",
            AccessMode::CopyOnWrite => "copy-on-write",
            AccessMode::LockedWrite => "locked-write",
        };
        f.write_str(name)
    }
}

/// Duplication and release hooks for a region's payload.
///
/// The defaults perform a byte-for-byte copy and a plain deallocation, which
/// is what [`ByteCopy`] uses. Payloads that need more (pointer fix-ups,
/// pooled buffers, accounting) override one or both methods.
pub trait BufferOps: Send + Sync {
    /// Produces the private copy a copy-on-write region switches to on its
    /// first write. Must return exactly `src.len()` bytes.
    fn duplicate(&self, src: &[u8]) -> Result<Vec<u8>, RegionError> {
        let mut copy = Vec::new();
        copy.try_reserve_exact(src.len())
            .map_err(|_| RegionError::AllocationFailed { requested: src.len() })?;
        copy.extend_from_slice(src);
        Ok(copy)
    }

    /// Releases a buffer the region no longer uses.
    fn release(&self, buffer: Vec<u8>) {
        drop(buffer);
    }
}

/// The default [`BufferOps`]: `memcpy` duplication, plain release.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteCopy;

impl BufferOps for ByteCopy {}

/// Backing bytes of a region. Borrowed storage only ever appears in
/// read-only views, so it is never written or released.
enum Storage<'a> {
    Owned(Vec<u8>),
    Borrowed(&'a [u8]),
}

impl Storage<'_> {
    #[inline]
    fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Owned(buffer) => buffer,
            Storage::Borrowed(view) => view,
        }
    }

    #[inline]
    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Storage::Owned(buffer) => buffer,
            Storage::Borrowed(_) => &mut [],
        }
    }

    fn capacity(&self) -> usize {
        match self {
            Storage::Owned(buffer) => buffer.capacity(),
            Storage::Borrowed(view) => view.len(),
        }
    }
}

fn zeroed(size: usize) -> Result<Vec<u8>, RegionError> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(size)
        .map_err(|_| RegionError::AllocationFailed { requested: size })?;
    buffer.resize(size, 0);
    Ok(buffer)
}

/// Point-in-time counters of a region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionStats {
    /// Successful read acquisitions.
    pub reads: u64,
    /// Successful write acquisitions.
    pub writes: u64,
    /// Copy-on-write duplications performed (0 or 1).
    pub copies: u64,
    /// Completed writes.
    pub version: u64,
    /// Readers currently holding the region.
    pub active_readers: i64,
    /// Writers currently holding the region.
    pub active_writers: i64,
}

/// A block of memory shared between threads under one of three access modes.
///
/// Owned regions are `SharedRegion<'static>`; a read-only view over
/// caller-owned bytes borrows them for `'a`.
pub struct SharedRegion<'a> {
    mode: AccessMode,
    storage: RwLock<Storage<'a>>,
    ops: Box<dyn BufferOps>,

    /// Set once the copy-on-write fork has happened. Only flipped while
    /// the upgradable lock is held, so racing first writers fork once.
    is_copy: AtomicBool,

    size: AtomicUsize,
    capacity: AtomicUsize,

    readers: AtomicI64,
    writers: AtomicI64,
    version: AtomicU64,

    reads: AtomicU64,
    writes: AtomicU64,
    copies: AtomicU64,
}

impl SharedRegion<'static> {
    /// Creates a zero-initialized region of `size` bytes using [`ByteCopy`].
    pub fn new(size: usize, mode: AccessMode) -> Result<Self, RegionError> {
        Self::with_ops(size, mode, Box::new(ByteCopy))
    }

    /// Creates a zero-initialized region with custom duplicate/release hooks.
    pub fn with_ops(
        size: usize,
        mode: AccessMode,
        ops: Box<dyn BufferOps>,
    ) -> Result<Self, RegionError> {
        if size == 0 {
            return Err(RegionError::ZeroSize);
        }
        let buffer = zeroed(size)?;
        log::debug!("Created {} shared region of {} bytes", mode, size);
        Ok(Self::from_storage(Storage::Owned(buffer), mode, ops))
    }

    /// Creates a region that takes ownership of `data` as its initial
    /// contents. This is how immutable tables and configuration blocks are
    /// published as `ReadOnly` regions.
    pub fn from_vec(data: Vec<u8>, mode: AccessMode) -> Result<Self, RegionError> {
        if data.is_empty() {
            return Err(RegionError::ZeroSize);
        }
        log::debug!("Published {} shared region of {} bytes", mode, data.len());
        Ok(Self::from_storage(Storage::Owned(data), mode, Box::new(ByteCopy)))
    }
}

impl<'a> SharedRegion<'a> {
    /// Wraps caller-owned bytes without copying them. The view is always
    /// `ReadOnly` and never releases `data`.
    pub fn readonly_view(data: &'a [u8]) -> Result<Self, RegionError> {
        if data.is_empty() {
            return Err(RegionError::ZeroSize);
        }
        Ok(Self::from_storage(
            Storage::Borrowed(data),
            AccessMode::ReadOnly,
            Box::new(ByteCopy),
        ))
    }

    fn from_storage(storage: Storage<'a>, mode: AccessMode, ops: Box<dyn BufferOps>) -> Self {
        let size = storage.as_slice().len();
        let capacity = storage.capacity();
        SharedRegion {
            mode,
            storage: RwLock::new(storage),
            ops,
            is_copy: AtomicBool::new(false),
            size: AtomicUsize::new(size),
            capacity: AtomicUsize::new(capacity),
            readers: AtomicI64::new(0),
            writers: AtomicI64::new(0),
            version: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            copies: AtomicU64::new(0),
        }
    }

    /// Acquires read access.
    ///
    /// `ReadOnly` regions return immediately without touching the lock. The
    /// other modes block while a writer holds the region.
    pub fn acquire_read(&self) -> RegionReadGuard<'_, 'a> {
        let access = match self.mode {
            AccessMode::ReadOnly => {
                // SAFETY: a read-only region never hands out write access and
                // cannot be resized, so the storage is not mutated again until
                // `drop`, which needs `&mut self` and therefore outlives every
                // guard borrowed from `&self`.
                let storage = unsafe { &*self.storage.data_ptr() };
                ReadAccess::Unlocked(storage.as_slice())
            }
            AccessMode::CopyOnWrite | AccessMode::LockedWrite => {
                ReadAccess::Locked(self.storage.read())
            }
        };
        self.readers.fetch_add(1, Ordering::AcqRel);
        self.reads.fetch_add(1, Ordering::Relaxed);
        RegionReadGuard { region: self, access }
    }

    /// Acquires exclusive write access.
    ///
    /// Fails with [`RegionError::ReadOnly`] for read-only regions. For a
    /// copy-on-write region the first call duplicates the buffer before
    /// taking the write lock; later calls go straight to the lock.
    pub fn acquire_write(&self) -> Result<RegionWriteGuard<'_, 'a>, RegionError> {
        let storage = match self.mode {
            AccessMode::ReadOnly => {
                log::warn!("Rejected write access to a read-only shared region");
                return Err(RegionError::ReadOnly);
            }
            AccessMode::CopyOnWrite if !self.is_copy.load(Ordering::Acquire) => {
                self.fork_for_write()?
            }
            AccessMode::CopyOnWrite | AccessMode::LockedWrite => self.storage.write(),
        };
        self.writers.fetch_add(1, Ordering::AcqRel);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(RegionWriteGuard { region: self, storage })
    }

    /// Performs the one-time copy-on-write duplication.
    ///
    /// The upgradable lock admits concurrent readers while the copy is
    /// made but excludes other would-be first writers, which re-check the
    /// flag once they get in.
    fn fork_for_write(&self) -> Result<RwLockWriteGuard<'_, Storage<'a>>, RegionError> {
        let current = self.storage.upgradable_read();
        if self.is_copy.load(Ordering::Acquire) {
            return Ok(RwLockUpgradableReadGuard::upgrade(current));
        }

        let expected = current.as_slice().len();
        let duplicate = self.ops.duplicate(current.as_slice())?;
        if duplicate.len() != expected {
            return Err(RegionError::DuplicateMismatch {
                expected,
                actual: duplicate.len(),
            });
        }
        let capacity = duplicate.capacity();

        let mut storage = RwLockUpgradableReadGuard::upgrade(current);
        let original = std::mem::replace(&mut *storage, Storage::Owned(duplicate));
        if let Storage::Owned(buffer) = original {
            self.ops.release(buffer);
        }
        self.capacity.store(capacity, Ordering::Release);
        self.is_copy.store(true, Ordering::Release);
        self.copies.fetch_add(1, Ordering::Relaxed);
        log::debug!("Copy-on-write region forked its {} byte buffer", expected);
        Ok(storage)
    }

    /// Current version; incremented once per released write.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Whether any write completed since `version` was observed.
    #[inline]
    pub fn is_modified_since(&self, version: u64) -> bool {
        self.version() != version
    }

    #[inline]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Current size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Allocated capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Whether this region has forked its private copy.
    #[inline]
    pub fn is_copy(&self) -> bool {
        self.is_copy.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> RegionStats {
        RegionStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            copies: self.copies.load(Ordering::Relaxed),
            version: self.version(),
            active_readers: self.readers.load(Ordering::Acquire),
            active_writers: self.writers.load(Ordering::Acquire),
        }
    }

    /// Consistency self-check.
    ///
    /// Never blocks: if a writer currently holds the lock the buffer itself
    /// is not inspected, only the counters.
    pub fn validate(&self) -> bool {
        let readers = self.readers.load(Ordering::Acquire);
        let writers = self.writers.load(Ordering::Acquire);

        if readers < 0 || writers < 0 {
            log::warn!("Region validation failed: negative access count ({readers} readers, {writers} writers)");
            return false;
        }
        if writers > 1 {
            log::warn!("Region validation failed: {writers} concurrent writers");
            return false;
        }
        if writers > 0 && readers > 0 {
            log::warn!("Region validation failed: readers and a writer active together");
            return false;
        }
        if self.mode == AccessMode::ReadOnly && writers != 0 {
            log::warn!("Region validation failed: writer on a read-only region");
            return false;
        }

        let size = self.size();
        if size == 0 || size > self.capacity() {
            log::warn!("Region validation failed: size {} vs capacity {}", size, self.capacity());
            return false;
        }

        let len = match self.mode {
            AccessMode::ReadOnly => {
                // SAFETY: see `acquire_read`.
                Some(unsafe { &*self.storage.data_ptr() }.as_slice().len())
            }
            _ => self.storage.try_read().map(|storage| storage.as_slice().len()),
        };
        match len {
            Some(len) if len != size => {
                log::warn!("Region validation failed: buffer holds {len} bytes, size says {size}");
                false
            }
            _ => true,
        }
    }
}

impl Drop for SharedRegion<'_> {
    fn drop(&mut self) {
        let storage = std::mem::replace(self.storage.get_mut(), Storage::Borrowed(&[]));
        if let Storage::Owned(buffer) = storage {
            self.ops.release(buffer);
        }
    }
}

impl fmt::Debug for SharedRegion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegion")
            .field("mode", &self.mode)
            .field("size", &self.size())
            .field("capacity", &self.capacity())
            .field("is_copy", &self.is_copy())
            .field("stats", &self.stats())
            .finish()
    }
}

impl fmt::Display for SharedRegion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        write!(
            f,
            "{} region {}/{} bytes, v{} ({} reads, {} writes, {} copies){}",
            self.mode,
            self.size(),
            self.capacity(),
            stats.version,
            stats.reads,
            stats.writes,
            stats.copies,
            if self.is_copy() { ", forked" } else { "" },
        )
    }
}

enum ReadAccess<'r, 'a> {
    Unlocked(&'r [u8]),
    Locked(RwLockReadGuard<'r, Storage<'a>>),
}

/// Read access to a region. Dropping the guard is `release_read`.
pub struct RegionReadGuard<'r, 'a> {
    region: &'r SharedRegion<'a>,
    access: ReadAccess<'r, 'a>,
}

impl RegionReadGuard<'_, '_> {
    /// Releases read access explicitly.
    #[inline]
    pub fn release(self) {}
}

impl Deref for RegionReadGuard<'_, '_> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        match &self.access {
            ReadAccess::Unlocked(bytes) => bytes,
            ReadAccess::Locked(storage) => storage.as_slice(),
        }
    }
}

impl fmt::Debug for RegionReadGuard<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionReadGuard")
            .field("mode", &self.region.mode)
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for RegionReadGuard<'_, '_> {
    fn drop(&mut self) {
        // The lock itself, if any, is released after this when `access` drops.
        self.region.readers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Exclusive write access to a region. Dropping the guard is
/// `release_write`: the writer count drops, the version advances by one
/// and the lock is released.
pub struct RegionWriteGuard<'r, 'a> {
    region: &'r SharedRegion<'a>,
    storage: RwLockWriteGuard<'r, Storage<'a>>,
}

impl RegionWriteGuard<'_, '_> {
    /// Resizes the region in place, preserving the common prefix and
    /// zero-filling any growth. Only `LockedWrite` regions can be resized;
    /// on error the region is left unchanged.
    pub fn resize(&mut self, new_size: usize) -> Result<(), RegionError> {
        let mode = self.region.mode;
        if mode != AccessMode::LockedWrite {
            log::warn!("Rejected resize of a {} region", mode);
            return Err(RegionError::ResizeNotPermitted(mode));
        }
        if new_size == 0 {
            return Err(RegionError::ZeroSize);
        }

        if let Storage::Owned(buffer) = &mut *self.storage {
            if new_size > buffer.len() {
                buffer
                    .try_reserve_exact(new_size - buffer.len())
                    .map_err(|_| RegionError::AllocationFailed { requested: new_size })?;
            }
            let old_size = buffer.len();
            buffer.resize(new_size, 0);
            self.region.size.store(new_size, Ordering::Release);
            self.region.capacity.store(buffer.capacity(), Ordering::Release);
            log::debug!("Resized locked-write region from {} to {} bytes", old_size, new_size);
        }
        Ok(())
    }

    /// Releases write access explicitly.
    #[inline]
    pub fn release(self) {}
}

impl Deref for RegionWriteGuard<'_, '_> {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        self.storage.as_slice()
    }
}

impl DerefMut for RegionWriteGuard<'_, '_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        self.storage.as_mut_slice()
    }
}

impl fmt::Debug for RegionWriteGuard<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionWriteGuard")
            .field("mode", &self.region.mode)
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for RegionWriteGuard<'_, '_> {
    fn drop(&mut self) {
        self.region.writers.fetch_sub(1, Ordering::AcqRel);
        self.region.version.fetch_add(1, Ordering::AcqRel);
    }
}
