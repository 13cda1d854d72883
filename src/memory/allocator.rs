use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::{Error, Result};
use crate::memory::fence::Fence;

/// Alignment applied to every tensor allocation and pattern offset.
pub const ALLOC_ALIGNMENT: usize = 64;

/// Kind of device a memory location lives on
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
pub enum DeviceType {
    Cpu,
    Gpu,
    Accelerator,
}

/// How a kernel wants a particular input or output placed
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
pub enum MemType {
    /// The provider's own device memory
    Default,
    /// Input that the kernel reads from host memory
    CpuInput,
    /// Output that the kernel writes to host memory
    CpuOutput,
}

/// Identifies the allocator a value's buffer comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryLocation {
    pub device: DeviceType,
    pub device_id: u32,
    pub mem_type: MemType,
}

impl MemoryLocation {
    pub fn new(device: DeviceType, device_id: u32, mem_type: MemType) -> Self {
        Self {
            device,
            device_id,
            mem_type,
        }
    }

    /// Default host memory
    pub fn cpu() -> Self {
        Self::new(DeviceType::Cpu, 0, MemType::Default)
    }

    pub fn is_cpu(&self) -> bool {
        self.device == DeviceType::Cpu
    }
}

impl Default for MemoryLocation {
    fn default() -> Self {
        Self::cpu()
    }
}

impl fmt::Display for MemoryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}({})", self.device, self.device_id, self.mem_type)
    }
}

/// Round `offset` up to the next multiple of `alignment` (a power of two).
pub fn align_offset(offset: usize, alignment: usize) -> Option<usize> {
    if alignment <= 1 {
        return Some(offset);
    }
    let mask = alignment - 1;
    offset.checked_add(mask).map(|v| v & !mask)
}

/// Bytes needed for `count` elements of `elem_size` bytes, rounded up to `alignment`.
///
/// Returns `None` on arithmetic overflow.
pub fn calc_mem_size_with_alignment(count: usize, elem_size: usize, alignment: usize) -> Option<usize> {
    let size = count.checked_mul(elem_size)?;
    align_offset(size, alignment)
}

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// Live-byte accounting shared between an allocator and the arenas it hands out
#[derive(Debug, Default)]
pub struct AllocationStats {
    live_bytes: AtomicUsize,
    total_allocations: AtomicUsize,
}

impl AllocationStats {
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub fn total_allocations(&self) -> usize {
        self.total_allocations.load(Ordering::Relaxed)
    }
}

/// One owned, zero-initialised block of bytes at a memory location.
///
/// Values never hold raw pointers into an arena. They hold a [`Buffer`], which is a shared
/// handle to the arena plus an offset and a size, so two values alias exactly when
/// their buffers name the same arena and offset.
pub struct Arena {
    id: u64,
    location: MemoryLocation,
    len: usize,
    bytes: Mutex<Vec<u8>>,
    stats: Option<Arc<AllocationStats>>,
}

impl Arena {
    /// Create an arena that is not accounted against any allocator
    pub fn new(location: MemoryLocation, len: usize) -> Arc<Self> {
        Self::build(location, len, None)
    }

    fn build(location: MemoryLocation, len: usize, stats: Option<Arc<AllocationStats>>) -> Arc<Self> {
        if let Some(stats) = &stats {
            stats.live_bytes.fetch_add(len, Ordering::Relaxed);
            stats.total_allocations.fetch_add(1, Ordering::Relaxed);
        }
        Arc::new(Self {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            location,
            len,
            bytes: Mutex::new(vec![0u8; len]),
            stats,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Some(stats) = &self.stats {
            stats.live_bytes.fetch_sub(self.len, Ordering::Relaxed);
        }
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("len", &self.len)
            .finish()
    }
}

/// A byte range `[offset, offset + size)` inside a shared arena
#[derive(Clone)]
pub struct Buffer {
    arena: Arc<Arena>,
    offset: usize,
    size: usize,
}

impl Buffer {
    /// A buffer covering a whole arena
    pub fn new(arena: Arc<Arena>) -> Self {
        let size = arena.len();
        Self {
            arena,
            offset: 0,
            size,
        }
    }

    pub fn arena_id(&self) -> u64 {
        self.arena.id()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn location(&self) -> MemoryLocation {
        self.arena.location()
    }

    /// Carve a sub-range, `offset` being relative to this buffer
    pub fn slice(&self, offset: usize, size: usize) -> Result<Buffer> {
        let end = offset
            .checked_add(size)
            .ok_or_else(|| Error::Fail("buffer slice overflows".to_string()))?;
        if end > self.size {
            return Err(Error::Fail(format!(
                "buffer slice [{}, {}) exceeds buffer of {} bytes",
                offset, end, self.size
            )));
        }
        Ok(Self {
            arena: Arc::clone(&self.arena),
            offset: self.offset + offset,
            size,
        })
    }

    /// True when both buffers start at the same place in the same arena
    pub fn same_region(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.arena, &other.arena) && self.offset == other.offset
    }

    /// True when the two byte ranges share at least one byte
    pub fn overlaps(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.arena, &other.arena)
            && self.offset < other.offset + other.size
            && other.offset < self.offset + self.size
    }

    /// Copy the buffer's bytes out
    pub fn read(&self) -> Result<Vec<u8>> {
        let bytes = self
            .arena
            .bytes
            .lock()
            .map_err(|_| Error::Fail("arena lock poisoned".to_string()))?;
        Ok(bytes[self.offset..self.offset + self.size].to_vec())
    }

    /// Copy `data` into the start of the buffer
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if data.len() > self.size {
            return Err(Error::InvalidArgument(format!(
                "cannot write {} bytes into a buffer of {} bytes",
                data.len(),
                self.size
            )));
        }
        let mut bytes = self
            .arena
            .bytes
            .lock()
            .map_err(|_| Error::Fail("arena lock poisoned".to_string()))?;
        bytes[self.offset..self.offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("arena", &self.arena.id())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

/// Source of buffers for one memory location
pub trait Allocator: Send + Sync + fmt::Debug {
    /// Location every buffer from this allocator lives at
    fn location(&self) -> MemoryLocation;

    /// Allocate `size` bytes
    fn alloc(&self, size: usize) -> Result<Buffer>;

    /// Create a completion fence for asynchronous producers; `None` for synchronous devices
    fn create_fence(&self) -> Option<Fence> {
        None
    }

    /// Bytes currently held by live buffers
    fn allocated_bytes(&self) -> usize;
}

pub type AllocatorPtr = Arc<dyn Allocator>;

/// Host allocator with an optional limit on live bytes
#[derive(Debug)]
pub struct CpuAllocator {
    location: MemoryLocation,
    memory_limit: Option<usize>,
    stats: Arc<AllocationStats>,
}

impl CpuAllocator {
    pub fn new(memory_limit: Option<usize>) -> Self {
        Self::with_location(MemoryLocation::cpu(), memory_limit)
    }

    pub fn with_location(location: MemoryLocation, memory_limit: Option<usize>) -> Self {
        Self {
            location,
            memory_limit,
            stats: Arc::new(AllocationStats::default()),
        }
    }

    /// Number of `alloc` calls served so far
    pub fn allocation_count(&self) -> usize {
        self.stats.total_allocations()
    }
}

impl Allocator for CpuAllocator {
    fn location(&self) -> MemoryLocation {
        self.location
    }

    fn alloc(&self, size: usize) -> Result<Buffer> {
        if let Some(limit) = self.memory_limit {
            let live = self.stats.live_bytes();
            if live.saturating_add(size) > limit {
                return Err(Error::Fail(format!(
                    "Memory limit exceeded: requested {} bytes with {} bytes already allocated (limit: {} bytes)",
                    size, live, limit
                )));
            }
        }
        let arena = Arena::build(self.location, size, Some(Arc::clone(&self.stats)));
        Ok(Buffer::new(arena))
    }

    fn allocated_bytes(&self) -> usize {
        self.stats.live_bytes()
    }
}

/// Create the default host allocator
pub fn create_default_allocator(memory_limit: Option<usize>) -> AllocatorPtr {
    Arc::new(CpuAllocator::new(memory_limit))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_rounding() {
        assert_eq!(calc_mem_size_with_alignment(4, 4, ALLOC_ALIGNMENT), Some(64));
        assert_eq!(calc_mem_size_with_alignment(16, 4, ALLOC_ALIGNMENT), Some(64));
        assert_eq!(calc_mem_size_with_alignment(17, 4, ALLOC_ALIGNMENT), Some(128));
        assert_eq!(calc_mem_size_with_alignment(0, 4, ALLOC_ALIGNMENT), Some(0));
        assert_eq!(calc_mem_size_with_alignment(usize::MAX, 2, ALLOC_ALIGNMENT), None);
        assert_eq!(calc_mem_size_with_alignment(usize::MAX, 1, ALLOC_ALIGNMENT), None);
    }

    #[test]
    fn test_live_bytes_follow_arena_lifetime() {
        let allocator = CpuAllocator::new(None);
        let a = allocator.alloc(128).unwrap();
        let b = allocator.alloc(64).unwrap();
        assert_eq!(allocator.allocated_bytes(), 192);

        let view = a.slice(64, 64).unwrap();
        drop(a);
        // the slice keeps the arena alive
        assert_eq!(allocator.allocated_bytes(), 192);
        drop(view);
        assert_eq!(allocator.allocated_bytes(), 64);
        drop(b);
        assert_eq!(allocator.allocated_bytes(), 0);
        assert_eq!(allocator.allocation_count(), 2);
    }

    #[test]
    fn test_memory_limit() {
        let allocator = CpuAllocator::new(Some(100));
        let _kept = allocator.alloc(64).unwrap();
        assert!(matches!(allocator.alloc(64), Err(Error::Fail(_))));
        assert!(allocator.alloc(36).is_ok());
    }

    #[test]
    fn test_slices_alias_and_overlap() {
        let buffer = Buffer::new(Arena::new(MemoryLocation::cpu(), 256));
        let first = buffer.slice(0, 64).unwrap();
        let second = buffer.slice(64, 64).unwrap();
        let again = buffer.slice(0, 16).unwrap();

        assert!(first.same_region(&again));
        assert!(!first.same_region(&second));
        assert!(!first.overlaps(&second));
        assert!(first.overlaps(&again));
        assert!(buffer.slice(200, 64).is_err());

        second.write(&[7u8; 4]).unwrap();
        let bytes = buffer.read().unwrap();
        assert_eq!(&bytes[64..68], &[7, 7, 7, 7]);
        assert_eq!(bytes[68], 0);
    }
}
