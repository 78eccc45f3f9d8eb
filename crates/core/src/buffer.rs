use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use parking_lot::{Mutex, MutexGuard};

use crate::format::PlaneFormat;

/// Logical slot a buffer belongs to.
///
/// The four logical cameras dewarp into two physical planes: left/right share
/// one chunk generation and front/rear share another. `pair()` exposes that
/// mapping.
///
/// # Example
/// ```rust
/// use halo_core::prelude::{CameraPair, PlaneId};
///
/// assert_eq!(PlaneId::CameraLeft.pair(), Some(CameraPair::LeftRight));
/// assert_eq!(PlaneId::camera(2), Some(PlaneId::CameraFront));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PlaneId {
    CameraLeft,
    CameraRight,
    CameraFront,
    CameraRear,
    AlphaLeft,
    AlphaRight,
    AlphaFront,
    AlphaRear,
    Car,
    Output,
}

/// Physical camera plane shared by two logical cameras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CameraPair {
    /// Left and right cameras dewarp into the same chunk.
    LeftRight,
    /// Front and rear cameras dewarp into the same chunk.
    FrontRear,
}

impl CameraPair {
    /// Index into per-pair tables (0 = left/right, 1 = front/rear).
    pub fn index(&self) -> usize {
        match self {
            CameraPair::LeftRight => 0,
            CameraPair::FrontRear => 1,
        }
    }
}

impl PlaneId {
    /// Camera plane for a capture index (0 = left, 1 = right, 2 = front, 3 = rear).
    pub fn camera(index: usize) -> Option<PlaneId> {
        match index {
            0 => Some(PlaneId::CameraLeft),
            1 => Some(PlaneId::CameraRight),
            2 => Some(PlaneId::CameraFront),
            3 => Some(PlaneId::CameraRear),
            _ => None,
        }
    }

    /// Alpha plane for a lane index.
    pub fn alpha(lane: usize) -> Option<PlaneId> {
        match lane {
            0 => Some(PlaneId::AlphaLeft),
            1 => Some(PlaneId::AlphaRight),
            2 => Some(PlaneId::AlphaFront),
            3 => Some(PlaneId::AlphaRear),
            _ => None,
        }
    }

    /// Capture index for camera planes.
    pub fn camera_index(&self) -> Option<usize> {
        match self {
            PlaneId::CameraLeft => Some(0),
            PlaneId::CameraRight => Some(1),
            PlaneId::CameraFront => Some(2),
            PlaneId::CameraRear => Some(3),
            _ => None,
        }
    }

    /// Physical pair this camera plane dewarps into.
    pub fn pair(&self) -> Option<CameraPair> {
        match self {
            PlaneId::CameraLeft | PlaneId::CameraRight => Some(CameraPair::LeftRight),
            PlaneId::CameraFront | PlaneId::CameraRear => Some(CameraPair::FrontRear),
            _ => None,
        }
    }
}

/// Errors from pool allocation and leasing.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("allocator could not reserve {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("pool for {plane:?} has no free slot")]
    Exhausted { plane: PlaneId },
    #[error("pool for {plane:?} has no slot {slot}")]
    NoSuchSlot { plane: PlaneId, slot: usize },
    #[error("slot {slot} of {plane:?} is still leased")]
    SlotBusy { plane: PlaneId, slot: usize },
}

/// Allocator for physically contiguous, hardware-addressable chunks.
///
/// The engine never allocates after setup; pools reserve all their chunks up
/// front and report `OutOfMemory` if the allocator cannot satisfy them.
pub trait ChunkAllocator: Send + Sync {
    /// Reserve a zeroed chunk of `len` bytes.
    fn allocate(&self, len: usize) -> Result<Vec<u8>, PoolError>;
}

/// Default allocator backed by the process heap.
///
/// # Example
/// ```rust
/// use halo_core::prelude::{ChunkAllocator, HeapChunks};
///
/// let chunk = HeapChunks.allocate(64).unwrap();
/// assert_eq!(chunk.len(), 64);
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapChunks;

impl ChunkAllocator for HeapChunks {
    fn allocate(&self, len: usize) -> Result<Vec<u8>, PoolError> {
        let mut chunk = Vec::new();
        chunk
            .try_reserve_exact(len)
            .map_err(|_| PoolError::OutOfMemory { requested: len })?;
        chunk.resize(len, 0);
        Ok(chunk)
    }
}

struct PoolSlot {
    data: Mutex<Vec<u8>>,
}

struct PoolShared {
    plane: PlaneId,
    format: PlaneFormat,
    slots: Vec<PoolSlot>,
    free: Mutex<Vec<bool>>,
    recycled: AtomicU64,
}

impl PoolShared {
    fn release(&self, slot: usize) {
        let mut free = self.free.lock();
        debug_assert!(!free[slot], "slot released twice");
        free[slot] = true;
        self.recycled.fetch_add(1, Ordering::Relaxed);
    }
}

/// Fixed-depth pool of hardware-addressable chunks for one logical plane.
///
/// Pools never grow: depth is reserved up front (depth 2 enables double
/// buffering) and `lease` fails once every slot is handed out. Chunks are
/// never resized or reformatted after allocation.
///
/// # Example
/// ```rust
/// use halo_core::prelude::*;
///
/// let fmt = PlaneFormat::new(FourCc::new(*b"AR24"), Resolution::new(4, 4).unwrap(), 4);
/// let pool = PlanePool::allocate(&HeapChunks, PlaneId::Car, fmt, 2).unwrap();
/// let handle = pool.lease().unwrap();
/// assert_eq!(pool.available(), 1);
/// drop(handle);
/// assert_eq!(pool.available(), 2);
/// ```
#[derive(Clone)]
pub struct PlanePool {
    shared: Arc<PoolShared>,
}

impl PlanePool {
    /// Reserve `count` chunks for `plane`.
    ///
    /// On allocator failure every chunk reserved so far is released before
    /// the error is returned.
    pub fn allocate(
        allocator: &dyn ChunkAllocator,
        plane: PlaneId,
        format: PlaneFormat,
        count: usize,
    ) -> Result<Self, PoolError> {
        let len = format.plane_bytes();
        let mut slots = Vec::with_capacity(count);
        for _ in 0..count {
            // Dropping `slots` on the error path frees the partial set.
            let chunk = allocator.allocate(len)?;
            slots.push(PoolSlot {
                data: Mutex::new(chunk),
            });
        }
        Ok(Self {
            shared: Arc::new(PoolShared {
                plane,
                format,
                free: Mutex::new(vec![true; count]),
                slots,
                recycled: AtomicU64::new(0),
            }),
        })
    }

    /// Lease the first free slot.
    pub fn lease(&self) -> Result<PlaneHandle, PoolError> {
        let mut free = self.shared.free.lock();
        let slot = free
            .iter()
            .position(|f| *f)
            .ok_or(PoolError::Exhausted {
                plane: self.shared.plane,
            })?;
        free[slot] = false;
        Ok(PlaneHandle::new(self.shared.clone(), slot))
    }

    /// Lease a specific slot, e.g. to toggle double-buffer generations.
    pub fn lease_slot(&self, slot: usize) -> Result<PlaneHandle, PoolError> {
        let mut free = self.shared.free.lock();
        match free.get(slot) {
            None => Err(PoolError::NoSuchSlot {
                plane: self.shared.plane,
                slot,
            }),
            Some(false) => Err(PoolError::SlotBusy {
                plane: self.shared.plane,
                slot,
            }),
            Some(true) => {
                free[slot] = false;
                Ok(PlaneHandle::new(self.shared.clone(), slot))
            }
        }
    }

    /// Logical plane this pool backs.
    pub fn plane(&self) -> PlaneId {
        self.shared.plane
    }

    /// Format every chunk was allocated with.
    pub fn format(&self) -> PlaneFormat {
        self.shared.format
    }

    /// Number of slots in the pool.
    pub fn depth(&self) -> usize {
        self.shared.slots.len()
    }

    /// Number of currently free slots.
    pub fn available(&self) -> usize {
        self.shared.free.lock().iter().filter(|f| **f).count()
    }

    /// Lifetime count of slots returned to the pool.
    pub fn recycled(&self) -> u64 {
        self.shared.recycled.load(Ordering::Relaxed)
    }
}

struct SlotGuard {
    shared: Arc<PoolShared>,
    slot: usize,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.shared.release(self.slot);
    }
}

/// Reference-counted handle to one pool slot.
///
/// Cloning shares the slot; the slot returns to its pool when the last clone
/// drops. Whichever queue holds a handle owns it — pushing a handle into a
/// queue transfers ownership in, popping transfers it out.
///
/// # Example
/// ```rust
/// use halo_core::prelude::*;
///
/// let fmt = PlaneFormat::new(FourCc::new(*b"AR24"), Resolution::new(2, 2).unwrap(), 4);
/// let pool = PlanePool::allocate(&HeapChunks, PlaneId::Output, fmt, 2).unwrap();
/// let a = pool.lease().unwrap();
/// let b = a.clone();
/// assert!(a.shares_chunk(&b));
/// a.fill(0x7f);
/// assert_eq!(b.read(|data| data[0]), 0x7f);
/// ```
#[derive(Clone)]
pub struct PlaneHandle {
    guard: Arc<SlotGuard>,
}

impl PlaneHandle {
    fn new(shared: Arc<PoolShared>, slot: usize) -> Self {
        Self {
            guard: Arc::new(SlotGuard { shared, slot }),
        }
    }

    /// Logical plane of the backing pool.
    pub fn plane(&self) -> PlaneId {
        self.guard.shared.plane
    }

    /// Pool slot index (double-buffer generation).
    pub fn slot(&self) -> usize {
        self.guard.slot
    }

    /// Format recorded at allocation time.
    pub fn format(&self) -> PlaneFormat {
        self.guard.shared.format
    }

    /// Whether two handles address the same physical chunk.
    pub fn shares_chunk(&self, other: &PlaneHandle) -> bool {
        Arc::ptr_eq(&self.guard.shared, &other.guard.shared) && self.guard.slot == other.guard.slot
    }

    /// Number of live clones of this handle (test/diagnostic aid).
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.guard)
    }

    fn data(&self) -> MutexGuard<'_, Vec<u8>> {
        self.guard.shared.slots[self.guard.slot].data.lock()
    }

    /// Read the chunk contents.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data())
    }

    /// Write the chunk contents.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data())
    }

    /// Fill the chunk with a constant byte.
    pub fn fill(&self, byte: u8) {
        self.data().fill(byte);
    }
}

impl std::fmt::Debug for PlaneHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaneHandle")
            .field("plane", &self.plane())
            .field("slot", &self.slot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FourCc, Resolution};

    fn fmt() -> PlaneFormat {
        PlaneFormat::new(FourCc::new(*b"AR24"), Resolution::new(4, 2).unwrap(), 4)
    }

    #[test]
    fn lease_and_return() {
        let pool = PlanePool::allocate(&HeapChunks, PlaneId::Car, fmt(), 2).unwrap();
        let a = pool.lease().unwrap();
        let b = pool.lease().unwrap();
        assert_eq!(pool.available(), 0);
        assert!(matches!(pool.lease(), Err(PoolError::Exhausted { .. })));
        assert_ne!(a.slot(), b.slot());
        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.recycled(), 2);
    }

    #[test]
    fn clones_keep_slot_leased() {
        let pool = PlanePool::allocate(&HeapChunks, PlaneId::Output, fmt(), 2).unwrap();
        let a = pool.lease().unwrap();
        let b = a.clone();
        drop(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn lease_slot_toggles_generations() {
        let pool = PlanePool::allocate(&HeapChunks, PlaneId::Car, fmt(), 2).unwrap();
        let one = pool.lease_slot(1).unwrap();
        assert_eq!(one.slot(), 1);
        assert!(matches!(
            pool.lease_slot(1),
            Err(PoolError::SlotBusy { slot: 1, .. })
        ));
        assert!(matches!(
            pool.lease_slot(5),
            Err(PoolError::NoSuchSlot { slot: 5, .. })
        ));
        let zero = pool.lease_slot(0).unwrap();
        assert!(!one.shares_chunk(&zero));
    }

    #[test]
    fn chunks_are_zeroed_and_sized() {
        let pool = PlanePool::allocate(&HeapChunks, PlaneId::AlphaLeft, fmt(), 1).unwrap();
        let h = pool.lease().unwrap();
        h.read(|data| {
            assert_eq!(data.len(), fmt().plane_bytes());
            assert!(data.iter().all(|b| *b == 0));
        });
    }

    struct FailingAfter(std::sync::atomic::AtomicUsize);

    impl ChunkAllocator for FailingAfter {
        fn allocate(&self, len: usize) -> Result<Vec<u8>, PoolError> {
            if self.0.fetch_sub(1, Ordering::Relaxed) == 0 {
                return Err(PoolError::OutOfMemory { requested: len });
            }
            HeapChunks.allocate(len)
        }
    }

    #[test]
    fn partial_allocation_reports_oom() {
        let allocator = FailingAfter(std::sync::atomic::AtomicUsize::new(1));
        let Err(err) = PlanePool::allocate(&allocator, PlaneId::Car, fmt(), 2) else {
            panic!("allocation should fail once the allocator runs dry");
        };
        assert!(matches!(err, PoolError::OutOfMemory { .. }));
    }

    #[test]
    fn pair_mapping() {
        assert_eq!(PlaneId::CameraRight.pair(), Some(CameraPair::LeftRight));
        assert_eq!(PlaneId::CameraRear.pair(), Some(CameraPair::FrontRear));
        assert_eq!(PlaneId::Car.pair(), None);
        assert_eq!(PlaneId::camera(4), None);
        assert_eq!(PlaneId::alpha(3), Some(PlaneId::AlphaRear));
    }
}
