//! Pre-allocated packet buffer pool.
//!
//! A userspace daemon has no interrupt context to worry about, so the
//! kernel build's lock-free Treiber stack (ABA-tagged CAS head, built to
//! stay safe when `alloc`/`release` can run from an IRQ handler) buys
//! nothing here — every call site is a plain OS thread. What's kept is the
//! rest of the design: a fixed-size backing array, O(1) alloc/release via an
//! intrusive freelist, and a `slot_data` pointer so [`PacketBuf`] can treat a
//! slot as a flat byte buffer. The freelist itself is just a `Mutex<Vec<u16>>`.
//!
//! [`PacketBuf`]: super::packetbuf::PacketBuf

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Size of each packet buffer slot in bytes.
///
/// Covers the maximum Ethernet frame (1518) plus headroom (128) with room to spare.
pub const BUF_SIZE: usize = 2048;

/// Number of pre-allocated buffer slots.
pub const POOL_SIZE: usize = 256;

// =============================================================================
// Static backing storage
// =============================================================================

/// Raw buffer storage — 256 slots x 2048 bytes.
///
/// Interior mutability via `UnsafeCell` is sound because the pool's
/// allocation discipline guarantees that each slot is owned by at most one
/// [`PacketBuf`](super::packetbuf::PacketBuf) at any time.
struct PoolStorage {
    slots: UnsafeCell<[[u8; BUF_SIZE]; POOL_SIZE]>,
}

// SAFETY: slot access is serialized by the pool's ownership model; a slot is
// accessed exclusively by its owning PacketBuf (move-only, no Clone).
unsafe impl Sync for PoolStorage {}

static POOL_STORAGE: PoolStorage = PoolStorage {
    slots: UnsafeCell::new([[0u8; BUF_SIZE]; POOL_SIZE]),
};

// =============================================================================
// Pool metadata
// =============================================================================

/// Fixed-size packet buffer pool.
pub struct PacketPool {
    freelist: Mutex<Vec<u16>>,
    count: AtomicUsize,
    initialized: AtomicBool,
}

/// The global packet pool singleton.
///
/// Call [`PacketPool::init`] once at daemon startup before any networking
/// code runs.
pub static PACKET_POOL: PacketPool = PacketPool {
    freelist: Mutex::new(Vec::new()),
    count: AtomicUsize::new(0),
    initialized: AtomicBool::new(false),
};

impl PacketPool {
    /// Populate the freelist with every slot, `0..POOL_SIZE`. Subsequent
    /// calls are no-ops.
    pub fn init(&self) {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut freelist = self.freelist.lock().unwrap_or_else(|p| p.into_inner());
        freelist.clear();
        freelist.extend((0..POOL_SIZE as u16).rev());
        self.count.store(POOL_SIZE, Ordering::Release);
    }

    /// Allocate a buffer slot. Returns `None` if the pool is exhausted.
    pub fn alloc(&self) -> Option<u16> {
        let mut freelist = self.freelist.lock().unwrap_or_else(|p| p.into_inner());
        let slot = freelist.pop()?;
        self.count.fetch_sub(1, Ordering::Relaxed);
        Some(slot)
    }

    /// Return a buffer slot to the pool.
    ///
    /// The slot must have been previously allocated from this pool; the
    /// caller must not touch the slot's data after calling `release`.
    pub fn release(&self, slot: u16) {
        debug_assert!(
            (slot as usize) < POOL_SIZE,
            "release: slot index {} out of bounds",
            slot
        );
        let mut freelist = self.freelist.lock().unwrap_or_else(|p| p.into_inner());
        freelist.push(slot);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of free buffer slots (diagnostic).
    #[inline]
    pub fn available(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Whether the pool has been initialized.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Raw pointer to the first byte of slot `slot`.
    ///
    /// Valid for `BUF_SIZE` bytes. The caller must own the slot (allocated,
    /// not yet released) and avoid aliasing mutable references.
    #[inline]
    pub(crate) fn slot_data(&self, slot: u16) -> *mut u8 {
        debug_assert!((slot as usize) < POOL_SIZE);
        // SAFETY: UnsafeCell grants interior mutability; pointer arithmetic
        // is in-bounds because slot < POOL_SIZE and each slot is BUF_SIZE bytes.
        unsafe { (POOL_STORAGE.slots.get() as *mut u8).add(slot as usize * BUF_SIZE) }
    }
}
