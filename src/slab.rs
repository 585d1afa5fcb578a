//! Slab metadata and the intrusive freelist.
//!
//! A slab is `PAGE_SIZE << order` bytes of provider memory sliced into
//! `capacity` object slots. Bookkeeping lives in a [`SlabMeta`] allocated
//! separately (one per backing region), so the objects get the whole
//! region; the backing region's natural alignment lets the owning slab be
//! recovered from any object address by masking.
//!
//! Free objects are threaded into a singly-linked list through a pointer
//! slot inside their own memory. [`write_free_ptr`]/[`read_free_ptr`] are
//! the only places in the crate that do that raw aliasing; everything
//! above them deals in opaque `usize` object addresses.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::layout::ObjectLayout;
use crate::{NodeId, FREELIST_END};

/// Slab state bits, all in one word. Bit 0 is a spinlock scoped to this
/// slab; the rest are only mutated while it is held.
const STATE_LOCKED: usize = 1 << 0;
const STATE_FROZEN: usize = 1 << 1;
const STATE_DEBUG: usize = 1 << 2;
const STATE_ON_PARTIAL: usize = 1 << 3;
const STATE_ON_FULL: usize = 1 << 4;

/// Write the intrusive next-free link of the object at `obj`.
///
/// # Safety
/// `obj + fp_offset` must point at a writable, word-aligned pointer slot
/// inside a free (or being-freed) object of a live slab.
#[inline]
pub(crate) unsafe fn write_free_ptr(obj: usize, fp_offset: usize, next: usize) {
    ((obj + fp_offset) as *mut usize).write(next);
}

/// Read the intrusive next-free link of the object at `obj`.
///
/// # Safety
/// `obj + fp_offset` must point at the link slot of a free object of a
/// live slab.
#[inline]
pub(crate) unsafe fn read_free_ptr(obj: usize, fp_offset: usize) -> usize {
    ((obj + fp_offset) as *const usize).read()
}

/// Per-slab bookkeeping. Owned via `Box`, shared as raw [`SlabRef`]s by
/// the per-CPU caches, the node lists and the cache's base→meta index;
/// freed exactly once, when the backing pages go back to the provider.
pub(crate) struct SlabMeta {
    /// First byte of the backing region.
    pub base: usize,
    pub order: u32,
    /// Object stride, copied from the cache layout.
    pub size: usize,
    pub capacity: u32,
    /// Node the backing pages live on.
    pub node: NodeId,
    state: AtomicUsize,
    /// Head of the intrusive freelist, or `FREELIST_END`.
    freelist: AtomicUsize,
    /// Objects currently allocated (objects lent to a CPU cache count as
    /// allocated until the slab is deactivated).
    inuse: AtomicU32,
    /// `inuse` at the moment the slab was last frozen; deactivation uses
    /// it to tell hot slabs from ones given back untouched.
    pub frozen_inuse: AtomicU32,
}

impl SlabMeta {
    pub fn new(base: usize, node: NodeId, layout: &ObjectLayout, debug: bool) -> SlabMeta {
        SlabMeta {
            base,
            order: layout.order,
            size: layout.size,
            capacity: layout.objects_per_slab as u32,
            node,
            state: AtomicUsize::new(if debug { STATE_DEBUG } else { 0 }),
            freelist: AtomicUsize::new(FREELIST_END),
            inuse: AtomicU32::new(0),
            frozen_inuse: AtomicU32::new(0),
        }
    }

    /// Spin until this slab's lock bit is acquired.
    pub fn lock(&self) {
        while self.state.fetch_or(STATE_LOCKED, Ordering::Acquire) & STATE_LOCKED != 0 {
            core::hint::spin_loop();
        }
    }

    /// Single non-blocking acquisition attempt.
    pub fn try_lock(&self) -> bool {
        self.state.fetch_or(STATE_LOCKED, Ordering::Acquire) & STATE_LOCKED == 0
    }

    pub fn unlock(&self) {
        self.state.fetch_and(!STATE_LOCKED, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.state.load(Ordering::Acquire) & STATE_FROZEN != 0
    }

    pub fn set_frozen(&self) {
        self.frozen_inuse.store(self.inuse(), Ordering::Relaxed);
        self.state.fetch_or(STATE_FROZEN, Ordering::Release);
    }

    pub fn clear_frozen(&self) {
        self.state.fetch_and(!STATE_FROZEN, Ordering::Release);
    }

    pub fn is_debug(&self) -> bool {
        self.state.load(Ordering::Relaxed) & STATE_DEBUG != 0
    }

    pub fn on_partial(&self) -> bool {
        self.state.load(Ordering::Relaxed) & STATE_ON_PARTIAL != 0
    }

    pub fn set_on_partial(&self, on: bool) {
        if on {
            self.state.fetch_or(STATE_ON_PARTIAL, Ordering::Relaxed);
        } else {
            self.state.fetch_and(!STATE_ON_PARTIAL, Ordering::Relaxed);
        }
    }

    pub fn on_full(&self) -> bool {
        self.state.load(Ordering::Relaxed) & STATE_ON_FULL != 0
    }

    pub fn set_on_full(&self, on: bool) {
        if on {
            self.state.fetch_or(STATE_ON_FULL, Ordering::Relaxed);
        } else {
            self.state.fetch_and(!STATE_ON_FULL, Ordering::Relaxed);
        }
    }

    pub fn freelist(&self) -> usize {
        self.freelist.load(Ordering::Acquire)
    }

    pub fn set_freelist(&self, head: usize) {
        self.freelist.store(head, Ordering::Release);
    }

    pub fn inuse(&self) -> u32 {
        self.inuse.load(Ordering::Acquire)
    }

    pub fn set_inuse(&self, value: u32) {
        self.inuse.store(value, Ordering::Release);
    }

    pub fn inuse_add(&self, n: u32) {
        self.inuse.fetch_add(n, Ordering::AcqRel);
    }

    pub fn inuse_sub(&self, n: u32) {
        self.inuse.fetch_sub(n, Ordering::AcqRel);
    }

    /// Push one free object. Caller holds the slab lock and adjusts
    /// `inuse` itself.
    pub fn push_free(&self, obj: usize, fp_offset: usize) {
        let head = self.freelist();
        unsafe { write_free_ptr(obj, fp_offset, head) };
        self.set_freelist(obj);
    }

    /// Pop one free object. Caller holds the slab lock and adjusts
    /// `inuse` itself.
    pub fn pop_free(&self, fp_offset: usize) -> Option<usize> {
        let head = self.freelist();
        if head == FREELIST_END {
            return None;
        }
        let next = unsafe { read_free_ptr(head, fp_offset) };
        self.set_freelist(next);
        Some(head)
    }

    /// Detach the whole freelist in one step (the bulk grab that feeds a
    /// CPU cache). Caller holds the slab lock.
    pub fn take_freelist(&self) -> usize {
        let head = self.freelist();
        self.set_freelist(FREELIST_END);
        head
    }

    /// Is `addr` a plausible object address of this slab (in range and on
    /// an object boundary)?
    pub fn contains(&self, addr: usize) -> bool {
        if addr < self.base {
            return false;
        }
        let offset = addr - self.base;
        offset < self.capacity as usize * self.size && offset % self.size == 0
    }

    /// Address of object slot `index`.
    pub fn obj_addr(&self, index: usize) -> usize {
        self.base + index * self.size
    }
}

/// Pre-link every slot of a fresh slab into one freelist, object `i`
/// pointing at object `i + 1`, and return the head (object 0).
pub(crate) fn init_freelist(base: usize, layout: &ObjectLayout) -> usize {
    let count = layout.objects_per_slab;
    for i in 0..count {
        let obj = base + i * layout.size;
        let next = if i + 1 < count {
            base + (i + 1) * layout.size
        } else {
            FREELIST_END
        };
        unsafe { write_free_ptr(obj, layout.fp_offset, next) };
    }
    base
}

/// Shared raw handle to a [`SlabMeta`]. The metadata outlives every copy
/// of the handle: the cache only drops the `Box` after removing the slab
/// from its index, the node lists and every CPU slot.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlabRef(pub core::ptr::NonNull<SlabMeta>);

unsafe impl Send for SlabRef {}
unsafe impl Sync for SlabRef {}

impl SlabRef {
    pub fn as_meta(&self) -> &SlabMeta {
        unsafe { self.0.as_ref() }
    }
}
