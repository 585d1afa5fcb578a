//! Per-CPU fast-path state: the frozen slab and the private freelist of
//! objects lent out of it.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::cpu_local::CpuLocalSlot;
use crate::slab::SlabRef;
use crate::NodeId;

/// Marker for "no node recorded".
pub(crate) const NODE_NONE: usize = usize::MAX;

/// Fast-path event counters, one set per CPU per cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum StatItem {
    /// Allocation served straight from the private freelist.
    AllocFastpath,
    /// Allocation that went through the slow path.
    AllocSlowpath,
    /// Free pushed onto the private freelist of the owning CPU.
    FreeFastpath,
    /// Free that took the slab lock.
    FreeSlowpath,
    /// Slab freelists bulk-grabbed into the private freelist.
    Refill,
    /// Slabs this CPU gave back to their node.
    Deactivate,
    /// Fresh slabs requested from the page provider.
    NewSlab,
    /// Slabs whose pages went back to the page provider.
    DiscardSlab,
    /// Partial slabs taken from a remote node.
    RemoteSteal,
    /// Frees that hit a slab frozen on some other CPU.
    CrossCpuFree,
}

pub(crate) const STAT_ITEMS: usize = StatItem::CrossCpuFree as usize + 1;

/// One CPU's view of a cache.
///
/// Only the CPU this instance belongs to touches `freelist` on the fast
/// path; every other access (flush, deactivation on behalf of the CPU)
/// detaches state wholesale with atomic swaps.
pub(crate) struct CpuCache {
    /// Private freelist of validated free objects from `slab`.
    pub freelist: CpuLocalSlot,
    /// Objects currently sitting in `freelist`. They are counted as
    /// `inuse` by their slab until deactivation merges them back.
    pub lent: AtomicUsize,
    /// `SlabMeta` pointer of the frozen slab, or 0.
    slab: AtomicUsize,
    /// Base address of the frozen slab, or 0. Kept separately so the
    /// fast free path can match addresses without touching the metadata.
    slab_base: AtomicUsize,
    /// Node of the frozen slab, or `NODE_NONE`.
    node: AtomicUsize,
    stats: [AtomicUsize; STAT_ITEMS],
}

impl CpuCache {
    pub fn new() -> Self {
        const ZERO: AtomicUsize = AtomicUsize::new(0);
        Self {
            freelist: CpuLocalSlot::new(),
            lent: AtomicUsize::new(0),
            slab: AtomicUsize::new(0),
            slab_base: AtomicUsize::new(0),
            node: AtomicUsize::new(NODE_NONE),
            stats: [ZERO; STAT_ITEMS],
        }
    }

    pub fn stat(&self, item: StatItem) {
        self.stats[item as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn stat_value(&self, item: StatItem) -> usize {
        self.stats[item as usize].load(Ordering::Relaxed)
    }

    pub fn current_slab(&self) -> Option<SlabRef> {
        let raw = self.slab.load(Ordering::Acquire) as *mut crate::slab::SlabMeta;
        core::ptr::NonNull::new(raw).map(SlabRef)
    }

    pub fn slab_base(&self) -> usize {
        self.slab_base.load(Ordering::Acquire)
    }

    pub fn node(&self) -> usize {
        self.node.load(Ordering::Acquire)
    }

    /// Install a freshly frozen slab as this CPU's current one.
    pub fn install_slab(&self, slab: SlabRef, node: NodeId) {
        self.slab_base
            .store(slab.as_meta().base, Ordering::Release);
        self.node.store(node, Ordering::Release);
        self.slab.store(slab.0.as_ptr() as usize, Ordering::Release);
    }

    /// Detach the current slab, clearing the slot. The private freelist is
    /// detached separately (`freelist.take()`).
    pub fn take_slab(&self) -> Option<SlabRef> {
        let raw = self.slab.swap(0, Ordering::AcqRel) as *mut crate::slab::SlabMeta;
        self.slab_base.store(0, Ordering::Release);
        self.node.store(NODE_NONE, Ordering::Release);
        core::ptr::NonNull::new(raw).map(SlabRef)
    }

    /// Does `node_hint` allow serving from the currently installed slab?
    pub fn node_matches(&self, node_hint: Option<NodeId>) -> bool {
        match node_hint {
            None => true,
            Some(want) => self.node() == want,
        }
    }
}
