//! A per-CPU, NUMA-aware slab allocator for fixed-size kernel objects.
//!
//! # Overview
//!
//! The organization is as follows:
//!
//!  * A [`CacheRegistry`] owns every named [`Cache`], merges compatible
//!    caches, and provides the fixed `kmalloc` size classes for
//!    arbitrary-size requests.
//!  * A [`Cache`] allocates objects of exactly one size. It owns one
//!    node allocator (partial-slab list) per NUMA node and one per-CPU
//!    fast-path cache per online CPU.
//!  * A slab is one contiguous power-of-two page allocation sliced into
//!    equal objects, threaded together by an intrusive freelist stored in
//!    the free objects' own memory. Slab bookkeeping lives in a dedicated
//!    metadata struct, never inside the page itself, so objects use the
//!    whole backing region.
//!
//! The fast path (allocate/free against the CPU's currently frozen slab)
//! is lock-free; slow paths take the owning slab's bit-spinlock and then,
//! if a list transition is needed, the per-node list lock. That order is
//! fixed: slab lock first, node lock second.
//!
//! Memory is obtained from a client-supplied [`SlabPageProvider`] and CPU
//! enumeration from a [`SmpTopology`], so the crate itself has no
//! dependency on a particular kernel's page allocator or percpu machinery.
#![no_std]
#![crate_name = "slubmalloc"]
#![crate_type = "lib"]
#![deny(clippy::all)]
#![allow(clippy::needless_return)]
extern crate alloc;

mod cache;
mod check;
mod cpu;
mod cpu_local;
mod layout;
mod node;
mod slab;
mod zone;

pub use cache::*;
pub use check::corruption_events;
pub use layout::*;
pub use zone::*;

#[cfg(test)]
#[macro_use]
extern crate std;

#[cfg(test)]
mod tests;


use core::ptr::NonNull;

/// Base page shift/size assumed by the allocator. The page provider hands
/// out regions of `PAGE_SIZE << order` bytes.
pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Machine word size; the minimum object alignment and the size of an
/// intrusive free-pointer slot.
pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// Hardware cache line, used when rounding up the alignment of big objects.
pub const CACHE_LINE_SIZE: usize = 64;

/// Freelist terminator. `usize::MAX` is never word-aligned, so it can never
/// collide with a real object address.
pub const FREELIST_END: usize = usize::MAX;

/// Default cap for the slab-order search. Orders above this are only used
/// as a last resort for objects that cannot fit otherwise.
pub const DEFAULT_MAX_ORDER: u32 = 1;

/// Hard upper bound on the slab order; one object must fit below this or
/// the size is unservable.
pub const ABSOLUTE_MAX_ORDER: u32 = 3;

/// Default number of empty/partial slabs a node keeps around instead of
/// returning them to the page provider.
pub const DEFAULT_MIN_PARTIAL: usize = 5;

/// Default lower bound of objects per slab the order search aims for.
pub const DEFAULT_MIN_OBJECTS: usize = 4;

pub type CpuId = usize;
pub type NodeId = usize;

/// Error that can be returned by cache creation, allocation and teardown
/// requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabError {
    /// The page provider could not satisfy a new-slab request. Never
    /// retried internally; retry policy belongs to the caller.
    OutOfMemory,
    /// The object size exceeds what even the largest permitted slab order
    /// can hold.
    SizeTooLarge,
    /// Allocator can't deal with the provided size/alignment combination.
    InvalidLayout,
    /// A debug-build consistency check failed. The offending operation was
    /// rejected and the damage contained; the cache stays serviceable.
    CorruptionDetected,
    /// A node-offline request found slabs with live objects on that node.
    NodeBusy,
    /// Destroy was requested while objects are still allocated.
    CacheBusy,
}

bitflags::bitflags! {
    /// Behavior flags fixed at cache creation.
    pub struct CacheFlags: u32 {
        /// Sanity-check every alloc/free against the slab (bounds,
        /// double-free).
        const CONSISTENCY_CHECKS = 0x0000_0001;
        /// Guard zones around each object, verified on alloc and free.
        const RED_ZONE           = 0x0000_0002;
        /// Fill freed objects with a poison pattern, verified on reuse.
        const POISON             = 0x0000_0004;
        /// Record the last alloc/free call site per object.
        const STORE_USER         = 0x0000_0008;
        /// Emit a trace line for every alloc/free.
        const TRACE              = 0x0000_0010;
        /// Account slabs as reclaimable towards the page provider.
        const RECLAIM_ACCOUNT    = 0x0000_0020;
        /// Back slabs with DMA-capable pages.
        const DMA                = 0x0000_0040;
        /// Defer page returns until an RCU grace period has elapsed.
        const DESTROY_BY_RCU     = 0x0000_0080;
        /// Round big objects up to a hardware cache line.
        const HWCACHE_ALIGN      = 0x0000_0100;
    }
}

impl CacheFlags {
    /// Flags that force every operation on the cache through the
    /// validation layer.
    pub fn debug_flags() -> CacheFlags {
        CacheFlags::CONSISTENCY_CHECKS
            | CacheFlags::RED_ZONE
            | CacheFlags::POISON
            | CacheFlags::STORE_USER
            | CacheFlags::TRACE
    }

    /// Flags that make a cache ineligible for merging.
    pub fn never_merge() -> CacheFlags {
        Self::debug_flags() | CacheFlags::DESTROY_BY_RCU
    }

    pub fn has_debug(&self) -> bool {
        self.intersects(Self::debug_flags())
    }
}

bitflags::bitflags! {
    /// Per-allocation request flags.
    pub struct AllocFlags: u32 {
        /// Return memory whose first `object_size` bytes are zero.
        const ZERO = 0x0000_0001;
    }
}

bitflags::bitflags! {
    /// Hints forwarded to the page provider with each slab request.
    pub struct PageFlags: u32 {
        const DMA         = 0x0000_0001;
        const RECLAIMABLE = 0x0000_0002;
    }
}

/// The memory backing used by every [`Cache`]. A client that wants to use
/// the allocator has to provide this interface.
///
/// # Contract
/// `alloc_pages(order, ..)` must return a region of `PAGE_SIZE << order`
/// bytes aligned to its own size; the allocator relies on that alignment
/// to map object addresses back to their slab by masking. Regions must
/// stay valid until the matching `free_pages`. `alloc_pages` may block
/// (the allocator never calls it with one of its locks held).
pub unsafe trait SlabPageProvider: Send + Sync {
    fn alloc_pages(
        &self,
        order: u32,
        node: Option<NodeId>,
        flags: PageFlags,
    ) -> Option<NonNull<u8>>;

    /// # Safety
    /// `ptr` must come from `alloc_pages` with the same `order`, with no
    /// live objects inside.
    unsafe fn free_pages(&self, ptr: NonNull<u8>, order: u32);

    /// Which node the backing memory of `ptr` actually lives on.
    fn page_to_node(&self, ptr: NonNull<u8>) -> NodeId;
}

/// CPU/NUMA enumeration services. A snapshot of the online sets is taken
/// at cache creation; hotplug events are delivered explicitly through the
/// registry (`on_cpu_offline` / `on_node_offline`).
pub trait SmpTopology: Send + Sync {
    fn cpu_count(&self) -> usize;
    fn node_count(&self) -> usize;
    fn current_cpu(&self) -> CpuId;
    fn node_of_cpu(&self, cpu: CpuId) -> NodeId;

    /// Nodes ordered by increasing distance from `from`, excluding `from`
    /// itself. Used by the remote partial-slab scavenger.
    fn nodes_by_distance(&self, from: NodeId) -> alloc::vec::Vec<NodeId> {
        (0..self.node_count()).filter(|&n| n != from).collect()
    }

    /// Run `f` once per online CPU. Only the flush path uses this; an SMP
    /// host would back it with an IPI, the default runs inline (the
    /// non-preemptive fallback, which takes over the target CPU's slot).
    fn run_on_each_cpu(&self, f: &mut dyn FnMut(CpuId)) {
        for cpu in 0..self.cpu_count() {
            f(cpu);
        }
    }
}

/// Topology of a machine with one CPU and one memory node. Handy for
/// bring-up and for host-side tools.
pub struct UniprocessorTopology;

impl SmpTopology for UniprocessorTopology {
    fn cpu_count(&self) -> usize {
        1
    }
    fn node_count(&self) -> usize {
        1
    }
    fn current_cpu(&self) -> CpuId {
        0
    }
    fn node_of_cpu(&self, _cpu: CpuId) -> NodeId {
        0
    }
}

/// Runtime-tunable knobs, fixed per cache at creation. Mirrors the usual
/// kernel command-line tunables for this allocator family.
#[derive(Debug, Clone, Copy)]
pub struct TunableConfig {
    /// Cap for the slab-order search (`DEFAULT_MAX_ORDER`).
    pub max_order: u32,
    /// Empty slabs kept per node before pages are returned.
    pub min_partial: usize,
    /// Objects-per-slab goal of the order search.
    pub min_objects: usize,
    /// 0..=100. Probability (percent) that an allocation falling off its
    /// node's partial list may scavenge remote nodes. 0 pins allocations
    /// to the requested node.
    pub remote_defrag_ratio: u32,
    /// Globally disable cache merging.
    pub never_merge: bool,
}

impl Default for TunableConfig {
    fn default() -> Self {
        Self {
            max_order: DEFAULT_MAX_ORDER,
            min_partial: DEFAULT_MIN_PARTIAL,
            min_objects: DEFAULT_MIN_OBJECTS,
            remote_defrag_ratio: 100,
            never_merge: false,
        }
    }
}
