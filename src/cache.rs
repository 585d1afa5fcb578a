//! The central per-type allocator: one object size, per-CPU fast paths,
//! per-node partial lists, slab lifecycle.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::panic::Location;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use hashbrown::HashMap;
use spin::{Mutex, RwLock};

use crate::check::{self, DebugCtx, TrackKind};
use crate::cpu::CpuCache;
pub use crate::cpu::StatItem;
use crate::layout::ObjectLayout;
use crate::node::NodeAllocator;
use crate::slab::{self, read_free_ptr, SlabMeta, SlabRef};
use crate::zone::SlabUsage;
use crate::{
    AllocFlags, CacheFlags, CpuId, NodeId, PageFlags, SlabError, SlabPageProvider, SmpTopology,
    TunableConfig, FREELIST_END,
};

/// Object constructor, invoked once per object when its slab is created —
/// not on every allocation.
pub type CtorFn = fn(*mut u8);

/// Point-in-time counters for one cache: totals plus a per-node
/// breakdown. Taken with node locks only.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub total_objects: usize,
    pub active_objects: usize,
    pub total_slabs: usize,
    pub partial_slabs: usize,
    pub per_node: Vec<NodeStats>,
}

#[derive(Debug, Clone)]
pub struct NodeStats {
    pub node: NodeId,
    pub total_slabs: usize,
    pub partial_slabs: usize,
    pub total_objects: usize,
    /// Free objects sitting on this node's partial slabs.
    pub partial_free_objects: usize,
    /// Slabs ever created on this node.
    pub lifetime_slabs: usize,
}

/// A `kmem_cache`: allocates objects of exactly one size.
///
/// Owns one node allocator per NUMA node and one CPU cache per CPU, both
/// sized from the topology snapshot taken at creation.
pub struct Cache {
    name: String,
    flags: CacheFlags,
    layout: ObjectLayout,
    /// Usable bytes per object. Starts at `layout.objsize` and only ever
    /// grows, when a larger compatible cache is merged into this one.
    objsize: AtomicUsize,
    ctor: Option<CtorFn>,
    config: TunableConfig,
    /// Named aliases sharing this cache after merging. Teardown happens
    /// when the last alias is destroyed.
    pub(crate) refcount: AtomicUsize,
    provider: &'static dyn SlabPageProvider,
    topology: &'static dyn SmpTopology,
    cpus: Vec<CpuCache>,
    nodes: Vec<NodeAllocator>,
    /// Slab base address → metadata, for every live slab of this cache.
    /// The free slow path resolves objects here after masking.
    slabs_by_base: RwLock<HashMap<usize, SlabRef>>,
    /// Cycling roll deciding whether a miss may scavenge remote nodes.
    defrag_clock: AtomicUsize,
    /// Pages waiting out an RCU grace period before going back to the
    /// provider (`DESTROY_BY_RCU` caches only).
    deferred_pages: Mutex<Vec<(usize, u32)>>,
    /// Cached `flags.has_debug()`; a debug cache never uses the lock-free
    /// fast paths.
    debug: bool,
}

// Raw slab pointers in the index and node lists are guarded by the lock
// discipline described in the crate docs.
unsafe impl Send for Cache {}
unsafe impl Sync for Cache {}

impl Cache {
    /// Build a cache. Usually reached through
    /// [`CacheRegistry::create_cache`](crate::CacheRegistry::create_cache),
    /// which also handles merging.
    pub fn create(
        name: &str,
        objsize: usize,
        align: usize,
        mut flags: CacheFlags,
        ctor: Option<CtorFn>,
        provider: &'static dyn SlabPageProvider,
        topology: &'static dyn SmpTopology,
        config: TunableConfig,
    ) -> Result<Cache, SlabError> {
        // A constructor maintains object state across frees; poison would
        // destroy it.
        if ctor.is_some() {
            flags.remove(CacheFlags::POISON);
        }
        let layout = ObjectLayout::calculate(objsize, align, flags, ctor.is_some(), &config)?;
        let cpus = (0..topology.cpu_count()).map(|_| CpuCache::new()).collect();
        let nodes = (0..topology.node_count()).map(NodeAllocator::new).collect();

        log::debug!(
            "cache '{}': objsize {} size {} align {} order {} objects/slab {}",
            name,
            layout.objsize,
            layout.size,
            layout.align,
            layout.order,
            layout.objects_per_slab,
        );

        Ok(Cache {
            name: String::from(name),
            debug: flags.has_debug(),
            flags,
            objsize: AtomicUsize::new(layout.objsize),
            layout,
            ctor,
            config,
            refcount: AtomicUsize::new(1),
            provider,
            topology,
            cpus,
            nodes,
            slabs_by_base: RwLock::new(HashMap::new()),
            defrag_clock: AtomicUsize::new(0),
            deferred_pages: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> CacheFlags {
        self.flags
    }

    /// Usable bytes per object (`ksize` of any pointer from this cache).
    pub fn object_size(&self) -> usize {
        self.objsize.load(Ordering::Relaxed)
    }

    pub fn layout(&self) -> &ObjectLayout {
        &self.layout
    }

    /// Number of named aliases currently sharing this cache.
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    pub(crate) fn has_ctor(&self) -> bool {
        self.ctor.is_some()
    }

    /// Grow the usable size after a merge, so the biggest merged user
    /// still gets what it asked for from `object_size`/zero-fill.
    pub(crate) fn raise_objsize(&self, objsize: usize) {
        self.objsize.fetch_max(objsize, Ordering::AcqRel);
    }

    fn debug_ctx(&self) -> DebugCtx<'_> {
        DebugCtx {
            name: &self.name,
            layout: &self.layout,
            flags: self.flags,
        }
    }

    /// Allocate one object, preferring `node_hint` when given.
    ///
    /// With a pinned `node_hint` and `remote_defrag_ratio == 0`, the
    /// returned object is guaranteed to reside on that node (or the
    /// allocation fails).
    #[track_caller]
    pub fn alloc(&self, node_hint: Option<NodeId>, aflags: AllocFlags) -> Option<NonNull<u8>> {
        let caller = Location::caller();
        let cpu = self.topology.current_cpu();
        let cc = &self.cpus[cpu];

        let obj = if !self.debug && cc.node_matches(node_hint) {
            match cc.freelist.pop(self.layout.fp_offset) {
                Some(obj) => {
                    cc.lent.fetch_sub(1, Ordering::Relaxed);
                    cc.stat(StatItem::AllocFastpath);
                    Some(obj)
                }
                None => self.alloc_slow(cpu, node_hint, caller),
            }
        } else {
            self.alloc_slow(cpu, node_hint, caller)
        }?;

        if self.flags.contains(CacheFlags::TRACE) {
            log::trace!("cache '{}': alloc {:#x}", self.name, obj);
        }
        if aflags.contains(AllocFlags::ZERO) {
            debug_assert!(
                self.ctor.is_none(),
                "zeroing would wipe constructor-established state"
            );
            unsafe { core::ptr::write_bytes(obj as *mut u8, 0, self.object_size()) };
        }
        NonNull::new(obj as *mut u8)
    }

    /// Slow path: refill the CPU cache from the node lists or a fresh
    /// slab, then serve one object.
    #[inline(never)]
    fn alloc_slow(
        &self,
        cpu: CpuId,
        node_hint: Option<NodeId>,
        caller: &'static Location<'static>,
    ) -> Option<usize> {
        let cc = &self.cpus[cpu];
        cc.stat(StatItem::AllocSlowpath);
        let fp_offset = self.layout.fp_offset;

        loop {
            let slab = match cc.current_slab() {
                Some(slab) => slab,
                None => {
                    let slab = self.acquire_slab(cpu, node_hint)?;
                    let meta = slab.as_meta();
                    cc.install_slab(slab, meta.node);
                    meta.unlock();
                    slab
                }
            };
            let meta = slab.as_meta();
            meta.lock();

            // A pinned allocation cannot be served from a slab on the
            // wrong node; give the slab back and start over.
            if let Some(want) = node_hint {
                if meta.node != want {
                    self.deactivate_locked(cpu, slab);
                    continue;
                }
            }

            let head = meta.freelist();
            if head == FREELIST_END {
                // Exhausted (possibly refilled later by remote frees).
                self.deactivate_locked(cpu, slab);
                continue;
            }

            if meta.is_debug() {
                // Debug slabs serve one checked object at a time and never
                // lend their freelist to the CPU cache, so the validation
                // scans always see the complete free set.
                let ctx = self.debug_ctx();
                if check::alloc_check(&ctx, meta, head).is_err() {
                    // Damage containment: declare every object in use so
                    // the slab drops out of circulation until frees
                    // rebuild a trustworthy freelist.
                    meta.set_freelist(FREELIST_END);
                    meta.set_inuse(meta.capacity);
                    self.deactivate_locked(cpu, slab);
                    continue;
                }
                meta.pop_free(fp_offset);
                meta.inuse_add(1);
                check::mark_allocated(&ctx, head);
                if self.flags.contains(CacheFlags::STORE_USER) {
                    check::set_track(&ctx, head, TrackKind::Alloc, cpu, caller);
                }
                meta.unlock();
                return Some(head);
            }

            // Bulk grab: lend the whole freelist to this CPU. Everything
            // on it counts as allocated until deactivation merges the
            // leftovers back.
            let lent = (meta.capacity - meta.inuse()) as usize;
            let head = meta.take_freelist();
            meta.set_inuse(meta.capacity);
            meta.unlock();

            let rest = unsafe { read_free_ptr(head, fp_offset) };
            cc.freelist.set(rest);
            cc.lent.store(lent - 1, Ordering::Relaxed);
            cc.stat(StatItem::Refill);
            return Some(head);
        }
    }

    /// Find the next slab for `cpu`: the target node's partial list, then
    /// (for unpinned requests, ratio permitting) remote partial lists by
    /// distance, then a fresh slab. The result is frozen and locked.
    fn acquire_slab(&self, cpu: CpuId, node_hint: Option<NodeId>) -> Option<SlabRef> {
        let local = node_hint.unwrap_or_else(|| self.topology.node_of_cpu(cpu));

        if let Some(slab) = self.nodes[local].take_partial() {
            return Some(slab);
        }

        if node_hint.is_none() && self.defrag_roll() {
            for remote in self.topology.nodes_by_distance(local) {
                // Only raid nodes holding more than they would retain.
                if self.nodes[remote].nr_partial() > self.config.min_partial {
                    if let Some(slab) = self.nodes[remote].take_partial() {
                        self.cpus[cpu].stat(StatItem::RemoteSteal);
                        return Some(slab);
                    }
                }
            }
        }

        self.new_slab(cpu, node_hint, local)
    }

    fn defrag_roll(&self) -> bool {
        let ratio = self.config.remote_defrag_ratio.min(100);
        if ratio == 0 {
            return false;
        }
        let roll = (self.defrag_clock.fetch_add(1, Ordering::Relaxed) % 100) as u32;
        roll < ratio
    }

    /// Get a brand-new slab from the page provider. May block inside the
    /// provider; no allocator locks are held here. Returns the slab
    /// frozen and locked.
    fn new_slab(&self, cpu: CpuId, node_hint: Option<NodeId>, local: NodeId) -> Option<SlabRef> {
        let mut pflags = PageFlags::empty();
        if self.flags.contains(CacheFlags::DMA) {
            pflags |= PageFlags::DMA;
        }
        if self.flags.contains(CacheFlags::RECLAIM_ACCOUNT) {
            pflags |= PageFlags::RECLAIMABLE;
        }

        let order = self.layout.order;
        let ptr = match self.provider.alloc_pages(order, Some(local), pflags) {
            Some(ptr) => ptr,
            // A pinned request must not fall back to other nodes.
            None if node_hint.is_some() => return None,
            None => self.provider.alloc_pages(order, None, pflags)?,
        };
        let base = ptr.as_ptr() as usize;
        debug_assert_eq!(base & (self.layout.slab_bytes() - 1), 0);

        let node = self.provider.page_to_node(ptr).min(self.nodes.len() - 1);
        let meta = Box::new(SlabMeta::new(base, node, &self.layout, self.debug));
        let slab = SlabRef(NonNull::from(Box::leak(meta)));
        let meta = slab.as_meta();

        if self.debug {
            let ctx = self.debug_ctx();
            for i in 0..self.layout.objects_per_slab {
                check::init_object_free_state(&ctx, meta.obj_addr(i));
                check::init_object_tracking(&ctx, meta.obj_addr(i));
            }
        }
        let head = slab::init_freelist(base, &self.layout);
        meta.set_freelist(head);
        // Constructors run exactly once, at slab creation.
        if let Some(ctor) = self.ctor {
            for i in 0..self.layout.objects_per_slab {
                ctor(meta.obj_addr(i) as *mut u8);
            }
        }

        meta.lock();
        meta.set_frozen();
        self.slabs_by_base.write().insert(base, slab);
        self.nodes[node].account_new_slab(self.layout.objects_per_slab);
        self.cpus[cpu].stat(StatItem::NewSlab);

        log::trace!(
            "cache '{}': new slab {:#x} on node {} ({} objects)",
            self.name,
            base,
            node,
            self.layout.objects_per_slab,
        );
        Some(slab)
    }

    /// Give up CPU ownership of `slab` (which is locked and installed on
    /// `cpu`'s cache): merge the private freelist back, unfreeze, and file
    /// the slab with its node. Always unlocks.
    fn deactivate_locked(&self, cpu: CpuId, slab: SlabRef) {
        let cc = &self.cpus[cpu];
        let meta = slab.as_meta();
        let fp_offset = self.layout.fp_offset;

        let taken = cc.take_slab();
        if taken.is_none() {
            // Already taken over (concurrent flush); nothing to merge.
            meta.unlock();
            return;
        }
        debug_assert!(taken == Some(slab));

        // Merge the leftover private freelist, object by object.
        let mut head = cc.freelist.take();
        cc.lent.store(0, Ordering::Relaxed);
        let mut merged = 0u32;
        while head != FREELIST_END {
            let next = unsafe { read_free_ptr(head, fp_offset) };
            meta.push_free(head, fp_offset);
            merged += 1;
            head = next;
        }
        meta.inuse_sub(merged);

        // Served allocations while frozen? Then its remaining free space
        // is "hot" and should be drained soon (tail). A slab given back
        // untouched goes to the head.
        let was_hot = meta.inuse() > meta.frozen_inuse.load(Ordering::Relaxed);
        meta.clear_frozen();
        cc.stat(StatItem::Deactivate);

        let node = &self.nodes[meta.node];
        let inuse = meta.inuse();
        if inuse == 0 {
            if node.nr_partial() < self.config.min_partial {
                // Keep a few empty slabs around; a page-provider round
                // trip costs more than the memory usually does.
                node.add_partial(slab, false);
                meta.unlock();
            } else {
                meta.unlock();
                self.discard_slab(slab);
            }
        } else if meta.freelist() != FREELIST_END {
            node.add_partial(slab, was_hot);
            meta.unlock();
        } else {
            // Fully allocated: off every list, except that call-site
            // tracking wants full slabs reachable for scans.
            if self.flags.contains(CacheFlags::STORE_USER) {
                node.add_full(slab);
            }
            meta.unlock();
        }
    }

    /// Free one object previously returned by [`Cache::alloc`].
    ///
    /// # Safety
    /// `ptr` must come from this cache's `alloc` and not have been freed
    /// since.
    #[track_caller]
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let caller = Location::caller();
        let addr = ptr.as_ptr() as usize;
        let cpu = self.topology.current_cpu();
        let cc = &self.cpus[cpu];
        let base = addr & !(self.layout.slab_bytes() - 1);

        if self.flags.contains(CacheFlags::TRACE) {
            log::trace!("cache '{}': free {:#x}", self.name, addr);
        }

        // Fast path: the object belongs to the slab this CPU has frozen;
        // only this CPU ever touches that private list.
        if !self.debug && base != 0 && cc.slab_base() == base {
            cc.freelist.push(addr, self.layout.fp_offset);
            cc.lent.fetch_add(1, Ordering::Relaxed);
            cc.stat(StatItem::FreeFastpath);
            return;
        }

        self.free_slow(cpu, addr, base, caller);
    }

    fn free_slow(&self, cpu: CpuId, addr: usize, base: usize, caller: &'static Location<'static>) {
        let cc = &self.cpus[cpu];
        cc.stat(StatItem::FreeSlowpath);
        let fp_offset = self.layout.fp_offset;

        let slab = { self.slabs_by_base.read().get(&base).copied() };
        let Some(slab) = slab else {
            log::error!(
                "cache '{}': free of {:#x} which belongs to no slab of this cache",
                self.name,
                addr,
            );
            return;
        };
        let meta = slab.as_meta();
        meta.lock();

        if meta.is_debug() {
            let ctx = self.debug_ctx();
            if check::free_check(&ctx, meta, addr).is_err() {
                // Rejected: safer to leak the object than to corrupt the
                // freelist with it.
                meta.unlock();
                return;
            }
            if self.flags.contains(CacheFlags::STORE_USER) {
                check::set_track(&ctx, addr, TrackKind::Free, cpu, caller);
            }
            if meta.on_full() {
                self.nodes[meta.node].remove_full(slab);
            }
        }

        let was_full = meta.freelist() == FREELIST_END;
        meta.push_free(addr, fp_offset);
        meta.inuse_sub(1);

        if meta.is_frozen() {
            // The owning CPU finds this object at its next refill.
            if cc.current_slab() != Some(slab) {
                cc.stat(StatItem::CrossCpuFree);
            }
            meta.unlock();
            return;
        }

        let node = &self.nodes[meta.node];
        let inuse = meta.inuse();
        if inuse == 0 {
            if meta.on_partial() {
                if node.nr_partial() > self.config.min_partial {
                    node.remove_partial(slab);
                    meta.unlock();
                    self.discard_slab(slab);
                    return;
                }
            } else if node.nr_partial() < self.config.min_partial {
                node.add_partial(slab, true);
            } else {
                meta.unlock();
                self.discard_slab(slab);
                return;
            }
            meta.unlock();
            return;
        }
        if was_full && !meta.on_partial() {
            // First free object of a previously-full slab: reusable again.
            node.add_partial(slab, true);
        }
        meta.unlock();
    }

    /// Return a detached, unlocked, object-free slab's pages to the
    /// provider (or park them on the deferred list for RCU caches) and
    /// drop its metadata.
    fn discard_slab(&self, slab: SlabRef) {
        let meta = slab.as_meta();
        let (base, order, node, capacity) =
            (meta.base, meta.order, meta.node, meta.capacity as usize);

        self.slabs_by_base.write().remove(&base);
        self.nodes[node].account_discard_slab(capacity);
        self.cpus[self.topology.current_cpu()].stat(StatItem::DiscardSlab);

        unsafe { drop(Box::from_raw(slab.0.as_ptr())) };

        if self.flags.contains(CacheFlags::DESTROY_BY_RCU) {
            self.deferred_pages.lock().push((base, order));
        } else {
            unsafe {
                self.provider
                    .free_pages(NonNull::new_unchecked(base as *mut u8), order)
            };
        }
        log::trace!("cache '{}': discard slab {:#x}", self.name, base);
    }

    /// Release every page whose grace period the caller vouches for.
    /// No-op for non-RCU caches.
    pub fn rcu_drain(&self) {
        let pages = core::mem::take(&mut *self.deferred_pages.lock());
        for (base, order) in pages {
            unsafe {
                self.provider
                    .free_pages(NonNull::new_unchecked(base as *mut u8), order)
            };
        }
    }

    /// Deactivate one CPU's frozen slab back to its node.
    pub(crate) fn flush_cpu(&self, cpu: CpuId) {
        if let Some(slab) = self.cpus[cpu].current_slab() {
            slab.as_meta().lock();
            self.deactivate_locked(cpu, slab);
        }
    }

    /// Deactivate every CPU's frozen slab. Slow by design; used by
    /// shrink, destroy and CPU-offline handling. Callers must be able to
    /// tolerate the per-CPU takeover (quiescent CPUs, or an IPI-backed
    /// topology).
    pub fn flush_all(&self) {
        self.topology.run_on_each_cpu(&mut |cpu| self.flush_cpu(cpu));
    }

    /// Release empty slabs and re-order every node's partial list so that
    /// the fullest slabs are allocated from first.
    ///
    /// Live objects are never touched (only empty slabs are released and
    /// only list order changes). Errors only if the temporary bucket
    /// array cannot be allocated, which callers may treat as retryable.
    pub fn shrink(&self) -> Result<(), SlabError> {
        self.flush_all();
        let objects = self.layout.objects_per_slab;

        for node in &self.nodes {
            let mut buckets: Vec<VecDeque<SlabRef>> = Vec::new();
            buckets
                .try_reserve(objects)
                .map_err(|_| SlabError::OutOfMemory)?;
            for _ in 0..objects {
                buckets.push(VecDeque::new());
            }

            let empties = node.sort_partial_by_occupancy(&mut buckets);
            for slab in empties {
                slab.as_meta().unlock();
                self.discard_slab(slab);
            }
        }
        Ok(())
    }

    /// Tear the cache down. Fails with [`SlabError::CacheBusy`] — leaving
    /// the cache fully intact — if any object is still allocated. When
    /// the cache is a merge alias, only the last destroy tears down.
    pub fn destroy(&self) -> Result<(), SlabError> {
        if self.refcount.fetch_sub(1, Ordering::AcqRel) > 1 {
            return Ok(());
        }

        self.flush_all();
        self.rcu_drain();

        // Everything still indexed must be an empty slab parked on a
        // partial list; anything else means live objects.
        let mut listed = 0usize;
        let mut outstanding = 0usize;
        for node in &self.nodes {
            let lists = node.lists.lock();
            listed += lists.partial.len();
            outstanding += lists
                .partial
                .iter()
                .filter(|s| s.as_meta().inuse() > 0)
                .count();
            outstanding += lists.full.len();
        }
        let indexed = self.slabs_by_base.read().len();
        if outstanding > 0 || indexed != listed {
            self.refcount.fetch_add(1, Ordering::AcqRel);
            log::warn!(
                "cache '{}': destroy refused, {} slab(s) still hold objects",
                self.name,
                outstanding + (indexed - listed),
            );
            return Err(SlabError::CacheBusy);
        }

        for node in &self.nodes {
            while let Some(slab) = node.take_partial() {
                slab.as_meta().clear_frozen();
                slab.as_meta().unlock();
                self.discard_slab(slab);
            }
        }
        log::debug!("cache '{}': destroyed", self.name);
        Ok(())
    }

    /// Is `ptr` an address this cache could have returned (in range of a
    /// live slab and on an object boundary)?
    pub fn ptr_validate(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let base = addr & !(self.layout.slab_bytes() - 1);
        match self.slabs_by_base.read().get(&base) {
            Some(slab) => slab.as_meta().contains(addr),
            None => false,
        }
    }

    /// Read-only snapshot of object/slab counts. Takes node locks
    /// transiently, never slab locks.
    pub fn stats(&self) -> CacheStats {
        let mut per_node = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let lists = node.lists.lock();
            let partial_free_objects: usize = lists
                .partial
                .iter()
                .map(|s| (s.as_meta().capacity - s.as_meta().inuse()) as usize)
                .sum();
            per_node.push(NodeStats {
                node: node.node,
                total_slabs: node.nr_slabs.load(Ordering::Relaxed),
                partial_slabs: lists.partial.len(),
                total_objects: node.total_objects.load(Ordering::Relaxed),
                partial_free_objects,
                lifetime_slabs: node.lifetime_slabs.load(Ordering::Relaxed),
            });
        }

        // Objects lent to CPU freelists are free in fact though their
        // slabs count them as in use.
        let inuse_total: usize = {
            let index = self.slabs_by_base.read();
            index
                .values()
                .map(|s| s.as_meta().inuse() as usize)
                .sum()
        };
        let lent_total: usize = self.cpus.iter().map(|c| c.lent.load(Ordering::Relaxed)).sum();

        CacheStats {
            total_objects: per_node.iter().map(|n| n.total_objects).sum(),
            active_objects: inuse_total.saturating_sub(lent_total),
            total_slabs: per_node.iter().map(|n| n.total_slabs).sum(),
            partial_slabs: per_node.iter().map(|n| n.partial_slabs).sum(),
            per_node,
        }
    }

    /// 本cache占用/空闲的内存空间统计
    pub fn usage(&self) -> SlabUsage {
        let stats = self.stats();
        let total = (stats.total_slabs * self.layout.slab_bytes()) as u64;
        let free =
            ((stats.total_objects - stats.active_objects) * self.layout.size) as u64;
        SlabUsage::new(total, free)
    }

    /// Sum of one fast-path event counter over all CPUs.
    pub fn event_count(&self, item: StatItem) -> usize {
        self.cpus.iter().map(|c| c.stat_value(item)).sum()
    }

    /// Drain this node of every slab, for memory hotplug. Refuses with
    /// [`SlabError::NodeBusy`] if any slab on the node still holds
    /// objects.
    pub(crate) fn drain_node(&self, node_id: NodeId) -> Result<(), SlabError> {
        if node_id >= self.nodes.len() {
            return Ok(());
        }
        self.flush_all();
        let node = &self.nodes[node_id];

        {
            let lists = node.lists.lock();
            let busy = lists.partial.iter().any(|s| s.as_meta().inuse() > 0)
                || !lists.full.is_empty();
            if busy {
                return Err(SlabError::NodeBusy);
            }
        }
        if node.nr_slabs.load(Ordering::Relaxed) > node.lists.lock().partial.len() {
            // Slabs exist outside the lists (fully used, untracked).
            return Err(SlabError::NodeBusy);
        }

        while let Some(slab) = node.take_partial() {
            slab.as_meta().clear_frozen();
            slab.as_meta().unlock();
            self.discard_slab(slab);
        }
        Ok(())
    }
}

impl Drop for Cache {
    /// Last-resort cleanup when the handle itself is dropped: give every
    /// remaining page back so host tests and tools do not leak. Live
    /// objects at this point are a caller bug and are logged.
    fn drop(&mut self) {
        self.flush_all();
        self.rcu_drain();
        let slabs: Vec<SlabRef> = self.slabs_by_base.read().values().copied().collect();
        for slab in slabs {
            let meta = slab.as_meta();
            if meta.inuse() > 0 {
                log::warn!(
                    "cache '{}': dropped with {} live object(s) in slab {:#x}",
                    self.name,
                    meta.inuse(),
                    meta.base,
                );
            }
            if meta.on_partial() {
                self.nodes[meta.node].remove_partial(slab);
            }
            if meta.on_full() {
                self.nodes[meta.node].remove_full(slab);
            }
            self.discard_slab(slab);
        }
        self.rcu_drain();
    }
}
