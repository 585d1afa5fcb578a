//! Per-NUMA-node shared state: the partial-slab list (and, for call-site
//! tracking caches, the full-slab list used by validation scans).

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use crate::slab::SlabRef;
use crate::NodeId;

pub(crate) struct NodeLists {
    /// Slabs with both free and used objects, available to any CPU on the
    /// node. Head is preferred by the next allocation.
    pub partial: VecDeque<SlabRef>,
    /// Fully-allocated slabs, tracked only when the cache stores call
    /// sites, so validation scans can reach every object.
    pub full: VecDeque<SlabRef>,
}

pub(crate) struct NodeAllocator {
    pub node: NodeId,
    pub lists: Mutex<NodeLists>,
    /// Mirror of `lists.partial.len()`, readable without the lock for the
    /// retention and remote-scavenging heuristics.
    nr_partial: AtomicUsize,
    /// Slabs currently backed by pages on this node, in any state.
    pub nr_slabs: AtomicUsize,
    /// Object capacity summed over current slabs.
    pub total_objects: AtomicUsize,
    /// Slabs ever created on this node (lifetime statistic).
    pub lifetime_slabs: AtomicUsize,
}

impl NodeAllocator {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            lists: Mutex::new(NodeLists {
                partial: VecDeque::new(),
                full: VecDeque::new(),
            }),
            nr_partial: AtomicUsize::new(0),
            nr_slabs: AtomicUsize::new(0),
            total_objects: AtomicUsize::new(0),
            lifetime_slabs: AtomicUsize::new(0),
        }
    }

    pub fn nr_partial(&self) -> usize {
        self.nr_partial.load(Ordering::Relaxed)
    }

    /// Add to the partial list. Tail for slabs that were recently serving
    /// allocations (drain mostly-full slabs first), head for cold ones.
    /// Caller holds the slab lock.
    pub fn add_partial(&self, slab: SlabRef, to_tail: bool) {
        let mut lists = self.lists.lock();
        debug_assert!(!slab.as_meta().on_partial());
        slab.as_meta().set_on_partial(true);
        if to_tail {
            lists.partial.push_back(slab);
        } else {
            lists.partial.push_front(slab);
        }
        self.nr_partial.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove a specific slab from the partial list. Caller holds the
    /// slab lock.
    pub fn remove_partial(&self, slab: SlabRef) {
        let mut lists = self.lists.lock();
        if let Some(pos) = lists.partial.iter().position(|s| *s == slab) {
            lists.partial.remove(pos);
            slab.as_meta().set_on_partial(false);
            self.nr_partial.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Grab one partial slab for a CPU: first lockable candidate wins,
    /// busy ones are skipped rather than waited on. The winner comes back
    /// frozen and still locked.
    ///
    /// Acquiring slab locks while holding the node lock inverts the usual
    /// slab→node order; it stays deadlock-free because only `try_lock` is
    /// used here.
    pub fn take_partial(&self) -> Option<SlabRef> {
        let mut lists = self.lists.lock();
        let mut pos = 0;
        while pos < lists.partial.len() {
            let slab = lists.partial[pos];
            if slab.as_meta().try_lock() {
                lists.partial.remove(pos);
                slab.as_meta().set_on_partial(false);
                self.nr_partial.fetch_sub(1, Ordering::Relaxed);
                slab.as_meta().set_frozen();
                return Some(slab);
            }
            pos += 1;
        }
        None
    }

    /// Track a fully-allocated slab for validation scans. Caller holds
    /// the slab lock.
    pub fn add_full(&self, slab: SlabRef) {
        let mut lists = self.lists.lock();
        debug_assert!(!slab.as_meta().on_full());
        slab.as_meta().set_on_full(true);
        lists.full.push_back(slab);
    }

    /// Caller holds the slab lock.
    pub fn remove_full(&self, slab: SlabRef) {
        let mut lists = self.lists.lock();
        if let Some(pos) = lists.full.iter().position(|s| *s == slab) {
            lists.full.remove(pos);
            slab.as_meta().set_on_full(false);
        }
    }

    /// Shrink pass: bucket the partial list by `inuse` and rebuild it
    /// fullest-first, so future allocations drain nearly-full slabs.
    /// Empty slabs are pulled off the list and returned (still locked)
    /// for the caller to discard; busy ones (trylock failure) are kept.
    ///
    /// `buckets` must hold one slot per possible `inuse` value below
    /// capacity; it is drained back into the list before returning.
    pub fn sort_partial_by_occupancy(
        &self,
        buckets: &mut alloc::vec::Vec<VecDeque<SlabRef>>,
    ) -> alloc::vec::Vec<SlabRef> {
        let mut empties = alloc::vec::Vec::new();
        let mut lists = self.lists.lock();

        while let Some(slab) = lists.partial.pop_front() {
            let meta = slab.as_meta();
            if meta.inuse() == 0 && meta.try_lock() {
                if meta.inuse() == 0 {
                    meta.set_on_partial(false);
                    self.nr_partial.fetch_sub(1, Ordering::Relaxed);
                    empties.push(slab);
                    continue;
                }
                // A racing free repopulated it between the check and the
                // lock; keep it.
                meta.unlock();
            }
            let idx = (meta.inuse() as usize).min(buckets.len().saturating_sub(1));
            buckets[idx].push_back(slab);
        }

        for bucket in buckets.iter_mut().rev() {
            while let Some(slab) = bucket.pop_front() {
                lists.partial.push_back(slab);
            }
        }
        empties
    }

    pub fn account_new_slab(&self, objects: usize) {
        self.nr_slabs.fetch_add(1, Ordering::Relaxed);
        self.total_objects.fetch_add(objects, Ordering::Relaxed);
        self.lifetime_slabs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn account_discard_slab(&self, objects: usize) {
        self.nr_slabs.fetch_sub(1, Ordering::Relaxed);
        self.total_objects.fetch_sub(objects, Ordering::Relaxed);
    }
}
