//! The cache registry: named caches, cache merging, the fixed `kmalloc`
//! size classes for arbitrary-size requests, and hotplug entry points.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;

use hashbrown::HashMap;
use spin::RwLock;

use crate::cache::{Cache, CtorFn};
use crate::layout::{mergeable_with, ObjectLayout};
use crate::{
    AllocFlags, CacheFlags, CpuId, NodeId, SlabError, SlabPageProvider, SmpTopology,
    TunableConfig,
};

/// Fixed general-purpose size classes. The in-between classes (96, 192)
/// cut internal fragmentation for the most common object sizes.
pub const KMALLOC_CLASSES: &[usize] = &[
    8, 16, 32, 64, 96, 128, 192, 256, 512, 1024, 2048, 4096, 8192,
];

/// Biggest request the size classes serve; larger allocations belong to
/// the page allocator directly.
pub const MAX_KMALLOC_SIZE: usize = 8192;

/// Owns every [`Cache`] and answers arbitrary-size (`kmalloc`-style)
/// requests by routing them to the right size class.
pub struct CacheRegistry {
    provider: &'static dyn SlabPageProvider,
    topology: &'static dyn SmpTopology,
    config: TunableConfig,
    /// One cache per entry of [`KMALLOC_CLASSES`].
    kmalloc: Vec<Arc<Cache>>,
    /// Every distinct client cache (merged aliases appear once).
    caches: RwLock<Vec<Arc<Cache>>>,
    /// Alias name → cache. Several names may point at one merged cache.
    names: RwLock<HashMap<String, Arc<Cache>>>,
}

impl CacheRegistry {
    /// Build the registry and its built-in size classes.
    ///
    /// Panics if a built-in class cannot be laid out — a misconfiguration
    /// that would make every later allocation undefined, so it aborts
    /// init rather than limp along.
    pub fn new(
        provider: &'static dyn SlabPageProvider,
        topology: &'static dyn SmpTopology,
        config: TunableConfig,
    ) -> CacheRegistry {
        let mut kmalloc = Vec::with_capacity(KMALLOC_CLASSES.len());
        for &size in KMALLOC_CLASSES {
            let name = alloc::format!("kmalloc-{}", size);
            let cache = Cache::create(
                &name,
                size,
                0,
                CacheFlags::empty(),
                None,
                provider,
                topology,
                config,
            )
            .expect("built-in size class must fit a slab");
            kmalloc.push(Arc::new(cache));
        }
        log::info!(
            "slab registry ready: {} size classes, {} CPUs, {} nodes",
            kmalloc.len(),
            topology.cpu_count(),
            topology.node_count(),
        );
        CacheRegistry {
            provider,
            topology,
            config,
            kmalloc,
            caches: RwLock::new(Vec::new()),
            names: RwLock::new(HashMap::new()),
        }
    }

    /// Figure out the index into the class array for a request; shared by
    /// every `kmalloc`-family entry point.
    fn class_index(size: usize) -> Option<usize> {
        match size {
            0 => None,
            1..=8 => Some(0),
            9..=16 => Some(1),
            17..=32 => Some(2),
            33..=64 => Some(3),
            65..=96 => Some(4),
            97..=128 => Some(5),
            129..=192 => Some(6),
            193..=256 => Some(7),
            257..=512 => Some(8),
            513..=1024 => Some(9),
            1025..=2048 => Some(10),
            2049..=4096 => Some(11),
            4097..=8192 => Some(12),
            _ => None,
        }
    }

    /// Usable bytes a request of `size` would actually get, for realloc
    /// decisions. `None` when the size classes cannot serve it.
    pub fn ksize(size: usize) -> Option<usize> {
        Self::class_index(size).map(|idx| KMALLOC_CLASSES[idx])
    }

    /// General-purpose allocation from the size classes.
    pub fn kmalloc(&self, size: usize, flags: AllocFlags) -> Option<NonNull<u8>> {
        self.kmalloc_node(size, None, flags)
    }

    /// `kmalloc` with zeroed memory.
    pub fn kzalloc(&self, size: usize) -> Option<NonNull<u8>> {
        self.kmalloc(size, AllocFlags::ZERO)
    }

    pub fn kmalloc_node(
        &self,
        size: usize,
        node: Option<NodeId>,
        flags: AllocFlags,
    ) -> Option<NonNull<u8>> {
        let idx = Self::class_index(size)?;
        self.kmalloc[idx].alloc(node, flags)
    }

    /// Free a `kmalloc` allocation of `size` bytes.
    ///
    /// # Safety
    /// `ptr` must come from `kmalloc`/`kzalloc` with a size mapping to
    /// the same class, and not have been freed since.
    pub unsafe fn kfree(&self, ptr: NonNull<u8>, size: usize) {
        match Self::class_index(size) {
            Some(idx) => self.kmalloc[idx].free(ptr),
            None => log::error!("kfree of {:p} with unservable size {}", ptr, size),
        }
    }

    /// Create (or merge into) a named cache.
    ///
    /// Compatible requests are folded into an existing cache to curb
    /// cache proliferation; the existing cache's usable size is raised so
    /// every merged user still gets at least what it asked for.
    pub fn create_cache(
        &self,
        name: &str,
        objsize: usize,
        align: usize,
        flags: CacheFlags,
        ctor: Option<CtorFn>,
    ) -> Result<Arc<Cache>, SlabError> {
        if self.names.read().contains_key(name) {
            log::warn!("cache name '{}' already registered", name);
        }

        if let Some(existing) = self.find_mergeable(objsize, align, flags, ctor) {
            existing
                .refcount
                .fetch_add(1, core::sync::atomic::Ordering::AcqRel);
            existing.raise_objsize(objsize);
            log::debug!("cache '{}' merged into '{}'", name, existing.name());
            self.names
                .write()
                .insert(String::from(name), existing.clone());
            return Ok(existing);
        }

        let cache = Arc::new(Cache::create(
            name,
            objsize,
            align,
            flags,
            ctor,
            self.provider,
            self.topology,
            self.config,
        )?);
        self.caches.write().push(cache.clone());
        self.names.write().insert(String::from(name), cache.clone());
        Ok(cache)
    }

    /// First existing cache a request may share, if any.
    fn find_mergeable(
        &self,
        objsize: usize,
        align: usize,
        flags: CacheFlags,
        ctor: Option<CtorFn>,
    ) -> Option<Arc<Cache>> {
        if self.config.never_merge
            || ctor.is_some()
            || flags.intersects(CacheFlags::never_merge())
        {
            return None;
        }
        let candidate = ObjectLayout::calculate(objsize, align, flags, false, &self.config).ok()?;

        let check = |cache: &Arc<Cache>| -> bool {
            !cache.has_ctor()
                && !cache.flags().intersects(CacheFlags::never_merge())
                && mergeable_with(cache.layout(), cache.flags(), &candidate, flags)
        };
        for cache in self.kmalloc.iter() {
            if check(cache) {
                return Some(cache.clone());
            }
        }
        for cache in self.caches.read().iter() {
            if check(cache) {
                return Some(cache.clone());
            }
        }
        None
    }

    /// Look a cache up by any of its registered names.
    pub fn find_cache(&self, name: &str) -> Option<Arc<Cache>> {
        self.names.read().get(name).cloned()
    }

    /// Destroy the cache registered under `name`. With live objects the
    /// destroy is refused and the registration kept.
    pub fn destroy_cache(&self, name: &str) -> Result<(), SlabError> {
        let cache = self
            .names
            .read()
            .get(name)
            .cloned()
            .ok_or(SlabError::InvalidLayout)?;
        cache.destroy()?;
        self.names.write().remove(name);
        if cache.refcount() == 0 {
            self.caches.write().retain(|c| !Arc::ptr_eq(c, &cache));
        }
        Ok(())
    }

    fn for_each_cache(&self, f: &mut dyn FnMut(&Arc<Cache>)) {
        for cache in self.kmalloc.iter() {
            f(cache);
        }
        for cache in self.caches.read().iter() {
            f(cache);
        }
    }

    /// CPU going away: push every cache's per-CPU state back to the
    /// nodes so nothing stays stranded in the dead CPU's slot.
    pub fn on_cpu_offline(&self, cpu: CpuId) {
        self.for_each_cache(&mut |cache| cache.flush_cpu(cpu));
    }

    /// Memory node going away. Refused while any cache still has
    /// object-holding slabs on the node; empty slabs are drained.
    pub fn on_node_offline(&self, node: NodeId) -> Result<(), SlabError> {
        let mut result = Ok(());
        self.for_each_cache(&mut |cache| {
            if result.is_ok() {
                result = cache.drain_node(node);
            }
        });
        if result.is_err() {
            log::warn!("node {} offline refused: slabs still in use", node);
        }
        result
    }

    /// Release empty slabs everywhere (memory pressure hook).
    pub fn reclaim_all(&self) -> Result<(), SlabError> {
        let mut result = Ok(());
        self.for_each_cache(&mut |cache| {
            if result.is_ok() {
                result = cache.shrink();
            }
        });
        result
    }

    /// 全部cache的内存占用统计
    pub fn usage(&self) -> SlabUsage {
        let mut total = 0u64;
        let mut free = 0u64;
        self.for_each_cache(&mut |cache| {
            let usage = cache.usage();
            total += usage.total();
            free += usage.free();
        });
        SlabUsage::new(total, free)
    }
}

/// Slab内存空间使用情况
pub struct SlabUsage {
    // slab总共使用的内存空间
    total: u64,
    // slab的空闲空间
    free: u64,
}

impl SlabUsage {
    pub fn new(total: u64, free: u64) -> Self {
        Self { total, free }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn used(&self) -> u64 {
        self.total - self.free
    }

    pub fn free(&self) -> u64 {
        self.free
    }
}
