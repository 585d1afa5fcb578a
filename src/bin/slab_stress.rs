//! Linux host 压测/长稳工具：对一个 Cache 执行随机 alloc/free 序列。
//!
//! 典型用法：
//! - `cargo run --release --features host --bin slab_stress -- --iters 500000 --max-live 4096 --size 64 --seed 1`
//! - `valgrind --leak-check=full --show-leak-kinds=all target/release/slab_stress --iters 200000`
//!
//! 说明：该工具只依赖 std + crate 本身，方便在 Linux 主机上跑 valgrind/miri/stress。

use slubmalloc::*;

use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::alloc::Layout;
use std::collections::HashMap;
use std::env;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::time::Instant;

struct Pager {
    pages: Mutex<HashMap<usize, u32>>,
}

impl Pager {
    fn new() -> Self {
        Self {
            pages: Mutex::new(HashMap::with_capacity(1 << 14)),
        }
    }

    fn currently_allocated(&self) -> usize {
        self.pages.lock().unwrap().len()
    }
}

unsafe impl SlabPageProvider for Pager {
    fn alloc_pages(&self, order: u32, _node: Option<NodeId>, _flags: PageFlags) -> Option<NonNull<u8>> {
        let bytes = PAGE_SIZE << order;
        let p = unsafe { std::alloc::alloc(Layout::from_size_align(bytes, bytes).unwrap()) };
        if p.is_null() {
            panic!("alloc_pages(order {}) failed", order);
        }
        self.pages.lock().unwrap().insert(p as usize, order);
        NonNull::new(p)
    }

    unsafe fn free_pages(&self, ptr: NonNull<u8>, order: u32) {
        let base = ptr.as_ptr() as usize;
        assert_eq!(
            self.pages.lock().unwrap().remove(&base),
            Some(order),
            "freeing unknown page {:#x}",
            base
        );
        let bytes = PAGE_SIZE << order;
        std::alloc::dealloc(ptr.as_ptr(), Layout::from_size_align(bytes, bytes).unwrap());
    }

    fn page_to_node(&self, _ptr: NonNull<u8>) -> NodeId {
        0
    }
}

fn arg_u64(name: &str, default: u64) -> u64 {
    let mut it = env::args().skip(1);
    while let Some(a) = it.next() {
        if a == name {
            return it
                .next()
                .unwrap_or_else(|| panic!("missing value for {}", name))
                .parse::<u64>()
                .unwrap_or_else(|_| panic!("invalid u64 for {}", name));
        }
    }
    default
}

fn arg_usize(name: &str, default: usize) -> usize {
    arg_u64(name, default as u64) as usize
}

fn main() {
    let iters = arg_u64("--iters", 200_000) as usize;
    let max_live = arg_usize("--max-live", 4096);
    let size = arg_usize("--size", 64);
    let seed = arg_u64("--seed", 1);
    let debug = arg_u64("--debug", 0) != 0;

    assert!(size > 0 && size <= MAX_KMALLOC_SIZE);

    let pager: &'static Pager = Box::leak(Box::new(Pager::new()));
    let topo: &'static UniprocessorTopology = Box::leak(Box::new(UniprocessorTopology));

    let flags = if debug {
        CacheFlags::CONSISTENCY_CHECKS | CacheFlags::RED_ZONE | CacheFlags::POISON
    } else {
        CacheFlags::empty()
    };
    let cache = Cache::create(
        "stress",
        size,
        8,
        flags,
        None,
        pager,
        topo,
        TunableConfig::default(),
    )
    .expect("cache creation");

    let mut rng = SmallRng::seed_from_u64(seed);
    let mut live: Vec<NonNull<u8>> = Vec::with_capacity(max_live);
    let start = Instant::now();
    let mut allocs = 0usize;
    let mut frees = 0usize;
    let mut shrinks = 0usize;

    for i in 0..iters {
        let do_alloc = live.is_empty() || (live.len() < max_live && rng.gen_bool(0.60));
        if do_alloc {
            let ptr = cache
                .alloc(None, AllocFlags::empty())
                .expect("allocation failed");
            unsafe { ptr.as_ptr().write_bytes(0xE1, size) };
            live.push(ptr);
            allocs += 1;
        } else {
            let idx = rng.gen_range(0..live.len());
            let p = live.swap_remove(idx);
            unsafe { cache.free(p) };
            frees += 1;
        }

        // 偶尔回收空 slab
        if (i & 0x3fff) == 0x3fff {
            cache.shrink().expect("shrink failed");
            shrinks += 1;
        }
    }

    for p in live.drain(..) {
        unsafe { cache.free(p) };
        frees += 1;
    }

    cache.flush_all();
    let stats = cache.stats();
    assert_eq!(stats.active_objects, 0, "objects unaccounted for");
    assert_eq!(corruption_events(), 0, "corruption detected during clean run");

    let refills = cache.event_count(StatItem::Refill);
    let new_slabs = cache.event_count(StatItem::NewSlab);
    let discards = cache.event_count(StatItem::DiscardSlab);
    drop(cache);

    let dur = start.elapsed();
    println!(
        "slab_stress done: iters={} size={} allocs={} frees={} refills={} new_slabs={} discards={} shrinks={} pages_left={} elapsed={:?}",
        iters,
        size,
        allocs,
        frees,
        refills,
        new_slabs,
        discards,
        shrinks,
        pager.currently_allocated(),
        dur
    );

    assert_eq!(pager.currently_allocated(), 0, "leaked pages");
}
