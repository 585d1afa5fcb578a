//! Object validation: redzones, poison patterns, call-site tracking and
//! deterministic repair when corruption is found.
//!
//! Detection never panics and never takes a slab out of service wholesale.
//! A corrupt freelist is truncated (unreachable objects are leaked, which
//! is safe), a double-free is rejected, a damaged guard pattern is logged,
//! restored and execution continues.
//!
//! Debug caches never lend objects to the per-CPU freelists, so while the
//! slab lock is held the slab freelist is the complete set of free
//! objects; the double-free scan relies on that.

use core::panic::Location;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::layout::{ObjectLayout, TRACK_SIZE};
use crate::slab::{read_free_ptr, write_free_ptr, SlabMeta};
use crate::{CacheFlags, CpuId, FREELIST_END, WORD_SIZE};

/// Fill patterns. Freed object bytes, the last byte of the poisoned
/// region, active/inactive guard zones.
pub const POISON_FREE: u8 = 0x6b;
pub const POISON_END: u8 = 0xa5;
pub const RED_ACTIVE: u8 = 0xcc;
pub const RED_INACTIVE: u8 = 0xbb;

/// Monotonic event stamp for tracking records.
static TRACK_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Process-wide count of detected corruption events, for health
/// monitoring. Only ever increases.
static CORRUPTION_EVENTS: AtomicUsize = AtomicUsize::new(0);

pub fn corruption_events() -> usize {
    CORRUPTION_EVENTS.load(Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackKind {
    Alloc,
    Free,
}

/// Everything the validator needs to know about the owning cache.
pub(crate) struct DebugCtx<'a> {
    pub name: &'a str,
    pub layout: &'a ObjectLayout,
    pub flags: CacheFlags,
}

/// One call-site record: the caller location pointer and a packed
/// cpu/sequence word. Written raw into the object's trailing metadata.
#[repr(C)]
#[derive(Clone, Copy)]
struct Track {
    caller: usize,
    cpu_seq: usize,
}

/// CPU id lives in the top 16 bits of `cpu_seq`, the sequence below.
const TRACK_CPU_SHIFT: u32 = usize::BITS - 16;
const TRACK_SEQ_MASK: usize = (1 << TRACK_CPU_SHIFT) - 1;

const _: () = assert!(core::mem::size_of::<Track>() == TRACK_SIZE);

fn track_slot(ctx: &DebugCtx<'_>, obj: usize, kind: TrackKind) -> Option<*mut Track> {
    let off = ctx.layout.track_offset?;
    let idx = match kind {
        TrackKind::Alloc => 0,
        TrackKind::Free => 1,
    };
    Some((obj + off + idx * TRACK_SIZE) as *mut Track)
}

pub(crate) fn set_track(
    ctx: &DebugCtx<'_>,
    obj: usize,
    kind: TrackKind,
    cpu: CpuId,
    caller: &'static Location<'static>,
) {
    if let Some(slot) = track_slot(ctx, obj, kind) {
        let seq = TRACK_SEQ.fetch_add(1, Ordering::Relaxed);
        let track = Track {
            caller: caller as *const _ as usize,
            cpu_seq: (cpu << TRACK_CPU_SHIFT) | (seq & TRACK_SEQ_MASK),
        };
        unsafe { slot.write(track) };
    }
}

fn log_track(ctx: &DebugCtx<'_>, obj: usize, kind: TrackKind) {
    if let Some(slot) = track_slot(ctx, obj, kind) {
        let track = unsafe { slot.read() };
        if track.caller != 0 {
            let location = unsafe { &*(track.caller as *const Location<'static>) };
            log::error!(
                "  last {:?} at {}:{} (cpu {}, seq {})",
                kind,
                location.file(),
                location.line(),
                track.cpu_seq >> TRACK_CPU_SHIFT,
                track.cpu_seq & TRACK_SEQ_MASK,
            );
        }
    }
}

fn clear_tracks(ctx: &DebugCtx<'_>, obj: usize) {
    for kind in [TrackKind::Alloc, TrackKind::Free] {
        if let Some(slot) = track_slot(ctx, obj, kind) {
            unsafe {
                slot.write(Track {
                    caller: 0,
                    cpu_seq: 0,
                })
            };
        }
    }
}

fn fill(addr: usize, len: usize, pattern: u8) {
    unsafe { core::ptr::write_bytes(addr as *mut u8, pattern, len) };
}

/// Find the first byte in `[addr, addr+len)` that differs from `pattern`.
fn check_bytes(addr: usize, len: usize, pattern: u8) -> Option<usize> {
    let bytes = unsafe { core::slice::from_raw_parts(addr as *const u8, len) };
    bytes.iter().position(|&b| b != pattern).map(|i| addr + i)
}

/// Hex-dump `len` bytes at `addr` through the logger, 16 per line.
fn dump_bytes(addr: usize, len: usize) {
    let bytes = unsafe { core::slice::from_raw_parts(addr as *const u8, len) };
    for (i, chunk) in bytes.chunks(16).enumerate() {
        log::error!("  {:#018x}: {:02x?}", addr + i * 16, chunk);
    }
}

fn report_corruption(
    ctx: &DebugCtx<'_>,
    meta: &SlabMeta,
    obj: usize,
    what: &str,
    fault_addr: usize,
) {
    CORRUPTION_EVENTS.fetch_add(1, Ordering::Relaxed);
    log::error!(
        "slab corruption in cache '{}': {} (object {:#x}, slab base {:#x}, inuse {}/{}, fault at {:#x})",
        ctx.name,
        what,
        obj,
        meta.base,
        meta.inuse(),
        meta.capacity,
        fault_addr,
    );
    // 打印对象及其元数据区域，便于离线分析
    dump_bytes(obj, ctx.layout.size.min(256));
    if ctx.flags.contains(CacheFlags::STORE_USER) {
        log_track(ctx, obj, TrackKind::Alloc);
        log_track(ctx, obj, TrackKind::Free);
    }
}

/// Write the free-state patterns of one object: poison fill over the
/// payload, inactive guards around it, cleared tracking records. Used at
/// slab creation and again after every free.
pub(crate) fn init_object_free_state(ctx: &DebugCtx<'_>, obj: usize) {
    let layout = ctx.layout;
    if ctx.flags.contains(CacheFlags::POISON) {
        fill(obj, layout.objsize - 1, POISON_FREE);
        fill(obj + layout.objsize - 1, 1, POISON_END);
    }
    if ctx.flags.contains(CacheFlags::RED_ZONE) {
        fill(obj + layout.objsize, layout.red_right - layout.objsize, RED_INACTIVE);
        if let Some(canary) = layout.canary_offset {
            fill(obj + canary, WORD_SIZE, RED_INACTIVE);
        }
    }
}

/// One-time setup at slab creation, on top of the free-state fill.
pub(crate) fn init_object_tracking(ctx: &DebugCtx<'_>, obj: usize) {
    if ctx.flags.contains(CacheFlags::STORE_USER) {
        clear_tracks(ctx, obj);
    }
}

/// Verify the free-state patterns before an object is handed out.
/// A mismatch (someone wrote to a freed object) is logged and the
/// patterns are restored; the allocation proceeds.
fn check_object_free_state(ctx: &DebugCtx<'_>, meta: &SlabMeta, obj: usize) {
    let layout = ctx.layout;
    if ctx.flags.contains(CacheFlags::POISON) {
        let bad = check_bytes(obj, layout.objsize - 1, POISON_FREE)
            .or_else(|| check_bytes(obj + layout.objsize - 1, 1, POISON_END));
        if let Some(fault) = bad {
            report_corruption(ctx, meta, obj, "poison overwritten (use after free)", fault);
        }
    }
    check_guards(ctx, meta, obj, RED_INACTIVE);
}

/// Verify guard zones against the pattern they should currently carry,
/// restoring them when damaged.
fn check_guards(ctx: &DebugCtx<'_>, meta: &SlabMeta, obj: usize, expected: u8) {
    let layout = ctx.layout;
    if !ctx.flags.contains(CacheFlags::RED_ZONE) {
        return;
    }
    let red_len = layout.red_right - layout.objsize;
    if let Some(fault) = check_bytes(obj + layout.objsize, red_len, expected) {
        report_corruption(ctx, meta, obj, "right redzone overwritten", fault);
        fill(obj + layout.objsize, red_len, expected);
    }
    if let Some(canary) = layout.canary_offset {
        if let Some(fault) = check_bytes(obj + canary, WORD_SIZE, RED_INACTIVE) {
            report_corruption(ctx, meta, obj, "end canary overwritten", fault);
            fill(obj + canary, WORD_SIZE, RED_INACTIVE);
        }
    }
}

/// Validate the slab's freelist, truncating it at the first corrupt link
/// and recomputing `inuse` from what is actually reachable. Unreachable
/// objects are leaked deliberately; a leak is recoverable, following a
/// wild pointer is not. Returns the reachable free count.
///
/// Caller holds the slab lock.
pub(crate) fn repair_freelist(ctx: &DebugCtx<'_>, meta: &SlabMeta) -> usize {
    let fp_offset = ctx.layout.fp_offset;
    let mut reachable = 0usize;
    let mut prev: Option<usize> = None;
    let mut cursor = meta.freelist();

    while cursor != FREELIST_END {
        let in_bounds = meta.contains(cursor);
        let cycle = reachable >= meta.capacity as usize;
        if !in_bounds || cycle {
            CORRUPTION_EVENTS.fetch_add(1, Ordering::Relaxed);
            log::error!(
                "cache '{}': freelist of slab {:#x} corrupt at entry {} ({}, value {:#x}); truncating, {} objects leaked",
                ctx.name,
                meta.base,
                reachable,
                if cycle { "cycle" } else { "out of bounds" },
                cursor,
                (meta.capacity as usize)
                    .saturating_sub(meta.inuse() as usize)
                    .saturating_sub(reachable),
            );
            match prev {
                Some(p) => unsafe { write_free_ptr(p, fp_offset, FREELIST_END) },
                None => meta.set_freelist(FREELIST_END),
            }
            meta.set_inuse(meta.capacity - reachable as u32);
            return reachable;
        }
        prev = Some(cursor);
        reachable += 1;
        cursor = unsafe { read_free_ptr(cursor, fp_offset) };
    }
    reachable
}

/// Full allocation-side consistency check for a debug slab's freelist
/// head. `Err` means the slab cannot safely serve this object and the
/// caller must contain the damage.
///
/// Caller holds the slab lock.
pub(crate) fn alloc_check(ctx: &DebugCtx<'_>, meta: &SlabMeta, obj: usize) -> Result<(), ()> {
    if !meta.contains(obj) {
        report_corruption(ctx, meta, obj, "freelist head out of bounds", obj);
        repair_freelist(ctx, meta);
        return Err(());
    }
    check_object_free_state(ctx, meta, obj);
    Ok(())
}

/// Flip an object that passed `alloc_check` into its allocated state.
pub(crate) fn mark_allocated(ctx: &DebugCtx<'_>, obj: usize) {
    let layout = ctx.layout;
    if ctx.flags.contains(CacheFlags::RED_ZONE) {
        fill(obj + layout.objsize, layout.red_right - layout.objsize, RED_ACTIVE);
    }
}

/// Free-side consistency check. `Err` rejects the free: the object stays
/// allocated from the allocator's point of view.
///
/// Caller holds the slab lock.
pub(crate) fn free_check(ctx: &DebugCtx<'_>, meta: &SlabMeta, obj: usize) -> Result<(), ()> {
    if !meta.contains(obj) {
        report_corruption(
            ctx,
            meta,
            obj,
            "free of pointer outside slab object range",
            obj,
        );
        return Err(());
    }

    // Double free: the object must not already be on the freelist.
    let fp_offset = ctx.layout.fp_offset;
    let mut cursor = meta.freelist();
    let mut walked = 0usize;
    while cursor != FREELIST_END && walked <= meta.capacity as usize {
        if cursor == obj {
            report_corruption(ctx, meta, obj, "double free", obj);
            return Err(());
        }
        if !meta.contains(cursor) {
            repair_freelist(ctx, meta);
            break;
        }
        walked += 1;
        cursor = unsafe { read_free_ptr(cursor, fp_offset) };
    }

    // Guards must still carry the allocated-state pattern.
    check_guards(ctx, meta, obj, RED_ACTIVE);

    // Return the object to its free-state fill for the next reuse check.
    init_object_free_state(ctx, obj);
    Ok(())
}
