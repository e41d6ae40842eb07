//! Slab allocator — per-size-class page lists with an intra-page bump
//! pointer and an explicit free-list stack.
//!
//! Shaped after `kernel/src/mem/heap.rs::SlabAllocator`: a fixed array of
//! classes, each with a free list refilled by carving a freshly allocated
//! page when the list and the current page are both exhausted. Generalized
//! from the teacher's ten hardcoded classes to spec.md §6's geometric
//! class table, and extended with the reservation bootstrap that has no
//! teacher analogue (spec.md §4.2/§9).

use std::ptr::NonNull;

use log::info;

use crate::arena::Arena;
use crate::error::{AllocError, AllocResult};
use crate::{BLOCK_SIZE, POWER_SMALLEST, RESERVED_HEADROOM_PCT, RESERVED_SLABS, SMA_CLASS_ID};

fn round_up8(size: usize) -> usize {
    (size + 7) & !7
}

/// One size class: class `0` is always the SMA's backing class
/// (`size == BLOCK_SIZE`); classes `1..` are the regular fixed-size item
/// classes built by [`Slabs::init`].
pub struct SlabClass {
    pub size: usize,
    pub perslab: usize,
    pub slabs: usize,
    /// Reservation target for this class's page count. Undefined until the
    /// first pressure event crosses the reserved-headroom threshold.
    pub rsvd_slabs: Option<usize>,
    end_page_ptr: Option<NonNull<u8>>,
    end_page_free: usize,
    /// Explicit free-list stack of returned chunks (LIFO).
    slots: Vec<NonNull<u8>>,
    slab_list: Vec<NonNull<u8>>,
    pub requested: u64,
}

unsafe impl Send for SlabClass {}

impl SlabClass {
    fn new(size: usize, perslab: usize) -> Self {
        Self {
            size,
            perslab,
            slabs: 0,
            rsvd_slabs: None,
            end_page_ptr: None,
            end_page_free: 0,
            slots: Vec::new(),
            slab_list: Vec::new(),
            requested: 0,
        }
    }

    /// `used_chunks + |slots| + end_page_free == slabs * perslab` (P2).
    pub fn used_chunks(&self) -> usize {
        self.slabs * self.perslab - self.slots.len() - self.end_page_free
    }

    pub fn sl_curr(&self) -> usize {
        self.slots.len()
    }

    pub fn end_page_free(&self) -> usize {
        self.end_page_free
    }
}

/// The full slab-class table.
pub struct Slabs {
    pub classes: Vec<SlabClass>,
    page_size: usize,
}

impl Slabs {
    /// Builds class 0 (the SMA backing class, `size == BLOCK_SIZE`) plus a
    /// geometric table from `chunk_size` up to `item_size_max / factor`,
    /// with a final class of exactly `item_size_max` and `perslab = 1`
    /// (spec.md §6 `init`).
    pub fn init(item_size_max: usize, growth_factor: f64, chunk_size: usize) -> Self {
        let mut classes = Vec::new();
        classes.push(SlabClass::new(BLOCK_SIZE, item_size_max / BLOCK_SIZE));

        let limit = ((item_size_max as f64) / growth_factor) as usize;
        let mut size = round_up8(chunk_size);
        while size < limit && size < item_size_max {
            classes.push(SlabClass::new(size, item_size_max / size));
            let grown = ((size as f64) * growth_factor).ceil() as usize;
            size = round_up8(grown.max(size + 8));
        }
        classes.push(SlabClass::new(item_size_max, 1));

        Self {
            classes,
            page_size: item_size_max,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Smallest class id (from `POWER_SMALLEST`) whose chunk size is `>=
    /// size`; `0` when no regular class fits (spec.md §4.2 — the caller
    /// must treat `0` combined with `size > classes[0].size` as "too
    /// large", see DESIGN.md).
    pub fn classify(&self, size: usize) -> usize {
        for (id, class) in self.classes.iter().enumerate().skip(POWER_SMALLEST) {
            if class.size >= size {
                return id;
            }
        }
        0
    }

    /// Allocate one chunk of `class[id].size` bytes (`>= size`).
    pub fn alloc_slab_chunk(
        &mut self,
        arena: &mut Arena,
        size: usize,
        id: usize,
    ) -> AllocResult<(NonNull<u8>, bool)> {
        debug_assert!(id < self.classes.len());
        debug_assert!(self.classes[id].size >= size);

        if self.classes[id].slots.is_empty() && self.classes[id].end_page_free == 0 {
            let crossed = self.grow_slab(arena, id)?;
            let ptr = self.take_chunk(id);
            return Ok((ptr, crossed));
        }
        Ok((self.take_chunk(id), false))
    }

    fn take_chunk(&mut self, id: usize) -> NonNull<u8> {
        let class = &mut self.classes[id];
        if let Some(ptr) = class.slots.pop() {
            return ptr;
        }
        debug_assert!(class.end_page_free > 0);
        let ptr = class.end_page_ptr.expect("end_page_free > 0 implies a current page");
        class.end_page_free -= 1;
        class.end_page_ptr = if class.end_page_free == 0 {
            None
        } else {
            Some(unsafe { NonNull::new_unchecked(ptr.as_ptr().add(class.size)) })
        };
        ptr
    }

    /// Return a chunk to `class[id]`'s free-list stack.
    pub fn free_slab_chunk(&mut self, ptr: NonNull<u8>, id: usize) {
        self.classes[id].slots.push(ptr);
    }

    /// Admit a new page for `class[id]` when either the global ceiling has
    /// room, or the class is still under its (possibly undefined)
    /// reservation. Returns whether this call crossed the reserved-headroom
    /// threshold for the first time (the reservation bootstrap, spec.md
    /// §4.2) — callers use this to recompute the shortage level and wake
    /// eviction.
    fn grow_slab(&mut self, arena: &mut Arena, id: usize) -> AllocResult<bool> {
        let page_size = self.page_size;
        let admitted = {
            let class = &self.classes[id];
            arena.mem_malloced + page_size <= arena.mem_limit
                || class.rsvd_slabs.map_or(false, |r| class.slabs < r)
        };
        if !admitted {
            log::warn!("slab class {id} exhausted: growth refused under reservation");
            return Err(AllocError::OutOfMemory);
        }

        let page = arena.allocate_page(page_size)?;
        {
            let class = &mut self.classes[id];
            class.slab_list.push(page);
            class.slabs += 1;
            class.end_page_ptr = Some(page);
            class.end_page_free = class.perslab;
        }

        let mut crossed = false;
        if (arena.mem_limit as i64 - arena.mem_malloced as i64) < arena.mem_reserved as i64 {
            let class0 = &mut self.classes[SMA_CLASS_ID];
            if class0.rsvd_slabs.is_none() {
                let bump = std::cmp::max(RESERVED_SLABS, class0.slabs * RESERVED_HEADROOM_PCT / 100);
                class0.rsvd_slabs = Some(class0.slabs + bump);
                info!("slab class 0 reservation bootstrapped to {} slabs", class0.slabs + bump);
                crossed = true;
            }
        }
        Ok(crossed)
    }

    /// Reset every class whose reservation is currently defined, letting
    /// the next pressure crossing recompute it. Generalizes the original's
    /// two-class (`blck_clsid` + top fixed class) guard in
    /// `do_slabs_set_memlimit` to "every defined reservation", since class
    /// 0 is the only class this allocator ever reserves (SPEC_FULL.md
    /// SUPPLEMENTED FEATURES #3).
    pub fn clear_reservations(&mut self) {
        for class in &mut self.classes {
            class.rsvd_slabs = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;

    #[test]
    fn class_zero_is_block_sized() {
        let slabs = Slabs::init(1024 * 1024, 1.25, 48);
        assert_eq!(slabs.classes[0].size, BLOCK_SIZE);
        assert_eq!(slabs.classes[0].perslab, 1024 * 1024 / BLOCK_SIZE);
    }

    #[test]
    fn final_class_is_exactly_item_size_max() {
        let slabs = Slabs::init(1024 * 1024, 1.25, 48);
        let last = slabs.classes.last().unwrap();
        assert_eq!(last.size, 1024 * 1024);
        assert_eq!(last.perslab, 1);
    }

    #[test]
    fn classify_picks_smallest_fitting_class() {
        let slabs = Slabs::init(1024 * 1024, 1.25, 48);
        let id = slabs.classify(50);
        assert!(slabs.classes[id].size >= 50);
        assert!(id >= POWER_SMALLEST);
    }

    #[test]
    fn classify_overflow_returns_zero() {
        let slabs = Slabs::init(1024 * 1024, 1.25, 48);
        assert_eq!(slabs.classify(10 * 1024 * 1024), 0);
    }

    #[test]
    fn alloc_and_free_reuse_chunk() {
        let mut slabs = Slabs::init(1024 * 1024, 1.25, 48);
        let mut arena = Arena::new(16 * 1024 * 1024, 1024 * 1024, false).unwrap();
        let id = slabs.classify(50);
        let (a, _) = slabs.alloc_slab_chunk(&mut arena, 50, id).unwrap();
        slabs.free_slab_chunk(a, id);
        let (b, _) = slabs.alloc_slab_chunk(&mut arena, 50, id).unwrap();
        assert_eq!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn reservation_bootstraps_once_headroom_crossed() {
        let _ = env_logger::try_init();
        let mut slabs = Slabs::init(1024 * 1024, 1.25, 48);
        let mut arena = Arena::new(3 * 1024 * 1024, 1024 * 1024, false).unwrap();
        let mut crossed_any = false;
        for _ in 0..4 {
            if slabs.alloc_slab_chunk(&mut arena, BLOCK_SIZE, 0).is_err() {
                break;
            }
            if slabs.classes[0].rsvd_slabs.is_some() {
                crossed_any = true;
            }
        }
        assert!(crossed_any);
    }
}
