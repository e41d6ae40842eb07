//! Small-object allocator: variable-length slots carved from 64 KiB blocks
//! pulled from slab class 0, with in-band headers/tails enabling O(1)
//! coalescing on free (spec.md §4.3/§4.4).
//!
//! Grounded on the free-list search/split/coalesce algorithm in
//! `original_source/slabs.c`'s `do_smmgr_alloc`/`do_smmgr_free`, re-expressed
//! over real pointers the way `kernel/src/mem/heap.rs::FreeList` links
//! `FreeNode`s — extended to a doubly linked list (`FreeSlotHeader::prev` /
//! `::next`) since coalescing needs O(1) removal of an arbitrary node, not
//! just the list head.

pub mod block;

use std::ptr::NonNull;

use log::debug;

use crate::arena::Arena;
use crate::error::AllocResult;
use crate::slab::Slabs;
use crate::{JUMBO_CLASS, MIN_SLOT_SIZE, NUM_CLASSES, SMA_CLASS_ID};

use block::{
    base_from_slot, free_header_of, header_of, init_free_slot, init_used_slot, status_of, tail_of,
    BlockHeader, SlotStatus, BLOCK_BODY_SIZE, BLOCK_HEADER_SIZE, TAIL_SIZE,
};

fn round_up8(size: usize) -> usize {
    (size + (crate::SLOT_ALIGN - 1)) & !(crate::SLOT_ALIGN - 1)
}

/// `class_of(len) = len / 8` for `len < 8192`, else the jumbo class
/// (spec.md §3 "SMA indices").
fn class_of(len: u32) -> usize {
    if (len as usize) < 8192 {
        (len / 8) as usize
    } else {
        JUMBO_CLASS
    }
}

/// A slot's total on-wire length for a `size`-byte payload: the payload
/// plus its tail, rounded up to 8 bytes, floored at [`MIN_SLOT_SIZE`].
pub(crate) fn slot_len_for(size: usize) -> u32 {
    let raw = round_up8(size + TAIL_SIZE);
    raw.max(MIN_SLOT_SIZE) as u32
}

#[derive(Default)]
struct FreeList {
    head: Option<NonNull<u8>>,
    tail: Option<NonNull<u8>>,
    space: u64,
    count: u64,
}

impl FreeList {
    fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

#[derive(Default, Clone, Copy)]
struct UsedList {
    space: u64,
    count: u64,
}

/// List of blocks (class-0 chunks) currently hosting at least one used
/// slot, threaded through [`BlockHeader`] (spec.md §4.4).
#[derive(Default)]
struct UsedBlist {
    head: Option<NonNull<BlockHeader>>,
    tail: Option<NonNull<BlockHeader>>,
    count: u64,
}

/// The small-object allocator's full mutable state.
pub struct Sma {
    free_slist: Vec<FreeList>,
    used_slist: Vec<UsedList>,
    used_blist: UsedBlist,

    used_minid: Option<usize>,
    used_maxid: Option<usize>,
    free_minid: Option<usize>,
    free_maxid: Option<usize>,

    pub used_total_space: u64,
    pub free_small_space: u64,
    pub free_avail_space: u64,
}

unsafe impl Send for Sma {}

impl Sma {
    pub fn new() -> Self {
        let mut free_slist = Vec::with_capacity(NUM_CLASSES);
        free_slist.resize_with(NUM_CLASSES, FreeList::default);
        let mut used_slist = Vec::with_capacity(NUM_CLASSES);
        used_slist.resize_with(NUM_CLASSES, UsedList::default);
        Self {
            free_slist,
            used_slist,
            used_blist: UsedBlist::default(),
            used_minid: None,
            used_maxid: None,
            free_minid: None,
            free_maxid: None,
            used_total_space: 0,
            free_small_space: 0,
            free_avail_space: 0,
        }
    }

    /// Total space this allocator currently holds, free or used
    /// (invariant P1: always a multiple of [`crate::BLOCK_SIZE`]).
    pub fn total_space(&self) -> u64 {
        self.used_total_space + self.free_small_space + self.free_avail_space
    }

    pub fn block_count(&self) -> u64 {
        self.used_blist.count
    }

    // -- free-list bookkeeping -------------------------------------------

    fn is_avail_class(&self, class: usize) -> bool {
        class == JUMBO_CLASS || self.used_maxid.map_or(true, |m| class >= m)
    }

    unsafe fn link_free(&mut self, class: usize, slot_ptr: NonNull<u8>, length: u32) {
        let header = free_header_of(slot_ptr.as_ptr());
        let old_head = self.free_slist[class].head;
        (*header).prev = None;
        (*header).next = old_head;
        match old_head {
            Some(h) => (*free_header_of(h.as_ptr())).prev = Some(slot_ptr),
            None => self.free_slist[class].tail = Some(slot_ptr),
        }
        self.free_slist[class].head = Some(slot_ptr);
        let was_empty = self.free_slist[class].count == 0;
        self.free_slist[class].count += 1;
        self.free_slist[class].space += length as u64;

        if self.is_avail_class(class) {
            self.free_avail_space += length as u64;
        } else {
            self.free_small_space += length as u64;
        }

        if was_empty && class != JUMBO_CLASS {
            if self.free_minid.map_or(true, |m| class < m) {
                self.free_minid = Some(class);
            }
            if self.free_maxid.map_or(true, |m| class > m) {
                self.free_maxid = Some(class);
            }
        }
    }

    unsafe fn unlink_free(&mut self, class: usize, slot_ptr: NonNull<u8>) {
        let header = free_header_of(slot_ptr.as_ptr());
        let prev = (*header).prev;
        let next = (*header).next;
        match prev {
            Some(p) => (*free_header_of(p.as_ptr())).next = next,
            None => self.free_slist[class].head = next,
        }
        match next {
            Some(n) => (*free_header_of(n.as_ptr())).prev = prev,
            None => self.free_slist[class].tail = prev,
        }
        let length = (*header).length;
        self.free_slist[class].count -= 1;
        self.free_slist[class].space -= length as u64;

        if self.is_avail_class(class) {
            self.free_avail_space -= length as u64;
        } else {
            self.free_small_space -= length as u64;
        }

        if self.free_slist[class].count == 0 && class != JUMBO_CLASS {
            if self.free_minid == Some(class) {
                self.free_minid = ((class + 1)..JUMBO_CLASS).find(|&c| !self.free_slist[c].is_empty());
            }
            if self.free_maxid == Some(class) {
                self.free_maxid = (0..class).rev().find(|&c| !self.free_slist[c].is_empty());
            }
        }
    }

    /// In-place head swap: replaces the class's head node with `new_ptr`
    /// without a full unlink/relink (the source was always the head). Used
    /// by [`Sma::alloc`] when a split's remainder stays in the same class
    /// as the slot it came from. `old_next` must be read from the
    /// replaced slot's header *before* that slot's memory is overwritten.
    unsafe fn replace_free_head(
        &mut self,
        class: usize,
        old_next: Option<NonNull<u8>>,
        old_len: u32,
        new_ptr: NonNull<u8>,
        new_len: u32,
    ) {
        let header = free_header_of(new_ptr.as_ptr());
        (*header).prev = None;
        (*header).next = old_next;
        match old_next {
            Some(n) => (*free_header_of(n.as_ptr())).prev = Some(new_ptr),
            None => self.free_slist[class].tail = Some(new_ptr),
        }
        self.free_slist[class].head = Some(new_ptr);
        self.free_slist[class].space = self.free_slist[class].space - old_len as u64 + new_len as u64;
        if self.is_avail_class(class) {
            self.free_avail_space = self.free_avail_space - old_len as u64 + new_len as u64;
        } else {
            self.free_small_space = self.free_small_space - old_len as u64 + new_len as u64;
        }
    }

    /// spec.md §4.3 search policy: the target class if non-empty; else the
    /// first non-empty class in `[2*target, free_maxid]`; else `free_maxid`
    /// if it is at least `target`; else the jumbo class.
    fn choose_class(&self, target: usize) -> usize {
        if !self.free_slist[target].is_empty() {
            return target;
        }
        if let Some(fmax) = self.free_maxid {
            let lower = 2 * target;
            if lower <= fmax {
                if let Some(c) = (lower..=fmax).find(|&c| !self.free_slist[c].is_empty()) {
                    return c;
                }
            }
            if fmax >= target {
                return fmax;
            }
        }
        JUMBO_CLASS
    }

    // -- used-list bookkeeping --------------------------------------------

    fn used_slot_list_add(&mut self, class: usize) {
        if self.used_minid.map_or(true, |m| class < m) {
            self.used_minid = Some(class);
        }
        if self.used_maxid.map_or(true, |m| class > m) {
            let old_maxid = self.used_maxid;
            self.used_maxid = Some(class);
            let lo = old_maxid.unwrap_or(0);
            for c in lo..class {
                let moved = self.free_slist[c].space;
                if moved > 0 {
                    self.free_small_space += moved;
                    self.free_avail_space -= moved;
                }
            }
        }
    }

    fn used_slot_list_del(&mut self, class: usize) {
        if self.used_minid == Some(class) {
            self.used_minid = (class..NUM_CLASSES).find(|&c| self.used_slist[c].count > 0);
        }
        if self.used_maxid == Some(class) {
            let old_maxid = class;
            let new_maxid = (0..class).rev().find(|&c| self.used_slist[c].count > 0);
            self.used_maxid = new_maxid;
            let lo = new_maxid.unwrap_or(0);
            for c in lo..old_maxid {
                let moved = self.free_slist[c].space;
                if moved > 0 {
                    self.free_small_space -= moved;
                    self.free_avail_space += moved;
                }
            }
        }
    }

    // -- block list ---------------------------------------------------------

    unsafe fn used_blist_add(&mut self, header: *mut BlockHeader) {
        let nn = NonNull::new_unchecked(header);
        (*header).prev = self.used_blist.tail;
        (*header).next = None;
        match self.used_blist.tail {
            Some(t) => (*t.as_ptr()).next = Some(nn),
            None => self.used_blist.head = Some(nn),
        }
        self.used_blist.tail = Some(nn);
        self.used_blist.count += 1;
    }

    unsafe fn used_blist_del(&mut self, header: *mut BlockHeader) {
        let prev = (*header).prev;
        let next = (*header).next;
        match prev {
            Some(p) => (*p.as_ptr()).next = next,
            None => self.used_blist.head = next,
        }
        match next {
            Some(n) => (*n.as_ptr()).prev = prev,
            None => self.used_blist.tail = prev,
        }
        self.used_blist.count -= 1;
    }

    // -- block lifecycle ------------------------------------------------

    /// Carve a fresh class-0 slab chunk into one block: a [`BlockHeader`]
    /// followed by a single free slot spanning the whole body
    /// (spec.md §4.4). Linked into `used_blist` immediately — the caller
    /// only ever creates a block when it is about to carve a slot from it
    /// (see [`Sma::alloc`]), so it never stays purely-free.
    fn new_block(&mut self, page: NonNull<u8>) {
        unsafe {
            let header = header_of(page);
            self.used_blist_add(header);
            let slot_ptr = page.as_ptr().add(BLOCK_HEADER_SIZE);
            init_free_slot(slot_ptr, BLOCK_HEADER_SIZE as u32, BLOCK_BODY_SIZE as u32);
            let class = class_of(BLOCK_BODY_SIZE as u32);
            self.link_free(
                class,
                NonNull::new_unchecked(slot_ptr),
                BLOCK_BODY_SIZE as u32,
            );
        }
    }

    // -- public API -------------------------------------------------------

    /// Allocate `size` payload bytes. Returns the slot pointer (the
    /// caller's usable address, identical to the slot's own start — spec.md
    /// §9's in-place-metadata note) and whether a fresh block had to be
    /// pulled from `slabs`/`arena` (used by callers to poll the pressure
    /// oracle).
    pub fn alloc(
        &mut self,
        slabs: &mut Slabs,
        arena: &mut Arena,
        size: usize,
    ) -> AllocResult<(NonNull<u8>, bool)> {
        let slen = slot_len_for(size);
        let target = class_of(slen);
        let mut grew = false;

        loop {
            let chosen = self.choose_class(target);
            let head = self.free_slist[chosen].head;
            let Some(slot_ptr) = head else {
                let (page, crossed) = slabs.alloc_slab_chunk(arena, crate::BLOCK_SIZE, SMA_CLASS_ID)?;
                grew = grew || crossed;
                self.new_block(page);
                continue;
            };

            unsafe {
                let header = free_header_of(slot_ptr.as_ptr());
                let old_len = (*header).length;
                let old_next = (*header).next;
                let tail = tail_of(slot_ptr.as_ptr(), old_len);
                let offset = (*tail).offset;

                // `used_len` must always equal `slen`: `free()` recomputes
                // the tail's location purely from the caller's `size`, with
                // no other record of how a slot was actually split. Any
                // leftover therefore becomes its own (possibly unlinkable)
                // remainder, never gets folded into the used slot.
                let used_len = slen;
                let remainder_len = old_len - slen;

                // `slot_ptr`'s own header must not be touched until every
                // read from it above (length, next, tail) has happened —
                // `init_used_slot` overwrites that same memory.
                if remainder_len == 0 {
                    self.unlink_free(chosen, slot_ptr);
                } else if remainder_len < MIN_SLOT_SIZE as u32 {
                    // Too small to host a `FreeSlotHeader` (needs 24 bytes
                    // plus its own tail). The widened 8-byte tail leaves no
                    // safe encoding for an 8/16/24-byte free slot, unlike
                    // the original's 4-byte tail (DESIGN.md, extends P6).
                    // Mark it as a permanent phantom used slot instead of
                    // linking it: `init_used_slot` writes exactly the
                    // `STATUS_USED` word a right-coalescing left neighbor
                    // checks for, and a nonzero tail length a left-coalescing
                    // right neighbor checks for, so nothing ever merges into
                    // it. It is lost to `free_small_space` for the life of
                    // the block.
                    self.unlink_free(chosen, slot_ptr);
                    let rem_ptr = slot_ptr.as_ptr().add(slen as usize);
                    init_used_slot(rem_ptr, offset + slen, remainder_len);
                    self.free_small_space += remainder_len as u64;
                } else {
                    let rem_ptr = slot_ptr.as_ptr().add(slen as usize);
                    let rem_offset = offset + slen;
                    let rem_class = class_of(remainder_len);
                    let rem_nn = NonNull::new_unchecked(rem_ptr);
                    init_free_slot(rem_ptr, rem_offset, remainder_len);
                    if rem_class == chosen {
                        self.replace_free_head(chosen, old_next, old_len, rem_nn, remainder_len);
                    } else {
                        self.unlink_free(chosen, slot_ptr);
                        self.link_free(rem_class, rem_nn, remainder_len);
                    }
                }

                init_used_slot(slot_ptr.as_ptr(), offset, used_len);

                let class = class_of(used_len);
                let was_empty = self.used_slist[class].count == 0;
                self.used_slist[class].count += 1;
                self.used_slist[class].space += used_len as u64;
                self.used_total_space += used_len as u64;
                if was_empty {
                    self.used_slot_list_add(class);
                }

                debug!("sma alloc: {size} bytes -> slot len {used_len} (class {class})");
                return Ok((slot_ptr, grew));
            }
        }
    }

    /// Release a previously allocated slot of `length` bytes, coalescing
    /// with free neighbors on either side (spec.md §4.3 "Free"). Returns
    /// the owning block's base pointer when the coalesce reaches the whole
    /// block (spec.md §4.4) — the caller must hand that pointer back to
    /// `Slabs::free_slab_chunk(_, SMA_CLASS_ID)`; this type never talks to
    /// `Slabs` directly.
    ///
    /// # Safety
    /// `ptr` must be a pointer previously returned by [`Sma::alloc`] with
    /// the same `length` it was allocated at (the used slot's own total
    /// length, not the original payload `size`).
    #[must_use]
    pub unsafe fn free(&mut self, ptr: NonNull<u8>, length: u32) -> Option<NonNull<u8>> {
        let tail = tail_of(ptr.as_ptr(), length);
        let offset = (*tail).offset;
        let class = class_of(length);

        self.used_slist[class].count -= 1;
        self.used_slist[class].space -= length as u64;
        self.used_total_space -= length as u64;
        if self.used_slist[class].count == 0 {
            self.used_slot_list_del(class);
        }

        let mut merged_ptr = ptr.as_ptr();
        let mut merged_offset = offset;
        let mut merged_len = length;

        // Left neighbor: its tail sits immediately before our slot start.
        // `length == 0` there marks it free (R2, DESIGN.md).
        if merged_offset as usize >= BLOCK_HEADER_SIZE + TAIL_SIZE {
            let left_tail = merged_ptr.sub(TAIL_SIZE) as *mut block::SlotTail;
            if (*left_tail).length == 0 {
                let left_offset = (*left_tail).offset;
                let left_len = merged_offset - left_offset;
                let left_ptr = merged_ptr.sub((merged_offset - left_offset) as usize);
                let left_class = class_of(left_len);
                self.unlink_free(left_class, NonNull::new_unchecked(left_ptr));
                merged_ptr = left_ptr;
                merged_offset = left_offset;
                merged_len += left_len;
            }
        }

        // Right neighbor: starts immediately after our slot.
        let block_base = base_from_slot(NonNull::new_unchecked(merged_ptr), merged_offset);
        let right_offset = merged_offset + merged_len;
        if (right_offset as usize) < BLOCK_BODY_SIZE + BLOCK_HEADER_SIZE {
            let right_ptr = block_base.as_ptr().add(right_offset as usize);
            let status = SlotStatus::from_bits_truncate(status_of(right_ptr));
            if !status.contains(SlotStatus::USED) {
                let right_len = (*free_header_of(right_ptr)).length;
                let right_class = class_of(right_len);
                self.unlink_free(right_class, NonNull::new_unchecked(right_ptr));
                merged_len += right_len;
            }
        }

        init_free_slot(merged_ptr, merged_offset, merged_len);
        let merged_class = class_of(merged_len);
        self.link_free(
            merged_class,
            NonNull::new_unchecked(merged_ptr),
            merged_len,
        );

        // A coalesce back to a whole, untouched block frees the block back
        // to the slab allocator (spec.md §4.4): unlink it again immediately
        // rather than leaving it sitting in a free list the SMA no longer
        // owns.
        if merged_offset as usize == BLOCK_HEADER_SIZE && merged_len as usize == BLOCK_BODY_SIZE {
            self.unlink_free(merged_class, NonNull::new_unchecked(merged_ptr));
            let header = header_of(block_base);
            self.used_blist_del(header);
            Some(block_base)
        } else {
            None
        }
    }

    pub fn used_minid(&self) -> Option<usize> {
        self.used_minid
    }

    pub fn used_maxid(&self) -> Option<usize> {
        self.used_maxid
    }

    pub fn free_minid(&self) -> Option<usize> {
        self.free_minid
    }

    pub fn free_maxid(&self) -> Option<usize> {
        self.free_maxid
    }
}

impl Default for Sma {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::slab::Slabs;

    fn fresh() -> (Sma, Slabs, Arena) {
        (
            Sma::new(),
            Slabs::init(1024 * 1024, 1.25, 48),
            Arena::new(16 * 1024 * 1024, 1024 * 1024, false).unwrap(),
        )
    }

    #[test]
    fn first_alloc_splits_a_fresh_block() {
        let _ = env_logger::try_init();
        let (mut sma, mut slabs, mut arena) = fresh();
        let (ptr, _grew) = sma.alloc(&mut slabs, &mut arena, 100).unwrap();
        assert_eq!(sma.block_count(), 1);
        unsafe {
            let tail = tail_of(ptr.as_ptr(), slot_len_for(100));
            assert_eq!((*tail).offset, BLOCK_HEADER_SIZE as u32);
        }
    }

    #[test]
    fn alloc_then_free_reclaims_the_whole_block() {
        let (mut sma, mut slabs, mut arena) = fresh();
        let (ptr, _) = sma.alloc(&mut slabs, &mut arena, 100).unwrap();
        let len = slot_len_for(100);
        let reclaimed = unsafe { sma.free(ptr, len) };
        assert!(reclaimed.is_some());
        assert_eq!(sma.used_total_space, 0);
        assert_eq!(sma.free_avail_space, 0);
        assert_eq!(sma.block_count(), 0);
    }

    #[test]
    fn two_adjacent_allocations_coalesce_on_free() {
        let (mut sma, mut slabs, mut arena) = fresh();
        let (a, _) = sma.alloc(&mut slabs, &mut arena, 100).unwrap();
        let (b, _) = sma.alloc(&mut slabs, &mut arena, 100).unwrap();
        let len_a = slot_len_for(100);
        let len_b = slot_len_for(100);
        let (first, second) = unsafe { (sma.free(a, len_a), sma.free(b, len_b)) };
        assert!(first.is_none());
        assert!(second.is_some());
        assert_eq!(sma.used_total_space, 0);
        assert_eq!(sma.free_avail_space, 0);
    }

    #[test]
    fn class_of_splits_at_jumbo_threshold() {
        assert_eq!(class_of(8184), 8184 / 8);
        assert_eq!(class_of(8192), JUMBO_CLASS);
    }

    #[test]
    fn sub_minimum_remainder_becomes_a_permanent_phantom_slot() {
        let (mut sma, mut slabs, mut arena) = fresh();
        let (a, _) = sma.alloc(&mut slabs, &mut arena, 72).unwrap(); // slen 80
        let (c, _) = sma.alloc(&mut slabs, &mut arena, 72).unwrap(); // keeps the block alive
        assert!(unsafe { sma.free(a, slot_len_for(72)) }.is_none());

        let before = sma.free_small_space;
        // slen 64 against an 80-byte free slot leaves a 16-byte remainder,
        // too small for a FreeSlotHeader.
        let (b, _) = sma.alloc(&mut slabs, &mut arena, 56).unwrap();
        assert_eq!(sma.free_small_space, before + 16);

        unsafe {
            assert!(sma.free(b, slot_len_for(56)).is_none());
            // The phantom sliver between `b` and `c` is permanently marked
            // used, so `c`'s free can only coalesce rightward into the rest
            // of the block, never leftward across the sliver.
            assert!(sma.free(c, slot_len_for(72)).is_none());
        }
        assert_eq!(sma.block_count(), 1);
    }
}
