//! Pressure oracle: a pure function of arena/slab/SMA state that tells the
//! eviction collaborator how close the arena is to exhausting its reserved
//! headroom (spec.md §4.5).

use crate::arena::Arena;
use crate::slab::Slabs;
use crate::sma::Sma;
use crate::{BLOCK_SIZE, MAX_SHORTAGE_LEVEL, RESERVED_HEADROOM_PCT, SMA_CLASS_ID};

/// `0` unless `mem_limit − mem_malloced < mem_reserved`; otherwise a
/// piecewise function of how much class-0/SMA headroom remains against the
/// reserved-chunk budget.
pub fn shortage_level(arena: &Arena, slabs: &Slabs, sma: &Sma) -> i32 {
    if arena.headroom() >= arena.mem_reserved as i64 {
        return 0;
    }

    let class0 = &slabs.classes[SMA_CLASS_ID];
    // Before the reservation bootstraps, there is no excess to reserve yet:
    // treat `rsvd_slabs` as the current slab count (DESIGN.md).
    let rsvd_slabs = class0.rsvd_slabs.unwrap_or(class0.slabs);

    let rsvd = (rsvd_slabs * class0.perslab * RESERVED_HEADROOM_PCT) as f64 / 100.0;
    let headroom_slabs = (rsvd_slabs as i64 - class0.slabs as i64).max(0) as usize * class0.perslab;
    let avail = (sma.free_avail_space as f64 / BLOCK_SIZE as f64)
        + class0.sl_curr() as f64
        + class0.end_page_free() as f64
        + headroom_slabs as f64;

    if avail <= 0.0 {
        return MAX_SHORTAGE_LEVEL;
    }
    if avail > rsvd {
        return 0;
    }

    let ratio = rsvd / avail;
    if ratio < 2.0 {
        let level = 1.0 + (rsvd - avail) / (rsvd / 6.0);
        level.clamp(1.0, 3.0).round() as i32
    } else {
        (ratio + 2.0).clamp(4.0, MAX_SHORTAGE_LEVEL as f64).round() as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InitOptions;
    use crate::facade::Allocator;

    #[test]
    fn no_pressure_when_headroom_exceeds_reserved() {
        let opts = InitOptions {
            mem_limit: 16 * 1024 * 1024,
            ..Default::default()
        };
        let alloc = Allocator::init(opts).unwrap();
        assert_eq!(alloc.shortage_level(), 0);
    }

    #[test]
    fn pressure_rises_once_headroom_is_exhausted() {
        let opts = InitOptions {
            mem_limit: 5 * 1024 * 1024,
            item_size_max: 900 * 1024,
            ..Default::default()
        };
        let alloc = Allocator::init(opts).unwrap();
        let mut last = 0;
        for _ in 0..16 {
            if alloc.alloc(900 * 1024).is_err() {
                break;
            }
            last = alloc.shortage_level();
        }
        assert!(last >= 1);
    }
}
