//! Stats snapshots emitted through [`crate::StatsSink`] (spec.md §6 `stats`,
//! SPEC_FULL.md SUPPLEMENTED FEATURES).

use crate::collab::StatsSink;

/// One slab class's stats row.
#[derive(Debug, Clone, Copy)]
pub struct SlabClassStats {
    pub id: usize,
    pub chunk_size: usize,
    pub chunks_per_page: usize,
    pub total_pages: usize,
    pub reserved_pages: Option<usize>,
    pub used_chunks: usize,
    pub free_chunks: usize,
    pub requested_bytes: u64,
}

impl SlabClassStats {
    pub fn emit(&self, sink: &mut dyn StatsSink) {
        let prefix = format!("class{}", self.id);
        sink.emit(&format!("{prefix}:chunk_size"), self.chunk_size.into());
        sink.emit(&format!("{prefix}:chunks_per_page"), self.chunks_per_page.into());
        sink.emit(&format!("{prefix}:total_pages"), self.total_pages.into());
        sink.emit(&format!("{prefix}:reserved_pages"), self.reserved_pages.unwrap_or(0).into());
        sink.emit(&format!("{prefix}:used_chunks"), self.used_chunks.into());
        sink.emit(&format!("{prefix}:free_chunks"), self.free_chunks.into());
        sink.emit(&format!("{prefix}:requested_bytes"), self.requested_bytes.into());
    }
}

/// Arena-wide totals (SPEC_FULL.md SUPPLEMENTED FEATURES #4).
#[derive(Debug, Clone, Copy)]
pub struct ArenaStats {
    pub mem_limit: usize,
    pub mem_malloced: usize,
    pub mem_reserved: usize,
    pub shortage_level: i32,
    pub sma_used_total_space: u64,
    pub sma_free_small_space: u64,
    pub sma_free_avail_space: u64,
    pub sma_block_count: u64,
}

impl ArenaStats {
    pub fn emit(&self, sink: &mut dyn StatsSink) {
        sink.emit("mem_limit", self.mem_limit.into());
        sink.emit("mem_malloced", self.mem_malloced.into());
        sink.emit("mem_reserved", self.mem_reserved.into());
        sink.emit("shortage_level", self.shortage_level.into());
        sink.emit("sma_used_total_space", self.sma_used_total_space.into());
        sink.emit("sma_free_small_space", self.sma_free_small_space.into());
        sink.emit("sma_free_avail_space", self.sma_free_avail_space.into());
        sink.emit("sma_block_count", self.sma_block_count.into());
    }
}
