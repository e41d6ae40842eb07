//! Startup configuration for [`crate::Allocator::init`].

/// Test-only knobs, kept out of `InitOptions`' main fields so the happy-path
/// construction reads cleanly. Named after the environment variables they
/// replace in the reference implementation (`T_MEMD_INITIAL_MALLOC`,
/// `T_MEMD_SLABS_ALLOC`); here they are typed struct fields instead of
/// process environment reads, since `init` has no other ambient input.
#[derive(Debug, Clone, Copy, Default)]
pub struct TestHooks {
    /// Pre-seed `mem_malloced` to this value at startup (`T_MEMD_INITIAL_MALLOC`).
    /// `0` means "do not pre-seed".
    pub initial_malloc: usize,
    /// When `true`, skip pre-allocating one page per class at startup
    /// (`T_MEMD_SLABS_ALLOC=0`). Default (`false`) preallocates, matching
    /// the env var's unset behavior — so the derived `Default` doesn't
    /// silently invert it.
    pub skip_slab_preallocation: bool,
}

/// Parameters for [`crate::Allocator::init`].
#[derive(Debug, Clone, Copy)]
pub struct InitOptions {
    /// Global memory ceiling in bytes.
    pub mem_limit: usize,
    /// Geometric growth factor between adjacent slab classes.
    pub growth_factor: f64,
    /// Largest regular slab-class chunk size, and the slab page size.
    /// 1 MiB in the reference configuration.
    pub item_size_max: usize,
    /// Base overhead (item header + smallest key/value) added before the
    /// first power-of-`growth_factor` class is computed.
    pub chunk_size: usize,
    /// Largest size routed to the small-object allocator; larger sizes use
    /// the slab path directly. Not bit-exact in the reference source (the
    /// constant lives outside the retrieved excerpt) — configurable here.
    pub max_sm_value_size: usize,
    /// Use a pre-allocated contiguous arena instead of the system heap.
    pub preallocate: bool,
    pub test_hooks: TestHooks,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            mem_limit: 64 * 1024 * 1024,
            growth_factor: 1.25,
            item_size_max: 1024 * 1024,
            chunk_size: 48,
            max_sm_value_size: 1024,
            preallocate: false,
            test_hooks: TestHooks::default(),
        }
    }
}
