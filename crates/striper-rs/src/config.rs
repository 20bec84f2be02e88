//! Platform tuning values for the striper engine.
//!
//! These were compile-time constants in older engines; here they are plain
//! fields so a deployment (or a test) can tune them per array.

/// StriperConfig carries the per-array tuning limits consulted during request
/// sizing, resource planning and error recovery.
#[derive(Clone, Debug)]
pub struct StriperConfig {
    /// Largest transfer, in blocks, a single member disk accepts per request.
    pub max_blocks_per_drive: u64,
    /// Largest scatter/gather list, in elements, the backend accepts.
    pub max_sg_elements: usize,
    /// Blocks per buffer page handed out by the allocator.
    pub page_size_blocks: u64,
    /// Region granularity, in blocks, for single-region (strip mining) mode.
    pub mine_region_size: u64,
    /// Retries permitted for a retryable member error before escalating.
    pub retry_count: u32,
    /// Minimum transfer, in stripes, before a misaligned zero is trimmed so
    /// that interior full stripes can go out as write-same.
    pub min_zero_stripe_optimize: u64,
    /// Requests at or below this many blocks skip the speculative sizing
    /// pass; they can never exceed the backend limits.
    pub small_request_blocks: u64,
}

impl Default for StriperConfig {
    fn default() -> Self {
        Self {
            max_blocks_per_drive: 0x800,
            max_sg_elements: 128,
            page_size_blocks: 32,
            mine_region_size: 64,
            retry_count: 2,
            min_zero_stripe_optimize: 2,
            small_request_blocks: 64,
        }
    }
}
