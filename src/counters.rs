//! Allocation counters. These exist for observability and tests; the
//! allocator itself never reads them to make decisions. All fields are
//! monotone except `bytes_used`/`bytes_unused`, which move in opposite
//! directions as blocks are handed out and taken back.

/// Snapshot of the allocator's counters, obtained with
/// [`crate::TagAlloc::counters`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Counters {
    /// Regions mapped.
    pub region_allocs: u64,
    /// Regions returned to the OS.
    pub region_frees: u64,
    /// Successful small allocations.
    pub total_allocs: u64,
    /// Small releases.
    pub total_frees: u64,
    /// Large mappings created.
    pub large_block_allocs: u64,
    /// Large mappings unmapped.
    pub large_block_frees: u64,
    /// Free blocks inspected by first-fit searches.
    pub blocks_checked: u64,
    /// Number of region free lists entered by first-fit searches. Dividing
    /// `blocks_checked` by this yields the average search length.
    pub check_amount: u64,
    /// Bytes currently handed out to callers, counted in whole block sizes.
    pub bytes_used: u64,
    /// Free bytes currently available inside mapped regions.
    pub bytes_unused: u64,
    /// Highest `bytes_used / bytes_unused` ratio observed so far.
    pub peak_utilization: f64,
}

impl Counters {
    /// All-zero counters, for const contexts.
    pub(crate) const ZERO: Self = Self {
        region_allocs: 0,
        region_frees: 0,
        total_allocs: 0,
        total_frees: 0,
        large_block_allocs: 0,
        large_block_frees: 0,
        blocks_checked: 0,
        check_amount: 0,
        bytes_used: 0,
        bytes_unused: 0,
        peak_utilization: 0.0,
    };

    /// Re-samples the utilization ratio. Called after every change to
    /// `bytes_used`/`bytes_unused`; the first region has not been mapped yet
    /// when the first sample is taken, hence the zero guard.
    pub(crate) fn note_utilization(&mut self) {
        if self.bytes_unused == 0 {
            return;
        }
        let ratio = self.bytes_used as f64 / self.bytes_unused as f64;
        if ratio > self.peak_utilization {
            self.peak_utilization = ratio;
        }
    }
}
