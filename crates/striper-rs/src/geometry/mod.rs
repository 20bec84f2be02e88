//! Striping geometry: mapping logical ranges onto member disks.
//!
//! Everything in this module is pure arithmetic over [`RaidParams`]; the
//! state machines snapshot the result once per sub-request and never consult
//! mutable state.

pub mod calc;

#[cfg(test)]
mod geometry_tests;

/// Widest striped group supported by the engine.
pub const MAX_WIDTH: usize = 16;

/// Bitmask with one bit per member position.
pub type PositionMask = u16;

/// Supported striped raid types.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RaidType {
    Raid0,
    Raid10,
}

impl RaidType {
    #[must_use]
    pub const fn is_mirror_backed(self) -> bool {
        matches!(self, Self::Raid10)
    }
}

/// RaidParams describes one striped group's immutable layout.
#[derive(Clone, Debug)]
pub struct RaidParams {
    pub raid_type: RaidType,
    /// Number of striped data positions. For RAID-10 each position is a
    /// mirrored pair; the pair is a single position at this level.
    pub width: usize,
    /// Blocks per stripe element.
    pub element_size: u64,
    /// Alignment unit in blocks; requests not aligned to this need pre-reads.
    pub optimal_block_size: u64,
    /// Per-member capacity in blocks.
    pub capacity_per_disk: u64,
    /// Positions whose backing drive requires 4K-aligned transfers.
    pub aligned_4k_positions: PositionMask,
    /// Largest window, in blocks, one sub-request may cover.
    pub max_window_blocks: u64,
}

impl RaidParams {
    /// `new` validates and builds the layout description.
    ///
    /// # Errors
    /// Returns an error for a zero/oversized width, a zero element size or an
    /// optimal block size that does not divide the element size.
    pub fn new(
        raid_type: RaidType,
        width: usize,
        element_size: u64,
        optimal_block_size: u64,
        capacity_per_disk: u64,
    ) -> anyhow::Result<Self> {
        if width == 0 || width > MAX_WIDTH {
            anyhow::bail!("invalid width {width} for {raid_type:?} (max {MAX_WIDTH})");
        }
        if element_size == 0 {
            anyhow::bail!("element size must be nonzero");
        }
        if optimal_block_size == 0 || element_size % optimal_block_size != 0 {
            anyhow::bail!(
                "optimal block size {optimal_block_size} must divide element size {element_size}"
            );
        }
        Ok(Self {
            raid_type,
            width,
            element_size,
            optimal_block_size,
            capacity_per_disk,
            aligned_4k_positions: 0,
            max_window_blocks: width as u64 * element_size * 16,
        })
    }

    /// `with_aligned_4k_positions` marks positions that need aligned I/O.
    #[must_use]
    pub const fn with_aligned_4k_positions(mut self, mask: PositionMask) -> Self {
        self.aligned_4k_positions = mask;
        self
    }

    #[must_use]
    pub const fn blocks_per_stripe(&self) -> u64 {
        self.width as u64 * self.element_size
    }

    /// Exported capacity of the whole group in blocks.
    #[must_use]
    pub const fn configured_capacity(&self) -> u64 {
        self.width as u64 * self.capacity_per_disk
    }

    #[must_use]
    pub const fn position_needs_alignment(&self, position: usize) -> bool {
        self.aligned_4k_positions & (1 << position) != 0
    }
}

/// One contiguous physical extent, in per-member block units.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Extent {
    pub start_lba: u64,
    pub size: u64,
}

/// GeometrySnapshot is the per-sub-request view of the layout: where in the
/// stripe the request starts and how the data indices map to positions.
#[derive(Clone, Debug)]
pub struct GeometrySnapshot {
    /// Logical data index to physical member position.
    pub positions: [usize; MAX_WIDTH],
    pub width: usize,
    /// Per-member offset of the enclosing parity stripe row.
    pub logical_parity_start: u64,
    /// Data index at which the request starts.
    pub start_index: usize,
    /// Offset of the first block within its stripe element.
    pub start_offset_rel_parity_stripe: u64,
    /// Blocks from the first block to the end of its stripe element.
    pub blocks_remaining_in_parity: u64,
    /// Largest request, in blocks, this window permits.
    pub max_blocks: u64,
}

impl Default for GeometrySnapshot {
    fn default() -> Self {
        Self {
            positions: [0; MAX_WIDTH],
            width: 0,
            logical_parity_start: 0,
            start_index: 0,
            start_offset_rel_parity_stripe: 0,
            blocks_remaining_in_parity: 0,
            max_blocks: 0,
        }
    }
}

/// `physical_geometry` computes the geometry snapshot for a request starting
/// at `start_lba`.
///
/// # Arguments
/// * `params` - The group layout.
/// * `start_lba` - First logical block of the request.
///
/// # Returns
/// A [`GeometrySnapshot`] whose position map is a permutation of
/// `0..width` and whose parity stripe start is at or below `start_lba`.
///
/// # Errors
/// Returns an error when the layout itself is invalid (zero width or a
/// start beyond the configured capacity).
pub fn physical_geometry(params: &RaidParams, start_lba: u64) -> anyhow::Result<GeometrySnapshot> {
    if params.width == 0 || params.width > MAX_WIDTH {
        anyhow::bail!("invalid width {}", params.width);
    }
    if start_lba >= params.configured_capacity() {
        anyhow::bail!(
            "start lba {start_lba} beyond configured capacity {}",
            params.configured_capacity()
        );
    }
    let stripe = params.blocks_per_stripe();
    let offset_in_stripe = start_lba % stripe;
    let start_index = (offset_in_stripe / params.element_size) as usize;
    let start_offset = offset_in_stripe % params.element_size;

    let mut positions = [0usize; MAX_WIDTH];
    for (i, slot) in positions.iter_mut().enumerate().take(params.width) {
        *slot = i;
    }

    Ok(GeometrySnapshot {
        positions,
        width: params.width,
        logical_parity_start: (start_lba / stripe) * params.element_size,
        start_index,
        start_offset_rel_parity_stripe: start_offset,
        blocks_remaining_in_parity: params.element_size - start_offset,
        max_blocks: params.max_window_blocks.max(params.element_size),
    })
}

/// `stripe_range` determines the parity (physical per-member) extent(s) a
/// logical range touches.
///
/// The result covers up to two extents: `[0]` is always populated, `[1]` is
/// nonzero only for the discontiguous case where the access ends in the
/// element following the one it begins in without overlapping.
///
/// # Arguments
/// * `lba` - First logical block accessed.
/// * `blocks` - Number of logical blocks accessed.
/// * `element_size` - Blocks per stripe element.
/// * `data_disks` - Data positions in the stripe.
#[must_use]
pub fn stripe_range(lba: u64, blocks: u64, element_size: u64, data_disks: usize) -> [Extent; 2] {
    let blks_per_stripe = element_size * data_disks as u64;
    let mut range = [Extent::default(); 2];

    let mut parity_start = element_size * (lba / blks_per_stripe);
    let mut parity_count = element_size;
    let mut remaining = blocks;

    if blocks <= element_size - (lba % element_size) {
        // Access begins and ends within a single stripe element.
        parity_start += lba % element_size;
        parity_count = blocks;
    } else if element_size > blks_per_stripe - (lba % blks_per_stripe) {
        // Access begins within the last element of the stripe and continues
        // into the next stripe; cover only the blocks actually accessed.
        parity_start += lba % element_size;
        parity_count -= lba % element_size;
    } else if blocks < element_size {
        // Access ends in the element following the one it begins in without
        // enough blocks to overlap: two distinct extents.
        range[1].start_lba = parity_start + (lba % element_size);
        range[1].size = parity_count - (lba % element_size);
        parity_count = (blocks + lba) % element_size;
    }
    // Otherwise the access in the first stripe is large enough to overlap the
    // starting point and the whole first element row is covered.

    remaining -= blocks.min(blks_per_stripe - (lba % blks_per_stripe));

    // Whole stripes accessed beyond the first.
    parity_count += (remaining / blks_per_stripe) * element_size;
    remaining %= blks_per_stripe;

    // Final stripe: if the access extends beyond its first element the whole
    // row is covered, otherwise only the blocks accessed.
    parity_count += remaining.min(element_size);

    range[0].start_lba = parity_start;
    range[0].size = parity_count;
    range
}

/// `parity_footprint` collapses the (possibly discontiguous) stripe range of
/// a request into the single `(parity_start, parity_count)` span the engine
/// tracks.
#[must_use]
pub fn parity_footprint(lba: u64, blocks: u64, element_size: u64, data_disks: usize) -> (u64, u64) {
    let range = stripe_range(lba, blocks, element_size, data_disks);
    if range[1].size != 0 {
        let end = range[1].start_lba + range[1].size - 1;
        (range[0].start_lba, end - range[0].start_lba + 1)
    } else {
        (range[0].start_lba, range[0].size)
    }
}

/// `position_extent` returns the contiguous per-member physical extent a
/// logical range occupies on the member at data index `index`, or `None`
/// when the range never touches that member.
///
/// # Arguments
/// * `lba` - First logical block accessed.
/// * `blocks` - Number of logical blocks accessed.
/// * `element_size` - Blocks per stripe element.
/// * `width` - Data positions in the stripe.
/// * `index` - Data index of the member of interest.
#[must_use]
pub fn position_extent(
    lba: u64,
    blocks: u64,
    element_size: u64,
    width: usize,
    index: usize,
) -> Option<(u64, u64)> {
    if blocks == 0 || index >= width {
        return None;
    }
    let stripe = element_size * width as u64;
    let end = lba + blocks - 1;

    // First logical block at or after `lba` held by this member.
    let row0 = lba / stripe;
    let elem0 = row0 * stripe + index as u64 * element_size;
    let first = if lba <= elem0 {
        elem0
    } else if lba < elem0 + element_size {
        lba
    } else {
        elem0 + stripe
    };
    if first > end {
        return None;
    }

    // Last logical block at or before `end` held by this member.
    let row_n = end / stripe;
    let elem_n = row_n * stripe + index as u64 * element_size;
    let last = if end >= elem_n + element_size {
        elem_n + element_size - 1
    } else if end >= elem_n {
        end
    } else {
        // The final row does not reach this member; use the previous row.
        elem_n - stripe + element_size - 1
    };

    let to_physical = |l: u64| (l / stripe) * element_size + (l % stripe) - index as u64 * element_size;
    let plba = to_physical(first);
    let plast = to_physical(last);
    Some((plba, plast - plba + 1))
}

/// `logical_offset_of_physical` inverts [`position_extent`]: the logical
/// block corresponding to physical block `plba` on data index `index`.
#[must_use]
pub fn logical_offset_of_physical(plba: u64, element_size: u64, width: usize, index: usize) -> u64 {
    let row = plba / element_size;
    let offset = plba % element_size;
    row * element_size * width as u64 + index as u64 * element_size + offset
}

/// `is_aligned_to_optimal` reports whether a range needs no alignment
/// padding.
#[must_use]
pub const fn is_aligned_to_optimal(lba: u64, blocks: u64, optimal_block_size: u64) -> bool {
    lba % optimal_block_size == 0 && (lba + blocks) % optimal_block_size == 0
}

/// `align_range_to_optimal` widens `[lba, lba + blocks)` outward to optimal
/// block boundaries.
#[must_use]
pub const fn align_range_to_optimal(lba: u64, blocks: u64, optimal_block_size: u64) -> (u64, u64) {
    let start = lba - lba % optimal_block_size;
    let end = lba + blocks;
    let end = if end % optimal_block_size == 0 {
        end
    } else {
        end + optimal_block_size - end % optimal_block_size
    };
    (start, end - start)
}

/// `align_end_reduce` trims a block count so the request ends on an element
/// boundary, leaving at least one block. Used when another sub-request will
/// follow, so its start cannot overlap this request's tail pre-read.
#[must_use]
pub const fn align_end_reduce(element_size: u64, lba: u64, blocks: u64) -> u64 {
    let end = lba + blocks;
    let aligned_end = end - end % element_size;
    if aligned_end > lba { aligned_end - lba } else { blocks }
}
