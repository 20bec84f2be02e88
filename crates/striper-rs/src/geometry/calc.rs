//! Stateless logical/physical address calculator.
//!
//! This is the arithmetic sibling of the data-path engine: no resources, no
//! state machines, just the translation a support tool needs when chasing a
//! block across members.

#[cfg(test)]
mod calc_tests;

use crate::geometry::{RaidParams, RaidType};

/// Physical placement of one logical block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PhysicalAddress {
    /// Block address on the owning member.
    pub pba: u64,
    /// Striped data position holding the block.
    pub data_pos: usize,
    /// Concrete member drives backing the position. RAID-0 has one; RAID-10
    /// has the primary and its mirror.
    pub drives: [Option<usize>; 2],
}

/// `logical_to_physical` maps a logical block address to its member placement.
///
/// # Arguments
/// * `params` - The group layout.
/// * `lba` - Logical block address.
///
/// # Errors
/// Returns an error if `lba` is beyond the configured capacity.
pub fn logical_to_physical(params: &RaidParams, lba: u64) -> anyhow::Result<PhysicalAddress> {
    if lba >= params.configured_capacity() {
        anyhow::bail!(
            "lba {lba} beyond configured capacity {}",
            params.configured_capacity()
        );
    }
    let element = params.element_size;
    let stripe = params.blocks_per_stripe();
    let data_pos = ((lba % stripe) / element) as usize;
    let pba = (lba / stripe) * element + lba % element;
    let drives = match params.raid_type {
        RaidType::Raid0 => [Some(data_pos), None],
        RaidType::Raid10 => [Some(data_pos * 2), Some(data_pos * 2 + 1)],
    };
    Ok(PhysicalAddress { pba, data_pos, drives })
}

/// `physical_to_logical` inverts [`logical_to_physical`].
///
/// # Arguments
/// * `params` - The group layout.
/// * `pba` - Block address on the member.
/// * `data_pos` - Striped data position of the member.
///
/// # Errors
/// Returns an error for an out-of-range position or member address.
pub fn physical_to_logical(params: &RaidParams, pba: u64, data_pos: usize) -> anyhow::Result<u64> {
    if data_pos >= params.width {
        anyhow::bail!("data position {data_pos} out of range (width {})", params.width);
    }
    if pba >= params.capacity_per_disk {
        anyhow::bail!("pba {pba} beyond member capacity {}", params.capacity_per_disk);
    }
    let element = params.element_size;
    let row = pba / element;
    let offset = pba % element;
    Ok(row * params.blocks_per_stripe() + data_pos as u64 * element + offset)
}
