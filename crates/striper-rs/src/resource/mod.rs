//! Resource planning: what a SIOTS needs before it can dispatch.
//!
//! Planning is two-phase. The first pass computes per-member FRU infos and a
//! page budget with no memory in hand, so the caller can size (and if needed
//! halve) the request. The second pass materializes FRUTS and binds their
//! buffers to the granted pages. Running the first pass twice on the same
//! SIOTS state yields the same plan; nothing here mutates the SIOTS.

#[cfg(test)]
mod planner_tests;

use crate::BLOCK_BYTES;
use crate::config::StriperConfig;
use crate::geometry::{self, RaidParams, RaidType};
use crate::transact::fruts::{FruInfo, FruOpcode, Fruts, FrutsChain};
use crate::transact::siots::{Algorithm, Siots};
use crate::transport::PageGrant;

/// Scatter/gather list size classes, in elements.
pub const SG_CLASSES: [usize; 4] = [1, 8, 32, 128];

/// Memory request derived from a plan.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PageBudget {
    pub pages: usize,
    pub total_blocks: u64,
    /// FRUTS counts per entry of [`SG_CLASSES`].
    pub sg_class_counts: [usize; SG_CLASSES.len()],
}

/// Everything the first planning pass produces.
#[derive(Clone, Debug, Default)]
pub struct ResourcePlan {
    /// Reads: the data reads of a read/verify/check-zeroed, or the aligning
    /// pre-reads of an unaligned write.
    pub read_infos: Vec<FruInfo>,
    /// Writes or write-sames.
    pub write_infos: Vec<FruInfo>,
    pub budget: PageBudget,
}

impl ResourcePlan {
    /// Whether any member operation exceeds the backend ceilings; the caller
    /// halves the request and re-plans.
    #[must_use]
    pub fn exceeds_limits(&self, config: &StriperConfig) -> bool {
        self.read_infos
            .iter()
            .chain(self.write_infos.iter())
            .any(|info| {
                info.blocks > config.max_blocks_per_drive
                    || info.sg_elements > config.max_sg_elements
            })
    }
}

/// Scatter/gather elements needed for a buffer of `blocks`, allowing one
/// extra fragment for a page-straddling start.
const fn sg_elements_for(blocks: u64, page_size_blocks: u64) -> usize {
    (blocks.div_ceil(page_size_blocks) + 1) as usize
}

const fn sg_class_index(elements: usize) -> usize {
    let mut i = 0;
    while i < SG_CLASSES.len() {
        if elements <= SG_CLASSES[i] {
            return i;
        }
        i += 1;
    }
    SG_CLASSES.len() - 1
}

fn finish_budget(plan: &mut ResourcePlan, config: &StriperConfig) {
    let mut total = 0u64;
    let mut counts = [0usize; SG_CLASSES.len()];
    for info in plan.read_infos.iter_mut().chain(plan.write_infos.iter_mut()) {
        info.sg_elements = sg_elements_for(info.blocks, config.page_size_blocks);
        counts[sg_class_index(info.sg_elements)] += 1;
        total += info.blocks;
    }
    plan.budget = PageBudget {
        pages: total.div_ceil(config.page_size_blocks) as usize,
        total_blocks: total,
        sg_class_counts: counts,
    };
}

/// Per-member extents of the SIOTS's logical range, as FRU infos.
fn data_extents(siots: &Siots, params: &RaidParams) -> Vec<FruInfo> {
    let mut infos = Vec::new();
    for index in 0..siots.geo.width {
        if let Some((lba, blocks)) = geometry::position_extent(
            siots.start_lba,
            siots.xfer_count,
            params.element_size,
            params.width,
            index,
        ) {
            infos.push(FruInfo::new(siots.geo.positions[index], lba, blocks));
        }
    }
    infos
}

/// `plan_read` computes the member reads for a read SIOTS.
#[must_use]
pub fn plan_read(siots: &Siots, params: &RaidParams, config: &StriperConfig) -> ResourcePlan {
    let mut plan = ResourcePlan { read_infos: data_extents(siots, params), ..Default::default() };
    finish_budget(&mut plan, config);
    plan
}

/// `plan_write` computes the member writes plus, for unaligned 4K positions
/// on plain RAID-0, the aligning pre-reads. The write covers the aligned
/// range; only the host-supplied middle will differ from the pre-read.
#[must_use]
pub fn plan_write(siots: &Siots, params: &RaidParams, config: &StriperConfig) -> ResourcePlan {
    let mut plan = ResourcePlan::default();
    for info in data_extents(siots, params) {
        let mut write_info = info;
        // RAID-10 realigns one level down; no pre-reads at this level.
        if params.raid_type == RaidType::Raid0
            && params.position_needs_alignment(info.position)
            && !geometry::is_aligned_to_optimal(info.lba, info.blocks, params.optimal_block_size)
        {
            let (aligned_lba, aligned_blocks) = geometry::align_range_to_optimal(
                info.lba,
                info.blocks,
                params.optimal_block_size,
            );
            plan.read_infos.push(FruInfo::new(info.position, aligned_lba, aligned_blocks));
            write_info.lba = aligned_lba;
            write_info.blocks = aligned_blocks;
        }
        plan.write_infos.push(write_info);
    }
    finish_budget(&mut plan, config);
    plan
}

/// `plan_verify` reads the current parity region on every position.
#[must_use]
pub fn plan_verify(
    siots: &Siots,
    region_start: u64,
    region_blocks: u64,
    config: &StriperConfig,
) -> ResourcePlan {
    let mut plan = ResourcePlan::default();
    for index in 0..siots.geo.width {
        plan.read_infos.push(FruInfo::new(
            siots.geo.positions[index],
            region_start,
            region_blocks,
        ));
    }
    finish_budget(&mut plan, config);
    plan
}

/// `plan_zero` issues one write-same per touched position; the buffer is a
/// single pattern block each.
#[must_use]
pub fn plan_zero(siots: &Siots, params: &RaidParams, config: &StriperConfig) -> ResourcePlan {
    let mut plan = ResourcePlan::default();
    for info in data_extents(siots, params) {
        // One pattern block regardless of span; sizing counts the buffer,
        // not the media range.
        plan.write_infos.push(FruInfo { sg_elements: 0, ..info });
    }
    // Budget one block per write-same pattern.
    let mut total = 0u64;
    let mut counts = [0usize; SG_CLASSES.len()];
    for info in &mut plan.write_infos {
        info.sg_elements = sg_elements_for(1, config.page_size_blocks);
        counts[sg_class_index(info.sg_elements)] += 1;
        total += 1;
    }
    plan.budget = PageBudget {
        pages: total.div_ceil(config.page_size_blocks) as usize,
        total_blocks: total,
        sg_class_counts: counts,
    };
    plan
}

/// `plan_for` dispatches on the SIOTS algorithm.
///
/// # Panics
/// Panics if generate has not set an algorithm; planning before generate is
/// a caller bug.
#[must_use]
pub fn plan_for(siots: &Siots, params: &RaidParams, config: &StriperConfig) -> ResourcePlan {
    match siots.algorithm.expect("algorithm set before planning") {
        Algorithm::R0Read | Algorithm::CheckZeroed => plan_read(siots, params, config),
        Algorithm::R0Write => plan_write(siots, params, config),
        Algorithm::R0Verify | Algorithm::R0BvaVerify | Algorithm::R0RecoveryVerify => {
            let (start, blocks) = current_verify_region(siots, config, params.optimal_block_size);
            plan_verify(siots, start, blocks, config)
        }
        Algorithm::Zero => plan_zero(siots, params, config),
    }
}

/// The sub-range a verify works on this pass: the whole parity range
/// normally, or one mining region at a time in single-region mode. The first
/// region may be short so later regions start aligned.
#[must_use]
pub fn current_verify_region(
    siots: &Siots,
    config: &StriperConfig,
    optimal_block_size: u64,
) -> (u64, u64) {
    let start = siots.parity_start + siots.region_blocks_done;
    let remaining = siots.region_remaining();
    if !siots.flags.single_region_mode {
        return (siots.parity_start, siots.parity_count);
    }
    let region = config.mine_region_size.max(optimal_block_size).max(1);
    let count = if start % region != 0 { region - start % region } else { region };
    (start, count.min(remaining))
}

/// Bind granted pages to a chain's buffers.
///
/// # Errors
/// Returns an error when the grant runs out before the chain is covered,
/// meaning size calculation and setup disagreed.
fn bind_buffers(chain: &mut FrutsChain, grant: &mut PageGrant) -> anyhow::Result<()> {
    for fruts in chain.iter_mut() {
        if fruts.is_noop() {
            continue;
        }
        let bytes = match fruts.opcode {
            FruOpcode::WriteSame => BLOCK_BYTES,
            _ => fruts.buffer_bytes(),
        };
        fruts.data = grant
            .carve(bytes)
            .ok_or_else(|| anyhow::anyhow!("page grant exhausted binding position {}", fruts.position))?;
    }
    Ok(())
}

/// `setup_resources` materializes the planned FRUTS onto the SIOTS and binds
/// their buffers to the grant.
///
/// # Errors
/// Returns an error when the grant cannot cover the plan.
pub fn setup_resources(
    siots: &mut Siots,
    plan: &ResourcePlan,
    grant: &mut PageGrant,
) -> anyhow::Result<()> {
    siots.read_chain.clear();
    siots.write_chain.clear();
    let algorithm = siots.algorithm.expect("algorithm set before setup");
    let write_opcode = match algorithm {
        Algorithm::Zero => FruOpcode::WriteSame,
        Algorithm::R0RecoveryVerify => FruOpcode::WriteVerify,
        _ => FruOpcode::Write,
    };
    for info in &plan.read_infos {
        siots.read_chain.push(Fruts::from_info(info, FruOpcode::Read));
    }
    for info in &plan.write_infos {
        siots.write_chain.push(Fruts::from_info(info, write_opcode));
    }
    bind_buffers(&mut siots.read_chain, grant)?;
    bind_buffers(&mut siots.write_chain, grant)?;
    Ok(())
}
