//! Generate: classify the incoming opcode, size the sub-request against the
//! backend limits and hand the SIOTS to its state machine.

#[cfg(test)]
mod generate_tests;

use tracing::{debug, error};

use crate::engine::{EngineCtx, StepResult};
use crate::geometry::{
    self, GeometrySnapshot, MAX_WIDTH, RaidParams, RaidType, physical_geometry,
};
use crate::resource;
use crate::transact::Opcode;
use crate::transact::iots::Iots;
use crate::transact::siots::{
    Algorithm, CheckZeroedState, ReadState, Siots, SiotsState, SiotsStatus, VerifyState,
    WriteState, ZeroState,
};

/// The generate state: runs exactly once per SIOTS.
pub fn step(siots: &mut Siots, iots: &mut Iots, ctx: &mut EngineCtx<'_>) -> StepResult {
    let opcode = iots.opcode;
    let outcome = if opcode.is_read_write_family() {
        gen_read_write(siots, iots, ctx)
    } else if opcode.is_verify_family() {
        gen_verify(siots, iots, ctx)
    } else if opcode.is_zero_family() {
        gen_zero(siots, iots, ctx)
    } else if opcode == Opcode::CheckZeroed {
        gen_check_zeroed(siots, iots, ctx)
    } else {
        error!(?opcode, "unsupported opcode");
        return StepResult::Done(SiotsStatus::UnexpectedError);
    };

    if let Err(status) = outcome {
        return StepResult::Done(status);
    }
    // Generate must always leave a runnable SIOTS behind.
    if let Err(err) = siots.validate(ctx.params.width, ctx.params.optimal_block_size) {
        error!(%err, "generate left an invalid sub-request");
        return StepResult::Done(SiotsStatus::UnexpectedError);
    }
    debug!(
        algorithm = ?siots.algorithm,
        lba = siots.start_lba,
        blocks = siots.xfer_count,
        "gen start"
    );
    StepResult::Continue
}

/// Whether this write needs 4K-alignment pre-reads on plain RAID-0.
fn write_needs_alignment(siots: &Siots, params: &RaidParams) -> bool {
    params.raid_type == RaidType::Raid0
        && params.aligned_4k_positions != 0
        && !geometry::is_aligned_to_optimal(
            siots.start_lba,
            siots.xfer_count,
            params.optimal_block_size,
        )
}

/// Fill the generic read/write sizing fields for a transfer of `blocks`.
fn read_write_calculate(
    siots: &mut Siots,
    params: &RaidParams,
    blocks: u64,
) -> Result<(), SiotsStatus> {
    if params.width == 0 || blocks == 0 {
        error!(width = params.width, blocks, "degenerate transfer");
        return Err(SiotsStatus::UnexpectedError);
    }
    let element = params.element_size;
    siots.xfer_count = blocks;
    siots.data_disks =
        ((blocks + siots.start_lba % element).div_ceil(element)).min(params.width as u64) as usize;
    let (parity_start, parity_count) =
        geometry::parity_footprint(siots.start_lba, blocks, element, params.width);
    siots.parity_start = parity_start;
    siots.parity_count = parity_count;
    Ok(())
}

/// Find the largest transfer the backend limits accept, halving on overflow.
/// Requests small enough to be trivially safe skip the speculative pass.
fn max_read_write_blocks(
    siots: &mut Siots,
    ctx: &mut EngineCtx<'_>,
) -> Result<u64, SiotsStatus> {
    let mut blocks = siots.xfer_count;
    if blocks <= ctx.config.small_request_blocks {
        return Ok(blocks);
    }
    loop {
        let plan = resource::plan_for(siots, ctx.params, ctx.config);
        if !plan.exceeds_limits(ctx.config) {
            return Ok(blocks);
        }
        debug!(lba = siots.start_lba, blocks, reduced = blocks / 2, "request exceeds limits");
        blocks /= 2;
        if blocks == 0 {
            error!("request cannot be sized within resource limits");
            return Err(SiotsStatus::UnexpectedError);
        }
        read_write_calculate(siots, ctx.params, blocks)?;
    }
}

fn gen_read_write(
    siots: &mut Siots,
    iots: &mut Iots,
    ctx: &mut EngineCtx<'_>,
) -> Result<(), SiotsStatus> {
    let params = ctx.params;
    siots.geo = physical_geometry(params, siots.start_lba).map_err(|err| {
        error!(%err, "invalid geometry for request");
        SiotsStatus::UnexpectedError
    })?;

    match iots.opcode {
        Opcode::Read => {
            siots.algorithm = Some(Algorithm::R0Read);
            siots.state = SiotsState::Read(ReadState::Alloc);
        }
        Opcode::Write
        | Opcode::WriteNoncached
        | Opcode::VerifyWrite
        | Opcode::WriteVerify
        | Opcode::Zero
        | Opcode::UnmarkZero => {
            // Unaligned zeros arrive here too; the write machine supplies
            // the zero source.
            siots.algorithm = Some(Algorithm::R0Write);
            siots.state = SiotsState::Write(WriteState::Alloc);
        }
        _ => {
            error!(opcode = ?iots.opcode, "unexpected opcode in read/write generate");
            return Err(SiotsStatus::UnexpectedError);
        }
    }
    siots.start_pos = siots.geo.positions[siots.geo.start_index];
    siots.retry_count = ctx.config.retry_count;

    let mut blocks = siots.xfer_count.min(siots.geo.max_blocks);
    read_write_calculate(siots, params, blocks)?;

    // Clamp to what the scatter/gather and per-drive ceilings accept.
    blocks = max_read_write_blocks(siots, ctx)?;

    // An unaligned write followed by more work is trimmed back to an element
    // boundary so the next SIOTS cannot overlap this one's tail pre-read.
    if siots.algorithm == Some(Algorithm::R0Write)
        && write_needs_alignment(siots, ctx.params)
        && blocks < iots.blocks_remaining()
    {
        let reduced = geometry::align_end_reduce(ctx.params.element_size, siots.start_lba, blocks);
        if reduced != blocks {
            debug!(blocks, reduced, "align write end trimmed");
            read_write_calculate(siots, ctx.params, reduced)?;
            blocks = reduced;
        }
    }
    if blocks == 0 {
        return Err(SiotsStatus::UnexpectedError);
    }
    if !iots.dec_blocks(siots.xfer_count) {
        error!(
            xfer = siots.xfer_count,
            remaining = iots.blocks_remaining(),
            "generate claimed more blocks than remain"
        );
        return Err(SiotsStatus::UnexpectedError);
    }
    siots.drive_operations = siots.data_disks;
    Ok(())
}

/// Geometry for a verify request, whose range is addressed in per-member
/// physical rows rather than logical blocks.
pub(crate) fn verify_geometry(
    params: &RaidParams,
    start_lba: u64,
) -> Result<GeometrySnapshot, SiotsStatus> {
    if start_lba >= params.capacity_per_disk {
        error!(start_lba, "verify start beyond member capacity");
        return Err(SiotsStatus::UnexpectedError);
    }
    let mut positions = [0usize; MAX_WIDTH];
    for (i, slot) in positions.iter_mut().enumerate().take(params.width) {
        *slot = i;
    }
    let offset = start_lba % params.element_size;
    Ok(GeometrySnapshot {
        positions,
        width: params.width,
        logical_parity_start: start_lba - offset,
        start_index: 0,
        start_offset_rel_parity_stripe: offset,
        blocks_remaining_in_parity: params.element_size - offset,
        max_blocks: params.max_window_blocks.max(params.element_size),
    })
}

fn gen_verify(
    siots: &mut Siots,
    iots: &mut Iots,
    ctx: &mut EngineCtx<'_>,
) -> Result<(), SiotsStatus> {
    let params = ctx.params;
    // Background verifies never run at this level for striped mirrors; the
    // mirror object owns them.
    if params.raid_type == RaidType::Raid10 {
        error!(opcode = ?iots.opcode, "background verify not allowed on a striped mirror");
        return Err(SiotsStatus::UnexpectedError);
    }
    siots.geo = verify_geometry(params, siots.start_lba)?;

    // Only aligned requests reach the verify path.
    if siots.start_lba % params.optimal_block_size != 0
        || siots.xfer_count % params.optimal_block_size != 0
    {
        error!(
            lba = siots.start_lba,
            blocks = siots.xfer_count,
            optimal = params.optimal_block_size,
            "verify request not aligned to optimal block size"
        );
        return Err(SiotsStatus::UnexpectedError);
    }

    let blocks = siots
        .xfer_count
        .min(siots.geo.max_blocks)
        .min(ctx.config.max_blocks_per_drive)
        .min(params.capacity_per_disk - siots.start_lba);
    siots.xfer_count = blocks;
    siots.parity_start = siots.start_lba;
    siots.parity_count = blocks;
    siots.data_disks = params.width;
    siots.start_pos = siots.geo.positions[siots.geo.start_index];
    siots.retry_count = ctx.config.retry_count;

    if !iots.dec_blocks(siots.xfer_count) {
        return Err(SiotsStatus::UnexpectedError);
    }
    siots.drive_operations = params.width;
    siots.algorithm = Some(Algorithm::R0Verify);
    siots.state = SiotsState::Verify(VerifyState::Alloc);
    Ok(())
}

fn gen_zero(
    siots: &mut Siots,
    iots: &mut Iots,
    ctx: &mut EngineCtx<'_>,
) -> Result<(), SiotsStatus> {
    let params = ctx.params;
    siots.geo = physical_geometry(params, siots.start_lba).map_err(|err| {
        error!(%err, "invalid geometry for zero request");
        SiotsStatus::UnexpectedError
    })?;
    siots.start_pos = siots.geo.positions[siots.geo.start_index];
    siots.retry_count = ctx.config.retry_count;

    let stripe = params.blocks_per_stripe();
    let aligned = geometry::is_aligned_to_optimal(
        siots.start_lba,
        siots.xfer_count,
        params.optimal_block_size,
    );
    if iots.opcode == Opcode::UnmarkZero
        && (!aligned
            || siots.start_lba % stripe != 0
            || (siots.start_lba + siots.xfer_count) % stripe != 0)
    {
        error!(lba = siots.start_lba, blocks = siots.xfer_count, "unmark zero not stripe aligned");
        return Err(SiotsStatus::UnexpectedError);
    }

    if params.raid_type == RaidType::Raid0 && !aligned {
        // Misaligned plain-RAID-0 zeros need pre-reads, so they run as
        // ordinary writes of zero. Large transfers are trimmed so interior
        // full stripes go out as write-same and only the ragged edges take
        // the slow path.
        if siots.xfer_count > stripe * ctx.config.min_zero_stripe_optimize {
            if siots.start_lba % params.optimal_block_size == 0 && siots.xfer_count > stripe {
                siots.xfer_count -= (siots.start_lba + siots.xfer_count) % stripe;
            } else {
                siots.xfer_count = siots
                    .xfer_count
                    .min(stripe - siots.start_lba % stripe);
            }
        }
        return gen_read_write(siots, iots, ctx);
    }

    read_write_calculate(siots, params, siots.xfer_count)?;
    if !iots.dec_blocks(siots.xfer_count) {
        return Err(SiotsStatus::UnexpectedError);
    }
    siots.drive_operations = siots.data_disks;
    siots.algorithm = Some(Algorithm::Zero);
    siots.state = SiotsState::Zero(ZeroState::Alloc);
    Ok(())
}

fn gen_check_zeroed(
    siots: &mut Siots,
    iots: &mut Iots,
    ctx: &mut EngineCtx<'_>,
) -> Result<(), SiotsStatus> {
    let params = ctx.params;
    siots.geo = physical_geometry(params, siots.start_lba).map_err(|err| {
        error!(%err, "invalid geometry for check-zeroed request");
        SiotsStatus::UnexpectedError
    })?;
    if !geometry::is_aligned_to_optimal(
        siots.start_lba,
        siots.xfer_count,
        params.optimal_block_size,
    ) {
        error!(lba = siots.start_lba, blocks = siots.xfer_count, "check-zeroed not aligned");
        return Err(SiotsStatus::UnexpectedError);
    }
    siots.start_pos = siots.geo.positions[siots.geo.start_index];
    siots.retry_count = ctx.config.retry_count;
    read_write_calculate(siots, params, siots.xfer_count.min(siots.geo.max_blocks))?;
    if !iots.dec_blocks(siots.xfer_count) {
        return Err(SiotsStatus::UnexpectedError);
    }
    siots.drive_operations = siots.data_disks;
    siots.algorithm = Some(Algorithm::CheckZeroed);
    siots.state = SiotsState::CheckZeroed(CheckZeroedState::Alloc);
    Ok(())
}
