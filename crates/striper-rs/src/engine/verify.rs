//! The verify state machine, shared by plain verify, BVA verify and the
//! nested recovery verify.
//!
//! Verify reads whole-stripe regions on every position, runs the strip
//! checker, invalidates what cannot be reconstructed, rewrites what can,
//! and reports the error regions it found. After a mid-stream media error
//! it drops into single-region mode so one repair pass never covers more
//! than a mining region.


use tracing::{debug, warn};

use crate::BLOCK_BYTES;
use crate::engine::{
    ChainSel, EngineCtx, ErrorDisposition, StepResult, classify_chain, generate,
    handle_chain_status, operator_resolution, sector_runs,
};
use crate::resource;
use crate::transact::fruts::{FruInfo, FruOpcode, FruResult, Fruts};
use crate::transact::iots::Iots;
use crate::transact::siots::{
    Algorithm, Siots, SiotsState, SiotsStatus, VerifyState, WaitReason,
};
use crate::transport::{AllocOutcome, ErrorRegionKind, InvalidateReason};

/// Build the nested SIOTS a write/read spawns to repair a stripe: the
/// parent's touched range expanded outward to full parity-stripe boundaries.
pub(crate) fn make_nested(
    parent: &Siots,
    ctx: &EngineCtx<'_>,
    algorithm: Algorithm,
) -> Result<Siots, SiotsStatus> {
    let params = ctx.params;
    let element = params.element_size;
    let (parity_start, parity_count) = crate::geometry::parity_footprint(
        parent.start_lba,
        parent.xfer_count,
        element,
        params.width,
    );
    // Round outward to whole stripes; verify operates on nothing smaller.
    let start = parity_start - parity_start % element;
    let end = (parity_start + parity_count).next_multiple_of(element);
    let end = end.min(params.capacity_per_disk);
    if start >= end {
        return Err(SiotsStatus::UnexpectedError);
    }

    let mut child = parent.nested();
    child.parity_start = start;
    child.parity_count = end - start;
    child.start_lba = start;
    child.xfer_count = end - start;
    child.geo = generate::verify_geometry(params, start)?;
    child.algorithm = Some(algorithm);
    child.data_disks = params.width;
    child.start_pos = child.geo.positions[0];
    child.drive_operations = params.width;
    child.retry_count = ctx.config.retry_count;
    child.state = SiotsState::Verify(VerifyState::Alloc);
    debug!(start, count = child.parity_count, ?algorithm, "expanded nested verify");
    Ok(child)
}

pub fn step(
    state: VerifyState,
    siots: &mut Siots,
    iots: &mut Iots,
    ctx: &mut EngineCtx<'_>,
) -> StepResult {
    match state {
        VerifyState::Alloc => {
            let plan = resource::plan_for(siots, ctx.params, ctx.config);
            match ctx.transport.allocate_memory(plan.budget.pages) {
                AllocOutcome::Granted(grant) => {
                    siots.grant = Some(grant);
                    siots.state = SiotsState::Verify(VerifyState::Setup);
                    StepResult::Continue
                }
                AllocOutcome::Pending => {
                    siots.state = SiotsState::Verify(VerifyState::Setup);
                    StepResult::Waiting(WaitReason::MemoryAllocation)
                }
                AllocOutcome::Error => StepResult::Done(SiotsStatus::UnexpectedError),
            }
        }
        VerifyState::Setup => {
            if siots.alloc_failed {
                return StepResult::Done(SiotsStatus::UnexpectedError);
            }
            let Some(mut grant) = siots.grant.take() else {
                return StepResult::Done(SiotsStatus::UnexpectedError);
            };
            let plan = resource::plan_for(siots, ctx.params, ctx.config);
            if let Err(err) = resource::setup_resources(siots, &plan, &mut grant) {
                warn!(%err, "verify resource setup failed");
                return StepResult::Done(SiotsStatus::UnexpectedError);
            }
            siots.state = SiotsState::Verify(VerifyState::Dispatch);
            StepResult::Continue
        }
        VerifyState::Dispatch => {
            if !ctx.transport.dispatch_chain(&mut siots.read_chain) {
                return StepResult::Done(SiotsStatus::UnexpectedError);
            }
            siots.wait_count = siots.read_chain.outstanding();
            siots.state = SiotsState::Verify(VerifyState::Evaluate);
            StepResult::Waiting(WaitReason::ChainCompletion)
        }
        VerifyState::Evaluate => {
            if let Some(resolution) = operator_resolution(siots, ctx, ChainSel::Read) {
                return resolution;
            }
            let (board, status) = classify_chain(siots, iots, ctx, ChainSel::Read);
            match handle_chain_status(siots, iots, ctx, &board, status, ChainSel::Read) {
                ErrorDisposition::Proceed => {
                    siots.state = SiotsState::Verify(VerifyState::ChecksumStrip);
                    StepResult::Continue
                }
                ErrorDisposition::Done(status) => StepResult::Done(status),
                ErrorDisposition::Waiting(reason) => StepResult::Waiting(reason),
                ErrorDisposition::Retried => StepResult::Waiting(WaitReason::ChainCompletion),
                ErrorDisposition::CallerPolicy => {
                    if board.drop_count > 0 {
                        return StepResult::Done(SiotsStatus::Dropped);
                    }
                    if !siots.flags.single_region_mode {
                        // Re-scope to one mining region at a time so a single
                        // repair pass has a bounded blast radius.
                        warn!(
                            bitmap = board.hard_media_bitmap,
                            "media error mid-verify, entering single-region mode"
                        );
                        siots.flags.single_region_mode = true;
                        siots.region_blocks_done = 0;
                        siots.state = SiotsState::Verify(VerifyState::Alloc);
                        return StepResult::Continue;
                    }
                    // Already mining: the bad positions' content is gone;
                    // invalidate and write back below.
                    siots.state = SiotsState::Verify(VerifyState::ChecksumStrip);
                    StepResult::Continue
                }
            }
        }
        VerifyState::ChecksumStrip => {
            // Read-only verifies record what they find but repair nothing.
            let read_only = siots.algorithm == Some(Algorithm::R0Verify)
                && iots.opcode == crate::transact::Opcode::ReadOnlyVerify;
            checksum_strip(siots, ctx, read_only);
            if siots.write_chain.is_empty() {
                siots.state = SiotsState::Verify(VerifyState::RegionAdvance);
            } else {
                siots.state = SiotsState::Verify(VerifyState::WriteBack);
            }
            StepResult::Continue
        }
        VerifyState::WriteBack => {
            if !ctx.transport.dispatch_chain(&mut siots.write_chain) {
                return StepResult::Done(SiotsStatus::UnexpectedError);
            }
            siots.wait_count = siots.write_chain.outstanding();
            siots.state = SiotsState::Verify(VerifyState::WriteBackEvaluate);
            StepResult::Waiting(WaitReason::ChainCompletion)
        }
        VerifyState::WriteBackEvaluate => {
            if let Some(resolution) = operator_resolution(siots, ctx, ChainSel::Write) {
                return resolution;
            }
            let (board, status) = classify_chain(siots, iots, ctx, ChainSel::Write);
            match handle_chain_status(siots, iots, ctx, &board, status, ChainSel::Write) {
                ErrorDisposition::Proceed => {
                    siots.state = SiotsState::Verify(VerifyState::RegionAdvance);
                    StepResult::Continue
                }
                ErrorDisposition::Done(status) => StepResult::Done(status),
                ErrorDisposition::Waiting(reason) => StepResult::Waiting(reason),
                ErrorDisposition::Retried => StepResult::Waiting(WaitReason::ChainCompletion),
                ErrorDisposition::CallerPolicy => {
                    if board.drop_count > 0 {
                        return StepResult::Done(SiotsStatus::Dropped);
                    }
                    // A write-verify can itself take a media error; the
                    // content was already invalidated, so the repair stands
                    // as far as it can. Move on to bound the damage.
                    warn!(
                        bitmap = board.hard_media_bitmap,
                        "media error on verify write-back"
                    );
                    siots.state = SiotsState::Verify(VerifyState::RegionAdvance);
                    StepResult::Continue
                }
            }
        }
        VerifyState::RegionAdvance => {
            let (_, region_blocks) =
                resource::current_verify_region(siots, ctx.config, ctx.params.optimal_block_size);
            siots.region_blocks_done = if siots.flags.single_region_mode {
                siots.region_blocks_done + region_blocks
            } else {
                siots.parity_count
            };
            siots.read_chain.clear();
            siots.write_chain.clear();
            if siots.flags.single_region_mode && siots.region_remaining() > 0 {
                siots.state = SiotsState::Verify(VerifyState::Alloc);
                return StepResult::Continue;
            }
            report_error_regions(siots);
            StepResult::Done(siots.success_status())
        }
    }
}

/// Run the strip checker over this region, repair what is repairable in the
/// buffers, and stage the write-back chain.
fn checksum_strip(siots: &mut Siots, ctx: &mut EngineCtx<'_>, read_only: bool) {
    let media_bitmap = siots
        .read_chain
        .bitmap_where(|r| matches!(r, FruResult::HardMedia | FruResult::MediaNoRemap));

    let report = {
        let runs = sector_runs(&siots.read_chain);
        ctx.xor.verify_strip(&runs)
    };
    siots.regions.extend(report.regions.iter().copied());
    if siots.media_error_lba.is_none() {
        siots.media_error_lba = report.first_error_lba;
    }

    // Strip-level repair: touch only the sectors a ledger entry names, not
    // the whole pass. Uncorrectable content is invalidated, stamp-only
    // errors are rewritten in place.
    for region in &report.regions {
        for fruts in siots.read_chain.iter_mut() {
            if region.positions & (1 << fruts.position) == 0 {
                continue;
            }
            let offset = (region.lba - fruts.lba) as usize * BLOCK_BYTES;
            let len = region.blocks as usize * BLOCK_BYTES;
            let span = &mut fruts.data[offset..offset + len];
            match region.kind {
                ErrorRegionKind::Uncorrectable => ctx.xor.invalidate_sectors(
                    span,
                    region.lba,
                    InvalidateReason::VerifyUncorrectable,
                ),
                ErrorRegionKind::LbaStamp => ctx.xor.fill_checksums(span, region.lba),
                ErrorRegionKind::Invalidated => {}
            }
        }
    }
    // Members that lost the whole region have nothing worth keeping.
    for fruts in siots.read_chain.iter_mut() {
        if media_bitmap & (1 << fruts.position) != 0 {
            ctx.xor.invalidate_sectors(&mut fruts.data, fruts.lba, InvalidateReason::MediaError);
        }
    }

    // Soft media errors are rewritten on plain verify so the drive remaps.
    let soft_bitmap = if siots.algorithm == Some(Algorithm::R0Verify) {
        siots.read_chain.bitmap_where(|r| r == FruResult::SoftMedia)
    } else {
        0
    };
    let write_bitmap =
        report.uncorrectable_bitmap | report.correctable_bitmap | media_bitmap | soft_bitmap;
    if write_bitmap == 0 || read_only {
        return;
    }

    // Recovery verifies write back with verify so a failing member surfaces
    // here instead of on the parent's re-read.
    let opcode = if siots.algorithm == Some(Algorithm::R0RecoveryVerify) {
        FruOpcode::WriteVerify
    } else {
        FruOpcode::Write
    };
    siots.write_chain.clear();
    for fruts in siots.read_chain.iter() {
        if write_bitmap & (1 << fruts.position) == 0 {
            continue;
        }
        let mut write =
            Fruts::from_info(&FruInfo::new(fruts.position, fruts.lba, fruts.blocks), opcode);
        write.data = fruts.data.clone();
        siots.write_chain.push(write);
    }
}

/// Event-log the ledger accumulated over every pass of this verify.
fn report_error_regions(siots: &Siots) {
    for region in &siots.regions {
        warn!(
            lba = region.lba,
            blocks = region.blocks,
            positions = region.positions,
            kind = ?region.kind,
            "verify error region"
        );
    }
}
