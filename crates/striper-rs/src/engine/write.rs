//! The RAID-0 / RAID-10 write state machine.
//!
//! A write may branch through an aligning pre-read, a nested BVA verify
//! (verify-before-write) or a nested recovery verify before its member
//! writes dispatch. RAID-10 delegates everything past checksum setting to
//! the mirror level, so it never pre-reads or nests here.


use tracing::{debug, warn};

use crate::BLOCK_BYTES;
use crate::engine::read::{
    invalidate_media_positions, lowest_logical_error_lba, record_media_error,
};
use crate::engine::{
    ChainSel, EngineCtx, ErrorDisposition, StepResult, classify_chain, handle_chain_status,
    operator_resolution, run_siots, sector_runs, verify,
};
use crate::geometry::{RaidType, logical_offset_of_physical, position_extent};
use crate::resource;
use crate::transact::Opcode;
use crate::transact::iots::{Iots, MediaQualifier};
use crate::transact::siots::{
    Algorithm, Siots, SiotsState, SiotsStatus, WaitReason, WriteState,
};
use crate::transport::{AllocOutcome, SectorRun, XorStatus};

pub fn step(
    state: WriteState,
    siots: &mut Siots,
    iots: &mut Iots,
    ctx: &mut EngineCtx<'_>,
) -> StepResult {
    match state {
        WriteState::Alloc => {
            let plan = resource::plan_for(siots, ctx.params, ctx.config);
            match ctx.transport.allocate_memory(plan.budget.pages) {
                AllocOutcome::Granted(grant) => {
                    siots.grant = Some(grant);
                    siots.state = SiotsState::Write(WriteState::Setup);
                    StepResult::Continue
                }
                AllocOutcome::Pending => {
                    siots.state = SiotsState::Write(WriteState::Setup);
                    StepResult::Waiting(WaitReason::MemoryAllocation)
                }
                AllocOutcome::Error => StepResult::Done(SiotsStatus::UnexpectedError),
            }
        }
        WriteState::Setup => {
            if siots.alloc_failed {
                return StepResult::Done(SiotsStatus::UnexpectedError);
            }
            let Some(mut grant) = siots.grant.take() else {
                return StepResult::Done(SiotsStatus::UnexpectedError);
            };
            let plan = resource::plan_for(siots, ctx.params, ctx.config);
            if let Err(err) = resource::setup_resources(siots, &plan, &mut grant) {
                warn!(%err, "write resource setup failed");
                return StepResult::Done(SiotsStatus::UnexpectedError);
            }
            siots.state = SiotsState::Write(WriteState::Branch);
            StepResult::Continue
        }
        WriteState::Branch => {
            if ctx.params.raid_type == RaidType::Raid10 {
                // The mirror level owns verify-on-access and realignment.
                siots.state = SiotsState::Write(WriteState::SetChecksums);
                return StepResult::Continue;
            }
            if iots.opcode == Opcode::VerifyWrite {
                // Verify the whole touched stripe before writing into it.
                siots.state = SiotsState::Write(WriteState::BvaVerify);
                return StepResult::Continue;
            }
            if !siots.read_chain.is_empty() {
                siots.state = SiotsState::Write(WriteState::PreReadDispatch);
                return StepResult::Continue;
            }
            siots.state = SiotsState::Write(WriteState::SetChecksums);
            StepResult::Continue
        }
        WriteState::PreReadDispatch => {
            if !ctx.transport.dispatch_chain(&mut siots.read_chain) {
                return StepResult::Done(SiotsStatus::UnexpectedError);
            }
            siots.wait_count = siots.read_chain.outstanding();
            siots.state = SiotsState::Write(WriteState::PreReadEvaluate);
            StepResult::Waiting(WaitReason::ChainCompletion)
        }
        WriteState::PreReadEvaluate => {
            if let Some(resolution) = operator_resolution(siots, ctx, ChainSel::Read) {
                return resolution;
            }
            let (board, status) = classify_chain(siots, iots, ctx, ChainSel::Read);
            match handle_chain_status(siots, iots, ctx, &board, status, ChainSel::Read) {
                ErrorDisposition::Proceed => {
                    siots.state = SiotsState::Write(WriteState::PreReadChecksum);
                    StepResult::Continue
                }
                ErrorDisposition::Done(status) => StepResult::Done(status),
                ErrorDisposition::Waiting(reason) => StepResult::Waiting(reason),
                ErrorDisposition::Retried => StepResult::Waiting(WaitReason::ChainCompletion),
                ErrorDisposition::CallerPolicy => {
                    if board.drop_count > 0 {
                        return StepResult::Done(SiotsStatus::Dropped);
                    }
                    // A media error on the pre-read does not fail the write:
                    // repair the stripe, then re-issue the pre-read.
                    record_media_error(siots, ChainSel::Read);
                    spawn_recovery(siots, iots, ctx)
                }
            }
        }
        WriteState::PreReadChecksum => {
            let report = {
                let runs = sector_runs(&siots.read_chain);
                ctx.xor.check_checksums(&runs, true, true)
            };
            match report.status() {
                XorStatus::NoError => {
                    siots.state = SiotsState::Write(WriteState::SetChecksums);
                    StepResult::Continue
                }
                XorStatus::BadMemory => StepResult::Done(SiotsStatus::UnexpectedError),
                XorStatus::ChecksumError => {
                    if report.has_fresh_corruption() {
                        siots.media_error_lba = report.first_error_lba;
                        siots.media_error_position = report.first_error_position;
                        return spawn_recovery(siots, iots, ctx);
                    }
                    // Already-invalidated sectors stay lost; the stitched
                    // write preserves their pattern and the host range gets
                    // fresh data.
                    siots.state = SiotsState::Write(WriteState::SetChecksums);
                    StepResult::Continue
                }
            }
        }
        WriteState::BvaVerify | WriteState::RecoveryVerify => child_step(state, siots, iots, ctx),
        WriteState::SetChecksums => match fill_write_buffers(siots, iots, ctx) {
            Ok(()) => {
                siots.state = SiotsState::Write(WriteState::Dispatch);
                StepResult::Continue
            }
            Err(status) => StepResult::Done(status),
        },
        WriteState::Dispatch => {
            if !ctx.transport.dispatch_chain(&mut siots.write_chain) {
                return StepResult::Done(SiotsStatus::UnexpectedError);
            }
            siots.flags.write_started = true;
            siots.wait_count = siots.write_chain.outstanding();
            if !siots.flags.single_region_mode {
                siots.signal_generate_next = true;
            }
            siots.state = SiotsState::Write(WriteState::Evaluate);
            StepResult::Waiting(WaitReason::ChainCompletion)
        }
        WriteState::Evaluate => {
            if let Some(resolution) = operator_resolution(siots, ctx, ChainSel::Write) {
                return resolution;
            }
            let (board, status) = classify_chain(siots, iots, ctx, ChainSel::Write);
            match handle_chain_status(siots, iots, ctx, &board, status, ChainSel::Write) {
                ErrorDisposition::Proceed => {
                    if ctx.params.raid_type == RaidType::Raid0 {
                        // Event reporting is the mirror's job on RAID-10.
                        debug!(
                            lba = siots.start_lba,
                            blocks = siots.xfer_count,
                            "write complete"
                        );
                    }
                    StepResult::Done(siots.success_status())
                }
                ErrorDisposition::Done(status) => StepResult::Done(status),
                ErrorDisposition::Waiting(reason) => StepResult::Waiting(reason),
                ErrorDisposition::Retried => StepResult::Waiting(WaitReason::ChainCompletion),
                ErrorDisposition::CallerPolicy => {
                    if board.drop_count > 0 {
                        return StepResult::Done(SiotsStatus::Dropped);
                    }
                    record_media_error(siots, ChainSel::Write);
                    let lba = lowest_logical_error_lba(
                        siots,
                        ChainSel::Write,
                        ctx.params.width,
                        ctx.params.element_size,
                    );
                    if !ctx.params.raid_type.is_mirror_backed() {
                        warn!(lba, bitmap = board.hard_media_bitmap, "write media error");
                        invalidate_media_positions(
                            siots,
                            ctx,
                            board.hard_media_bitmap,
                            ChainSel::Write,
                        );
                    }
                    StepResult::Done(SiotsStatus::MediaError {
                        lba,
                        qualifier: MediaQualifier::DataLost,
                    })
                }
            }
        }
    }
}

/// Spawn the nested recovery verify over the enclosing parity stripe; at
/// most one repair attempt per SIOTS.
fn spawn_recovery(siots: &mut Siots, iots: &mut Iots, ctx: &mut EngineCtx<'_>) -> StepResult {
    if siots.recovery_attempted || siots.flags.single_error_recovery {
        let lba = lowest_logical_error_lba(
            siots,
            ChainSel::Read,
            ctx.params.width,
            ctx.params.element_size,
        );
        return StepResult::Done(SiotsStatus::MediaError {
            lba,
            qualifier: MediaQualifier::ChecksumError,
        });
    }
    siots.recovery_attempted = true;
    siots.flags.single_error_recovery = true;
    match verify::make_nested(siots, ctx, Algorithm::R0RecoveryVerify) {
        Ok(child) => {
            iots.error_count += 1;
            siots.child = Some(Box::new(child));
            siots.state = SiotsState::Write(WriteState::RecoveryVerify);
            StepResult::Continue
        }
        Err(status) => StepResult::Done(status),
    }
}

/// Drive a nested SIOTS (BVA or recovery verify) to completion, then resume
/// the write.
fn child_step(
    state: WriteState,
    siots: &mut Siots,
    iots: &mut Iots,
    ctx: &mut EngineCtx<'_>,
) -> StepResult {
    if state == WriteState::BvaVerify && siots.child.is_none() {
        match verify::make_nested(siots, ctx, Algorithm::R0BvaVerify) {
            Ok(child) => siots.child = Some(Box::new(child)),
            Err(status) => return StepResult::Done(status),
        }
    }
    let Some(child) = siots.child.as_deref_mut() else {
        return StepResult::Done(SiotsStatus::UnexpectedError);
    };
    if !child.is_finished() {
        let outcome = run_siots(child, iots, ctx);
        if matches!(outcome.state, crate::engine::RunState::Waiting(_)) {
            return StepResult::Waiting(WaitReason::NestedSiots);
        }
    }
    let child_status = siots
        .child
        .take()
        .and_then(|c| c.error)
        .unwrap_or(SiotsStatus::Success);
    if !child_status.is_success() {
        // The nested machine's failure becomes this write's completion.
        return StepResult::Done(child_status);
    }
    match state {
        WriteState::BvaVerify => {
            // Stripe verified; continue through the normal branch order.
            if !siots.read_chain.is_empty() {
                siots.read_chain.reset_positions(!0);
                siots.state = SiotsState::Write(WriteState::PreReadDispatch);
            } else {
                siots.state = SiotsState::Write(WriteState::SetChecksums);
            }
            StepResult::Continue
        }
        WriteState::RecoveryVerify => {
            // The stripe is repaired; re-issue the pre-read so stitched data
            // reflects the media. Lost sectors now carry the invalidated
            // pattern, which the checksum state tolerates.
            if !siots.read_chain.is_empty() {
                siots.read_chain.reset_positions(!0);
                siots.state = SiotsState::Write(WriteState::PreReadDispatch);
            } else {
                siots.state = SiotsState::Write(WriteState::SetChecksums);
            }
            StepResult::Continue
        }
        _ => StepResult::Done(SiotsStatus::UnexpectedError),
    }
}

/// Populate the write buffers: pre-read content for the aligned edges, the
/// host (or zero) source for the logical range, fresh checksums and stamps
/// for every sector this request supplies.
fn fill_write_buffers(
    siots: &mut Siots,
    iots: &Iots,
    ctx: &mut EngineCtx<'_>,
) -> Result<(), SiotsStatus> {
    let zero_source = iots.opcode.is_zero_family();
    let element = ctx.params.element_size;
    let width = ctx.params.width;

    // Host-supplied data must arrive with intact checksums; anything else is
    // an internal error, the host interface only ever passes pre-validated
    // or pre-invalidated blocks.
    if !zero_source && !iots.host_data.is_empty() {
        let offset = iots.host_offset(siots.start_lba);
        let len = siots.xfer_count as usize * BLOCK_BYTES;
        let run = SectorRun {
            position: 0,
            seed_lba: 0,
            data: &iots.host_data[offset..offset + len],
        };
        let report = ctx.xor.check_checksums(&[run], true, false);
        if report.crc_error_bitmap != 0 {
            warn!(lba = siots.start_lba, "host data failed checksum validation");
            return Err(SiotsStatus::UnexpectedError);
        }
    } else if !zero_source {
        return Err(SiotsStatus::UnexpectedError);
    }

    // Snapshot pre-read buffers for stitching before mutating the writes.
    let prereads: Vec<(usize, u64, Vec<u8>)> = siots
        .read_chain
        .iter()
        .map(|f| (f.position, f.lba, f.data.clone()))
        .collect();

    for fruts in siots.write_chain.iter_mut() {
        let index = index_of_position_in(&siots.geo, fruts.position);
        let Some((host_lba, host_blocks)) =
            position_extent(siots.start_lba, siots.xfer_count, element, width, index)
        else {
            return Err(SiotsStatus::UnexpectedError);
        };
        if fruts.blocks != host_blocks {
            // Stitched write: start from the aligned pre-read image.
            let Some((_, _, preread)) = prereads
                .iter()
                .find(|(p, lba, _)| *p == fruts.position && *lba == fruts.lba)
            else {
                return Err(SiotsStatus::UnexpectedError);
            };
            if preread.len() != fruts.data.len() {
                return Err(SiotsStatus::UnexpectedError);
            }
            fruts.data.copy_from_slice(preread);
        }
        let head = (host_lba - fruts.lba) as usize * BLOCK_BYTES;
        let len = host_blocks as usize * BLOCK_BYTES;
        let dst = &mut fruts.data[head..head + len];
        if zero_source {
            dst.fill(0);
        } else {
            for sector in 0..host_blocks {
                let logical = logical_offset_of_physical(host_lba + sector, element, width, index);
                let src = iots.host_offset(logical);
                let at = sector as usize * BLOCK_BYTES;
                dst[at..at + BLOCK_BYTES]
                    .copy_from_slice(&iots.host_data[src..src + BLOCK_BYTES]);
            }
        }
        // Stamp the supplied range for its destination addresses.
        ctx.xor.fill_checksums(dst, host_lba);
    }
    Ok(())
}

fn index_of_position_in(geo: &crate::geometry::GeometrySnapshot, position: usize) -> usize {
    geo.positions[..geo.width].iter().position(|&p| p == position).unwrap_or(0)
}
