//! The RAID-0 read state machine.
//!
//! Allocate, dispatch every member read as one chain, evaluate, verify
//! checksums and deliver the data. Reads never recover in line: a hard media
//! or checksum error invalidates and reports; repair belongs to the write
//! and verify paths.


use tracing::warn;

use crate::BLOCK_BYTES;
use crate::engine::{
    ChainSel, EngineCtx, ErrorDisposition, StepResult, classify_chain, handle_chain_status,
    operator_resolution, sector_runs,
};
use crate::geometry::{PositionMask, logical_offset_of_physical};
use crate::resource;
use crate::transact::fruts::FruResult;
use crate::transact::iots::{Iots, MediaQualifier};
use crate::transact::siots::{ReadState, Siots, SiotsState, SiotsStatus, WaitReason};
use crate::transport::{AllocOutcome, InvalidateReason, XorStatus};

/// Data index serving a physical position in this SIOTS's geometry.
pub(crate) fn index_of_position(siots: &Siots, position: usize) -> usize {
    siots.geo.positions[..siots.geo.width]
        .iter()
        .position(|&p| p == position)
        .unwrap_or(0)
}

/// Lowest logical lba represented by the recorded member error, for
/// reporting.
pub(crate) fn lowest_logical_error_lba(
    siots: &Siots,
    sel: ChainSel,
    width: usize,
    element: u64,
) -> u64 {
    let member_lba = siots.media_error_lba.unwrap_or(siots.parity_start);
    let chain = match sel {
        ChainSel::Read => &siots.read_chain,
        ChainSel::Write => &siots.write_chain,
    };
    let index = siots
        .media_error_position
        .or_else(|| {
            chain
                .iter()
                .find(|f| {
                    f.result.is_some_and(|r| {
                        matches!(r, FruResult::HardMedia | FruResult::MediaNoRemap)
                    }) && f.lba <= member_lba
                        && member_lba < f.lba + f.blocks
                })
                .map(|f| f.position)
        })
        .map_or(siots.geo.start_index, |p| index_of_position(siots, p));
    logical_offset_of_physical(member_lba, element, width, index)
}

/// Record the lowest member (lba, position) carrying a hard media error on
/// a chain.
pub(crate) fn record_media_error(siots: &mut Siots, sel: ChainSel) {
    let chain = match sel {
        ChainSel::Read => &siots.read_chain,
        ChainSel::Write => &siots.write_chain,
    };
    let worst = chain
        .active()
        .filter(|f| {
            f.result
                .is_some_and(|r| matches!(r, FruResult::HardMedia | FruResult::MediaNoRemap))
        })
        .map(|f| (f.lba, f.position))
        .min();
    if let Some((lba, position)) = worst {
        siots.media_error_lba = Some(lba);
        siots.media_error_position = Some(position);
    }
}

/// Invalidate the media content behind positions that took a hard media
/// error: best effort, the completion is already a media error.
pub(crate) fn invalidate_media_positions(
    siots: &mut Siots,
    ctx: &mut EngineCtx<'_>,
    bitmap: PositionMask,
    sel: ChainSel,
) {
    let mut patch = crate::transact::fruts::FrutsChain::new();
    let chain = match sel {
        ChainSel::Read => &siots.read_chain,
        ChainSel::Write => &siots.write_chain,
    };
    for fruts in chain.active() {
        if bitmap & (1 << fruts.position) == 0 {
            continue;
        }
        let mut data = vec![0u8; fruts.blocks as usize * BLOCK_BYTES];
        ctx.xor.invalidate_sectors(&mut data, fruts.lba, InvalidateReason::MediaError);
        let mut replacement = crate::transact::fruts::Fruts::from_info(
            &crate::transact::fruts::FruInfo::new(fruts.position, fruts.lba, fruts.blocks),
            crate::transact::fruts::FruOpcode::Write,
        );
        replacement.data = data;
        patch.push(replacement);
    }
    if !patch.is_empty() {
        let _ = ctx.transport.dispatch_chain(&mut patch);
    }
}

pub fn step(
    state: ReadState,
    siots: &mut Siots,
    iots: &mut Iots,
    ctx: &mut EngineCtx<'_>,
) -> StepResult {
    match state {
        ReadState::Alloc => {
            let plan = resource::plan_for(siots, ctx.params, ctx.config);
            match ctx.transport.allocate_memory(plan.budget.pages) {
                AllocOutcome::Granted(grant) => {
                    siots.grant = Some(grant);
                    siots.state = SiotsState::Read(ReadState::Setup);
                    StepResult::Continue
                }
                AllocOutcome::Pending => {
                    // Resumed by the allocator; setup re-runs the same
                    // calculation against the granted pages.
                    siots.state = SiotsState::Read(ReadState::Setup);
                    StepResult::Waiting(WaitReason::MemoryAllocation)
                }
                AllocOutcome::Error => StepResult::Done(SiotsStatus::UnexpectedError),
            }
        }
        ReadState::Setup => {
            if siots.alloc_failed {
                return StepResult::Done(SiotsStatus::UnexpectedError);
            }
            let Some(mut grant) = siots.grant.take() else {
                return StepResult::Done(SiotsStatus::UnexpectedError);
            };
            let plan = resource::plan_for(siots, ctx.params, ctx.config);
            if let Err(err) = resource::setup_resources(siots, &plan, &mut grant) {
                warn!(%err, "read resource setup failed");
                return StepResult::Done(SiotsStatus::UnexpectedError);
            }
            siots.state = SiotsState::Read(ReadState::Dispatch);
            StepResult::Continue
        }
        ReadState::Dispatch => {
            if !ctx.transport.dispatch_chain(&mut siots.read_chain) {
                return StepResult::Done(SiotsStatus::UnexpectedError);
            }
            siots.wait_count = siots.read_chain.outstanding();
            // Let the IOTS carve the next sub-request while this chain is in
            // flight; single-region machines never pipeline.
            if !siots.flags.single_region_mode {
                siots.signal_generate_next = true;
            }
            siots.state = SiotsState::Read(ReadState::Evaluate);
            StepResult::Waiting(WaitReason::ChainCompletion)
        }
        ReadState::Evaluate => {
            if let Some(resolution) = operator_resolution(siots, ctx, ChainSel::Read) {
                return resolution;
            }
            let (board, status) = classify_chain(siots, iots, ctx, ChainSel::Read);
            match handle_chain_status(siots, iots, ctx, &board, status, ChainSel::Read) {
                ErrorDisposition::Proceed => {
                    siots.state = SiotsState::Read(ReadState::ChecksumCheck);
                    StepResult::Continue
                }
                ErrorDisposition::Done(status) => StepResult::Done(status),
                ErrorDisposition::Waiting(reason) => StepResult::Waiting(reason),
                ErrorDisposition::Retried => StepResult::Waiting(WaitReason::ChainCompletion),
                ErrorDisposition::CallerPolicy => {
                    if board.drop_count > 0 {
                        return StepResult::Done(SiotsStatus::Dropped);
                    }
                    record_media_error(siots, ChainSel::Read);
                    let lba = lowest_logical_error_lba(
                        siots,
                        ChainSel::Read,
                        ctx.params.width,
                        ctx.params.element_size,
                    );
                    if ctx.params.raid_type.is_mirror_backed() {
                        // The mirror object already recovered or invalidated;
                        // just surface the completion.
                        return StepResult::Done(SiotsStatus::MediaError {
                            lba,
                            qualifier: MediaQualifier::DataLost,
                        });
                    }
                    warn!(lba, bitmap = board.hard_media_bitmap, "read media error, invalidating");
                    invalidate_media_positions(siots, ctx, board.hard_media_bitmap, ChainSel::Read);
                    StepResult::Done(SiotsStatus::MediaError {
                        lba,
                        qualifier: MediaQualifier::DataLost,
                    })
                }
            }
        }
        ReadState::ChecksumCheck => {
            let report = {
                let runs = sector_runs(&siots.read_chain);
                ctx.xor.check_checksums(&runs, true, true)
            };
            match report.status() {
                XorStatus::NoError => {
                    siots.state = SiotsState::Read(ReadState::PostCheck);
                    StepResult::Continue
                }
                XorStatus::BadMemory => StepResult::Done(SiotsStatus::UnexpectedError),
                XorStatus::ChecksumError => {
                    siots.media_error_lba = report.first_error_lba;
                    siots.media_error_position = report.first_error_position;
                    let lba = lowest_logical_error_lba(
                        siots,
                        ChainSel::Read,
                        ctx.params.width,
                        ctx.params.element_size,
                    );
                    // No in-line recovery on pure reads; report and surface.
                    let qualifier = if report.has_fresh_corruption() {
                        warn!(lba, "checksum error on read");
                        MediaQualifier::ChecksumError
                    } else {
                        MediaQualifier::Invalidated
                    };
                    StepResult::Done(SiotsStatus::MediaError { lba, qualifier })
                }
            }
        }
        ReadState::PostCheck => {
            deliver_to_host(siots, iots, ctx);
            StepResult::Done(siots.success_status())
        }
    }
}

/// Copy completed member reads into the host buffer.
fn deliver_to_host(siots: &Siots, iots: &mut Iots, ctx: &EngineCtx<'_>) {
    if iots.host_data.is_empty() {
        return;
    }
    let element = ctx.params.element_size;
    let width = ctx.params.width;
    let end = iots.lba + iots.blocks;
    for fruts in siots.read_chain.active() {
        let index = index_of_position(siots, fruts.position);
        for sector in 0..fruts.blocks {
            let logical = logical_offset_of_physical(fruts.lba + sector, element, width, index);
            if logical < iots.lba || logical >= end {
                continue;
            }
            let src = sector as usize * BLOCK_BYTES;
            let dst = iots.host_offset(logical);
            iots.host_data[dst..dst + BLOCK_BYTES]
                .copy_from_slice(&fruts.data[src..src + BLOCK_BYTES]);
        }
    }
}
