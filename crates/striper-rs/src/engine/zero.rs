//! The zero and check-zeroed state machines.
//!
//! Zero dispatches one write-same per touched position. Degraded positions
//! are marked no-op before dispatch: zeroing a missing member is a rebuild
//! concern, not an immediate failure.


use tracing::{debug, warn};

use crate::BLOCK_DATA_BYTES;
use crate::engine::{
    ChainSel, EngineCtx, ErrorDisposition, StepResult, classify_chain, handle_chain_status,
    operator_resolution,
};
use crate::resource;
use crate::transact::fruts::FruResult;
use crate::transact::iots::{Iots, MediaQualifier};
use crate::transact::siots::{
    CheckZeroedState, Siots, SiotsState, SiotsStatus, WaitReason, ZeroState,
};
use crate::transport::AllocOutcome;

pub fn step(
    state: ZeroState,
    siots: &mut Siots,
    iots: &mut Iots,
    ctx: &mut EngineCtx<'_>,
) -> StepResult {
    match state {
        ZeroState::Alloc => {
            let plan = resource::plan_for(siots, ctx.params, ctx.config);
            match ctx.transport.allocate_memory(plan.budget.pages) {
                AllocOutcome::Granted(grant) => {
                    siots.grant = Some(grant);
                    siots.state = SiotsState::Zero(ZeroState::Setup);
                    StepResult::Continue
                }
                AllocOutcome::Pending => {
                    siots.state = SiotsState::Zero(ZeroState::Setup);
                    StepResult::Waiting(WaitReason::MemoryAllocation)
                }
                AllocOutcome::Error => StepResult::Done(SiotsStatus::UnexpectedError),
            }
        }
        ZeroState::Setup => {
            if siots.alloc_failed {
                return StepResult::Done(SiotsStatus::UnexpectedError);
            }
            let Some(mut grant) = siots.grant.take() else {
                return StepResult::Done(SiotsStatus::UnexpectedError);
            };
            let plan = resource::plan_for(siots, ctx.params, ctx.config);
            if let Err(err) = resource::setup_resources(siots, &plan, &mut grant) {
                warn!(%err, "zero resource setup failed");
                return StepResult::Done(SiotsStatus::UnexpectedError);
            }
            // Seed each pattern block; missing members are skipped, their
            // content is a deferred rebuild concern.
            let mut degraded = 0u16;
            for fruts in siots.write_chain.iter_mut() {
                fruts.data[..BLOCK_DATA_BYTES].fill(0);
                ctx.xor.fill_checksums(&mut fruts.data, fruts.lba);
                if ctx.transport.position_degraded(fruts.position) {
                    degraded |= 1 << fruts.position;
                }
            }
            siots.degraded_positions = degraded;
            for position in 0..ctx.params.width {
                if degraded & (1 << position) != 0 {
                    siots.write_chain.set_noop(position);
                }
            }
            siots.state = SiotsState::Zero(ZeroState::Dispatch);
            StepResult::Continue
        }
        ZeroState::Dispatch => {
            if siots.write_chain.active().next().is_none() {
                // Every touched position is degraded; nothing to issue.
                debug!(lba = siots.start_lba, "zero fully degraded, deferring to rebuild");
                return StepResult::Done(siots.success_status());
            }
            if !ctx.transport.dispatch_chain(&mut siots.write_chain) {
                return StepResult::Done(SiotsStatus::UnexpectedError);
            }
            siots.wait_count = siots.write_chain.outstanding();
            siots.state = SiotsState::Zero(ZeroState::Evaluate);
            StepResult::Waiting(WaitReason::ChainCompletion)
        }
        ZeroState::Evaluate => {
            if let Some(resolution) = operator_resolution(siots, ctx, ChainSel::Write) {
                return resolution;
            }
            let (board, status) = classify_chain(siots, iots, ctx, ChainSel::Write);
            match handle_chain_status(siots, iots, ctx, &board, status, ChainSel::Write) {
                ErrorDisposition::Proceed => StepResult::Done(siots.success_status()),
                ErrorDisposition::Done(status) => StepResult::Done(status),
                ErrorDisposition::Waiting(reason) => StepResult::Waiting(reason),
                ErrorDisposition::Retried => StepResult::Waiting(WaitReason::ChainCompletion),
                ErrorDisposition::CallerPolicy => {
                    if board.drop_count > 0 {
                        return StepResult::Done(SiotsStatus::Dropped);
                    }
                    warn!(bitmap = board.hard_media_bitmap, "media error zeroing");
                    StepResult::Done(SiotsStatus::MediaError {
                        lba: siots.start_lba,
                        qualifier: MediaQualifier::DataLost,
                    })
                }
            }
        }
    }
}

pub fn check_zeroed_step(
    state: CheckZeroedState,
    siots: &mut Siots,
    iots: &mut Iots,
    ctx: &mut EngineCtx<'_>,
) -> StepResult {
    match state {
        CheckZeroedState::Alloc => {
            let plan = resource::plan_for(siots, ctx.params, ctx.config);
            match ctx.transport.allocate_memory(plan.budget.pages) {
                AllocOutcome::Granted(grant) => {
                    siots.grant = Some(grant);
                    siots.state = SiotsState::CheckZeroed(CheckZeroedState::Setup);
                    StepResult::Continue
                }
                AllocOutcome::Pending => {
                    siots.state = SiotsState::CheckZeroed(CheckZeroedState::Setup);
                    StepResult::Waiting(WaitReason::MemoryAllocation)
                }
                AllocOutcome::Error => StepResult::Done(SiotsStatus::UnexpectedError),
            }
        }
        CheckZeroedState::Setup => {
            if siots.alloc_failed {
                return StepResult::Done(SiotsStatus::UnexpectedError);
            }
            let Some(mut grant) = siots.grant.take() else {
                return StepResult::Done(SiotsStatus::UnexpectedError);
            };
            let plan = resource::plan_for(siots, ctx.params, ctx.config);
            if let Err(err) = resource::setup_resources(siots, &plan, &mut grant) {
                warn!(%err, "check-zeroed resource setup failed");
                return StepResult::Done(SiotsStatus::UnexpectedError);
            }
            siots.state = SiotsState::CheckZeroed(CheckZeroedState::Dispatch);
            StepResult::Continue
        }
        CheckZeroedState::Dispatch => {
            if !ctx.transport.dispatch_chain(&mut siots.read_chain) {
                return StepResult::Done(SiotsStatus::UnexpectedError);
            }
            siots.wait_count = siots.read_chain.outstanding();
            siots.state = SiotsState::CheckZeroed(CheckZeroedState::Evaluate);
            StepResult::Waiting(WaitReason::ChainCompletion)
        }
        CheckZeroedState::Evaluate => {
            if let Some(resolution) = operator_resolution(siots, ctx, ChainSel::Read) {
                return resolution;
            }
            let (board, status) = classify_chain(siots, iots, ctx, ChainSel::Read);
            match handle_chain_status(siots, iots, ctx, &board, status, ChainSel::Read) {
                ErrorDisposition::Proceed => {
                    let zeroed = siots.read_chain.active().all(|f| {
                        f.result == Some(FruResult::Zeroed)
                            || f.data
                                .chunks_exact(crate::BLOCK_BYTES)
                                .all(|s| s[..BLOCK_DATA_BYTES].iter().all(|&b| b == 0))
                    });
                    iots.check_zeroed_result = Some(zeroed);
                    StepResult::Done(siots.success_status())
                }
                ErrorDisposition::Done(status) => StepResult::Done(status),
                ErrorDisposition::Waiting(reason) => StepResult::Waiting(reason),
                ErrorDisposition::Retried => StepResult::Waiting(WaitReason::ChainCompletion),
                ErrorDisposition::CallerPolicy => {
                    if board.drop_count > 0 {
                        return StepResult::Done(SiotsStatus::Dropped);
                    }
                    StepResult::Done(SiotsStatus::MediaError {
                        lba: siots.start_lba,
                        qualifier: MediaQualifier::DataLost,
                    })
                }
            }
        }
    }
}
