//! The cooperative state-machine engine.
//!
//! Every SIOTS is driven by [`run_siots`]: states execute until one suspends
//! (returning a wait reason) or the machine finishes. Nothing here blocks a
//! thread; external completions re-enter a parked machine through
//! [`resume_siots`] with an [`Event`]. [`Execution`] is the owning-object
//! surface: it carves SIOTS from an IOTS, pumps events, honors abort and
//! quiesce, and folds completions upward.

pub mod generate;
pub mod read;
pub mod verify;
pub mod write;
pub mod zero;


use tracing::{debug, warn};

use crate::config::StriperConfig;
use crate::geometry::RaidParams;
use crate::transact::eboard::{ClassifyCtx, FruEboard, FruErrorStatus};
use crate::transact::fruts::FrutsChain;
use crate::transact::iots::{Iots, IotsStatus};
use crate::transact::siots::{Siots, SiotsState, SiotsStatus, WaitReason};
use crate::transport::{BlockTransport, PageGrant, SectorRun, TransportEvent, XorLib};

/// Borrowed collaborators every state function receives.
pub struct EngineCtx<'a> {
    pub params: &'a RaidParams,
    pub config: &'a StriperConfig,
    pub transport: &'a mut dyn BlockTransport,
    pub xor: &'a dyn XorLib,
}

/// External completion delivered to a parked SIOTS.
#[derive(Debug)]
pub enum Event {
    AllocGranted { grant: Option<PageGrant> },
    ChainComplete,
    OperatorContinue { proceed: bool },
}

/// What one state function asks the driver to do next.
#[derive(Debug)]
pub enum StepResult {
    Continue,
    Waiting(WaitReason),
    Done(SiotsStatus),
}

/// Where a driven SIOTS ended up.
#[derive(Debug)]
pub enum RunState {
    Waiting(WaitReason),
    Done(SiotsStatus),
}

/// Result of driving a SIOTS, plus the pipelining signal raised on the way.
#[derive(Debug)]
pub struct RunOutcome {
    pub state: RunState,
    /// Dispatch wants the IOTS to start carving the next SIOTS now.
    pub generate_next: bool,
}

/// `run_siots` steps a machine until it suspends or finishes.
///
/// Abort and quiesce are honored at every step boundary: an aborted SIOTS
/// transitions straight to the abort completion without touching members
/// again, a quiesced one parks without erroring.
pub fn run_siots(siots: &mut Siots, iots: &mut Iots, ctx: &mut EngineCtx<'_>) -> RunOutcome {
    loop {
        if siots.is_finished() {
            let status = siots.error.unwrap_or(SiotsStatus::Success);
            return RunOutcome {
                state: RunState::Done(status),
                generate_next: std::mem::take(&mut siots.signal_generate_next),
            };
        }
        if iots.flags.abort || siots.flags.aborted {
            siots.flags.aborted = true;
            siots.grant = None;
            siots.set_error(SiotsStatus::Aborted);
            siots.state = SiotsState::Finished;
            continue;
        }
        if iots.flags.quiesce {
            siots.flags.quiesced = true;
            siots.wait_reason = Some(WaitReason::Quiesce);
            return RunOutcome {
                state: RunState::Waiting(WaitReason::Quiesce),
                generate_next: std::mem::take(&mut siots.signal_generate_next),
            };
        }
        siots.flags.quiesced = false;

        let step = match siots.state {
            SiotsState::Generate => generate::step(siots, iots, ctx),
            SiotsState::Read(state) => read::step(state, siots, iots, ctx),
            SiotsState::Write(state) => write::step(state, siots, iots, ctx),
            SiotsState::Verify(state) => verify::step(state, siots, iots, ctx),
            SiotsState::Zero(state) => zero::step(state, siots, iots, ctx),
            SiotsState::CheckZeroed(state) => zero::check_zeroed_step(state, siots, iots, ctx),
            SiotsState::Finished => unreachable!("finished handled above"),
        };
        match step {
            StepResult::Continue => {}
            StepResult::Waiting(reason) => {
                siots.wait_reason = Some(reason);
                return RunOutcome {
                    state: RunState::Waiting(reason),
                    generate_next: std::mem::take(&mut siots.signal_generate_next),
                };
            }
            StepResult::Done(status) => {
                siots.set_error(status);
                siots.state = SiotsState::Finished;
            }
        }
    }
}

/// Deliver an event to the SIOTS (or the nested SIOTS actually waiting on
/// it) and clear the wait.
fn apply_event(siots: &mut Siots, event: Event) {
    if siots.wait_reason == Some(WaitReason::NestedSiots) {
        if let Some(child) = siots.child.as_deref_mut() {
            apply_event(child, event);
        }
        siots.wait_reason = None;
        return;
    }
    match event {
        Event::AllocGranted { grant } => {
            siots.alloc_failed = grant.is_none();
            siots.grant = grant;
        }
        Event::ChainComplete => {}
        Event::OperatorContinue { proceed } => siots.operator_decision = Some(proceed),
    }
    siots.wait_reason = None;
}

/// `resume_siots` re-enters a parked machine with an external completion.
pub fn resume_siots(
    siots: &mut Siots,
    event: Event,
    iots: &mut Iots,
    ctx: &mut EngineCtx<'_>,
) -> RunOutcome {
    apply_event(siots, event);
    run_siots(siots, iots, ctx)
}

/// The wait the whole (possibly nested) SIOTS is actually parked on.
#[must_use]
pub fn effective_wait(siots: &Siots) -> Option<WaitReason> {
    match siots.wait_reason {
        Some(WaitReason::NestedSiots) => siots.child.as_deref().and_then(effective_wait),
        other => other,
    }
}

/// Which chain of the SIOTS an evaluation refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChainSel {
    Read,
    Write,
}

impl ChainSel {
    fn chain_mut(self, siots: &mut Siots) -> &mut FrutsChain {
        match self {
            Self::Read => &mut siots.read_chain,
            Self::Write => &mut siots.write_chain,
        }
    }
}

/// What the shared error handler decided.
#[derive(Debug)]
pub enum ErrorDisposition {
    /// Classification was clean (possibly with a soft hint); keep going.
    Proceed,
    Done(SiotsStatus),
    Waiting(WaitReason),
    /// The erroring subset was reissued; wait for the chain again.
    Retried,
    /// Media/drop errors: the caller owns the invalidate-or-recover policy.
    CallerPolicy,
}

/// `classify_chain` builds the error board for a chain and classifies it
/// against the request context.
#[must_use]
pub fn classify_chain(
    siots: &Siots,
    iots: &Iots,
    ctx: &EngineCtx<'_>,
    sel: ChainSel,
) -> (FruEboard, FruErrorStatus) {
    let chain = match sel {
        ChainSel::Read => &siots.read_chain,
        ChainSel::Write => &siots.write_chain,
    };
    let (board, ok) = FruEboard::build(chain);
    if !ok {
        return (board, FruErrorStatus::Error);
    }
    let classify_ctx = ClassifyCtx {
        raid_type_is_mirror_backed: ctx.params.raid_type.is_mirror_backed(),
        aborted: iots.flags.abort || siots.flags.aborted,
        aborted_for_shutdown: iots.flags.abort_for_shutdown,
        quiescing: iots.flags.quiesce,
        background_op: iots.class.is_background(),
    };
    (board, board.classify(&classify_ctx))
}

/// `handle_chain_status` is the shared policy for every machine's evaluate
/// state. Only the media-error recovery decision stays with the caller.
pub fn handle_chain_status(
    siots: &mut Siots,
    iots: &mut Iots,
    ctx: &mut EngineCtx<'_>,
    board: &FruEboard,
    status: FruErrorStatus,
    sel: ChainSel,
) -> ErrorDisposition {
    match status {
        FruErrorStatus::Success => ErrorDisposition::Proceed,
        FruErrorStatus::ReduceQdSoft => {
            iots.reduce_qdepth_hint = true;
            siots.soft_status = Some(SiotsStatus::ReduceQdSoft);
            ErrorDisposition::Proceed
        }
        FruErrorStatus::NotPreferred => ErrorDisposition::Done(SiotsStatus::NotPreferred),
        FruErrorStatus::ReduceQdHard => {
            iots.reduce_qdepth_hint = true;
            ErrorDisposition::Done(SiotsStatus::ReduceQdHard)
        }
        FruErrorStatus::Shutdown => ErrorDisposition::Done(SiotsStatus::Shutdown),
        FruErrorStatus::Dead => ErrorDisposition::Done(SiotsStatus::IoFailed),
        FruErrorStatus::Aborted => ErrorDisposition::Done(SiotsStatus::Aborted),
        FruErrorStatus::BadCrc => ErrorDisposition::Done(SiotsStatus::WriteCrcError),
        FruErrorStatus::Waiting => {
            // A retry parked by a quiesce resumes on unquiesce; everything
            // else waits for the operator/monitor.
            if iots.flags.quiesce {
                ErrorDisposition::Waiting(WaitReason::Quiesce)
            } else {
                ErrorDisposition::Waiting(WaitReason::OperatorDecision)
            }
        }
        FruErrorStatus::Retry => {
            if siots.retry_count == 0 {
                warn!(
                    lba = siots.start_lba,
                    blocks = siots.xfer_count,
                    "retries exhausted, failing request"
                );
                return ErrorDisposition::Done(SiotsStatus::IoFailed);
            }
            siots.retry_count -= 1;
            let chain = sel.chain_mut(siots);
            chain.reset_positions(board.retry_bitmap);
            debug!(bitmap = board.retry_bitmap, "reissuing retryable member subset");
            if ctx.transport.dispatch_chain(chain) {
                ErrorDisposition::Retried
            } else {
                ErrorDisposition::Done(SiotsStatus::UnexpectedError)
            }
        }
        FruErrorStatus::Error => ErrorDisposition::CallerPolicy,
    }
}

/// Resolve a pending operator decision at an evaluate state. `None` means no
/// decision is pending and evaluation proceeds normally.
pub fn operator_resolution(
    siots: &mut Siots,
    ctx: &mut EngineCtx<'_>,
    sel: ChainSel,
) -> Option<StepResult> {
    let proceed = siots.operator_decision.take()?;
    if !proceed {
        return Some(StepResult::Done(SiotsStatus::IoFailed));
    }
    // The member may have come back; reissue the dead subset and look again.
    let chain = sel.chain_mut(siots);
    let dead = chain.bitmap_where(|r| r == crate::transact::fruts::FruResult::Dead);
    if dead == 0 {
        return None;
    }
    chain.reset_positions(dead);
    if ctx.transport.dispatch_chain(chain) {
        Some(StepResult::Waiting(WaitReason::ChainCompletion))
    } else {
        Some(StepResult::Done(SiotsStatus::UnexpectedError))
    }
}

/// Build checksum-library sector runs from the chain members that actually
/// transferred data.
#[must_use]
pub fn sector_runs(chain: &FrutsChain) -> Vec<SectorRun<'_>> {
    use crate::transact::fruts::FruResult;
    chain
        .active()
        .filter(|f| {
            f.result.is_some_and(|r| {
                matches!(
                    r,
                    FruResult::Success
                        | FruResult::SoftMedia
                        | FruResult::CongestedSoft
                        | FruResult::Zeroed
                )
            })
        })
        .filter(|f| !f.data.is_empty())
        .map(|f| SectorRun { position: f.position, seed_lba: f.lba, data: &f.data })
        .collect()
}

/// Outcome of driving a whole IOTS.
#[derive(Debug)]
pub enum EngineOutcome {
    Complete(IotsStatus),
    /// At least one SIOTS is parked on an operator decision or a quiesce;
    /// resume with [`Execution::resume_operator`] or [`Execution::unquiesce`].
    Parked,
}

/// The owning-object surface: carves SIOTS from the IOTS, drives them, pumps
/// transport events and folds completions upward.
pub struct Execution<'a> {
    pub iots: Iots,
    active: Vec<Siots>,
    params: &'a RaidParams,
    config: &'a StriperConfig,
    transport: &'a mut dyn BlockTransport,
    xor: &'a dyn XorLib,
    pipeline_credit: usize,
    halt: bool,
}

impl<'a> Execution<'a> {
    pub fn new(
        iots: Iots,
        params: &'a RaidParams,
        config: &'a StriperConfig,
        transport: &'a mut dyn BlockTransport,
        xor: &'a dyn XorLib,
    ) -> Self {
        Self {
            iots,
            active: Vec::new(),
            params,
            config,
            transport,
            xor,
            pipeline_credit: 0,
            halt: false,
        }
    }

    /// Drive the request until it completes or parks.
    pub fn run(&mut self) -> EngineOutcome {
        loop {
            while !self.halt
                && self.iots.blocks_remaining() > 0
                && (self.active.is_empty() || self.pipeline_credit > 0)
            {
                self.pipeline_credit = self.pipeline_credit.saturating_sub(1);
                self.spawn_and_run();
            }
            let progressed = self.pump();
            if self.active.is_empty() {
                if self.halt || self.iots.blocks_remaining() == 0 {
                    let status = self.iots.status().unwrap_or(IotsStatus::Success);
                    return EngineOutcome::Complete(status);
                }
                continue;
            }
            if !progressed {
                return EngineOutcome::Parked;
            }
        }
    }

    /// Deliver the operator's continue/fail decision to every SIOTS parked
    /// on one, then keep driving.
    pub fn resume_operator(&mut self, proceed: bool) -> EngineOutcome {
        {
            let Self { iots, active, params, config, transport, xor, pipeline_credit, halt } =
                self;
            let mut ctx =
                EngineCtx { params, config, transport: &mut **transport, xor: &**xor };
            let mut i = 0;
            while i < active.len() {
                if effective_wait(&active[i]) == Some(WaitReason::OperatorDecision) {
                    let outcome = resume_siots(
                        &mut active[i],
                        Event::OperatorContinue { proceed },
                        iots,
                        &mut ctx,
                    );
                    if Self::absorb(iots, active, i, outcome, pipeline_credit, halt) {
                        continue;
                    }
                }
                i += 1;
            }
        }
        self.run()
    }

    pub fn abort(&mut self) {
        self.iots.request_abort();
    }

    pub fn quiesce(&mut self) {
        self.iots.request_quiesce();
    }

    /// Clear a quiesce and keep driving the parked machines.
    pub fn unquiesce(&mut self) -> EngineOutcome {
        fn clear(siots: &mut Siots) {
            if siots.wait_reason == Some(WaitReason::Quiesce) {
                siots.wait_reason = None;
            }
            if let Some(child) = siots.child.as_deref_mut() {
                clear(child);
            }
        }
        self.iots.clear_quiesce();
        for siots in &mut self.active {
            clear(siots);
        }
        self.run()
    }

    #[must_use]
    pub fn into_iots(self) -> Iots {
        self.iots
    }

    fn spawn_and_run(&mut self) {
        let Self { iots, active, params, config, transport, xor, pipeline_credit, halt } = self;
        let mut ctx = EngineCtx { params, config, transport: &mut **transport, xor: &**xor };
        let mut siots = Siots::carve(iots);
        let outcome = run_siots(&mut siots, iots, &mut ctx);
        active.push(siots);
        let idx = active.len() - 1;
        let _ = Self::absorb(iots, active, idx, outcome, pipeline_credit, halt);
    }

    /// Fold a run outcome into executor state. Returns true when the SIOTS
    /// at `idx` finished and was removed.
    fn absorb(
        iots: &mut Iots,
        active: &mut Vec<Siots>,
        idx: usize,
        outcome: RunOutcome,
        pipeline_credit: &mut usize,
        halt: &mut bool,
    ) -> bool {
        if outcome.generate_next {
            *pipeline_credit += 1;
        }
        match outcome.state {
            RunState::Waiting(_) => false,
            RunState::Done(status) => {
                let iots_status = status.to_iots_status();
                iots.merge_status(iots_status);
                if !iots_status.is_success() {
                    // First failure stops further carving and aborts the
                    // remaining in-flight SIOTS.
                    *halt = true;
                    for other in active.iter_mut() {
                        other.flags.aborted = true;
                    }
                }
                active.remove(idx);
                true
            }
        }
    }

    /// Resolve whatever each active SIOTS is waiting on. Returns false when
    /// nothing could be advanced (everything needs the operator).
    fn pump(&mut self) -> bool {
        let Self { iots, active, params, config, transport, xor, pipeline_credit, halt } = self;
        let mut progressed_any = false;
        loop {
            let mut progressed = false;
            let mut i = 0;
            while i < active.len() {
                let abort_pending = iots.flags.abort;
                let wait = effective_wait(&active[i]);
                // A cleared wait (unquiesce) leaves the machine runnable.
                let runnable = wait.is_none() && !active[i].is_finished();
                let event = match wait {
                    Some(WaitReason::ChainCompletion) => Some(Event::ChainComplete),
                    Some(WaitReason::MemoryAllocation) => match transport.poll_event() {
                        Some(TransportEvent::AllocGranted { grant }) => {
                            Some(Event::AllocGranted { grant })
                        }
                        None => None,
                    },
                    Some(
                        WaitReason::OperatorDecision | WaitReason::Quiesce | WaitReason::NestedSiots,
                    )
                    | None => None,
                };
                if event.is_some() || abort_pending || runnable {
                    let mut ctx =
                        EngineCtx { params, config, transport: &mut **transport, xor: &**xor };
                    let outcome = match event {
                        Some(event) => resume_siots(&mut active[i], event, iots, &mut ctx),
                        None => run_siots(&mut active[i], iots, &mut ctx),
                    };
                    progressed = true;
                    progressed_any = true;
                    if Self::absorb(iots, active, i, outcome, pipeline_credit, halt) {
                        continue;
                    }
                }
                i += 1;
            }
            if !progressed {
                break;
            }
        }
        progressed_any
    }
}
