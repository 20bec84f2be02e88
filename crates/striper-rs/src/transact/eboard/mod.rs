//! Error board: chain-outcome aggregation and classification.
//!
//! The board is rebuilt from scratch every time a dispatched chain is
//! evaluated and discarded as soon as the machine has transitioned; it is
//! never persisted across states.


use tracing::warn;

use crate::geometry::{PositionMask, RaidType};
use crate::transact::fruts::{FruResult, FrutsChain};

/// Collective outcome of one evaluated FRUTS chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FruErrorStatus {
    Success,
    Dead,
    Shutdown,
    Retry,
    Aborted,
    Waiting,
    BadCrc,
    NotPreferred,
    ReduceQdHard,
    ReduceQdSoft,
    Error,
}

/// Request context consulted during classification.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClassifyCtx {
    pub raid_type_is_mirror_backed: bool,
    pub aborted: bool,
    pub aborted_for_shutdown: bool,
    pub quiescing: bool,
    /// Background, metadata or monitor-initiated requests complete dead
    /// members immediately instead of waiting for an operator decision.
    pub background_op: bool,
}

impl ClassifyCtx {
    #[must_use]
    pub fn for_raid_type(raid_type: RaidType) -> Self {
        Self {
            raid_type_is_mirror_backed: raid_type.is_mirror_backed(),
            ..Self::default()
        }
    }
}

/// Per-category counts and position bitmasks for one chain evaluation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FruEboard {
    pub dead_count: u32,
    pub dead_bitmap: PositionMask,
    pub retry_count: u32,
    pub retry_bitmap: PositionMask,
    pub abort_count: u32,
    pub hard_media_count: u32,
    pub hard_media_bitmap: PositionMask,
    pub menr_count: u32,
    pub menr_bitmap: PositionMask,
    pub soft_media_count: u32,
    pub soft_media_bitmap: PositionMask,
    pub drop_count: u32,
    pub drop_bitmap: PositionMask,
    pub bad_crc_count: u32,
    pub not_preferred_count: u32,
    pub reduce_qdepth_hard_count: u32,
    pub reduce_qdepth_soft_count: u32,
    pub timeout_count: u32,
    pub zeroed_count: u32,
    pub zeroed_bitmap: PositionMask,
    pub unexpected_count: u32,
}

impl FruEboard {
    /// `build` scans a completed chain and accumulates one entry per active
    /// member.
    ///
    /// # Returns
    /// The board, plus `false` if any member carried a completion the board
    /// cannot account for (an incomplete active member); the caller treats
    /// that as an invariant violation.
    #[must_use]
    pub fn build(chain: &FrutsChain) -> (Self, bool) {
        let mut board = Self::default();
        let mut ok = true;
        for fruts in chain.active() {
            let mask = 1 << fruts.position;
            match fruts.result {
                Some(FruResult::Success) => {}
                Some(FruResult::SoftMedia) => {
                    board.soft_media_count += 1;
                    board.soft_media_bitmap |= mask;
                }
                Some(FruResult::Zeroed) => {
                    board.zeroed_count += 1;
                    board.zeroed_bitmap |= mask;
                }
                Some(FruResult::HardMedia) => {
                    board.hard_media_count += 1;
                    board.hard_media_bitmap |= mask;
                }
                Some(FruResult::MediaNoRemap) => {
                    // A no-remap media error is still a hard media error;
                    // the dedicated bitmap only refines reporting.
                    board.menr_count += 1;
                    board.menr_bitmap |= mask;
                    board.hard_media_count += 1;
                    board.hard_media_bitmap |= mask;
                }
                Some(FruResult::Dead) => {
                    if board.dead_bitmap & mask == 0 {
                        board.dead_bitmap |= mask;
                        board.dead_count += 1;
                    }
                    warn!(
                        position = fruts.position,
                        lba = fruts.lba,
                        blocks = fruts.blocks,
                        "non-retryable member error"
                    );
                }
                Some(FruResult::Retryable) => {
                    if board.retry_bitmap & mask == 0 {
                        board.retry_bitmap |= mask;
                        board.retry_count += 1;
                    }
                    warn!(
                        position = fruts.position,
                        lba = fruts.lba,
                        blocks = fruts.blocks,
                        "retryable member error"
                    );
                }
                Some(FruResult::Timeout) => {
                    // An expired member op is reissued like a retryable error.
                    board.timeout_count += 1;
                    if board.retry_bitmap & mask == 0 {
                        board.retry_bitmap |= mask;
                        board.retry_count += 1;
                    }
                }
                Some(FruResult::Dropped) => {
                    board.drop_count += 1;
                    board.drop_bitmap |= mask;
                }
                Some(FruResult::Aborted) => board.abort_count += 1,
                Some(FruResult::BadCrc) => board.bad_crc_count += 1,
                Some(FruResult::NotPreferred) => board.not_preferred_count += 1,
                Some(FruResult::CongestedHard) => board.reduce_qdepth_hard_count += 1,
                Some(FruResult::CongestedSoft) => board.reduce_qdepth_soft_count += 1,
                None => {
                    board.unexpected_count += 1;
                    ok = false;
                }
            }
        }
        (board, ok)
    }

    /// `classify` maps the board to the single collective outcome.
    ///
    /// Dominance order: aborted-for-shutdown beats everything, then abort,
    /// bad CRC, not-preferred, hard queue-depth reduction, media/drop errors,
    /// clean success (possibly with a soft queue-depth hint), dead members
    /// and finally retryable members.
    #[must_use]
    pub fn classify(&self, ctx: &ClassifyCtx) -> FruErrorStatus {
        if ctx.aborted_for_shutdown {
            // The owning object is tearing down; park until the monitor says
            // what this request becomes.
            return FruErrorStatus::Waiting;
        }
        if ctx.aborted || self.abort_count > 0 {
            return FruErrorStatus::Aborted;
        }
        if self.bad_crc_count > 0 {
            return FruErrorStatus::BadCrc;
        }
        if self.not_preferred_count > 0 {
            return FruErrorStatus::NotPreferred;
        }
        if self.reduce_qdepth_hard_count > 0 {
            return FruErrorStatus::ReduceQdHard;
        }
        if self.hard_media_count > 0 || self.drop_count > 0 {
            return FruErrorStatus::Error;
        }
        if self.dead_count == 0 && self.retry_count == 0 {
            if self.reduce_qdepth_soft_count > 0 {
                return FruErrorStatus::ReduceQdSoft;
            }
            return FruErrorStatus::Success;
        }
        if self.dead_count > 0 {
            if ctx.background_op {
                return FruErrorStatus::Dead;
            }
            // Foreground requests wait for the owning object to decide
            // whether the member comes back or the group goes degraded.
            return FruErrorStatus::Waiting;
        }
        if ctx.raid_type_is_mirror_backed {
            // The mirror level retries internally; a retryable error
            // surfacing here means the pair is in real trouble.
            return FruErrorStatus::Shutdown;
        }
        if ctx.quiescing {
            return FruErrorStatus::Waiting;
        }
        FruErrorStatus::Retry
    }
}
