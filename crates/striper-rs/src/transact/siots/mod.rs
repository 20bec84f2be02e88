//! SIOTS: one state-machine instance over a sub-range of an IOTS.

#[cfg(test)]
mod siots_tests;

use crate::geometry::{GeometrySnapshot, PositionMask};
use crate::transact::fruts::FrutsChain;
use crate::transact::iots::{Iots, IotsStatus};
use crate::transport::{ErrorRegion, PageGrant};

/// The algorithm a SIOTS runs. Set exactly once by generate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Algorithm {
    R0Read,
    R0Write,
    R0Verify,
    /// Verify-before-write over the touched stripe, nested under a write.
    R0BvaVerify,
    /// Stripe repair verify, nested under a read/write that hit an error.
    R0RecoveryVerify,
    Zero,
    CheckZeroed,
}

impl Algorithm {
    #[must_use]
    pub const fn is_verify(self) -> bool {
        matches!(self, Self::R0Verify | Self::R0BvaVerify | Self::R0RecoveryVerify)
    }
}

/// SIOTS completion, folded into the IOTS when the machine finishes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SiotsStatus {
    Success,
    MediaError { lba: u64, qualifier: crate::transact::iots::MediaQualifier },
    IoFailed,
    Shutdown,
    Dropped,
    Aborted,
    /// The host handed us data with a bad in-transit checksum.
    WriteCrcError,
    NotPreferred,
    ReduceQdHard,
    ReduceQdSoft,
    UnexpectedError,
}

impl SiotsStatus {
    /// Map this completion onto the owner-visible status set. The soft path
    /// conditions (not-preferred, hard congestion) completed no data, so the
    /// owner sees them as failed-with-hint.
    #[must_use]
    pub const fn to_iots_status(self) -> IotsStatus {
        match self {
            Self::Success | Self::ReduceQdSoft => IotsStatus::Success,
            Self::MediaError { lba, qualifier } => IotsStatus::MediaError { lba, qualifier },
            Self::IoFailed | Self::WriteCrcError | Self::NotPreferred | Self::ReduceQdHard => {
                IotsStatus::IoFailed
            }
            Self::Shutdown => IotsStatus::Shutdown,
            Self::Dropped => IotsStatus::Dropped,
            Self::Aborted => IotsStatus::Aborted,
            Self::UnexpectedError => IotsStatus::UnexpectedError,
        }
    }

    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::ReduceQdSoft)
    }
}

/// Why a suspended SIOTS is parked.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitReason {
    MemoryAllocation,
    ChainCompletion,
    NestedSiots,
    OperatorDecision,
    Quiesce,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SiotsFlags {
    /// Verify narrowed to one region at a time after an error.
    pub single_region_mode: bool,
    /// A recovery attempt has already been made; do not nest another.
    pub single_error_recovery: bool,
    /// The write chain has been dispatched at least once.
    pub write_started: bool,
    pub quiesced: bool,
    pub aborted: bool,
}

/// Read machine states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadState {
    Alloc,
    Setup,
    Dispatch,
    Evaluate,
    ChecksumCheck,
    PostCheck,
}

/// Write machine states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteState {
    Alloc,
    Setup,
    Branch,
    PreReadDispatch,
    PreReadEvaluate,
    PreReadChecksum,
    /// Parked on a nested BVA-verify SIOTS.
    BvaVerify,
    /// Parked on a nested recovery-verify SIOTS.
    RecoveryVerify,
    SetChecksums,
    Dispatch,
    Evaluate,
}

/// Verify machine states (also run by the nested recovery verify).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VerifyState {
    Alloc,
    Setup,
    Dispatch,
    Evaluate,
    ChecksumStrip,
    WriteBack,
    WriteBackEvaluate,
    RegionAdvance,
}

/// Zero machine states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZeroState {
    Alloc,
    Setup,
    Dispatch,
    Evaluate,
}

/// Check-zeroed machine states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckZeroedState {
    Alloc,
    Setup,
    Dispatch,
    Evaluate,
}

/// Current position of a SIOTS in its state machine.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SiotsState {
    #[default]
    Generate,
    Read(ReadState),
    Write(WriteState),
    Verify(VerifyState),
    Zero(ZeroState),
    CheckZeroed(CheckZeroedState),
    Finished,
}

/// One sub-I/O tracking structure: the unit of state-machine execution.
#[derive(Debug, Default)]
pub struct Siots {
    pub algorithm: Option<Algorithm>,
    /// Logical range this SIOTS consumes from its IOTS.
    pub start_lba: u64,
    pub xfer_count: u64,
    /// Physical-stripe footprint, in per-member block units.
    pub parity_start: u64,
    pub parity_count: u64,
    pub data_disks: usize,
    pub start_pos: usize,
    pub drive_operations: usize,
    /// Outstanding member operations on the dispatched chain.
    pub wait_count: usize,
    pub flags: SiotsFlags,
    pub geo: GeometrySnapshot,
    /// Completion recorded by the machine; folded upward on finish.
    pub error: Option<SiotsStatus>,
    pub retry_count: u32,
    pub state: SiotsState,
    pub wait_reason: Option<WaitReason>,
    pub read_chain: FrutsChain,
    pub write_chain: FrutsChain,
    pub degraded_positions: PositionMask,
    /// Lowest member lba associated with a media error, for reporting.
    pub media_error_lba: Option<u64>,
    /// Position that lba was observed on.
    pub media_error_position: Option<usize>,
    /// Nested SIOTS (recovery verify / BVA verify). Exactly one level deep.
    pub child: Option<Box<Siots>>,
    /// Memory granted by the allocator for this SIOTS's buffers.
    pub grant: Option<PageGrant>,
    /// Error-region ledger populated by verify passes.
    pub regions: Vec<ErrorRegion>,
    /// Blocks of the parity range already mined in single-region mode.
    pub region_blocks_done: u64,
    /// A recovery verify has been spawned for this SIOTS already.
    pub recovery_attempted: bool,
    /// Dispatch asked the IOTS to start carving the next SIOTS.
    pub signal_generate_next: bool,
    /// A deferred allocation came back failed.
    pub alloc_failed: bool,
    /// Operator answer delivered while parked on a dead-member decision.
    pub operator_decision: Option<bool>,
    /// Soft completion (not-preferred / queue-depth) to report in place of
    /// plain success once the machine finishes its data path.
    pub soft_status: Option<SiotsStatus>,
}

impl Siots {
    /// Carve the next SIOTS from an IOTS. Sizing happens later in generate.
    #[must_use]
    pub fn carve(iots: &Iots) -> Self {
        Self {
            start_lba: iots.next_lba(),
            xfer_count: iots.blocks_remaining(),
            state: SiotsState::Generate,
            ..Self::default()
        }
    }

    /// Build a nested SIOTS under this one. The caller fills the range and
    /// algorithm; nesting past one level is a caller bug.
    #[must_use]
    pub fn nested(&self) -> Self {
        Self {
            start_lba: self.start_lba,
            xfer_count: self.xfer_count,
            state: SiotsState::Generate,
            ..Self::default()
        }
    }

    /// Validate the invariants generate must leave behind.
    ///
    /// # Errors
    /// Names the violated invariant; callers translate this into an
    /// unexpected-error completion.
    pub fn validate(&self, width: usize, optimal_block_size: u64) -> anyhow::Result<()> {
        let Some(algorithm) = self.algorithm else {
            anyhow::bail!("algorithm not set");
        };
        if self.xfer_count == 0 {
            anyhow::bail!("zero transfer count");
        }
        if self.start_pos >= width {
            anyhow::bail!("start position {} not below width {width}", self.start_pos);
        }
        if self.data_disks == 0 || self.data_disks > width {
            anyhow::bail!("data disks {} out of range (width {width})", self.data_disks);
        }
        if self.drive_operations == 0 {
            anyhow::bail!("drive operations not set");
        }
        if algorithm.is_verify()
            && (self.parity_start % optimal_block_size != 0
                || self.parity_count % optimal_block_size != 0)
        {
            anyhow::bail!(
                "verify range 0x{:x}+0x{:x} not aligned to optimal size {optimal_block_size}",
                self.parity_start,
                self.parity_count
            );
        }
        Ok(())
    }

    /// Record the completion for this machine run. The first status sticks.
    pub fn set_error(&mut self, status: SiotsStatus) {
        if self.error.is_none() || self.error == Some(SiotsStatus::Success) {
            self.error = Some(status);
        }
    }

    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(self.state, SiotsState::Finished)
    }

    /// The parity range still uncovered by single-region mining.
    #[must_use]
    pub const fn region_remaining(&self) -> u64 {
        self.parity_count - self.region_blocks_done
    }

    /// Completion to report when the data path finishes cleanly: plain
    /// success unless a soft condition was recorded along the way.
    #[must_use]
    pub fn success_status(&self) -> SiotsStatus {
        self.soft_status.unwrap_or(SiotsStatus::Success)
    }
}
