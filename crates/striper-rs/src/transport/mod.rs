//! External collaborator contracts: the block transport that executes member
//! operations and supplies buffer memory, and the checksum library that
//! verifies and invalidates sector contents.
//!
//! The engine only ever talks to these traits; [`sim`] provides the
//! in-process implementations used by the test suite and tooling.

pub mod sim;

use crate::geometry::PositionMask;
use crate::transact::fruts::FrutsChain;

/// Memory granted by the allocator, carved into per-FRUTS buffers during
/// resource setup.
#[derive(Debug)]
pub struct PageGrant {
    pages: Vec<Vec<u8>>,
    cursor_page: usize,
    cursor_offset: usize,
}

impl PageGrant {
    #[must_use]
    pub const fn new(pages: Vec<Vec<u8>>) -> Self {
        Self { pages, cursor_page: 0, cursor_offset: 0 }
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Carve the next `bytes` bytes off the grant. Buffers may span pages.
    ///
    /// # Returns
    /// `None` when the grant is exhausted, which means the size calculation
    /// and the setup pass disagreed.
    pub fn carve(&mut self, bytes: usize) -> Option<Vec<u8>> {
        let mut out = Vec::with_capacity(bytes);
        while out.len() < bytes {
            let page = self.pages.get(self.cursor_page)?;
            let take = (bytes - out.len()).min(page.len() - self.cursor_offset);
            out.extend_from_slice(&page[self.cursor_offset..self.cursor_offset + take]);
            self.cursor_offset += take;
            if self.cursor_offset == page.len() {
                self.cursor_page += 1;
                self.cursor_offset = 0;
            }
        }
        Some(out)
    }
}

/// Immediate result of a memory allocation request.
#[derive(Debug)]
pub enum AllocOutcome {
    Granted(PageGrant),
    /// Grant will arrive later through [`TransportEvent::AllocGranted`].
    Pending,
    Error,
}

/// Asynchronous completion surfaced by the transport.
#[derive(Debug)]
pub enum TransportEvent {
    AllocGranted {
        /// `None` means the deferred allocation failed.
        grant: Option<PageGrant>,
    },
}

/// The block transport and allocator the machines dispatch through.
pub trait BlockTransport {
    /// Request `pages` buffer pages.
    fn allocate_memory(&mut self, pages: usize) -> AllocOutcome;

    /// Issue every active member operation of the chain. All members are
    /// issued together; completions land in each FRUTS's `result`.
    ///
    /// # Returns
    /// `false` when no member operation could be started at all.
    fn dispatch_chain(&mut self, chain: &mut FrutsChain) -> bool;

    /// Drain the next deferred completion, if any.
    fn poll_event(&mut self) -> Option<TransportEvent>;

    /// Whether every member behind a striped position is unavailable. Zero
    /// requests skip such positions instead of failing on them.
    fn position_degraded(&self, _position: usize) -> bool {
        false
    }
}

/// Collective result of a checksum pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum XorStatus {
    NoError,
    ChecksumError,
    /// The buffer itself was unreadable; always an internal error.
    BadMemory,
}

/// Outcome of [`XorLib::check_checksums`] over a set of member buffers.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChecksumReport {
    pub crc_error_bitmap: PositionMask,
    pub lba_stamp_error_bitmap: PositionMask,
    /// Sectors carrying a recognized data-lost pattern from an earlier
    /// repair; corrupted is not the same as invalidated.
    pub invalidated_bitmap: PositionMask,
    /// Lowest member lba carrying any error, for upward reporting.
    pub first_error_lba: Option<u64>,
    /// Position that lba was observed on.
    pub first_error_position: Option<usize>,
}

impl ChecksumReport {
    #[must_use]
    pub const fn status(&self) -> XorStatus {
        if self.crc_error_bitmap != 0
            || self.lba_stamp_error_bitmap != 0
            || self.invalidated_bitmap != 0
        {
            XorStatus::ChecksumError
        } else {
            XorStatus::NoError
        }
    }

    #[must_use]
    pub const fn has_fresh_corruption(&self) -> bool {
        self.crc_error_bitmap != 0 || self.lba_stamp_error_bitmap != 0
    }
}

/// Why a sector is being invalidated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InvalidateReason {
    /// The drive lost the data (hard media error).
    MediaError,
    /// Verify found the content uncorrectable.
    VerifyUncorrectable,
}

/// Classification of one ledger entry from a verify pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorRegionKind {
    Uncorrectable,
    /// Stamp wrong but data checksum intact; rewritable in place.
    LbaStamp,
    /// Previously invalidated content encountered again.
    Invalidated,
}

/// One contiguous run of bad sectors found by a verify pass.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ErrorRegion {
    pub lba: u64,
    pub blocks: u64,
    pub positions: PositionMask,
    pub kind: ErrorRegionKind,
}

/// Result of a strip verify across member buffers.
#[derive(Clone, Debug, Default)]
pub struct StripVerifyReport {
    /// Positions holding sectors whose content cannot be reconstructed.
    pub uncorrectable_bitmap: PositionMask,
    /// Positions whose sectors can be rewritten in place (stamp repair).
    pub correctable_bitmap: PositionMask,
    pub invalidated_bitmap: PositionMask,
    pub regions: Vec<ErrorRegion>,
    pub first_error_lba: Option<u64>,
}

impl StripVerifyReport {
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.uncorrectable_bitmap == 0 && self.correctable_bitmap == 0
    }
}

/// One member buffer handed to the checksum library: which position it came
/// from and the member lba its stamps are seeded with.
pub struct SectorRun<'a> {
    pub position: usize,
    pub seed_lba: u64,
    pub data: &'a [u8],
}

/// The checksum/verify collaborator.
pub trait XorLib {
    /// Compute and store checksum + lba stamp for every sector of `data`.
    fn fill_checksums(&self, data: &mut [u8], seed_lba: u64);

    /// Verify checksums (and optionally lba stamps) over member buffers.
    fn check_checksums(
        &self,
        runs: &[SectorRun<'_>],
        check_crc: bool,
        check_lba_stamp: bool,
    ) -> ChecksumReport;

    /// Read-verify compare across positions, producing the error-region
    /// ledger used for reporting and write-back decisions.
    fn verify_strip(&self, runs: &[SectorRun<'_>]) -> StripVerifyReport;

    /// Overwrite every sector of `data` with the data-lost pattern.
    fn invalidate_sectors(&self, data: &mut [u8], seed_lba: u64, reason: InvalidateReason);
}
