//! IOTS: the top-level tracking structure for one logical request.

#[cfg(test)]
mod iots_tests;

use crate::BLOCK_BYTES;
use crate::transact::Opcode;

/// Who issued the request; drives dead-member policy.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RequestClass {
    #[default]
    Foreground,
    Background,
    Metadata,
    Monitor,
}

impl RequestClass {
    /// Background-class requests complete dead members immediately instead
    /// of waiting for an operator decision.
    #[must_use]
    pub const fn is_background(self) -> bool {
        !matches!(self, Self::Foreground)
    }
}

/// Refinement carried by a media-error completion.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MediaQualifier {
    /// The drive reported the data unrecoverable.
    DataLost,
    /// Unrecoverable and remapping will not help.
    NoRemap,
    /// In-band corruption found by checksum verification.
    ChecksumError,
    /// The range had been invalidated by an earlier repair.
    Invalidated,
    /// Recovered, but the blocks should be remapped.
    RemapRequired,
}

/// Final status reported to the request's owner.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IotsStatus {
    Success,
    MediaError { lba: u64, qualifier: MediaQualifier },
    IoFailed,
    Shutdown,
    Dropped,
    Aborted,
    UnexpectedError,
}

impl IotsStatus {
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Externally-settable request flags, honored at every resume point.
#[derive(Clone, Copy, Debug, Default)]
pub struct IotsFlags {
    pub abort: bool,
    pub abort_for_shutdown: bool,
    pub quiesce: bool,
}

/// One logical request against the striped group.
#[derive(Debug)]
pub struct Iots {
    pub opcode: Opcode,
    pub lba: u64,
    pub blocks: u64,
    /// Blocks not yet claimed by a SIOTS. Decremented only through
    /// [`Iots::dec_blocks`].
    blocks_remaining: u64,
    pub class: RequestClass,
    pub flags: IotsFlags,
    /// Host buffer: source for writes, destination for reads.
    /// `blocks * BLOCK_BYTES` bytes when present.
    pub host_data: Vec<u8>,
    /// Errors observed across all SIOTS of this request.
    pub error_count: u32,
    /// Queue-depth hint carried alongside a success completion.
    pub reduce_qdepth_hint: bool,
    /// Answer produced by a check-zeroed request.
    pub check_zeroed_result: Option<bool>,
    status: Option<IotsStatus>,
}

impl Iots {
    #[must_use]
    pub fn new(opcode: Opcode, lba: u64, blocks: u64, class: RequestClass) -> Self {
        Self {
            opcode,
            lba,
            blocks,
            blocks_remaining: blocks,
            class,
            flags: IotsFlags::default(),
            host_data: Vec::new(),
            error_count: 0,
            reduce_qdepth_hint: false,
            check_zeroed_result: None,
            status: None,
        }
    }

    /// Attach the host data buffer. Must be exactly one block's worth of
    /// bytes per requested block.
    #[must_use]
    pub fn with_host_data(mut self, data: Vec<u8>) -> Self {
        debug_assert_eq!(data.len(), self.blocks as usize * BLOCK_BYTES);
        self.host_data = data;
        self
    }

    #[must_use]
    pub const fn blocks_remaining(&self) -> u64 {
        self.blocks_remaining
    }

    /// Logical address of the next unclaimed block.
    #[must_use]
    pub const fn next_lba(&self) -> u64 {
        self.lba + (self.blocks - self.blocks_remaining)
    }

    /// Claim `count` blocks for a SIOTS. This is the only mutation point for
    /// the remaining-blocks counter.
    ///
    /// # Returns
    /// `false` when the claim exceeds what is left, which is a caller bug.
    #[must_use]
    pub fn dec_blocks(&mut self, count: u64) -> bool {
        if count == 0 || count > self.blocks_remaining {
            return false;
        }
        self.blocks_remaining -= count;
        true
    }

    /// Byte offset into `host_data` for a logical block of this request.
    #[must_use]
    pub const fn host_offset(&self, lba: u64) -> usize {
        ((lba - self.lba) as usize) * BLOCK_BYTES
    }

    pub fn request_abort(&mut self) {
        self.flags.abort = true;
    }

    pub fn request_quiesce(&mut self) {
        self.flags.quiesce = true;
    }

    pub fn clear_quiesce(&mut self) {
        self.flags.quiesce = false;
    }

    #[must_use]
    pub const fn status(&self) -> Option<IotsStatus> {
        self.status
    }

    /// Fold a SIOTS completion into the request status. The first error
    /// sticks; later successes never clear it.
    pub fn merge_status(&mut self, status: IotsStatus) {
        match (self.status, status) {
            (None, s) => self.status = Some(s),
            (Some(IotsStatus::Success), s) if !s.is_success() => self.status = Some(s),
            _ => {}
        }
        if !status.is_success() {
            self.error_count += 1;
        }
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.status.is_some() && self.blocks_remaining == 0
    }
}
