//! In-process simulated collaborators: mmap-backed member disks, a
//! fault-injectable transport and a truncated-digest checksum library.
//!
//! These exist so the state machines can be driven end to end without real
//! hardware; the test suite and tooling build everything on top of them.

#[cfg(test)]
mod sim_tests;

use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::geometry::{RaidParams, RaidType};
use crate::transact::fruts::{FruOpcode, FruResult, FrutsChain};
use crate::transport::{
    AllocOutcome, BlockTransport, ChecksumReport, ErrorRegion, ErrorRegionKind, InvalidateReason,
    PageGrant, SectorRun, StripVerifyReport, TransportEvent, XorLib,
};
use crate::{BLOCK_BYTES, BLOCK_DATA_BYTES};

/// Checksum field value marking an intentionally invalidated sector.
const INVALIDATED_CRC: u32 = 0x494E_564C;

/// One simulated member drive backed by an mmap'd image file.
pub struct SimDisk {
    path: PathBuf,
    file: Option<File>,
    map: Option<MmapMut>,
    blocks: u64,
}

impl SimDisk {
    /// # Errors
    /// Returns an error if the image cannot be created/opened or mapped.
    pub fn open_prealloc(path: &Path, blocks: u64) -> anyhow::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = blocks * BLOCK_BYTES as u64;
        file.set_len(len)?;
        let map_len = usize::try_from(len)
            .map_err(|_| anyhow::anyhow!("disk length {len} exceeds addressable size"))?;
        let map = unsafe { MmapOptions::new().len(map_len).map_mut(&file)? };
        Ok(Self { path: path.to_path_buf(), file: Some(file), map: Some(map), blocks })
    }

    /// Hot-remove this member: drop the mapping and file handle.
    pub fn fail(&mut self) {
        self.map.take();
        self.file.take();
    }

    /// Hot-swap in a fresh, empty image. Contents must be rebuilt.
    ///
    /// # Errors
    /// Returns an error if the image cannot be recreated or mapped.
    pub fn replace(&mut self) -> anyhow::Result<()> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        let len = self.blocks * BLOCK_BYTES as u64;
        file.set_len(len)?;
        let map = unsafe { MmapOptions::new().len(len as usize).map_mut(&file)? };
        self.file = Some(file);
        self.map = Some(map);
        Ok(())
    }

    #[must_use]
    pub const fn is_missing(&self) -> bool {
        self.map.is_none()
    }

    #[must_use]
    pub const fn blocks(&self) -> u64 {
        self.blocks
    }

    /// Read whole blocks into `out`; `out` must hold `count` blocks.
    #[must_use]
    pub fn read_blocks(&self, lba: u64, count: u64, out: &mut [u8]) -> bool {
        let Some(map) = self.map.as_ref() else {
            return false;
        };
        if lba + count > self.blocks {
            return false;
        }
        let start = lba as usize * BLOCK_BYTES;
        let len = count as usize * BLOCK_BYTES;
        out[..len].copy_from_slice(&map[start..start + len]);
        true
    }

    /// Write whole blocks from `data` at `lba`.
    #[must_use]
    pub fn write_blocks(&mut self, lba: u64, data: &[u8]) -> bool {
        let Some(map) = self.map.as_mut() else {
            return false;
        };
        let count = (data.len() / BLOCK_BYTES) as u64;
        if lba + count > self.blocks {
            return false;
        }
        let start = lba as usize * BLOCK_BYTES;
        map[start..start + data.len()].copy_from_slice(data);
        true
    }
}

/// How the simulated allocator answers memory requests.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AllocMode {
    #[default]
    Immediate,
    /// Every request returns `Pending`; the grant arrives via `poll_event`.
    Deferred,
}

/// One injectable member fault, matched against dispatched operations.
#[derive(Clone, Debug)]
pub struct FaultSpec {
    pub position: usize,
    pub lba: u64,
    pub blocks: u64,
    pub result: FruResult,
    /// Times this fault fires before expiring.
    pub remaining: u32,
    pub applies_to_reads: bool,
    pub applies_to_writes: bool,
}

impl FaultSpec {
    #[must_use]
    pub const fn on_read(position: usize, lba: u64, blocks: u64, result: FruResult) -> Self {
        Self {
            position,
            lba,
            blocks,
            result,
            remaining: 1,
            applies_to_reads: true,
            applies_to_writes: false,
        }
    }

    #[must_use]
    pub const fn on_write(position: usize, lba: u64, blocks: u64, result: FruResult) -> Self {
        Self {
            position,
            lba,
            blocks,
            result,
            remaining: 1,
            applies_to_reads: false,
            applies_to_writes: true,
        }
    }

    #[must_use]
    pub const fn times(mut self, n: u32) -> Self {
        self.remaining = n;
        self
    }

    const fn overlaps(&self, lba: u64, blocks: u64) -> bool {
        lba < self.lba + self.blocks && self.lba < lba + blocks
    }
}

/// One dispatched member operation, kept for test assertions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OpRecord {
    pub position: usize,
    pub lba: u64,
    pub blocks: u64,
    pub opcode: FruOpcode,
    pub result: FruResult,
}

/// Simulated block transport: executes member operations synchronously
/// against the disk images, with optional deferred allocation and faults.
pub struct SimTransport {
    params: RaidParams,
    disks: Vec<SimDisk>,
    page_bytes: usize,
    alloc_mode: AllocMode,
    pending_allocs: VecDeque<usize>,
    faults: Vec<FaultSpec>,
    op_log: Vec<OpRecord>,
}

impl SimTransport {
    /// Create member images `member_<n>.img` under `dir`. RAID-10 groups get
    /// two members per striped position.
    ///
    /// # Errors
    /// Returns an error if any member image cannot be created.
    pub fn new(params: &RaidParams, dir: &Path, page_size_blocks: u64) -> anyhow::Result<Self> {
        let members = match params.raid_type {
            RaidType::Raid0 => params.width,
            RaidType::Raid10 => params.width * 2,
        };
        let mut disks = Vec::with_capacity(members);
        for i in 0..members {
            let path = dir.join(format!("member_{i}.img"));
            disks.push(SimDisk::open_prealloc(&path, params.capacity_per_disk)?);
        }
        Ok(Self {
            params: params.clone(),
            disks,
            page_bytes: (page_size_blocks as usize) * BLOCK_BYTES,
            alloc_mode: AllocMode::Immediate,
            pending_allocs: VecDeque::new(),
            faults: Vec::new(),
            op_log: Vec::new(),
        })
    }

    pub fn set_alloc_mode(&mut self, mode: AllocMode) {
        self.alloc_mode = mode;
    }

    /// Drain the record of dispatched member operations.
    pub fn take_op_log(&mut self) -> Vec<OpRecord> {
        std::mem::take(&mut self.op_log)
    }

    pub fn inject_fault(&mut self, fault: FaultSpec) {
        self.faults.push(fault);
    }

    /// Member drive indices backing a striped position.
    fn members_of(&self, position: usize) -> [Option<usize>; 2] {
        match self.params.raid_type {
            RaidType::Raid0 => [Some(position), None],
            RaidType::Raid10 => [Some(position * 2), Some(position * 2 + 1)],
        }
    }

    /// Whether every member behind a position is gone.
    #[must_use]
    pub fn position_is_missing(&self, position: usize) -> bool {
        self.members_of(position)
            .into_iter()
            .flatten()
            .all(|m| self.disks[m].is_missing())
    }

    pub fn fail_member(&mut self, member: usize) {
        self.disks[member].fail();
    }

    /// # Errors
    /// Returns an error if the replacement image cannot be created.
    pub fn replace_member(&mut self, member: usize) -> anyhow::Result<()> {
        self.disks[member].replace()
    }

    /// Test hook: read raw blocks from the first live member of a position.
    #[must_use]
    pub fn peek(&self, position: usize, lba: u64, count: u64) -> Option<Vec<u8>> {
        let mut out = vec![0u8; count as usize * BLOCK_BYTES];
        for member in self.members_of(position).into_iter().flatten() {
            if self.disks[member].read_blocks(lba, count, &mut out) {
                return Some(out);
            }
        }
        None
    }

    /// Test hook: write raw blocks to every live member of a position.
    pub fn poke(&mut self, position: usize, lba: u64, data: &[u8]) {
        for member in self.members_of(position).into_iter().flatten() {
            let _ = self.disks[member].write_blocks(lba, data);
        }
    }

    /// Test hook: flip a data byte of one sector so its checksum no longer
    /// verifies.
    pub fn corrupt_sector(&mut self, position: usize, lba: u64) {
        if let Some(mut sector) = self.peek(position, lba, 1) {
            sector[0] ^= 0xFF;
            self.poke(position, lba, &sector);
        }
    }

    fn take_fault(&mut self, position: usize, lba: u64, blocks: u64, is_read: bool) -> Option<FruResult> {
        for fault in &mut self.faults {
            let applies = if is_read { fault.applies_to_reads } else { fault.applies_to_writes };
            if applies && fault.position == position && fault.remaining > 0 && fault.overlaps(lba, blocks)
            {
                fault.remaining -= 1;
                return Some(fault.result);
            }
        }
        None
    }

    fn execute_read(&mut self, position: usize, lba: u64, blocks: u64, out: &mut [u8]) -> bool {
        for member in self.members_of(position).into_iter().flatten() {
            if self.disks[member].read_blocks(lba, blocks, out) {
                return true;
            }
        }
        false
    }

    fn execute_write(&mut self, position: usize, lba: u64, data: &[u8]) -> bool {
        let mut any = false;
        for member in self.members_of(position).into_iter().flatten() {
            if self.disks[member].write_blocks(lba, data) {
                any = true;
            }
        }
        any
    }

    fn execute_write_same(&mut self, position: usize, lba: u64, blocks: u64, pattern: &[u8]) -> bool {
        let mut sector = [0u8; BLOCK_BYTES];
        sector.copy_from_slice(&pattern[..BLOCK_BYTES]);
        let mut any = false;
        for i in 0..blocks {
            // Re-stamp each sector for its own destination address.
            let stamp = ((lba + i) & 0xFFFF_FFFF) as u32;
            sector[BLOCK_DATA_BYTES + 4..BLOCK_DATA_BYTES + 8]
                .copy_from_slice(&stamp.to_le_bytes());
            if self.execute_write(position, lba + i, &sector) {
                any = true;
            }
        }
        any
    }
}

/// Results that still transfer data before being reported.
const fn transfers_data(result: FruResult) -> bool {
    matches!(
        result,
        FruResult::Success | FruResult::SoftMedia | FruResult::Zeroed | FruResult::CongestedSoft
    )
}

impl BlockTransport for SimTransport {
    fn allocate_memory(&mut self, pages: usize) -> AllocOutcome {
        match self.alloc_mode {
            AllocMode::Immediate => {
                AllocOutcome::Granted(PageGrant::new(vec![vec![0u8; self.page_bytes]; pages]))
            }
            AllocMode::Deferred => {
                self.pending_allocs.push_back(pages);
                AllocOutcome::Pending
            }
        }
    }

    fn dispatch_chain(&mut self, chain: &mut FrutsChain) -> bool {
        let mut started = false;
        // Collect slots first; fault lookup needs `&mut self`.
        for slot in 0..chain.len() {
            let (position, lba, blocks, opcode, already_done) = {
                let f = chain.get(slot).unwrap();
                (f.position, f.lba, f.blocks, f.opcode, f.result.is_some())
            };
            if matches!(opcode, FruOpcode::Noop) || already_done {
                continue;
            }
            started = true;
            let is_read = matches!(opcode, FruOpcode::Read);
            let injected = self.take_fault(position, lba, blocks, is_read);
            if let Some(result) = injected
                && !transfers_data(result)
            {
                debug!(position, lba, ?result, "injected member fault");
                self.op_log.push(OpRecord { position, lba, blocks, opcode, result });
                let f = chain.get_mut(slot).unwrap();
                f.result = Some(result);
                f.transferred = 0;
                continue;
            }
            let ok = match opcode {
                FruOpcode::Read => {
                    // Read into the bound buffer; size it if the caller
                    // skipped resource setup.
                    let mut buf = {
                        let f = chain.get_mut(slot).unwrap();
                        let mut data = std::mem::take(&mut f.data);
                        data.resize(blocks as usize * BLOCK_BYTES, 0);
                        data
                    };
                    let ok = self.execute_read(position, lba, blocks, &mut buf);
                    chain.get_mut(slot).unwrap().data = buf;
                    ok
                }
                FruOpcode::Write | FruOpcode::WriteVerify => {
                    let data = chain.get(slot).unwrap().data.clone();
                    self.execute_write(position, lba, &data)
                }
                FruOpcode::WriteSame => {
                    let pattern = chain.get(slot).unwrap().data.clone();
                    self.execute_write_same(position, lba, blocks, &pattern)
                }
                FruOpcode::Noop => unreachable!(),
            };
            let result = if ok {
                injected.unwrap_or(FruResult::Success)
            } else {
                // Every member behind the position is gone.
                FruResult::Dead
            };
            self.op_log.push(OpRecord { position, lba, blocks, opcode, result });
            let f = chain.get_mut(slot).unwrap();
            f.result = Some(result);
            f.transferred = if ok { blocks } else { 0 };
        }
        started
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        let pages = self.pending_allocs.pop_front()?;
        Some(TransportEvent::AllocGranted {
            grant: Some(PageGrant::new(vec![vec![0u8; self.page_bytes]; pages])),
        })
    }

    fn position_degraded(&self, position: usize) -> bool {
        self.position_is_missing(position)
    }
}

/// Truncated-digest checksum library over 520-byte sectors.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimXor;

impl SimXor {
    fn crc_of(data: &[u8]) -> u32 {
        let digest = Sha256::digest(data);
        u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    fn sector_crc(sector: &[u8]) -> u32 {
        u32::from_le_bytes(
            sector[BLOCK_DATA_BYTES..BLOCK_DATA_BYTES + 4].try_into().unwrap(),
        )
    }

    fn sector_stamp(sector: &[u8]) -> u32 {
        u32::from_le_bytes(
            sector[BLOCK_DATA_BYTES + 4..BLOCK_DATA_BYTES + 8].try_into().unwrap(),
        )
    }

    const fn expected_stamp(lba: u64) -> u32 {
        (lba & 0xFFFF_FFFF) as u32
    }

    /// Per-sector verdict reused by check and verify passes.
    fn classify_sector(sector: &[u8], lba: u64) -> Option<ErrorRegionKind> {
        let stored = Self::sector_crc(sector);
        if stored == INVALIDATED_CRC {
            return Some(ErrorRegionKind::Invalidated);
        }
        if stored != Self::crc_of(&sector[..BLOCK_DATA_BYTES]) {
            return Some(ErrorRegionKind::Uncorrectable);
        }
        if Self::sector_stamp(sector) != Self::expected_stamp(lba) {
            return Some(ErrorRegionKind::LbaStamp);
        }
        None
    }
}

impl XorLib for SimXor {
    fn fill_checksums(&self, data: &mut [u8], seed_lba: u64) {
        for (i, sector) in data.chunks_exact_mut(BLOCK_BYTES).enumerate() {
            let crc = Self::crc_of(&sector[..BLOCK_DATA_BYTES]);
            sector[BLOCK_DATA_BYTES..BLOCK_DATA_BYTES + 4].copy_from_slice(&crc.to_le_bytes());
            let stamp = Self::expected_stamp(seed_lba + i as u64);
            sector[BLOCK_DATA_BYTES + 4..BLOCK_DATA_BYTES + 8]
                .copy_from_slice(&stamp.to_le_bytes());
        }
    }

    fn check_checksums(
        &self,
        runs: &[SectorRun<'_>],
        check_crc: bool,
        check_lba_stamp: bool,
    ) -> ChecksumReport {
        let mut report = ChecksumReport::default();
        for run in runs {
            for (i, sector) in run.data.chunks_exact(BLOCK_BYTES).enumerate() {
                let lba = run.seed_lba + i as u64;
                let mask = 1 << run.position;
                match Self::classify_sector(sector, lba) {
                    Some(ErrorRegionKind::Invalidated) => {
                        report.invalidated_bitmap |= mask;
                    }
                    Some(ErrorRegionKind::Uncorrectable) if check_crc => {
                        report.crc_error_bitmap |= mask;
                    }
                    Some(ErrorRegionKind::LbaStamp) if check_lba_stamp => {
                        report.lba_stamp_error_bitmap |= mask;
                    }
                    _ => continue,
                }
                if report.first_error_lba.is_none_or(|l| lba < l) {
                    report.first_error_lba = Some(lba);
                    report.first_error_position = Some(run.position);
                }
            }
        }
        report
    }

    fn verify_strip(&self, runs: &[SectorRun<'_>]) -> StripVerifyReport {
        let mut report = StripVerifyReport::default();
        for run in runs {
            let mask = 1 << run.position;
            let mut open: Option<ErrorRegion> = None;
            for (i, sector) in run.data.chunks_exact(BLOCK_BYTES).enumerate() {
                let lba = run.seed_lba + i as u64;
                let kind = Self::classify_sector(sector, lba);
                match kind {
                    Some(kind) => {
                        match kind {
                            ErrorRegionKind::Uncorrectable => report.uncorrectable_bitmap |= mask,
                            ErrorRegionKind::LbaStamp => report.correctable_bitmap |= mask,
                            ErrorRegionKind::Invalidated => report.invalidated_bitmap |= mask,
                        }
                        report.first_error_lba =
                            Some(report.first_error_lba.map_or(lba, |l| l.min(lba)));
                        match open.as_mut() {
                            Some(region) if region.kind == kind => region.blocks += 1,
                            _ => {
                                if let Some(region) = open.take() {
                                    report.regions.push(region);
                                }
                                open = Some(ErrorRegion { lba, blocks: 1, positions: mask, kind });
                            }
                        }
                    }
                    None => {
                        if let Some(region) = open.take() {
                            report.regions.push(region);
                        }
                    }
                }
            }
            if let Some(region) = open.take() {
                report.regions.push(region);
            }
        }
        report
    }

    fn invalidate_sectors(&self, data: &mut [u8], seed_lba: u64, reason: InvalidateReason) {
        let marker = match reason {
            InvalidateReason::MediaError => 0x4D,
            InvalidateReason::VerifyUncorrectable => 0x56,
        };
        for (i, sector) in data.chunks_exact_mut(BLOCK_BYTES).enumerate() {
            sector[..BLOCK_DATA_BYTES].fill(0);
            sector[0] = marker;
            sector[BLOCK_DATA_BYTES..BLOCK_DATA_BYTES + 4]
                .copy_from_slice(&INVALIDATED_CRC.to_le_bytes());
            let stamp = Self::expected_stamp(seed_lba + i as u64);
            sector[BLOCK_DATA_BYTES + 4..BLOCK_DATA_BYTES + 8]
                .copy_from_slice(&stamp.to_le_bytes());
        }
    }
}
