use tempfile::TempDir;

use crate::config::StriperConfig;
use crate::engine::{EngineCtx, StepResult, generate};
use crate::geometry::{RaidParams, RaidType};
use crate::transact::Opcode;
use crate::transact::iots::{Iots, RequestClass};
use crate::transact::siots::{
    Algorithm, ReadState, Siots, SiotsState, VerifyState, WriteState, ZeroState,
};
use crate::transport::sim::{SimTransport, SimXor};

struct Rig {
    params: RaidParams,
    config: StriperConfig,
    transport: SimTransport,
    xor: SimXor,
    _dir: TempDir,
}

impl Rig {
    fn new(params: RaidParams) -> Self {
        let dir = TempDir::new().unwrap();
        let config = StriperConfig::default();
        let transport = SimTransport::new(&params, dir.path(), config.page_size_blocks).unwrap();
        Self { params, config, transport, xor: SimXor, _dir: dir }
    }

    fn ctx(&mut self) -> EngineCtx<'_> {
        EngineCtx {
            params: &self.params,
            config: &self.config,
            transport: &mut self.transport,
            xor: &self.xor,
        }
    }
}

fn raid0() -> RaidParams {
    RaidParams::new(RaidType::Raid0, 4, 128, 8, 0x10000).unwrap()
}

fn generate_one(rig: &mut Rig, iots: &mut Iots) -> (Siots, StepResult) {
    let mut siots = Siots::carve(iots);
    let mut ctx = rig.ctx();
    let result = generate::step(&mut siots, iots, &mut ctx);
    (siots, result)
}

#[test]
fn read_generate_sets_algorithm_and_decrements_iots() {
    let mut rig = Rig::new(raid0());
    let mut iots = Iots::new(Opcode::Read, 0, 512, RequestClass::Foreground);
    let (siots, result) = generate_one(&mut rig, &mut iots);
    assert!(matches!(result, StepResult::Continue));
    assert_eq!(siots.algorithm, Some(Algorithm::R0Read));
    assert_eq!(siots.state, SiotsState::Read(ReadState::Alloc));
    assert_eq!(siots.xfer_count, 512);
    assert_eq!(siots.data_disks, 4);
    assert_eq!(iots.blocks_remaining(), 0);
}

#[test]
fn generate_never_leaves_algorithm_unset() {
    let mut rig = Rig::new(raid0());
    for (opcode, blocks) in [
        (Opcode::Read, 512u64),
        (Opcode::Write, 16),
        (Opcode::Verify, 64),
        (Opcode::Zero, 512),
        (Opcode::CheckZeroed, 64),
    ] {
        let mut iots = Iots::new(opcode, 0, blocks, RequestClass::Background);
        let (siots, result) = generate_one(&mut rig, &mut iots);
        assert!(matches!(result, StepResult::Continue), "{opcode:?}");
        assert!(siots.algorithm.is_some(), "{opcode:?} left algorithm unset");
        assert!(siots.drive_operations > 0);
    }
}

#[test]
fn oversized_request_is_split_across_siots() {
    let mut rig = Rig::new(raid0());
    let window = rig.params.max_window_blocks;
    let mut iots = Iots::new(Opcode::Read, 0, window + 512, RequestClass::Foreground);
    let (siots, _) = generate_one(&mut rig, &mut iots);
    assert_eq!(siots.xfer_count, window);
    assert_eq!(iots.blocks_remaining(), 512);

    let (second, _) = generate_one(&mut rig, &mut iots);
    assert_eq!(second.start_lba, window);
    assert_eq!(second.xfer_count, 512);
    assert_eq!(iots.blocks_remaining(), 0);
}

#[test]
fn resizing_after_halving_is_strictly_smaller() {
    let mut params = raid0();
    params.max_window_blocks = u64::MAX;
    let mut rig = Rig::new(params);
    // Per-drive ceiling times width bounds any generated transfer.
    let bound = rig.config.max_blocks_per_drive * 4;
    let mut iots = Iots::new(Opcode::Read, 0, bound * 4, RequestClass::Foreground);
    let (siots, result) = generate_one(&mut rig, &mut iots);
    assert!(matches!(result, StepResult::Continue));
    assert!(siots.xfer_count <= bound);
    assert!(siots.xfer_count > 0);
}

#[test]
fn unaligned_write_end_is_trimmed_for_following_siots() {
    let params = raid0().with_aligned_4k_positions(0b1111);
    let window = params.max_window_blocks;
    let mut rig = Rig::new(params);
    // Misaligned write too large for one SIOTS: the first SIOTS's end is
    // trimmed back to an element boundary so the next one cannot overlap
    // its tail pre-read.
    let mut iots = Iots::new(Opcode::Write, 10, window + 300, RequestClass::Foreground);
    let (siots, result) = generate_one(&mut rig, &mut iots);
    assert!(matches!(result, StepResult::Continue));
    assert_eq!((siots.start_lba + siots.xfer_count) % 128, 0);
    assert!(siots.xfer_count < window);
    assert_eq!(iots.blocks_remaining(), window + 300 - siots.xfer_count);

    // A misaligned write that is the whole request keeps its ragged end.
    let mut iots = Iots::new(Opcode::Write, 10, 5, RequestClass::Foreground);
    let (siots, _) = generate_one(&mut rig, &mut iots);
    assert_eq!(siots.xfer_count, 5);
}

#[test]
fn verify_generate_requires_raid0_and_alignment() {
    let mut rig = Rig::new(raid0());
    let mut iots = Iots::new(Opcode::Verify, 0x100, 64, RequestClass::Background);
    let (siots, result) = generate_one(&mut rig, &mut iots);
    assert!(matches!(result, StepResult::Continue));
    assert_eq!(siots.algorithm, Some(Algorithm::R0Verify));
    assert_eq!(siots.state, SiotsState::Verify(VerifyState::Alloc));
    assert_eq!(siots.data_disks, 4);
    assert_eq!(siots.parity_start, 0x100);

    // Misaligned verify is a programming error.
    let mut iots = Iots::new(Opcode::Verify, 0x101, 64, RequestClass::Background);
    let (_, result) = generate_one(&mut rig, &mut iots);
    assert!(matches!(result, StepResult::Done(_)));

    // Striped mirrors run background verify one level down.
    let mut rig = Rig::new(RaidParams::new(RaidType::Raid10, 4, 128, 8, 0x10000).unwrap());
    let mut iots = Iots::new(Opcode::Verify, 0x100, 64, RequestClass::Background);
    let (_, result) = generate_one(&mut rig, &mut iots);
    assert!(matches!(result, StepResult::Done(_)));
}

#[test]
fn aligned_zero_goes_to_the_zero_machine() {
    let mut rig = Rig::new(raid0());
    let mut iots = Iots::new(Opcode::Zero, 0, 1024, RequestClass::Background);
    let (siots, result) = generate_one(&mut rig, &mut iots);
    assert!(matches!(result, StepResult::Continue));
    assert_eq!(siots.algorithm, Some(Algorithm::Zero));
    assert_eq!(siots.state, SiotsState::Zero(ZeroState::Alloc));
}

#[test]
fn unaligned_zero_falls_back_to_the_write_path() {
    let mut rig = Rig::new(raid0());
    let mut iots = Iots::new(Opcode::Zero, 10, 5, RequestClass::Background);
    let (siots, result) = generate_one(&mut rig, &mut iots);
    assert!(matches!(result, StepResult::Continue));
    assert_eq!(siots.algorithm, Some(Algorithm::R0Write));
    assert_eq!(siots.state, SiotsState::Write(WriteState::Alloc));
}

#[test]
fn large_unaligned_zero_is_trimmed_to_stripe_boundaries() {
    let mut rig = Rig::new(raid0());
    let stripe = 512u64;
    // Aligned start, misaligned end, many stripes: cut after the last whole
    // stripe so the interior can be write-same.
    let mut iots = Iots::new(Opcode::Zero, 0, stripe * 4 + 5, RequestClass::Background);
    let (siots, _) = generate_one(&mut rig, &mut iots);
    assert_eq!(siots.xfer_count, stripe * 4);
    assert_eq!(siots.algorithm, Some(Algorithm::R0Write));

    // Misaligned start: cut at the end of the first stripe so the next
    // request begins stripe aligned.
    let mut iots = Iots::new(Opcode::Zero, 100, stripe * 4, RequestClass::Background);
    let (siots, _) = generate_one(&mut rig, &mut iots);
    assert_eq!(siots.xfer_count, stripe - 100);
}

#[test]
fn unmark_zero_must_be_stripe_aligned() {
    let mut rig = Rig::new(raid0());
    let mut iots = Iots::new(Opcode::UnmarkZero, 512, 512, RequestClass::Background);
    let (siots, result) = generate_one(&mut rig, &mut iots);
    assert!(matches!(result, StepResult::Continue));
    assert_eq!(siots.algorithm, Some(Algorithm::Zero));

    let mut iots = Iots::new(Opcode::UnmarkZero, 512, 100, RequestClass::Background);
    let (_, result) = generate_one(&mut rig, &mut iots);
    assert!(matches!(result, StepResult::Done(_)));
}

#[test]
fn zero_transfer_count_is_refused() {
    let mut rig = Rig::new(raid0());
    let mut iots = Iots::new(Opcode::Read, 0, 0, RequestClass::Foreground);
    let (_, result) = generate_one(&mut rig, &mut iots);
    assert!(matches!(result, StepResult::Done(_)));
}
