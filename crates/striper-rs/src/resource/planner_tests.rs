use crate::config::StriperConfig;
use crate::geometry::{RaidParams, RaidType, physical_geometry};
use crate::resource::{self, SG_CLASSES};
use crate::transact::siots::{Algorithm, Siots};
use crate::transport::PageGrant;

fn params() -> RaidParams {
    RaidParams::new(RaidType::Raid0, 4, 128, 8, 0x10000).unwrap()
}

fn config() -> StriperConfig {
    StriperConfig::default()
}

fn read_siots(lba: u64, blocks: u64) -> Siots {
    let p = params();
    let mut siots = Siots::default();
    siots.algorithm = Some(Algorithm::R0Read);
    siots.start_lba = lba;
    siots.xfer_count = blocks;
    siots.geo = physical_geometry(&p, lba).unwrap();
    siots
}

#[test]
fn read_plan_covers_exactly_the_transfer() {
    let siots = read_siots(0, 512);
    let plan = resource::plan_read(&siots, &params(), &config());
    assert_eq!(plan.read_infos.len(), 4);
    assert_eq!(plan.budget.total_blocks, 512);
    for info in &plan.read_infos {
        assert_eq!(info.blocks, 128);
        assert!(info.sg_elements > 0);
    }
}

#[test]
fn planning_is_a_fixed_point() {
    let siots = read_siots(300, 700);
    let p = params();
    let c = config();
    let first = resource::plan_read(&siots, &p, &c);
    let second = resource::plan_read(&siots, &p, &c);
    assert_eq!(first.read_infos, second.read_infos);
    assert_eq!(first.budget, second.budget);
}

#[test]
fn write_plan_generates_aligning_preread() {
    let p = params().with_aligned_4k_positions(0b1111);
    let mut siots = read_siots(10, 5);
    siots.algorithm = Some(Algorithm::R0Write);
    let plan = resource::plan_write(&siots, &p, &config());
    // One touched position; pre-read covers the full aligning span and the
    // write is widened to match it.
    assert_eq!(plan.read_infos.len(), 1);
    assert_eq!(plan.write_infos.len(), 1);
    assert_eq!(plan.read_infos[0].lba, 8);
    assert_eq!(plan.read_infos[0].blocks, 8);
    assert_eq!(plan.write_infos[0].lba, 8);
    assert_eq!(plan.write_infos[0].blocks, 8);
}

#[test]
fn aligned_write_plan_has_no_prereads() {
    let p = params().with_aligned_4k_positions(0b1111);
    let mut siots = read_siots(0, 512);
    siots.algorithm = Some(Algorithm::R0Write);
    let plan = resource::plan_write(&siots, &p, &config());
    assert!(plan.read_infos.is_empty());
    assert_eq!(plan.write_infos.len(), 4);
}

#[test]
fn raid10_write_plan_never_prereads() {
    let p = RaidParams::new(RaidType::Raid10, 4, 128, 8, 0x10000)
        .unwrap()
        .with_aligned_4k_positions(0b1111);
    let mut siots = Siots::default();
    siots.algorithm = Some(Algorithm::R0Write);
    siots.start_lba = 10;
    siots.xfer_count = 5;
    siots.geo = physical_geometry(&p, 10).unwrap();
    let plan = resource::plan_write(&siots, &p, &config());
    assert!(plan.read_infos.is_empty());
    assert_eq!(plan.write_infos[0].lba, 10);
    assert_eq!(plan.write_infos[0].blocks, 5);
}

#[test]
fn exceeds_limits_flags_oversized_members() {
    let c = config();
    let mut siots = read_siots(0, 4 * (c.max_blocks_per_drive + 8));
    siots.geo.max_blocks = u64::MAX;
    let plan = resource::plan_read(&siots, &params(), &c);
    assert!(plan.exceeds_limits(&c));

    let small = resource::plan_read(&read_siots(0, 512), &params(), &c);
    assert!(!small.exceeds_limits(&c));
}

#[test]
fn sg_class_counts_track_the_classes() {
    let plan = resource::plan_read(&read_siots(0, 512), &params(), &config());
    let total: usize = plan.budget.sg_class_counts.iter().sum();
    assert_eq!(total, plan.read_infos.len());
    // 128 blocks over 32-block pages is 5 elements with the straddle spare:
    // class 8.
    assert_eq!(SG_CLASSES[1], 8);
    assert_eq!(plan.budget.sg_class_counts[1], 4);
}

#[test]
fn verify_region_is_whole_range_until_mining() {
    let c = config();
    let mut siots = Siots::default();
    siots.parity_start = 0x100;
    siots.parity_count = 0x200;
    assert_eq!(resource::current_verify_region(&siots, &c, 8), (0x100, 0x200));

    siots.flags.single_region_mode = true;
    // Aligned start mines one full region.
    assert_eq!(resource::current_verify_region(&siots, &c, 8), (0x100, 64));
    // Progress moves the window and a misaligned start is trimmed so the
    // next region starts aligned.
    siots.region_blocks_done = 0x20;
    let (start, count) = resource::current_verify_region(&siots, &c, 8);
    assert_eq!(start, 0x120);
    assert_eq!(count, 32);
}

#[test]
fn setup_binds_buffers_to_the_grant() {
    let p = params();
    let c = config();
    let mut siots = read_siots(0, 512);
    let plan = resource::plan_for(&siots, &p, &c);
    let page_bytes = c.page_size_blocks as usize * crate::BLOCK_BYTES;
    let mut grant = PageGrant::new(vec![vec![0u8; page_bytes]; plan.budget.pages]);
    resource::setup_resources(&mut siots, &plan, &mut grant).unwrap();
    assert_eq!(siots.read_chain.len(), 4);
    for fruts in siots.read_chain.iter() {
        assert_eq!(fruts.data.len(), fruts.buffer_bytes());
    }
}

#[test]
fn setup_fails_on_an_undersized_grant() {
    let p = params();
    let c = config();
    let mut siots = read_siots(0, 512);
    let plan = resource::plan_for(&siots, &p, &c);
    let mut grant = PageGrant::new(vec![vec![0u8; 64]]);
    assert!(resource::setup_resources(&mut siots, &plan, &mut grant).is_err());
}
