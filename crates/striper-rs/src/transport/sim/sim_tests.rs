use tempfile::TempDir;

use crate::geometry::{RaidParams, RaidType};
use crate::transact::fruts::{FruInfo, FruOpcode, FruResult, Fruts, FrutsChain};
use crate::transport::sim::{AllocMode, FaultSpec, SimDisk, SimTransport, SimXor};
use crate::transport::{
    AllocOutcome, BlockTransport, ErrorRegionKind, InvalidateReason, SectorRun, TransportEvent,
    XorLib, XorStatus,
};
use crate::{BLOCK_BYTES, BLOCK_DATA_BYTES};

fn raid0() -> RaidParams {
    RaidParams::new(RaidType::Raid0, 4, 128, 8, 0x1000).unwrap()
}

fn transport(params: &RaidParams, dir: &TempDir) -> SimTransport {
    SimTransport::new(params, dir.path(), 32).unwrap()
}

fn filled_sectors(xor: &SimXor, blocks: u64, seed_lba: u64, fill: u8) -> Vec<u8> {
    let mut data = vec![fill; blocks as usize * BLOCK_BYTES];
    xor.fill_checksums(&mut data, seed_lba);
    data
}

#[test]
fn disk_round_trips_blocks() {
    let dir = TempDir::new().unwrap();
    let mut disk = SimDisk::open_prealloc(&dir.path().join("d.img"), 64).unwrap();
    let data = vec![0xAB; 4 * BLOCK_BYTES];
    assert!(disk.write_blocks(10, &data));
    let mut out = vec![0u8; 4 * BLOCK_BYTES];
    assert!(disk.read_blocks(10, 4, &mut out));
    assert_eq!(out, data);
    // Out-of-range access is refused.
    assert!(!disk.read_blocks(62, 4, &mut out));
}

#[test]
fn failed_disk_stops_serving_until_replaced() {
    let dir = TempDir::new().unwrap();
    let mut disk = SimDisk::open_prealloc(&dir.path().join("d.img"), 64).unwrap();
    disk.fail();
    assert!(disk.is_missing());
    let mut out = vec![0u8; BLOCK_BYTES];
    assert!(!disk.read_blocks(0, 1, &mut out));
    disk.replace().unwrap();
    assert!(!disk.is_missing());
    assert!(disk.read_blocks(0, 1, &mut out));
}

#[test]
fn dispatch_executes_reads_and_writes() {
    let params = raid0();
    let dir = TempDir::new().unwrap();
    let mut transport = transport(&params, &dir);
    let xor = SimXor;

    let mut chain = FrutsChain::new();
    let mut write = Fruts::from_info(&FruInfo::new(1, 0x40, 2), FruOpcode::Write);
    write.data = filled_sectors(&xor, 2, 0x40, 0x11);
    chain.push(write);
    assert!(transport.dispatch_chain(&mut chain));
    assert_eq!(chain.get(0).unwrap().result, Some(FruResult::Success));

    let mut read_chain = FrutsChain::new();
    read_chain.push(Fruts::from_info(&FruInfo::new(1, 0x40, 2), FruOpcode::Read));
    assert!(transport.dispatch_chain(&mut read_chain));
    let read = read_chain.get(0).unwrap();
    assert_eq!(read.result, Some(FruResult::Success));
    assert_eq!(read.data, chain.get(0).unwrap().data);
}

#[test]
fn write_same_restamps_each_sector() {
    let params = raid0();
    let dir = TempDir::new().unwrap();
    let mut transport = transport(&params, &dir);
    let xor = SimXor;

    let mut chain = FrutsChain::new();
    let mut ws = Fruts::from_info(&FruInfo::new(0, 0x10, 8), FruOpcode::WriteSame);
    ws.data = filled_sectors(&xor, 1, 0x10, 0);
    chain.push(ws);
    assert!(transport.dispatch_chain(&mut chain));

    let sectors = transport.peek(0, 0x10, 8).unwrap();
    let report = xor.check_checksums(
        &[SectorRun { position: 0, seed_lba: 0x10, data: &sectors }],
        true,
        true,
    );
    assert_eq!(report.status(), XorStatus::NoError);
}

#[test]
fn raid10_write_lands_on_both_members() {
    let params = RaidParams::new(RaidType::Raid10, 2, 64, 8, 0x1000).unwrap();
    let dir = TempDir::new().unwrap();
    let mut transport = SimTransport::new(&params, dir.path(), 32).unwrap();
    let xor = SimXor;

    let mut chain = FrutsChain::new();
    let mut write = Fruts::from_info(&FruInfo::new(1, 0, 1), FruOpcode::Write);
    write.data = filled_sectors(&xor, 1, 0, 0x22);
    chain.push(write);
    assert!(transport.dispatch_chain(&mut chain));

    // Primary gone, the mirror still serves the data.
    transport.fail_member(2);
    let sector = transport.peek(1, 0, 1).unwrap();
    assert_eq!(sector[..BLOCK_DATA_BYTES], vec![0x22; BLOCK_DATA_BYTES]);
}

#[test]
fn faults_fire_once_and_expire() {
    let params = raid0();
    let dir = TempDir::new().unwrap();
    let mut transport = transport(&params, &dir);
    transport.inject_fault(FaultSpec::on_read(2, 0, 16, FruResult::HardMedia));

    let mut chain = FrutsChain::new();
    chain.push(Fruts::from_info(&FruInfo::new(2, 4, 4), FruOpcode::Read));
    assert!(transport.dispatch_chain(&mut chain));
    assert_eq!(chain.get(0).unwrap().result, Some(FruResult::HardMedia));

    chain.reset_positions(!0);
    assert!(transport.dispatch_chain(&mut chain));
    assert_eq!(chain.get(0).unwrap().result, Some(FruResult::Success));
}

#[test]
fn missing_position_reports_dead() {
    let params = raid0();
    let dir = TempDir::new().unwrap();
    let mut transport = transport(&params, &dir);
    transport.fail_member(3);
    assert!(transport.position_degraded(3));

    let mut chain = FrutsChain::new();
    chain.push(Fruts::from_info(&FruInfo::new(3, 0, 1), FruOpcode::Read));
    assert!(transport.dispatch_chain(&mut chain));
    assert_eq!(chain.get(0).unwrap().result, Some(FruResult::Dead));
}

#[test]
fn deferred_allocation_grants_through_poll() {
    let params = raid0();
    let dir = TempDir::new().unwrap();
    let mut transport = transport(&params, &dir);
    transport.set_alloc_mode(AllocMode::Deferred);
    assert!(matches!(transport.allocate_memory(3), AllocOutcome::Pending));
    match transport.poll_event() {
        Some(TransportEvent::AllocGranted { grant: Some(grant) }) => {
            assert_eq!(grant.page_count(), 3);
        }
        other => panic!("expected a deferred grant, got {other:?}"),
    }
    assert!(transport.poll_event().is_none());
}

#[test]
fn checksum_library_flags_corruption_and_stamps() {
    let xor = SimXor;
    let mut data = filled_sectors(&xor, 4, 0x100, 0x33);
    let clean = xor.check_checksums(
        &[SectorRun { position: 0, seed_lba: 0x100, data: &data }],
        true,
        true,
    );
    assert_eq!(clean.status(), XorStatus::NoError);

    // Flip a payload byte in sector 2.
    data[2 * BLOCK_BYTES] ^= 0xFF;
    let report = xor.check_checksums(
        &[SectorRun { position: 0, seed_lba: 0x100, data: &data }],
        true,
        true,
    );
    assert_eq!(report.crc_error_bitmap, 1);
    assert_eq!(report.first_error_lba, Some(0x102));

    // A wrong seed trips the stamp check only.
    let mut stamped = filled_sectors(&xor, 1, 0x500, 0x44);
    xor.fill_checksums(&mut stamped, 0x500);
    let report = xor.check_checksums(
        &[SectorRun { position: 1, seed_lba: 0x501, data: &stamped }],
        true,
        true,
    );
    assert_eq!(report.crc_error_bitmap, 0);
    assert_eq!(report.lba_stamp_error_bitmap, 0b10);
}

#[test]
fn invalidated_sectors_are_recognized_not_corrupt() {
    let xor = SimXor;
    let mut data = filled_sectors(&xor, 2, 0x40, 0x55);
    xor.invalidate_sectors(&mut data[..BLOCK_BYTES], 0x40, InvalidateReason::MediaError);
    let report = xor.check_checksums(
        &[SectorRun { position: 0, seed_lba: 0x40, data: &data }],
        true,
        true,
    );
    assert_eq!(report.crc_error_bitmap, 0);
    assert_eq!(report.invalidated_bitmap, 1);
    assert!(!report.has_fresh_corruption());
}

#[test]
fn verify_strip_builds_coalesced_regions() {
    let xor = SimXor;
    let mut data = filled_sectors(&xor, 8, 0x80, 0x66);
    // Corrupt sectors 3 and 4 (contiguous) and invalidate sector 6.
    data[3 * BLOCK_BYTES + 7] ^= 0x01;
    data[4 * BLOCK_BYTES + 7] ^= 0x01;
    xor.invalidate_sectors(
        &mut data[6 * BLOCK_BYTES..7 * BLOCK_BYTES],
        0x86,
        InvalidateReason::VerifyUncorrectable,
    );
    let report = xor.verify_strip(&[SectorRun { position: 2, seed_lba: 0x80, data: &data }]);
    assert_eq!(report.uncorrectable_bitmap, 0b100);
    assert_eq!(report.invalidated_bitmap, 0b100);
    let uncorrectable: Vec<_> = report
        .regions
        .iter()
        .filter(|r| r.kind == ErrorRegionKind::Uncorrectable)
        .collect();
    assert_eq!(uncorrectable.len(), 1);
    assert_eq!(uncorrectable[0].lba, 0x83);
    assert_eq!(uncorrectable[0].blocks, 2);
}
