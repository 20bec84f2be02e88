use crate::transact::Opcode;
use crate::transact::iots::{Iots, IotsStatus, RequestClass};
use crate::transact::siots::{Algorithm, Siots, SiotsState, SiotsStatus};

fn sized_siots() -> Siots {
    let mut siots = Siots::default();
    siots.algorithm = Some(Algorithm::R0Read);
    siots.xfer_count = 64;
    siots.data_disks = 2;
    siots.drive_operations = 2;
    siots
}

#[test]
fn carve_takes_the_next_unclaimed_range() {
    let mut iots = Iots::new(Opcode::Read, 1000, 100, RequestClass::Foreground);
    assert!(iots.dec_blocks(40));
    let siots = Siots::carve(&iots);
    assert_eq!(siots.start_lba, 1040);
    assert_eq!(siots.xfer_count, 60);
    assert_eq!(siots.state, SiotsState::Generate);
}

#[test]
fn validate_accepts_a_complete_siots() {
    let siots = sized_siots();
    assert!(siots.validate(4, 8).is_ok());
}

#[test]
fn validate_rejects_missing_algorithm_and_zero_transfer() {
    let mut siots = sized_siots();
    siots.algorithm = None;
    assert!(siots.validate(4, 8).is_err());

    let mut siots = sized_siots();
    siots.xfer_count = 0;
    assert!(siots.validate(4, 8).is_err());
}

#[test]
fn validate_rejects_out_of_range_positions() {
    let mut siots = sized_siots();
    siots.start_pos = 4;
    assert!(siots.validate(4, 8).is_err());

    let mut siots = sized_siots();
    siots.data_disks = 5;
    assert!(siots.validate(4, 8).is_err());
}

#[test]
fn validate_requires_aligned_verify_ranges() {
    let mut siots = sized_siots();
    siots.algorithm = Some(Algorithm::R0Verify);
    siots.parity_start = 8;
    siots.parity_count = 16;
    assert!(siots.validate(4, 8).is_ok());

    siots.parity_start = 10;
    assert!(siots.validate(4, 8).is_err());
    siots.parity_start = 8;
    siots.parity_count = 15;
    assert!(siots.validate(4, 8).is_err());
}

#[test]
fn first_recorded_error_sticks() {
    let mut siots = sized_siots();
    siots.set_error(SiotsStatus::Success);
    siots.set_error(SiotsStatus::Shutdown);
    siots.set_error(SiotsStatus::Aborted);
    assert_eq!(siots.error, Some(SiotsStatus::Shutdown));
}

#[test]
fn siots_status_maps_onto_owner_statuses() {
    assert_eq!(SiotsStatus::Success.to_iots_status(), IotsStatus::Success);
    assert_eq!(SiotsStatus::ReduceQdSoft.to_iots_status(), IotsStatus::Success);
    assert_eq!(SiotsStatus::WriteCrcError.to_iots_status(), IotsStatus::IoFailed);
    // Path conditions completed no data; the owner must reissue.
    assert_eq!(SiotsStatus::NotPreferred.to_iots_status(), IotsStatus::IoFailed);
    assert_eq!(SiotsStatus::ReduceQdHard.to_iots_status(), IotsStatus::IoFailed);
    assert_eq!(SiotsStatus::Shutdown.to_iots_status(), IotsStatus::Shutdown);
    assert_eq!(SiotsStatus::Aborted.to_iots_status(), IotsStatus::Aborted);
}
