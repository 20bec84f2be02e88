use crate::transact::Opcode;
use crate::transact::iots::{Iots, IotsStatus, MediaQualifier, RequestClass};

#[test]
fn dec_blocks_is_the_only_way_down() {
    let mut iots = Iots::new(Opcode::Read, 100, 50, RequestClass::Foreground);
    assert_eq!(iots.next_lba(), 100);
    assert!(iots.dec_blocks(20));
    assert_eq!(iots.blocks_remaining(), 30);
    assert_eq!(iots.next_lba(), 120);
    // Claiming more than remains, or nothing at all, is refused.
    assert!(!iots.dec_blocks(31));
    assert!(!iots.dec_blocks(0));
    assert!(iots.dec_blocks(30));
    assert_eq!(iots.blocks_remaining(), 0);
}

#[test]
fn first_error_sticks() {
    let mut iots = Iots::new(Opcode::Write, 0, 8, RequestClass::Foreground);
    iots.merge_status(IotsStatus::Success);
    iots.merge_status(IotsStatus::MediaError { lba: 3, qualifier: MediaQualifier::DataLost });
    iots.merge_status(IotsStatus::Success);
    iots.merge_status(IotsStatus::IoFailed);
    assert_eq!(
        iots.status(),
        Some(IotsStatus::MediaError { lba: 3, qualifier: MediaQualifier::DataLost })
    );
    assert_eq!(iots.error_count, 2);
}

#[test]
fn request_class_background_policy() {
    assert!(!RequestClass::Foreground.is_background());
    assert!(RequestClass::Background.is_background());
    assert!(RequestClass::Metadata.is_background());
    assert!(RequestClass::Monitor.is_background());
}

#[test]
fn host_offset_is_relative_to_request_start() {
    let iots = Iots::new(Opcode::Read, 64, 16, RequestClass::Foreground);
    assert_eq!(iots.host_offset(64), 0);
    assert_eq!(iots.host_offset(66), 2 * crate::BLOCK_BYTES);
}
