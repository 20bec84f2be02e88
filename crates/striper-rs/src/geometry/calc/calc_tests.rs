use crate::geometry::calc::{logical_to_physical, physical_to_logical};
use crate::geometry::{RaidParams, RaidType};

fn raid0() -> RaidParams {
    RaidParams::new(RaidType::Raid0, 4, 128, 8, 0x10000).unwrap()
}

#[test]
fn first_stripe_maps_in_element_order() {
    let p = raid0();
    for pos in 0..4u64 {
        let addr = logical_to_physical(&p, pos * 128).unwrap();
        assert_eq!(addr.data_pos, pos as usize);
        assert_eq!(addr.pba, 0);
        assert_eq!(addr.drives, [Some(pos as usize), None]);
    }
}

#[test]
fn second_stripe_advances_the_row() {
    let p = raid0();
    let addr = logical_to_physical(&p, 512 + 130).unwrap();
    assert_eq!(addr.data_pos, 1);
    assert_eq!(addr.pba, 128 + 2);
}

#[test]
fn round_trips_across_the_address_space() {
    let p = raid0();
    for lba in [0, 1, 127, 128, 511, 512, 513, 4096, 99_999] {
        let addr = logical_to_physical(&p, lba).unwrap();
        assert_eq!(physical_to_logical(&p, addr.pba, addr.data_pos).unwrap(), lba);
    }
}

#[test]
fn raid10_reports_both_mirror_members() {
    let p = RaidParams::new(RaidType::Raid10, 3, 64, 8, 0x10000).unwrap();
    let addr = logical_to_physical(&p, 64 * 2 + 5).unwrap();
    assert_eq!(addr.data_pos, 2);
    assert_eq!(addr.drives, [Some(4), Some(5)]);
}

#[test]
fn rejects_out_of_range_inputs() {
    let p = raid0();
    assert!(logical_to_physical(&p, p.configured_capacity()).is_err());
    assert!(physical_to_logical(&p, 0, 4).is_err());
    assert!(physical_to_logical(&p, p.capacity_per_disk, 0).is_err());
}
