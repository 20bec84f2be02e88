use crate::geometry::{
    Extent, RaidParams, RaidType, align_end_reduce, align_range_to_optimal,
    is_aligned_to_optimal, logical_offset_of_physical, parity_footprint, physical_geometry,
    position_extent, stripe_range,
};

fn params(width: usize, element: u64) -> RaidParams {
    RaidParams::new(RaidType::Raid0, width, element, 8, 0x10000).unwrap()
}

#[test]
fn physical_geometry_maps_every_position_uniquely() {
    let p = params(4, 128);
    let geo = physical_geometry(&p, 300).unwrap();
    let mut seen = [false; 4];
    for &pos in &geo.positions[..geo.width] {
        assert!(pos < 4);
        assert!(!seen[pos], "position {pos} duplicated");
        seen[pos] = true;
    }
}

#[test]
fn physical_geometry_start_offsets() {
    let p = params(4, 128);
    // lba 300 = stripe 0 (512 blocks per stripe), element index 2, offset 44.
    let geo = physical_geometry(&p, 300).unwrap();
    assert_eq!(geo.logical_parity_start, 0);
    assert_eq!(geo.start_index, 2);
    assert_eq!(geo.start_offset_rel_parity_stripe, 44);
    assert_eq!(geo.blocks_remaining_in_parity, 84);

    // One full stripe later the row advances by one element.
    let geo = physical_geometry(&p, 300 + 512).unwrap();
    assert_eq!(geo.logical_parity_start, 128);
    assert_eq!(geo.start_index, 2);
}

#[test]
fn physical_geometry_rejects_out_of_range_start() {
    let p = params(2, 128);
    assert!(physical_geometry(&p, p.configured_capacity()).is_err());
}

#[test]
fn raid_params_rejects_bad_shapes() {
    assert!(RaidParams::new(RaidType::Raid0, 0, 128, 8, 0x1000).is_err());
    assert!(RaidParams::new(RaidType::Raid0, 4, 0, 8, 0x1000).is_err());
    // Optimal block size must divide the element size.
    assert!(RaidParams::new(RaidType::Raid10, 4, 100, 8, 0x1000).is_err());
}

#[test]
fn stripe_range_single_element_access() {
    // Entirely inside data index 1 of stripe 0.
    let range = stripe_range(140, 20, 128, 4);
    assert_eq!(range[0], Extent { start_lba: 12, size: 20 });
    assert_eq!(range[1].size, 0);
}

#[test]
fn stripe_range_tail_of_stripe_into_next() {
    // Begins in the last element of stripe 0 and continues into stripe 1.
    let range = stripe_range(500, 40, 128, 4);
    assert_eq!(range[0].start_lba, 500 % 128);
    // 12 blocks to finish stripe 0's last element, 28 land in stripe 1.
    assert_eq!(range[0].size, 12 + 28);
    assert_eq!(range[1].size, 0);
}

#[test]
fn stripe_range_discontiguous_extents() {
    // Ends in the element following its start without overlapping: lba 120,
    // 20 blocks -> 8 blocks at the end of index 0, 12 at the start of index 1.
    let range = stripe_range(120, 20, 128, 4);
    assert_eq!(range[0], Extent { start_lba: 0, size: 12 });
    assert_eq!(range[1], Extent { start_lba: 120, size: 8 });
}

#[test]
fn stripe_range_whole_stripes() {
    let range = stripe_range(0, 512 * 3, 128, 4);
    assert_eq!(range[0], Extent { start_lba: 0, size: 128 * 3 });
    assert_eq!(range[1].size, 0);
}

#[test]
fn parity_footprint_covers_discontiguous_span() {
    let (start, count) = parity_footprint(120, 20, 128, 4);
    assert_eq!(start, 0);
    assert_eq!(count, 128);
}

#[test]
fn position_extent_one_element_per_disk() {
    for index in 0..4 {
        let (plba, pcount) = position_extent(0, 512, 128, 4, index).unwrap();
        assert_eq!(plba, 0);
        assert_eq!(pcount, 128);
    }
}

#[test]
fn position_extent_partial_and_missing_members() {
    // lba 10 len 5 touches only data index 0.
    assert_eq!(position_extent(10, 5, 128, 4, 0), Some((10, 5)));
    for index in 1..4 {
        assert_eq!(position_extent(10, 5, 128, 4, index), None);
    }
}

#[test]
fn position_extent_multi_stripe_is_contiguous() {
    // 2.5 stripes starting mid element on index 1.
    let lba = 128 + 30;
    let blocks = 512 * 2 + 200;
    let sum: u64 = (0..4)
        .filter_map(|i| position_extent(lba, blocks, 128, 4, i))
        .map(|(_, c)| c)
        .sum();
    assert_eq!(sum, blocks);
}

#[test]
fn position_extent_round_trips_through_logical_offset() {
    let lba = 700;
    let blocks = 900;
    for index in 0..4 {
        if let Some((plba, _)) = position_extent(lba, blocks, 128, 4, index) {
            let logical = logical_offset_of_physical(plba, 128, 4, index);
            assert!(logical >= lba && logical < lba + blocks);
            // The member holding `logical` is `index`.
            assert_eq!((logical / 128) % 4, index as u64);
        }
    }
}

#[test]
fn alignment_helpers() {
    assert!(is_aligned_to_optimal(64, 64, 8));
    assert!(!is_aligned_to_optimal(10, 5, 8));
    assert_eq!(align_range_to_optimal(10, 5, 8), (8, 8));
    assert_eq!(align_range_to_optimal(8, 8, 8), (8, 8));
    // End trimmed back to the element boundary.
    assert_eq!(align_end_reduce(128, 100, 200), 156);
    // Unchanged when trimming would leave nothing.
    assert_eq!(align_end_reduce(128, 10, 5), 5);
}
