use crate::transact::fruts::{FruInfo, FruOpcode, FruResult, Fruts, FrutsChain};

fn chain_of(results: &[(usize, Option<FruResult>)]) -> FrutsChain {
    let mut chain = FrutsChain::new();
    for &(pos, result) in results {
        let mut f = Fruts::from_info(&FruInfo::new(pos, 0x100, 8), FruOpcode::Read);
        f.result = result;
        chain.push(f);
    }
    chain
}

#[test]
fn outstanding_counts_only_active_incomplete() {
    let mut chain = chain_of(&[
        (0, Some(FruResult::Success)),
        (1, None),
        (2, None),
    ]);
    assert_eq!(chain.outstanding(), 2);
    chain.set_noop(2);
    assert_eq!(chain.outstanding(), 1);
}

#[test]
fn bitmap_where_skips_noops() {
    let mut chain = chain_of(&[
        (0, Some(FruResult::HardMedia)),
        (1, Some(FruResult::Success)),
        (3, Some(FruResult::HardMedia)),
    ]);
    assert_eq!(chain.bitmap_where(|r| r == FruResult::HardMedia), 0b1001);
    chain.set_noop(3);
    assert_eq!(chain.bitmap_where(|r| r == FruResult::HardMedia), 0b0001);
}

#[test]
fn reset_positions_clears_only_masked_members() {
    let mut chain = chain_of(&[
        (0, Some(FruResult::Retryable)),
        (1, Some(FruResult::Success)),
    ]);
    chain.reset_positions(0b01);
    assert!(chain.find_position(0).unwrap().result.is_none());
    assert_eq!(chain.find_position(1).unwrap().result, Some(FruResult::Success));
}

#[test]
fn min_lba_reports_lowest_failing_member() {
    let mut chain = FrutsChain::new();
    for (pos, lba) in [(0usize, 0x400u64), (1, 0x200), (2, 0x300)] {
        let mut f = Fruts::from_info(&FruInfo::new(pos, lba, 4), FruOpcode::Read);
        f.result = Some(if pos == 1 { FruResult::Success } else { FruResult::HardMedia });
        chain.push(f);
    }
    assert_eq!(chain.min_lba_where(|r| r == FruResult::HardMedia), Some(0x300));
}
