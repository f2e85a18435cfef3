// src/bidding/rotation.rs

use std::sync::Arc;

use rand::distributions::{Distribution, WeightedError, WeightedIndex};
use rand::Rng;
use thiserror::Error;

use crate::model::Banner;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    /// 候选不为空但出价全为 0，属于数据问题
    #[error("all {candidates} candidates have zero price")]
    ZeroWeight { candidates: usize },
    #[error("invalid rotation weights: {0}")]
    Weights(WeightedError),
}

fn weights(candidates: &[Arc<Banner>]) -> Result<WeightedIndex<u64>, SelectionError> {
    WeightedIndex::new(candidates.iter().map(|banner| banner.price)).map_err(|error| match error {
        WeightedError::AllWeightsZero => SelectionError::ZeroWeight {
            candidates: candidates.len(),
        },
        other => SelectionError::Weights(other),
    })
}

/// **按出价加权随机选出一个候选**，返回下标
///
/// 候选为空返回 `Ok(None)`；出价全为 0 返回 `ZeroWeight`。
pub fn select<R: Rng + ?Sized>(candidates: &[Arc<Banner>], rng: &mut R) -> Result<Option<usize>, SelectionError> {
    if candidates.is_empty() {
        return Ok(None);
    }
    let index = weights(candidates)?;
    Ok(Some(index.sample(rng)))
}

/// 不放回地选出至多 `count` 个候选，按选中顺序返回下标
///
/// 出价为 0 的候选不会被选中；剩余候选出价全为 0 时提前结束。
pub fn select_many<R: Rng + ?Sized>(
    candidates: &[Arc<Banner>],
    count: usize,
    rng: &mut R,
) -> Result<Vec<usize>, SelectionError> {
    if candidates.is_empty() || count == 0 {
        return Ok(Vec::new());
    }
    let mut index = weights(candidates)?;
    let mut picked = Vec::with_capacity(count.min(candidates.len()));

    while picked.len() < count {
        let winner = index.sample(rng);
        picked.push(winner);
        match index.update_weights(&[(winner, &0)]) {
            Ok(()) => {}
            Err(WeightedError::AllWeightsZero) => break,
            Err(other) => return Err(SelectionError::Weights(other)),
        }
    }
    Ok(picked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::fixtures::banner;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn empty_set_is_not_an_error() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(select(&[], &mut rng), Ok(None));
        assert_eq!(select_many(&[], 3, &mut rng), Ok(Vec::new()));
    }

    #[test]
    fn all_zero_prices_fail_explicitly() {
        let mut rng = StdRng::seed_from_u64(1);
        let candidates = vec![banner(1, 0), banner(2, 0)];
        assert_eq!(
            select(&candidates, &mut rng),
            Err(SelectionError::ZeroWeight { candidates: 2 })
        );
        assert_eq!(
            select_many(&candidates, 1, &mut rng),
            Err(SelectionError::ZeroWeight { candidates: 2 })
        );
    }

    #[test]
    fn single_candidate_is_always_selected() {
        let mut rng = StdRng::seed_from_u64(7);
        let candidates = vec![banner(1, 5)];
        for _ in 0..100 {
            assert_eq!(select(&candidates, &mut rng), Ok(Some(0)));
        }
    }

    #[test]
    fn frequencies_converge_to_price_share() {
        let mut rng = StdRng::seed_from_u64(42);
        let candidates = vec![banner(1, 100), banner(2, 200), banner(3, 300)];
        let draws = 10_000;
        let mut hits = [0usize; 3];
        for _ in 0..draws {
            let winner = select(&candidates, &mut rng).expect("positive prices").expect("non-empty");
            hits[winner] += 1;
        }

        assert!(hits[0] < hits[1] && hits[1] < hits[2], "not monotonic: {hits:?}");
        for (i, price) in [100.0, 200.0, 300.0].into_iter().enumerate() {
            let expected = price / 600.0;
            let observed = hits[i] as f64 / draws as f64;
            assert!(
                (observed - expected).abs() <= expected * 0.1,
                "candidate {i}: observed {observed}, expected {expected}"
            );
        }
    }

    #[test]
    fn many_winners_are_distinct_and_skip_zero_prices() {
        let mut rng = StdRng::seed_from_u64(3);
        let candidates = vec![banner(1, 10), banner(2, 0), banner(3, 30)];
        let picked = select_many(&candidates, 3, &mut rng).expect("some prices are positive");
        let mut sorted = picked.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 2]);
    }

    proptest! {
        #[test]
        fn select_many_never_repeats(prices in proptest::collection::vec(1i64..1_000, 1..20), count in 1usize..25, seed in any::<u64>()) {
            let candidates: Vec<_> = prices.iter().enumerate().map(|(i, p)| banner(i as i64 + 1, *p)).collect();
            let mut rng = StdRng::seed_from_u64(seed);
            let picked = select_many(&candidates, count, &mut rng).expect("positive prices");
            prop_assert_eq!(picked.len(), count.min(candidates.len()));
            let mut unique = picked.clone();
            unique.sort_unstable();
            unique.dedup();
            prop_assert_eq!(unique.len(), picked.len());
        }
    }
}
