//! Length scan: the baseline every other strategy is measured against.
//!
//! Rows are visited in descending length. Since `q · p <= |q| |p|`, the scan
//! stops at the first row whose length bound cannot reach the floor.

use super::{QueryView, Target};
use crate::bucket::ProbeBucket;
use crate::context::Scratch;

pub(crate) fn scan(query: &QueryView<'_>, bucket: &ProbeBucket, target: Target, s: &mut Scratch<'_>) {
    let out = &mut s.out;
    let probes = out.probes;
    for row in bucket.rows() {
        let floor = out.floor(target, query.norm);
        if target.cannot_reach(query.norm * probes.norm(row), floor) {
            break;
        }
        out.verify(query, row, target);
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::StrategyKind;

    #[test]
    fn stops_at_length_cutoff() {
        let f = Fixture::new(1, 200, 4, 3);
        let bucket = f.bucket(StrategyKind::Length);
        let view = super::QueryView::new(&f.queries, 0, &[]);
        let mut s = f.scratch(StrategyKind::Length, 0, 1);

        let theta = f.queries.norm(0) * f.probes.norm(20);
        StrategyKind::Length.scan_above(&view, &bucket, theta, &mut s);
        assert!(s.stats().comparisons <= 21);
        assert_eq!(above_ids(&f, StrategyKind::Length, 0, theta, 1), f.brute_above(0, theta));
    }

    #[test]
    fn unreachable_threshold_does_no_work() {
        let f = Fixture::new(1, 50, 4, 9);
        let bucket = f.bucket(StrategyKind::Length);
        let view = super::QueryView::new(&f.queries, 0, &[]);
        let mut s = f.scratch(StrategyKind::Length, 0, 1);
        StrategyKind::Length.scan_above(&view, &bucket, 1e6, &mut s);
        assert_eq!(s.stats().comparisons, 0);
        assert!(s.matches().is_empty());
    }
}
