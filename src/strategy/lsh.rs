//! Sign-random-projection LSH candidate generation.
//!
//! Every probe row carries [`LSH_SIGNATURES`] blocks of [`LSH_CODE_BITS`]
//! sign bits. Two unit vectors at cosine `θ` agree on one bit with
//! probability `p = 1 - acos(θ) / π`, on a whole block with `p^8`. Using the
//! first `b` blocks, a row at cosine `θ` collides on at least one of them
//! with probability `1 - (1 - p^8)^b`; the strategy picks the fewest blocks
//! that reach the configured recall at `θ_b` and verifies every row that
//! collides. Rows are missed with probability at most `1 - recall`.
//!
//! For `θ_b <= 0` the bound is useless and the length scan takes over.

use super::{length, missing_index, state_mismatch, QueryView, StrategyKind, Target, COSINE_SLACK};
use crate::bucket::{ProbeBucket, LSH_CODE_BITS, LSH_SIGNATURES};
use crate::context::{AuxState, Scratch};

/// Query sketch buffer and the recall-derived blocks table.
#[derive(Debug, Clone)]
pub struct LshState {
    sketch: [u8; LSH_SIGNATURES],
    /// `thresholds[b - 1]`: lowest cosine at which `b` blocks reach the recall.
    thresholds: [f32; LSH_SIGNATURES],
}

impl LshState {
    pub fn new(recall: f32) -> Self {
        Self {
            sketch: [0; LSH_SIGNATURES],
            thresholds: blocks_table(recall),
        }
    }

    /// Fewest blocks whose recall target holds at cosine `theta_b`.
    pub fn blocks_for(&self, theta_b: f32) -> usize {
        self.thresholds
            .iter()
            .position(|&t| t <= theta_b)
            .map_or(LSH_SIGNATURES, |i| i + 1)
    }
}

fn blocks_table(recall: f32) -> [f32; LSH_SIGNATURES] {
    let recall = f64::from(recall);
    let mut table = [0.0f32; LSH_SIGNATURES];
    for (i, t) in table.iter_mut().enumerate() {
        let blocks = (i + 1) as f64;
        let block_prob = 1.0 - (1.0 - recall).powf(1.0 / blocks);
        let bit_prob = block_prob.powf(1.0 / LSH_CODE_BITS as f64);
        *t = ((1.0 - bit_prob) * std::f64::consts::PI).cos() as f32;
    }
    table
}

pub(crate) fn scan(query: &QueryView<'_>, bucket: &ProbeBucket, target: Target, s: &mut Scratch<'_>) {
    let floor = s.out.floor(target, query.norm);
    let theta_b = bucket.local_threshold(floor, query.norm);
    if theta_b > 1.0 + COSINE_SLACK {
        return;
    }
    if theta_b <= 0.0 {
        return length::scan(query, bucket, target, s);
    }
    let Some(index) = bucket.lsh.as_ref() else {
        missing_index(StrategyKind::Lsh, bucket)
    };
    let Scratch { out, aux, .. } = s;
    let AuxState::Lsh(state) = aux else {
        state_mismatch(StrategyKind::Lsh, aux)
    };

    index.sketch_into(query.direction, &mut state.sketch);
    let blocks = state.blocks_for(theta_b);
    let probes = out.probes;
    for (local, row) in bucket.rows().enumerate() {
        let floor = out.floor(target, query.norm);
        if target.cannot_reach(query.norm * probes.norm(row), floor) {
            break;
        }
        out.stats.list_steps += 1;
        let collides = index
            .sketch(local)
            .iter()
            .zip(&state.sketch)
            .take(blocks)
            .any(|(a, b)| a == b);
        if collides {
            out.verify(query, row, target);
        }
    }
}

/// Probability that a row at cosine `theta` collides on one of `blocks` blocks.
#[cfg(test)]
fn collision_probability(theta: f32, blocks: usize) -> f64 {
    let p = 1.0 - f64::from(theta.clamp(-1.0, 1.0)).acos() / std::f64::consts::PI;
    1.0 - (1.0 - p.powi(LSH_CODE_BITS as i32)).powi(blocks as i32)
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;

    #[test]
    fn blocks_table_is_decreasing() {
        let table = blocks_table(0.9);
        assert!(table.windows(2).all(|w| w[0] >= w[1]));
        assert!(table[0] < 1.0);
    }

    #[test]
    fn chosen_blocks_reach_recall() {
        let state = LshState::new(0.9);
        for theta in [0.55f32, 0.7, 0.8, 0.9, 0.97] {
            let b = state.blocks_for(theta);
            if b < LSH_SIGNATURES {
                assert!(collision_probability(theta, b) >= 0.9 - 1e-3, "theta {theta}, blocks {b}");
            }
        }
        assert!(state.blocks_for(0.99) <= state.blocks_for(0.6));
    }

    #[test]
    fn finds_most_close_rows() {
        let f = Fixture::new(20, 300, 8, 31);
        let mut found = 0usize;
        let mut expected = 0usize;
        for pos in 0..20 {
            let theta = 0.8 * f.brute_top_k(pos, 1)[0];
            let truth = f.brute_above(pos, theta);
            let got = above_ids(&f, StrategyKind::Lsh, pos, theta, 1);
            assert!(got.iter().all(|id| truth.binary_search(id).is_ok()));
            expected += truth.len();
            found += got.len();
        }
        assert!(found as f64 >= 0.5 * expected as f64, "found {found} of {expected}");
    }

    #[test]
    fn non_positive_threshold_falls_back_to_exact() {
        let f = Fixture::new(3, 60, 4, 12);
        for pos in 0..3 {
            assert_eq!(
                above_ids(&f, StrategyKind::Lsh, pos, -0.1, 1),
                f.brute_above(pos, -0.1)
            );
        }
    }
}
