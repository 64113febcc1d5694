//! Per-bucket retrieval strategies.
//!
//! Every strategy answers the same question for one query and one probe
//! bucket: which rows can beat the current threshold? They differ in how they
//! generate candidates before computing full inner products.
//!
//! # Strategies
//!
//! | Kind | Candidate generation | Exact |
//! |------|----------------------|-------|
//! | [`StrategyKind::Length`] | every row, stop at the length cutoff | yes |
//! | [`StrategyKind::Coordinate`] | per-coordinate feasible intervals on sorted lists | yes |
//! | [`StrategyKind::ThresholdAlgorithm`] | sorted access with random access verification | yes |
//! | [`StrategyKind::ThresholdAlgorithmNra`] | sorted access only, verify by upper bound | yes |
//! | [`StrategyKind::Lsh`] | sketch block collisions | no |
//! | [`StrategyKind::ApproximatePruning`] | prefix sums over focus coordinates | yes |
//!
//! All of them work in cosine space: a candidate row must satisfy
//! `q̂ · p̂ >= θ_b`, the bucket-local threshold derived from the global score
//! floor (see [`ProbeBucket::local_threshold`]). In top-k mode the floor rises
//! as the scratch heap improves, so the longer-running strategies refresh
//! `θ_b` while they scan.
//!
//! Sorted-list strategies read the focus coordinates from the query's
//! coordinate queue (largest `|q̂_j|` first) and use the first
//! `Scratch::num_lists` of them.
//!
//! # References
//!
//! - Teflioudi, Gemulla, Mykytiuk (2015): "LEMP: Fast Retrieval of Large
//!   Entries in a Matrix Product"
//! - Fagin, Lotem, Naor (2003): "Optimal aggregation algorithms for middleware"
//! - Charikar (2002): "Similarity estimation techniques from rounding algorithms"

use serde::{Deserialize, Serialize};

use crate::bucket::{ProbeBucket, QueryBatch};
use crate::context::{AuxState, Phase, Scratch};
use crate::matrix::VectorMatrix;

pub mod coordinate;
pub mod length;
pub mod lsh;
pub mod nra;
pub mod prefix;
pub mod ta;

/// Slack applied to cosine-space comparisons so rounding never prunes a
/// qualifying row.
pub(crate) const COSINE_SLACK: f32 = 1e-5;

/// The retrieval strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Length,
    Coordinate,
    ThresholdAlgorithm,
    ThresholdAlgorithmNra,
    Lsh,
    ApproximatePruning,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 6] = [
        StrategyKind::Length,
        StrategyKind::Coordinate,
        StrategyKind::ThresholdAlgorithm,
        StrategyKind::ThresholdAlgorithmNra,
        StrategyKind::Lsh,
        StrategyKind::ApproximatePruning,
    ];

    /// Buckets must carry per-coordinate sorted lists.
    pub fn needs_sorted_lists(self) -> bool {
        matches!(
            self,
            StrategyKind::Coordinate
                | StrategyKind::ThresholdAlgorithm
                | StrategyKind::ThresholdAlgorithmNra
        )
    }

    /// Buckets must carry LSH sketches.
    pub fn needs_sketches(self) -> bool {
        self == StrategyKind::Lsh
    }

    /// Queries must carry coordinate queues.
    pub fn uses_queue(self) -> bool {
        matches!(
            self,
            StrategyKind::Coordinate
                | StrategyKind::ThresholdAlgorithm
                | StrategyKind::ThresholdAlgorithmNra
                | StrategyKind::ApproximatePruning
        )
    }

    /// Whether the number of focus coordinates is a tunable knob.
    pub fn list_based(self) -> bool {
        self.uses_queue()
    }

    /// Never misses a qualifying row (with `gamma == 0`).
    pub fn is_exact(self) -> bool {
        self != StrategyKind::Lsh
    }

    pub fn name(self) -> &'static str {
        match self {
            StrategyKind::Length => "length",
            StrategyKind::Coordinate => "coordinate",
            StrategyKind::ThresholdAlgorithm => "threshold_algorithm",
            StrategyKind::ThresholdAlgorithmNra => "threshold_algorithm_nra",
            StrategyKind::Lsh => "lsh",
            StrategyKind::ApproximatePruning => "approximate_pruning",
        }
    }

    /// Report every row of `bucket` whose inner product with the query is
    /// at least `theta`, appending to the scratch matches.
    pub fn scan_above(
        self,
        query: &QueryView<'_>,
        bucket: &ProbeBucket,
        theta: f32,
        scratch: &mut Scratch<'_>,
    ) {
        self.scan(query, bucket, Target::Above(theta), scratch);
    }

    /// Offer the rows of `bucket` that can enter the scratch heap.
    ///
    /// The query must already be moved into scratch.
    pub fn scan_top_k(self, query: &QueryView<'_>, bucket: &ProbeBucket, scratch: &mut Scratch<'_>) {
        self.scan(query, bucket, Target::TopK, scratch);
    }

    /// [`scan_above`](Self::scan_above) for every query of a batch, stopping
    /// at the first query too short for the bucket's scan threshold.
    ///
    /// Queue-based kinds expect the batch's queues to be built.
    pub fn scan_batch_above(
        self,
        batch: &QueryBatch,
        queries: &VectorMatrix,
        bucket: &ProbeBucket,
        theta: f32,
        scratch: &mut Scratch<'_>,
    ) {
        debug_assert!(!self.uses_queue() || batch.queues_initialized());
        let phase = match self {
            StrategyKind::Length => Phase::Length,
            _ => Phase::Scan,
        };
        let started = scratch.out.start();
        for pos in batch.rows() {
            if queries.norm(pos) < bucket.scan_threshold() {
                break;
            }
            let view = QueryView::new(queries, pos, batch.queue(pos));
            if !view.may_reach(bucket, theta) {
                continue;
            }
            self.scan_above(&view, bucket, theta, scratch);
        }
        scratch.out.stop(started, phase);
    }

    fn scan(self, query: &QueryView<'_>, bucket: &ProbeBucket, target: Target, s: &mut Scratch<'_>) {
        match self {
            StrategyKind::Length => length::scan(query, bucket, target, s),
            StrategyKind::Coordinate => coordinate::scan(query, bucket, target, s),
            StrategyKind::ThresholdAlgorithm => ta::scan(query, bucket, target, s),
            StrategyKind::ThresholdAlgorithmNra => nra::scan(query, bucket, target, s),
            StrategyKind::Lsh => lsh::scan(query, bucket, target, s),
            StrategyKind::ApproximatePruning => prefix::scan(query, bucket, target, s),
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// What verified candidates are checked against.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target {
    /// Fixed global threshold θ.
    Above(f32),
    /// The scratch heap's current k-th best.
    TopK,
}

impl Target {
    /// Whether a row whose best possible score is `bound` is out of reach.
    ///
    /// Above-θ keeps ties (`>= θ`); the heap only admits strict improvements.
    #[inline]
    pub fn cannot_reach(self, bound: f32, floor: f32) -> bool {
        match self {
            Target::Above(_) => bound < floor,
            Target::TopK => bound <= floor,
        }
    }
}

/// One query as the strategies see it.
#[derive(Debug, Clone, Copy)]
pub struct QueryView<'q> {
    /// Row position in the sorted query matrix.
    pub pos: usize,
    /// External query id.
    pub id: u32,
    pub direction: &'q [f32],
    pub norm: f32,
    /// Focus coordinates, largest `|q̂_j|` first.
    pub queue: &'q [u32],
}

impl<'q> QueryView<'q> {
    pub fn new(queries: &'q VectorMatrix, pos: usize, queue: &'q [u32]) -> Self {
        Self {
            pos,
            id: queries.id(pos),
            direction: queries.row(pos),
            norm: queries.norm(pos),
            queue,
        }
    }

    /// Ball-bound prefilter: `false` when no row of the bucket can reach
    /// `floor`. Only ever used to skip a bucket, never to retire a query.
    #[inline]
    pub fn may_reach(&self, bucket: &ProbeBucket, floor: f32) -> bool {
        if !floor.is_finite() {
            return floor != f32::INFINITY;
        }
        let best = bucket.ball().max_inner_product(self.direction, 1.0) * self.norm;
        best + BALL_SLACK * (1.0 + best.abs()) >= floor
    }

    /// Focus coordinates to use, capped by the queue length.
    #[inline]
    pub(crate) fn focus(&self, num_lists: usize) -> &'q [u32] {
        &self.queue[..num_lists.min(self.queue.len())]
    }
}

/// Relative slack on ball-bound comparisons.
const BALL_SLACK: f32 = 1e-4;

/// Panics when a context's auxiliary state does not belong to `kind`.
#[cold]
#[track_caller]
pub(crate) fn state_mismatch(kind: StrategyKind, aux: &AuxState) -> ! {
    panic!(
        "{kind} strategy invoked on a context holding {} state; the context must be built for the configured method",
        aux.kind()
    )
}

/// Panics when a bucket lacks an index `kind` needs.
#[cold]
#[track_caller]
pub(crate) fn missing_index(kind: StrategyKind, bucket: &ProbeBucket) -> ! {
    panic!(
        "{kind} strategy invoked on bucket {} built without its index",
        bucket.index()
    )
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for the strategy tests.

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::config::RetrievalConfig;
    use crate::heap::sorted_candidates;

    pub fn random_rows(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let scale = rng.random_range(0.2f32..2.0);
                (0..dim).map(|_| rng.random_range(-1.0f32..1.0) * scale).collect()
            })
            .collect()
    }

    pub struct Fixture {
        pub queries: VectorMatrix,
        pub probes: VectorMatrix,
    }

    impl Fixture {
        pub fn new(nq: usize, np: usize, dim: usize, seed: u64) -> Self {
            Self {
                queries: VectorMatrix::from_rows(&random_rows(nq, dim, seed), false).unwrap(),
                probes: VectorMatrix::from_rows(&random_rows(np, dim, seed + 1), false).unwrap(),
            }
        }

        pub fn bucket(&self, kind: StrategyKind) -> ProbeBucket {
            ProbeBucket::new(0, &self.probes, 0..self.probes.len(), kind, 7)
        }

        pub fn queue(&self, pos: usize, len: usize) -> Vec<u32> {
            let mut order = Vec::new();
            crate::bucket::coordinate_queue(self.queries.row(pos), &mut order);
            order.truncate(len);
            order
        }

        pub fn scratch(&self, kind: StrategyKind, k: usize, num_lists: usize) -> Scratch<'_> {
            let config = RetrievalConfig::default();
            let mut s = Scratch::new(&self.probes, kind, k, self.probes.len(), &config);
            s.num_lists = num_lists;
            s
        }

        /// Probe ids with score `>= theta` for query `pos`, sorted.
        pub fn brute_above(&self, pos: usize, theta: f32) -> Vec<u32> {
            let mut ids: Vec<u32> = (0..self.probes.len())
                .filter(|&r| self.queries.inner_product(pos, &self.probes, r) >= theta)
                .map(|r| self.probes.id(r))
                .collect();
            ids.sort_unstable();
            ids
        }

        /// Best `k` scores for query `pos`, descending.
        pub fn brute_top_k(&self, pos: usize, k: usize) -> Vec<f32> {
            let mut scores: Vec<f32> = (0..self.probes.len())
                .map(|r| self.queries.inner_product(pos, &self.probes, r))
                .collect();
            scores.sort_by(|a, b| b.total_cmp(a));
            scores.truncate(k);
            scores
        }
    }

    /// Run `kind` above-θ for one query and return the sorted matched ids.
    pub fn above_ids(f: &Fixture, kind: StrategyKind, pos: usize, theta: f32, lists: usize) -> Vec<u32> {
        let bucket = f.bucket(kind);
        let queue = f.queue(pos, lists);
        let view = QueryView::new(&f.queries, pos, &queue);
        let mut s = f.scratch(kind, 0, lists);
        kind.scan_above(&view, &bucket, theta, &mut s);
        let mut ids: Vec<u32> = s.matches().iter().map(|m| m.probe_id).collect();
        ids.sort_unstable();
        ids
    }

    /// Run `kind` top-k for one query from an empty heap; scores descending.
    pub fn top_k_scores(f: &Fixture, kind: StrategyKind, pos: usize, k: usize, lists: usize) -> Vec<f32> {
        let bucket = f.bucket(kind);
        let queue = f.queue(pos, lists);
        let view = QueryView::new(&f.queries, pos, &queue);
        let mut s = f.scratch(kind, k, lists);
        kind.scan_top_k(&view, &bucket, &mut s);
        sorted_candidates(s.heap().as_slice())
            .iter()
            .map(|c| c.score)
            .collect()
    }

    pub fn assert_scores_close(got: &[f32], expected: &[f32]) {
        assert_eq!(got.len(), expected.len(), "got {got:?}, expected {expected:?}");
        for (g, e) in got.iter().zip(expected) {
            assert!((g - e).abs() < 1e-4, "got {got:?}, expected {expected:?}");
        }
    }
}
