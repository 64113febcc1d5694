//! Probe buckets and query batches.
//!
//! Probe rows (already sorted by descending length) are cut into buckets of
//! similar length. Each bucket carries its norm range, a ball bound over its
//! raw vectors, the read-only indexes its strategies need, and the outcome of
//! tuning. Buckets are visited in descending-length order, so once a query's
//! best possible score in a bucket (`|q| * norm_max`) cannot beat its
//! threshold, no later bucket can either.
//!
//! Query batches are the unit a worker hands to a strategy. They own the
//! per-query inactive flags and the lazily built coordinate queues.

use std::ops::Range;

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, StandardNormal};

use crate::bound::BallBound;
use crate::config::BucketingParams;
use crate::matrix::VectorMatrix;
use crate::simd;
use crate::strategy::StrategyKind;

/// Sketch blocks per probe row.
pub const LSH_SIGNATURES: usize = 32;
/// Sign bits per sketch block.
pub const LSH_CODE_BITS: usize = 8;

/// Tuned configuration of a bucket.
///
/// `threshold_ratio` is `t_b`: a query with local threshold below `t_b` is
/// scanned by the length strategy, anything else by the alternative.
/// `1.0` means "always length", `-1.0` "always the alternative".
/// `list_count` is the number of focus coordinates the alternative uses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TuningOutcome {
    pub threshold_ratio: f32,
    pub list_count: usize,
}

impl TuningOutcome {
    /// Outcome for a bucket where the length scan always wins.
    pub const BASELINE: Self = Self {
        threshold_ratio: 1.0,
        list_count: 1,
    };

    #[inline]
    pub fn always_baseline(&self) -> bool {
        self.threshold_ratio == 1.0
    }
}

/// One entry of a per-coordinate sorted list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ListEntry {
    pub value: f32,
    /// Row offset inside the bucket.
    pub row: u32,
}

/// For every coordinate, the bucket's rows sorted by ascending direction value.
#[derive(Debug, Clone)]
pub struct SortedLists {
    lists: Vec<Vec<ListEntry>>,
}

impl SortedLists {
    fn build(probes: &VectorMatrix, rows: Range<usize>) -> Self {
        let dim = probes.dimension();
        let lists = (0..dim)
            .map(|j| {
                let mut list: Vec<ListEntry> = rows
                    .clone()
                    .enumerate()
                    .map(|(local, r)| ListEntry {
                        value: probes.row(r)[j],
                        row: local as u32,
                    })
                    .collect();
                list.sort_by(|a, b| a.value.total_cmp(&b.value).then(a.row.cmp(&b.row)));
                list
            })
            .collect();
        Self { lists }
    }

    #[inline]
    pub fn list(&self, coord: usize) -> &[ListEntry] {
        &self.lists[coord]
    }

    /// Positions in list `coord` whose value lies in `[lo, hi]`.
    pub fn range(&self, coord: usize, lo: f32, hi: f32) -> Range<usize> {
        let list = &self.lists[coord];
        let start = list.partition_point(|e| e.value < lo);
        let end = list.partition_point(|e| e.value <= hi);
        start..end.max(start)
    }
}

/// Sign-random-projection sketches of a bucket's rows.
#[derive(Debug, Clone)]
pub struct LshIndex {
    dimension: usize,
    hyperplanes: Vec<f32>,
    sketches: Vec<u8>,
}

impl LshIndex {
    fn build(probes: &VectorMatrix, rows: Range<usize>, seed: u64) -> Self {
        let dimension = probes.dimension();
        let mut rng = StdRng::seed_from_u64(seed);
        let hyperplanes: Vec<f32> = (0..LSH_SIGNATURES * LSH_CODE_BITS * dimension)
            .map(|_| StandardNormal.sample(&mut rng))
            .collect();
        let mut index = Self {
            dimension,
            hyperplanes,
            sketches: vec![0; rows.len() * LSH_SIGNATURES],
        };
        let mut sketch = [0u8; LSH_SIGNATURES];
        for (local, r) in rows.enumerate() {
            index.sketch_into(probes.row(r), &mut sketch);
            index.sketches[local * LSH_SIGNATURES..(local + 1) * LSH_SIGNATURES]
                .copy_from_slice(&sketch);
        }
        index
    }

    /// Compute the sketch of a direction vector.
    pub fn sketch_into(&self, direction: &[f32], out: &mut [u8]) {
        debug_assert_eq!(out.len(), LSH_SIGNATURES);
        for (block, byte) in out.iter_mut().enumerate() {
            let mut code = 0u8;
            for bit in 0..LSH_CODE_BITS {
                let h = (block * LSH_CODE_BITS + bit) * self.dimension;
                if simd::dot(direction, &self.hyperplanes[h..h + self.dimension]) >= 0.0 {
                    code |= 1 << bit;
                }
            }
            *byte = code;
        }
    }

    /// Stored sketch of the bucket row at `local`.
    #[inline]
    pub fn sketch(&self, local: usize) -> &[u8] {
        &self.sketches[local * LSH_SIGNATURES..(local + 1) * LSH_SIGNATURES]
    }
}

/// A contiguous run of probe rows with similar lengths.
#[derive(Debug, Clone)]
pub struct ProbeBucket {
    pub(crate) index: usize,
    pub(crate) rows: Range<usize>,
    pub(crate) norm_min: f32,
    pub(crate) norm_max: f32,
    pub(crate) scan_threshold: f32,
    pub(crate) ball: BallBound,
    pub(crate) lists: Option<SortedLists>,
    pub(crate) lsh: Option<LshIndex>,
    pub(crate) tuning: TuningOutcome,
}

impl ProbeBucket {
    /// Build a bucket over `rows`, with the indexes `kind` needs.
    pub fn new(
        index: usize,
        probes: &VectorMatrix,
        rows: Range<usize>,
        kind: StrategyKind,
        seed: u64,
    ) -> Self {
        debug_assert!(!rows.is_empty());
        let norm_max = probes.norm(rows.start);
        let norm_min = probes.norm(rows.end - 1);

        let mut ball = BallBound::empty(probes.dimension());
        let mut raw = vec![0.0f32; probes.dimension()];
        for r in rows.clone() {
            probes.raw_row_into(r, &mut raw);
            ball.expand_to_include(std::iter::once(raw.as_slice()));
        }

        let lists = kind
            .needs_sorted_lists()
            .then(|| SortedLists::build(probes, rows.clone()));
        let lsh = kind.needs_sketches().then(|| {
            LshIndex::build(
                probes,
                rows.clone(),
                seed ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
            )
        });

        Self {
            index,
            rows,
            norm_min,
            norm_max,
            scan_threshold: f32::NEG_INFINITY,
            ball,
            lists,
            lsh,
            tuning: TuningOutcome::BASELINE,
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn rows(&self) -> Range<usize> {
        self.rows.clone()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// `(norm_min, norm_max)` of the bucket's rows.
    #[inline]
    pub fn norm_range(&self) -> (f32, f32) {
        (self.norm_min, self.norm_max)
    }

    #[inline]
    pub fn ball(&self) -> &BallBound {
        &self.ball
    }

    #[inline]
    pub fn tuning(&self) -> TuningOutcome {
        self.tuning
    }

    /// Record the tuner's decision.
    pub fn set_after_tuning(&mut self, list_count: usize, threshold_ratio: f32) {
        self.tuning = TuningOutcome {
            threshold_ratio,
            list_count: list_count.max(1),
        };
    }

    #[inline]
    pub fn scan_threshold(&self) -> f32 {
        self.scan_threshold
    }

    /// Set the above-θ scan threshold: a query needs `|q| >= theta / norm_max`.
    pub fn set_scan_threshold(&mut self, theta: f32) {
        self.scan_threshold = if self.norm_max > 0.0 {
            theta / self.norm_max
        } else {
            f32::INFINITY
        };
    }

    /// Best inner product any row could reach with a query of this length.
    #[inline]
    pub fn best_possible(&self, query_norm: f32) -> f32 {
        query_norm * self.norm_max
    }

    /// Whether a query of length `query_norm` that needs `score` goes to the
    /// length scan under the tuned outcome: its local threshold is below
    /// `t_b`.
    #[inline]
    pub fn prefers_length(&self, score: f32, query_norm: f32) -> bool {
        self.tuning.always_baseline()
            || self.local_threshold(score, query_norm) < self.tuning.threshold_ratio
    }

    /// Lower bound on `q̂ · p̂` for any row with `q · p >= score`.
    ///
    /// Non-negative scores divide by the longest row, negative ones by the
    /// shortest; a zero denominator degrades to `-inf` (scan everything) or
    /// `+inf` (nothing can qualify).
    pub fn local_threshold(&self, score: f32, query_norm: f32) -> f32 {
        if score >= 0.0 {
            let denom = query_norm * self.norm_max;
            if denom > 0.0 {
                score / denom
            } else if score > 0.0 {
                f32::INFINITY
            } else {
                f32::NEG_INFINITY
            }
        } else {
            let denom = query_norm * self.norm_min;
            if denom > 0.0 {
                score / denom
            } else {
                f32::NEG_INFINITY
            }
        }
    }
}

/// Cut length-sorted probe rows into buckets.
pub fn bucketize(
    probes: &VectorMatrix,
    params: &BucketingParams,
    kind: StrategyKind,
    seed: u64,
) -> Vec<ProbeBucket> {
    let mut buckets = Vec::new();
    let n = probes.len();
    let mut start = 0;
    while start < n {
        let cap = probes.norm(start) * params.length_ratio;
        let mut end = start + 1;
        while end < n
            && end - start < params.max_bucket_size
            && (end - start < params.min_bucket_size || probes.norm(end) >= cap)
        {
            end += 1;
        }
        buckets.push(ProbeBucket::new(buckets.len(), probes, start..end, kind, seed));
        start = end;
    }
    buckets
}

/// Order the coordinates of `direction` by descending `|q̂_j|` into `order`
/// (ties by coordinate index).
pub fn coordinate_queue(direction: &[f32], order: &mut Vec<u32>) {
    order.clear();
    order.extend(0..direction.len() as u32);
    order.sort_by(|&a, &b| {
        direction[b as usize]
            .abs()
            .total_cmp(&direction[a as usize].abs())
            .then(a.cmp(&b))
    });
}

/// A contiguous range of query rows processed together by one worker.
#[derive(Debug, Clone)]
pub struct QueryBatch {
    pub(crate) rows: Range<usize>,
    pub(crate) norm_min: f32,
    pub(crate) norm_max: f32,
    inactive: Vec<bool>,
    inactive_count: usize,
    queues: Option<Vec<u32>>,
    queue_len: usize,
}

impl QueryBatch {
    /// A batch over `rows` of a length-sorted query matrix.
    pub fn new(queries: &VectorMatrix, rows: Range<usize>) -> Self {
        debug_assert!(!rows.is_empty());
        Self {
            norm_max: queries.norm(rows.start),
            norm_min: queries.norm(rows.end - 1),
            inactive: vec![false; rows.len()],
            inactive_count: 0,
            queues: None,
            queue_len: 0,
            rows,
        }
    }

    /// Split `rows` into batches of at most `batch_size` queries.
    pub fn split(queries: &VectorMatrix, rows: Range<usize>, batch_size: usize) -> Vec<Self> {
        let mut batches = Vec::new();
        let mut start = rows.start;
        while start < rows.end {
            let end = (start + batch_size).min(rows.end);
            batches.push(Self::new(queries, start..end));
            start = end;
        }
        batches
    }

    #[inline]
    pub fn rows(&self) -> Range<usize> {
        self.rows.clone()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// `(norm_min, norm_max)` over the batch's queries.
    #[inline]
    pub fn norm_range(&self) -> (f32, f32) {
        (self.norm_min, self.norm_max)
    }

    #[inline]
    pub fn is_inactive(&self, pos: usize) -> bool {
        self.inactive[pos - self.rows.start]
    }

    /// Mark a query inactive. Inactivity is never cleared.
    pub fn mark_inactive(&mut self, pos: usize) {
        let slot = &mut self.inactive[pos - self.rows.start];
        if !*slot {
            *slot = true;
            self.inactive_count += 1;
        }
    }

    #[inline]
    pub fn inactive_count(&self) -> usize {
        self.inactive_count
    }

    /// Every query of the batch is inactive.
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.inactive_count == self.rows.len()
    }

    #[inline]
    pub fn queues_initialized(&self) -> bool {
        self.queues.is_some()
    }

    /// Build the per-query coordinate queues if they do not exist yet.
    ///
    /// A query's queue lists its coordinates by descending `|q̂_j|`, cut to
    /// `max_lists`. Returns whether this call built them.
    pub fn ensure_queues(&mut self, queries: &VectorMatrix, max_lists: usize) -> bool {
        if self.queues.is_some() {
            return false;
        }
        let len = max_lists.min(queries.dimension());
        let mut queues = Vec::with_capacity(self.rows.len() * len);
        let mut order: Vec<u32> = Vec::with_capacity(queries.dimension());
        for r in self.rows.clone() {
            coordinate_queue(queries.row(r), &mut order);
            queues.extend_from_slice(&order[..len]);
        }
        self.queue_len = len;
        self.queues = Some(queues);
        true
    }

    /// Coordinate queue of the query at `pos`; empty until built.
    #[inline]
    pub fn queue(&self, pos: usize) -> &[u32] {
        match &self.queues {
            Some(queues) => {
                let i = pos - self.rows.start;
                &queues[i * self.queue_len..(i + 1) * self.queue_len]
            }
            None => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bound::Bound;

    fn probes() -> VectorMatrix {
        let rows: Vec<Vec<f32>> = (0..10)
            .map(|i| {
                let len = 1.0 - 0.05 * i as f32;
                vec![len * 0.6, len * 0.8]
            })
            .collect();
        VectorMatrix::from_rows(&rows, false).unwrap()
    }

    #[test]
    fn bucketize_respects_length_ratio() {
        let params = BucketingParams {
            length_ratio: 0.8,
            max_bucket_size: 100,
            min_bucket_size: 1,
        };
        let buckets = bucketize(&probes(), &params, StrategyKind::Length, 0);
        assert!(buckets.len() >= 2);
        for b in &buckets {
            let (lo, hi) = b.norm_range();
            assert!(lo >= hi * 0.8 - 1e-6);
        }
        let covered: usize = buckets.iter().map(ProbeBucket::len).sum();
        assert_eq!(covered, 10);
    }

    #[test]
    fn bucket_ball_covers_raw_rows() {
        let m = probes();
        let bucket = ProbeBucket::new(0, &m, 0..10, StrategyKind::Length, 0);
        let mut raw = [0.0f32; 2];
        for r in 0..10 {
            m.raw_row_into(r, &mut raw);
            assert!(bucket.ball().min_distance(&raw) < 1e-5);
        }
    }

    #[test]
    fn sorted_lists_range() {
        let m = probes();
        let bucket = ProbeBucket::new(0, &m, 0..10, StrategyKind::Coordinate, 0);
        let lists = bucket.lists.as_ref().unwrap();
        let list = lists.list(0);
        assert!(list.windows(2).all(|w| w[0].value <= w[1].value));
        let r = lists.range(0, 0.5, 0.56);
        for e in &list[r] {
            assert!(e.value >= 0.5 && e.value <= 0.56);
        }
    }

    #[test]
    fn local_threshold_cases() {
        let m = probes();
        let bucket = ProbeBucket::new(0, &m, 0..10, StrategyKind::Length, 0);
        let (lo, hi) = bucket.norm_range();
        assert!((bucket.local_threshold(0.5, 1.0) - 0.5 / hi).abs() < 1e-6);
        assert!((bucket.local_threshold(-0.5, 1.0) + 0.5 / lo).abs() < 1e-6);
        assert_eq!(bucket.local_threshold(0.5, 0.0), f32::INFINITY);
        assert_eq!(bucket.local_threshold(-0.5, 0.0), f32::NEG_INFINITY);
        assert_eq!(
            bucket.local_threshold(f32::NEG_INFINITY, 1.0),
            f32::NEG_INFINITY
        );
    }

    #[test]
    fn length_preference_follows_local_threshold() {
        let m = probes();
        let mut bucket = ProbeBucket::new(0, &m, 0..10, StrategyKind::Length, 0);
        assert!(bucket.prefers_length(0.9, 1.0));

        // A negative k-th best is measured against the shortest row.
        bucket.set_after_tuning(2, -0.4);
        assert!(bucket.local_threshold(-0.3, 1.0) < -0.4);
        assert!(bucket.prefers_length(-0.3, 1.0));
        assert!(!bucket.prefers_length(-0.1, 1.0));
        assert!(!bucket.prefers_length(0.5, 1.0));

        bucket.set_after_tuning(2, 0.6);
        assert!(bucket.prefers_length(0.5, 1.0));
        assert!(!bucket.prefers_length(0.7, 1.0));
        assert!(bucket.prefers_length(f32::NEG_INFINITY, 1.0));
    }

    #[test]
    fn queues_built_once() {
        let q = VectorMatrix::from_rows(&[vec![0.1, -0.9, 0.3], vec![0.5, 0.1, 0.2]], false)
            .unwrap();
        let mut batch = QueryBatch::new(&q, 0..2);
        assert!(batch.queue(0).is_empty());
        assert!(batch.ensure_queues(&q, 2));
        assert!(!batch.ensure_queues(&q, 3));
        assert_eq!(batch.queue(0).len(), 2);
        let first = q.row(0);
        assert!(first[batch.queue(0)[0] as usize].abs() >= first[batch.queue(0)[1] as usize].abs());
    }

    #[test]
    fn inactivity_is_monotonic() {
        let q = VectorMatrix::from_rows(&[vec![1.0, 0.0], vec![0.5, 0.0]], false).unwrap();
        let mut batch = QueryBatch::new(&q, 0..2);
        batch.mark_inactive(1);
        batch.mark_inactive(1);
        assert_eq!(batch.inactive_count(), 1);
        assert!(batch.is_inactive(1));
        batch.mark_inactive(0);
        assert!(batch.is_exhausted());
    }
}
