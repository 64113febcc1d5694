//! Per-bucket sample-based tuning.
//!
//! Before a bucket is scanned, a handful of queries that can still reach it
//! are run through the length scan and through the alternative at every
//! allowed number of focus coordinates. Samples are ordered by their local
//! threshold; the tuner then picks the split point `t` and list count that
//! minimize
//!
//! ```text
//! cost = Σ_{s < t} length(s) + Σ_{s >= t} alternative(s, φ)
//! ```
//!
//! and stores the outcome in the bucket. A split at `t == 0` sends every
//! query to the alternative (`t_b = -1`); if the length scan alone beats
//! every split the bucket is marked baseline-only (`t_b = 1`).
//!
//! Samples are drawn with a seeded [`StdRng`], so with
//! [`TuningCost::Comparisons`] the outcome is identical across runs.

use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::bucket::{coordinate_queue, ProbeBucket, TuningOutcome};
use crate::config::{Method, RetrievalConfig, TuningCost};
use crate::context::{Phase, RetrievalContext, RunMode, ScanStats, Scratch};
use crate::heap::Candidate;
use crate::matrix::VectorMatrix;
use crate::strategy::{QueryView, StrategyKind, Target};

/// One sampled query, frozen at its state before the bucket.
#[derive(Debug, Clone)]
struct Sample {
    pos: usize,
    local_threshold: f32,
    initial: Vec<Candidate>,
    queue: Vec<u32>,
}

/// Chooses `(t_b, φ)` for each bucket of a run.
#[derive(Debug)]
pub struct BucketTuner<'a> {
    queries: &'a VectorMatrix,
    scratch: Scratch<'a>,
    method: Method,
    mode: RunMode,
    sample_size: usize,
    seed: u64,
    max_lists: usize,
    cost: TuningCost,
    order: Vec<u32>,
}

impl<'a> BucketTuner<'a> {
    pub fn new(
        queries: &'a VectorMatrix,
        probes: &'a VectorMatrix,
        mode: RunMode,
        max_bucket_rows: usize,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            queries,
            scratch: Scratch::new(probes, config.method.primary(), mode.k(), max_bucket_rows, config),
            method: config.method,
            mode,
            sample_size: config.sample_size,
            seed: config.seed,
            max_lists: config.max_lists.min(queries.dimension()),
            cost: config.tuning_cost,
            order: Vec::with_capacity(queries.dimension()),
        }
    }

    /// Work done while tuning.
    pub fn stats(&self) -> &ScanStats {
        self.scratch.stats()
    }

    /// Tune `bucket` against the current state of `contexts` and record the
    /// outcome in the bucket.
    ///
    /// Buckets without eligible samples keep their current outcome.
    pub fn tune(&mut self, bucket: &mut ProbeBucket, contexts: &[RetrievalContext<'_>]) -> TuningOutcome {
        let (alternative, mixed) = match self.method {
            Method::Single(StrategyKind::Length) => return bucket.tuning(),
            Method::Single(kind) => (kind, false),
            Method::Mixed(kind) => (kind, true),
        };
        if self.sample_size == 0 {
            return bucket.tuning();
        }
        let started = self.scratch.out.start();

        let samples = self.draw_samples(bucket, contexts);
        if samples.is_empty() {
            self.scratch.out.stop(started, Phase::Tuning);
            tracing::debug!(bucket = bucket.index(), "no tuning samples; keeping outcome");
            return bucket.tuning();
        }
        let n = samples.len();

        let baseline: Vec<f64> = samples
            .iter()
            .map(|s| self.measure(s, bucket, StrategyKind::Length, 1))
            .collect();
        let mut prefix = Vec::with_capacity(n + 1);
        prefix.push(0.0f64);
        for c in &baseline {
            prefix.push(prefix[prefix.len() - 1] + c);
        }
        let baseline_total = prefix[n];

        let phi_max = if alternative.list_based() {
            self.max_lists.max(1)
        } else {
            1
        };
        let splits = if mixed { n } else { 1 };
        let mut best_cost = f64::INFINITY;
        let mut best_phi = 0usize;
        let mut best_split = 0usize;
        let mut costs = vec![0.0f64; n];
        for phi in 0..phi_max {
            for (slot, s) in costs.iter_mut().zip(&samples) {
                *slot = self.measure(s, bucket, alternative, phi + 1);
            }
            let mut suffix = 0.0f64;
            let mut suffixes = vec![0.0f64; n];
            for t in (0..n).rev() {
                suffix += costs[t];
                suffixes[t] = suffix;
            }
            for t in 0..splits {
                let cost = prefix[t] + suffixes[t];
                if cost < best_cost {
                    best_cost = cost;
                    best_phi = phi;
                    best_split = t;
                }
            }
        }

        if mixed && baseline_total < best_cost {
            bucket.set_after_tuning(1, 1.0);
        } else {
            let ratio = if !mixed || best_split == 0 {
                -1.0
            } else {
                samples[best_split].local_threshold.clamp(-1.0, 1.0)
            };
            bucket.set_after_tuning(best_phi + 1, ratio);
        }

        let outcome = bucket.tuning();
        self.scratch.out.stop(started, Phase::Tuning);
        tracing::debug!(
            bucket = bucket.index(),
            samples = n,
            baseline_cost = baseline_total,
            best_cost,
            threshold_ratio = outcome.threshold_ratio,
            list_count = outcome.list_count,
            "tuned bucket"
        );
        outcome
    }

    /// Queries that can still produce results in `bucket`, sampled and
    /// sorted by local threshold.
    fn draw_samples(&mut self, bucket: &ProbeBucket, contexts: &[RetrievalContext<'_>]) -> Vec<Sample> {
        let queries = self.queries;
        let out = &self.scratch.out;
        let eligible: Vec<usize> = match self.mode {
            RunMode::AboveTheta { .. } => (0..queries.len())
                .take_while(|&pos| queries.norm(pos) >= bucket.scan_threshold())
                .collect(),
            RunMode::TopK { .. } => contexts
                .iter()
                .flat_map(|ctx| {
                    ctx.rows().filter(move |&pos| {
                        if ctx.is_inactive(pos) {
                            return false;
                        }
                        let qn = queries.norm(pos);
                        let floor = out.loosen(ctx.min_score(pos), qn);
                        !Target::TopK.cannot_reach(bucket.best_possible(qn), floor)
                    })
                })
                .collect(),
        };

        let picked: Vec<usize> = if eligible.len() <= self.sample_size {
            eligible
        } else {
            let mut rng = StdRng::seed_from_u64(
                self.seed ^ (bucket.index() as u64).wrapping_mul(0xD1B5_4A32_D192_ED03),
            );
            let mut idx = rand::seq::index::sample(&mut rng, eligible.len(), self.sample_size).into_vec();
            idx.sort_unstable();
            idx.into_iter().map(|i| eligible[i]).collect()
        };

        let queue_len = self.max_lists;
        let mut samples: Vec<Sample> = picked
            .into_iter()
            .map(|pos| {
                let initial = match self.mode {
                    RunMode::AboveTheta { .. } => Vec::new(),
                    RunMode::TopK { .. } => contexts
                        .iter()
                        .find(|ctx| ctx.rows().contains(&pos))
                        .map(|ctx| ctx.slots(pos).to_vec())
                        .unwrap_or_default(),
                };
                let qn = queries.norm(pos);
                // Same score the dispatcher splits on: θ or the unloosened k-th best.
                let score = match self.mode {
                    RunMode::AboveTheta { theta } => theta,
                    RunMode::TopK { .. } => initial.first().map_or(f32::NEG_INFINITY, |c| c.score),
                };
                coordinate_queue(queries.row(pos), &mut self.order);
                Sample {
                    pos,
                    local_threshold: bucket.local_threshold(score, qn),
                    initial,
                    queue: self.order[..queue_len].to_vec(),
                }
            })
            .collect();
        samples.sort_by(|a, b| {
            a.local_threshold
                .total_cmp(&b.local_threshold)
                .then(a.pos.cmp(&b.pos))
        });
        samples
    }

    /// Cost of scanning `bucket` for one sample with `kind` at `num_lists`.
    fn measure(&mut self, sample: &Sample, bucket: &ProbeBucket, kind: StrategyKind, num_lists: usize) -> f64 {
        let view = QueryView::new(self.queries, sample.pos, &sample.queue);
        self.scratch.num_lists = num_lists;
        let dimension = self.queries.dimension();
        let work_before = self.scratch.stats().work(dimension);
        let started = Instant::now();
        match self.mode {
            RunMode::AboveTheta { theta } => kind.scan_above(&view, bucket, theta, &mut self.scratch),
            RunMode::TopK { .. } => {
                self.scratch.out.heap.load(&sample.initial);
                kind.scan_top_k(&view, bucket, &mut self.scratch);
            }
        }
        let elapsed = started.elapsed();
        self.scratch.out.matches.clear();
        match self.cost {
            TuningCost::WallClock => elapsed.as_nanos() as f64,
            TuningCost::Comparisons => (self.scratch.stats().work(dimension) - work_before) as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::bucketize;
    use crate::config::BucketingParams;
    use crate::strategy::testing::random_rows;

    fn setup() -> (VectorMatrix, VectorMatrix, RetrievalConfig) {
        let q = VectorMatrix::from_rows(&random_rows(60, 8, 4), false).unwrap();
        let p = VectorMatrix::from_rows(&random_rows(300, 8, 5), false).unwrap();
        let config = RetrievalConfig {
            bucketing: BucketingParams {
                length_ratio: 0.9,
                max_bucket_size: 100,
                min_bucket_size: 10,
            },
            sample_size: 16,
            ..RetrievalConfig::reproducible()
        };
        (q, p, config)
    }

    #[test]
    fn tuning_is_deterministic() {
        let (q, p, config) = setup();
        let run = || {
            let mode = RunMode::AboveTheta { theta: 1.5 };
            let mut buckets = bucketize(&p, &config.bucketing, config.method.primary(), config.seed);
            let mut tuner = BucketTuner::new(&q, &p, mode, 100, &config);
            buckets
                .iter_mut()
                .map(|b| {
                    b.set_scan_threshold(1.5);
                    tuner.tune(b, &[])
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn length_only_is_never_tuned() {
        let (q, p, _) = setup();
        let config = RetrievalConfig::length_only();
        let mode = RunMode::AboveTheta { theta: 1.0 };
        let mut buckets = bucketize(&p, &config.bucketing, StrategyKind::Length, 0);
        let mut tuner = BucketTuner::new(&q, &p, mode, p.len(), &config);
        for b in &mut buckets {
            b.set_scan_threshold(1.0);
            assert_eq!(tuner.tune(b, &[]), TuningOutcome::BASELINE);
        }
    }

    #[test]
    fn unreachable_bucket_keeps_outcome() {
        let (q, p, config) = setup();
        let theta = 1e6;
        let mode = RunMode::AboveTheta { theta };
        let mut buckets = bucketize(&p, &config.bucketing, config.method.primary(), 0);
        let mut tuner = BucketTuner::new(&q, &p, mode, 100, &config);
        let b = &mut buckets[0];
        b.set_scan_threshold(theta);
        assert_eq!(tuner.tune(b, &[]), TuningOutcome::BASELINE);
    }

    #[test]
    fn single_alternative_only_tunes_lists() {
        let (q, p, config) = setup();
        let config = config.with_method(Method::Single(StrategyKind::ThresholdAlgorithm));
        let mode = RunMode::AboveTheta { theta: 1.0 };
        let mut buckets = bucketize(&p, &config.bucketing, StrategyKind::ThresholdAlgorithm, 0);
        let mut tuner = BucketTuner::new(&q, &p, mode, 100, &config);
        let b = &mut buckets[0];
        b.set_scan_threshold(1.0);
        let outcome = tuner.tune(b, &[]);
        assert_eq!(outcome.threshold_ratio, -1.0);
        assert!((1..=config.max_lists).contains(&outcome.list_count));
    }
}
