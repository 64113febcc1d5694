//! Bucket-level retrievers.
//!
//! A [`Retriever`] is either a single strategy or a [`HybridDispatcher`] that
//! mixes the length scan with one alternative. The hybrid decides per batch,
//! and where a batch straddles the tuned ratio per query, which strategy
//! scans the bucket.
//!
//! Only the bucket-level entry points ([`Retriever::run`] and
//! [`Retriever::run_top_k`]) are valid for a hybrid. Its per-query entry
//! points panic: the decision needs the bucket's tuning and the batch's
//! norm range, which a single query does not carry.

use crate::bucket::ProbeBucket;
use crate::config::Method;
use crate::context::{Phase, RetrievalContext, RunMode};
use crate::strategy::{QueryView, StrategyKind, Target};

/// Length scan mixed with an alternative strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HybridDispatcher {
    alternative: StrategyKind,
}

impl HybridDispatcher {
    pub fn new(alternative: StrategyKind) -> Self {
        Self { alternative }
    }

    #[inline]
    pub fn alternative(&self) -> StrategyKind {
        self.alternative
    }

    /// Above-θ retrieval of every batch of `ctx` against `bucket`.
    pub fn run(&self, bucket: &ProbeBucket, ctx: &mut RetrievalContext<'_>) {
        let theta = above_theta(ctx);
        let tuning = bucket.tuning();
        let t_b = tuning.threshold_ratio;
        let st = bucket.scan_threshold();
        let alt = self.alternative;
        ctx.scratch.num_lists = tuning.list_count;

        for b in 0..ctx.batches.len() {
            let (norm_min, norm_max) = ctx.batches[b].norm_range();
            if norm_max < st {
                break;
            }
            if tuning.always_baseline() || t_b * norm_min > st {
                StrategyKind::Length.scan_batch_above(
                    &ctx.batches[b],
                    ctx.queries,
                    bucket,
                    theta,
                    &mut ctx.scratch,
                );
                continue;
            }
            if alt.uses_queue() {
                ensure_queues(ctx, b);
            }
            if t_b * norm_max <= st {
                alt.scan_batch_above(&ctx.batches[b], ctx.queries, bucket, theta, &mut ctx.scratch);
                continue;
            }
            // The batch straddles the ratio: decide per query.
            let batch = &ctx.batches[b];
            for pos in batch.rows() {
                let qn = ctx.queries.norm(pos);
                if qn < st {
                    break;
                }
                let view = QueryView::new(ctx.queries, pos, batch.queue(pos));
                if !view.may_reach(bucket, theta) {
                    continue;
                }
                let (kind, phase) = if t_b * qn > st {
                    (StrategyKind::Length, Phase::Length)
                } else {
                    (alt, Phase::Scan)
                };
                let started = ctx.scratch.out.start();
                kind.scan_above(&view, bucket, theta, &mut ctx.scratch);
                ctx.scratch.out.stop(started, phase);
            }
        }
    }

    /// Top-k retrieval of every active query of `ctx` against `bucket`.
    pub fn run_top_k(&self, bucket: &ProbeBucket, ctx: &mut RetrievalContext<'_>) {
        let alt = self.alternative;
        top_k_loop(bucket, ctx, |qn, min_score| {
            if bucket.prefers_length(min_score, qn) {
                StrategyKind::Length
            } else {
                alt
            }
        });
    }
}

/// A bucket-level retriever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retriever {
    Single(StrategyKind),
    Mixed(HybridDispatcher),
}

impl Retriever {
    pub fn from_method(method: Method) -> Self {
        match method {
            Method::Single(kind) => Retriever::Single(kind),
            Method::Mixed(kind) => Retriever::Mixed(HybridDispatcher::new(kind)),
        }
    }

    /// Above-θ retrieval of every batch of `ctx` against `bucket`.
    pub fn run(&self, bucket: &ProbeBucket, ctx: &mut RetrievalContext<'_>) {
        match self {
            Retriever::Mixed(hybrid) => hybrid.run(bucket, ctx),
            Retriever::Single(kind) => {
                let theta = above_theta(ctx);
                ctx.scratch.num_lists = bucket.tuning().list_count;
                for b in 0..ctx.batches.len() {
                    if ctx.batches[b].norm_range().1 < bucket.scan_threshold() {
                        break;
                    }
                    if kind.uses_queue() {
                        ensure_queues(ctx, b);
                    }
                    kind.scan_batch_above(&ctx.batches[b], ctx.queries, bucket, theta, &mut ctx.scratch);
                }
            }
        }
    }

    /// Top-k retrieval of every active query of `ctx` against `bucket`.
    pub fn run_top_k(&self, bucket: &ProbeBucket, ctx: &mut RetrievalContext<'_>) {
        match self {
            Retriever::Mixed(hybrid) => hybrid.run_top_k(bucket, ctx),
            Retriever::Single(kind) => top_k_loop(bucket, ctx, |_, _| *kind),
        }
    }

    /// Above-θ retrieval of one query. Single strategies only.
    ///
    /// # Panics
    ///
    /// For a hybrid retriever, which only works bucket-wide.
    pub fn run_query(&self, pos: usize, bucket: &ProbeBucket, ctx: &mut RetrievalContext<'_>) {
        let kind = self.single_kind("run_query");
        let theta = above_theta(ctx);
        let b = ctx.batch_index(pos);
        if kind.uses_queue() {
            ensure_queues(ctx, b);
        }
        ctx.scratch.num_lists = bucket.tuning().list_count;
        let view = QueryView::new(ctx.queries, pos, ctx.batches[b].queue(pos));
        kind.scan_above(&view, bucket, theta, &mut ctx.scratch);
    }

    /// Above-θ retrieval of one batch. Single strategies only.
    ///
    /// # Panics
    ///
    /// For a hybrid retriever, which only works bucket-wide.
    pub fn run_batch(&self, batch: usize, bucket: &ProbeBucket, ctx: &mut RetrievalContext<'_>) {
        let kind = self.single_kind("run_batch");
        let theta = above_theta(ctx);
        if kind.uses_queue() {
            ensure_queues(ctx, batch);
        }
        ctx.scratch.num_lists = bucket.tuning().list_count;
        kind.scan_batch_above(&ctx.batches[batch], ctx.queries, bucket, theta, &mut ctx.scratch);
    }

    /// Top-k scan of one query that is already in the scratch heap.
    /// Single strategies only.
    ///
    /// # Panics
    ///
    /// For a hybrid retriever, which only works bucket-wide.
    pub fn run_query_top_k(&self, pos: usize, bucket: &ProbeBucket, ctx: &mut RetrievalContext<'_>) {
        let kind = self.single_kind("run_query_top_k");
        let b = ctx.batch_index(pos);
        if kind.uses_queue() {
            ensure_queues(ctx, b);
        }
        ctx.scratch.num_lists = bucket.tuning().list_count;
        let view = QueryView::new(ctx.queries, pos, ctx.batches[b].queue(pos));
        kind.scan_top_k(&view, bucket, &mut ctx.scratch);
    }

    #[track_caller]
    fn single_kind(&self, entry: &str) -> StrategyKind {
        match self {
            Retriever::Single(kind) => *kind,
            Retriever::Mixed(hybrid) => {
                tracing::error!(
                    entry,
                    alternative = %hybrid.alternative(),
                    "per-query entry point called on a mixed retriever"
                );
                panic!(
                    "{entry} is not supported by the mixed retriever (alternative {}); use run or run_top_k",
                    hybrid.alternative()
                );
            }
        }
    }
}

fn above_theta(ctx: &RetrievalContext<'_>) -> f32 {
    match ctx.mode {
        RunMode::AboveTheta { theta } => theta,
        RunMode::TopK { k } => panic!("above-θ retrieval on a context built for top-{k}"),
    }
}

/// Build batch `b`'s coordinate queues if needed, timing the work.
fn ensure_queues(ctx: &mut RetrievalContext<'_>, b: usize) {
    if ctx.batches[b].queues_initialized() {
        return;
    }
    let started = ctx.scratch.out.start();
    ctx.batches[b].ensure_queues(ctx.queries, ctx.max_lists);
    ctx.scratch.out.stop(started, Phase::Preprocess);
}

/// Per-query top-k loop shared by single and hybrid retrievers.
///
/// For every active query: retire it when even the bucket's longest row
/// cannot beat its loosened k-th best, skip the bucket when the ball bound
/// rules it out, otherwise move it to scratch, scan with the strategy `pick`
/// chooses from `(|q|, k-th best)`, and write it back.
fn top_k_loop<F>(bucket: &ProbeBucket, ctx: &mut RetrievalContext<'_>, pick: F)
where
    F: Fn(f32, f32) -> StrategyKind,
{
    ctx.scratch.num_lists = bucket.tuning().list_count;
    for b in 0..ctx.batches.len() {
        if ctx.batches[b].is_exhausted() {
            continue;
        }
        for pos in ctx.batches[b].rows() {
            if ctx.batches[b].is_inactive(pos) {
                continue;
            }
            let qn = ctx.queries.norm(pos);
            let min_score = ctx.min_score(pos);
            let floor = ctx.scratch.out.loosen(min_score, qn);
            if Target::TopK.cannot_reach(bucket.best_possible(qn), floor) {
                ctx.batches[b].mark_inactive(pos);
                continue;
            }
            let kind = pick(qn, min_score);
            if kind.uses_queue() {
                ensure_queues(ctx, b);
            }
            let view = QueryView::new(ctx.queries, pos, ctx.batches[b].queue(pos));
            if !view.may_reach(bucket, floor) {
                continue;
            }

            ctx.move_to_scratch(pos);
            let phase = match kind {
                StrategyKind::Length => Phase::Length,
                _ => Phase::Scan,
            };
            let view = QueryView::new(ctx.queries, pos, ctx.batches[b].queue(pos));
            let started = ctx.scratch.out.start();
            kind.scan_top_k(&view, bucket, &mut ctx.scratch);
            ctx.scratch.out.stop(started, phase);
            ctx.write_back(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::bucketize;
    use crate::config::{BucketingParams, RetrievalConfig};
    use crate::heap::sorted_candidates;
    use crate::matrix::VectorMatrix;
    use crate::strategy::testing::random_rows;

    fn matrices() -> (VectorMatrix, VectorMatrix) {
        (
            VectorMatrix::from_rows(&random_rows(30, 6, 1), false).unwrap(),
            VectorMatrix::from_rows(&random_rows(200, 6, 2), false).unwrap(),
        )
    }

    fn params() -> BucketingParams {
        BucketingParams {
            length_ratio: 0.8,
            max_bucket_size: 64,
            min_bucket_size: 8,
        }
    }

    fn brute_above(q: &VectorMatrix, p: &VectorMatrix, theta: f32) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        for i in 0..q.len() {
            for j in 0..p.len() {
                if q.inner_product(i, p, j) >= theta {
                    out.push((q.id(i), p.id(j)));
                }
            }
        }
        out.sort_unstable();
        out
    }

    fn run_above(method: Method, ratio: f32, lists: usize, theta: f32) -> Vec<(u32, u32)> {
        let (q, p) = matrices();
        let config = RetrievalConfig::default().with_method(method);
        let mut buckets = bucketize(&p, &params(), method.primary(), 3);
        let mut ctx = RetrievalContext::new(&q, &p, 0..q.len(), RunMode::AboveTheta { theta }, 64, &config);
        let retriever = Retriever::from_method(method);
        for bucket in &mut buckets {
            bucket.set_scan_threshold(theta);
            bucket.set_after_tuning(lists, ratio);
            retriever.run(bucket, &mut ctx);
        }
        let mut got: Vec<(u32, u32)> = ctx.matches().iter().map(|m| (m.query_id, m.probe_id)).collect();
        got.sort_unstable();
        got
    }

    #[test]
    fn hybrid_matches_brute_force_for_any_ratio() {
        let (q, p) = matrices();
        let theta = 1.0;
        let expected = brute_above(&q, &p, theta);
        assert!(!expected.is_empty());
        for alt in [
            StrategyKind::Coordinate,
            StrategyKind::ThresholdAlgorithm,
            StrategyKind::ThresholdAlgorithmNra,
            StrategyKind::ApproximatePruning,
        ] {
            for ratio in [1.0, -1.0, 0.3, 0.7] {
                assert_eq!(
                    run_above(Method::Mixed(alt), ratio, 2, theta),
                    expected,
                    "{alt} at ratio {ratio}"
                );
            }
        }
        assert_eq!(run_above(Method::Single(StrategyKind::Length), 1.0, 1, theta), expected);
    }

    #[test]
    fn hybrid_top_k_matches_length_scan() {
        let (q, p) = matrices();
        let k = 5;
        let mode = RunMode::TopK { k };
        let run = |method: Method, ratio: f32| {
            let config = RetrievalConfig::default().with_method(method);
            let mut buckets = bucketize(&p, &params(), method.primary(), 3);
            let mut ctx = RetrievalContext::new(&q, &p, 0..q.len(), mode, 64, &config);
            let retriever = Retriever::from_method(method);
            for bucket in &mut buckets {
                bucket.set_after_tuning(3, ratio);
                retriever.run_top_k(bucket, &mut ctx);
            }
            (0..q.len())
                .map(|pos| {
                    sorted_candidates(ctx.slots(pos))
                        .iter()
                        .map(|c| c.score)
                        .collect::<Vec<f32>>()
                })
                .collect::<Vec<_>>()
        };
        let baseline = run(Method::Single(StrategyKind::Length), 1.0);
        for ratio in [-1.0, 0.5] {
            let got = run(Method::Mixed(StrategyKind::Coordinate), ratio);
            for (g, e) in got.iter().zip(&baseline) {
                assert_eq!(g.len(), k);
                for (a, b) in g.iter().zip(e) {
                    assert!((a - b).abs() < 1e-4);
                }
            }
        }
    }

    #[test]
    fn only_queue_strategies_build_queues() {
        let theta = 1.0;
        let built = |alt: StrategyKind| {
            let (q, p) = matrices();
            let method = Method::Mixed(alt);
            let config = RetrievalConfig::default().with_method(method);
            let mut buckets = bucketize(&p, &params(), method.primary(), 3);
            let mut ctx = RetrievalContext::new(&q, &p, 0..q.len(), RunMode::AboveTheta { theta }, 64, &config);
            let retriever = Retriever::from_method(method);
            for bucket in &mut buckets {
                bucket.set_scan_threshold(theta);
                bucket.set_after_tuning(2, -1.0);
                retriever.run(bucket, &mut ctx);
            }
            ctx.batches().iter().any(|b| b.queues_initialized())
        };
        assert!(!built(StrategyKind::Lsh));
        assert!(built(StrategyKind::Coordinate));
    }

    #[test]
    #[should_panic(expected = "not supported by the mixed retriever")]
    fn mixed_rejects_per_query_entry() {
        let (q, p) = matrices();
        let config = RetrievalConfig::default();
        let buckets = bucketize(&p, &params(), StrategyKind::Coordinate, 3);
        let mut ctx = RetrievalContext::new(&q, &p, 0..q.len(), RunMode::TopK { k: 3 }, 64, &config);
        let retriever = Retriever::from_method(Method::Mixed(StrategyKind::Coordinate));
        retriever.run_query_top_k(0, &buckets[0], &mut ctx);
    }

    #[test]
    fn single_per_query_entry_points_agree_with_bucket_run() {
        let (q, p) = matrices();
        let theta = 1.0;
        let method = Method::Single(StrategyKind::Coordinate);
        let config = RetrievalConfig::default().with_method(method);
        let mut buckets = bucketize(&p, &params(), StrategyKind::Coordinate, 3);
        let mut ctx = RetrievalContext::new(&q, &p, 0..q.len(), RunMode::AboveTheta { theta }, 64, &config);
        let retriever = Retriever::from_method(method);
        for bucket in &mut buckets {
            bucket.set_scan_threshold(theta);
            bucket.set_after_tuning(2, -1.0);
            for pos in 0..q.len() {
                retriever.run_query(pos, bucket, &mut ctx);
            }
        }
        let mut got: Vec<(u32, u32)> = ctx.matches().iter().map(|m| (m.query_id, m.probe_id)).collect();
        got.sort_unstable();
        assert_eq!(got, brute_above(&q, &p, theta));
    }
}
