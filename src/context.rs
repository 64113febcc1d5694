//! Per-thread retrieval state.
//!
//! A [`RetrievalContext`] is owned by exactly one worker for a whole run. It
//! holds the worker's query batches, the flat top-k buffer for its query rows,
//! and a [`Scratch`] area the strategies write into: the k-sized scratch heap,
//! the above-θ matches, counters, and one method-specific [`AuxState`].
//!
//! The auxiliary state is chosen once from the configured method and never
//! changes; a mixed method carries the state of its alternative (the length
//! scan needs none).

use std::ops::Range;
use std::time::{Duration, Instant};

use crate::bucket::QueryBatch;
use crate::config::{Approximation, RetrievalConfig};
use crate::heap::{Candidate, TopKHeap};
use crate::matrix::VectorMatrix;
use crate::strategy::{
    coordinate::CoordinateState, lsh::LshState, nra::NraState, prefix::PrefixState, ta::TaState,
    QueryView, StrategyKind, Target,
};

/// What a run computes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunMode {
    /// Every pair with inner product `>= theta`.
    AboveTheta { theta: f32 },
    /// The `k` best probes per query.
    TopK { k: usize },
}

impl RunMode {
    /// Slots per query in the top-k buffer (0 for above-θ runs).
    pub fn k(self) -> usize {
        match self {
            RunMode::AboveTheta { .. } => 0,
            RunMode::TopK { k } => k,
        }
    }
}

/// One above-θ result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Match {
    pub query_id: u32,
    pub probe_id: u32,
    pub score: f32,
}

/// Work counters and (when instrumented) per-phase timings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanStats {
    /// Full inner products computed.
    pub comparisons: u64,
    /// Sorted-list entries, sketches and partial sums touched.
    pub list_steps: u64,
    pub length_time: Duration,
    pub scan_time: Duration,
    pub preprocess_time: Duration,
    pub tuning_time: Duration,
}

impl ScanStats {
    pub fn merge(&mut self, other: &ScanStats) {
        self.comparisons += other.comparisons;
        self.list_steps += other.list_steps;
        self.length_time += other.length_time;
        self.scan_time += other.scan_time;
        self.preprocess_time += other.preprocess_time;
        self.tuning_time += other.tuning_time;
    }

    /// Deterministic work estimate: inner products weighted by dimension.
    pub fn work(&self, dimension: usize) -> u64 {
        self.comparisons * dimension as u64 + self.list_steps
    }

    /// Log the counters and timings.
    pub fn report(&self) {
        tracing::info!(
            comparisons = self.comparisons,
            list_steps = self.list_steps,
            length_secs = self.length_time.as_secs_f64(),
            scan_secs = self.scan_time.as_secs_f64(),
            preprocess_secs = self.preprocess_time.as_secs_f64(),
            tuning_secs = self.tuning_time.as_secs_f64(),
            "retrieval timings"
        );
    }
}

/// Timing phases tracked by [`Collector::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Length,
    Scan,
    Preprocess,
    Tuning,
}

/// Method-specific scratch. Exactly one variant lives in a context.
#[derive(Debug)]
pub enum AuxState {
    Length,
    Coordinate(CoordinateState),
    ThresholdAlgorithm(TaState),
    ThresholdAlgorithmNra(NraState),
    Lsh(LshState),
    ApproximatePruning(PrefixState),
}

impl AuxState {
    /// Allocate the state for `kind`, sized for buckets of up to `max_rows`.
    pub fn new(kind: StrategyKind, max_rows: usize, config: &RetrievalConfig) -> Self {
        match kind {
            StrategyKind::Length => AuxState::Length,
            StrategyKind::Coordinate => AuxState::Coordinate(CoordinateState::new(max_rows)),
            StrategyKind::ThresholdAlgorithm => {
                AuxState::ThresholdAlgorithm(TaState::new(max_rows, config.ta_round_robin))
            }
            StrategyKind::ThresholdAlgorithmNra => {
                AuxState::ThresholdAlgorithmNra(NraState::new(max_rows))
            }
            StrategyKind::Lsh => AuxState::Lsh(LshState::new(config.lsh_recall)),
            StrategyKind::ApproximatePruning => {
                AuxState::ApproximatePruning(PrefixState::new(max_rows))
            }
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            AuxState::Length => StrategyKind::Length,
            AuxState::Coordinate(_) => StrategyKind::Coordinate,
            AuxState::ThresholdAlgorithm(_) => StrategyKind::ThresholdAlgorithm,
            AuxState::ThresholdAlgorithmNra(_) => StrategyKind::ThresholdAlgorithmNra,
            AuxState::Lsh(_) => StrategyKind::Lsh,
            AuxState::ApproximatePruning(_) => StrategyKind::ApproximatePruning,
        }
    }
}

/// Output side of the scratch area: where verified candidates go.
#[derive(Debug)]
pub struct Collector<'a> {
    pub(crate) probes: &'a VectorMatrix,
    pub(crate) heap: TopKHeap,
    pub(crate) matches: Vec<Match>,
    pub(crate) stats: ScanStats,
    approximation: Approximation,
    gamma: f32,
    instrument: bool,
}

impl<'a> Collector<'a> {
    fn new(probes: &'a VectorMatrix, k: usize, config: &RetrievalConfig) -> Self {
        Self {
            probes,
            heap: TopKHeap::new(k),
            matches: Vec::new(),
            stats: ScanStats::default(),
            approximation: config.approximation,
            gamma: config.gamma,
            instrument: config.instrument,
        }
    }

    /// Lowest score a candidate must reach to matter right now.
    ///
    /// Above-θ: θ. Top-k: the scratch heap's k-th best, loosened by the
    /// approximation factor.
    #[inline]
    pub fn floor(&self, target: Target, query_norm: f32) -> f32 {
        match target {
            Target::Above(theta) => theta,
            Target::TopK => self.loosen(self.heap.min_score(), query_norm),
        }
    }

    #[inline]
    pub fn loosen(&self, score: f32, query_norm: f32) -> f32 {
        self.approximation.loosen(self.gamma, score, query_norm)
    }

    /// Compute the inner product of the query with probe `row` and emit it.
    #[inline]
    pub fn verify(&mut self, query: &QueryView<'_>, row: usize, target: Target) {
        let probes = self.probes;
        let score = query.norm * probes.norm(row) * crate::simd::dot(query.direction, probes.row(row));
        self.stats.comparisons += 1;
        match target {
            Target::Above(theta) => {
                if score >= theta {
                    self.matches.push(Match {
                        query_id: query.id,
                        probe_id: probes.id(row),
                        score,
                    });
                }
            }
            Target::TopK => {
                self.heap.push(probes.id(row), score);
            }
        }
    }

    #[inline]
    pub fn start(&self) -> Option<Instant> {
        self.instrument.then(Instant::now)
    }

    #[inline]
    pub fn stop(&mut self, started: Option<Instant>, phase: Phase) {
        let Some(t) = started else {
            return;
        };
        let elapsed = t.elapsed();
        let slot = match phase {
            Phase::Length => &mut self.stats.length_time,
            Phase::Scan => &mut self.stats.scan_time,
            Phase::Preprocess => &mut self.stats.preprocess_time,
            Phase::Tuning => &mut self.stats.tuning_time,
        };
        *slot += elapsed;
    }
}

/// Scratch area handed to strategies.
#[derive(Debug)]
pub struct Scratch<'a> {
    pub(crate) out: Collector<'a>,
    pub(crate) aux: AuxState,
    /// Focus coordinates the alternative uses for the current bucket.
    pub(crate) num_lists: usize,
}

impl<'a> Scratch<'a> {
    pub fn new(
        probes: &'a VectorMatrix,
        kind: StrategyKind,
        k: usize,
        max_rows: usize,
        config: &RetrievalConfig,
    ) -> Self {
        Self {
            out: Collector::new(probes, k, config),
            aux: AuxState::new(kind, max_rows, config),
            num_lists: 1,
        }
    }

    #[inline]
    pub fn heap(&self) -> &TopKHeap {
        &self.out.heap
    }

    #[inline]
    pub fn matches(&self) -> &[Match] {
        &self.out.matches
    }

    #[inline]
    pub fn stats(&self) -> &ScanStats {
        &self.out.stats
    }
}

/// Everything one worker owns during a run.
#[derive(Debug)]
pub struct RetrievalContext<'a> {
    pub(crate) queries: &'a VectorMatrix,
    pub(crate) batches: Vec<QueryBatch>,
    pub(crate) rows: Range<usize>,
    pub(crate) batch_size: usize,
    pub(crate) mode: RunMode,
    pub(crate) max_lists: usize,
    pub(crate) top_k: Vec<Candidate>,
    pub(crate) scratch: Scratch<'a>,
}

impl<'a> RetrievalContext<'a> {
    /// A context for query rows `rows`, with auxiliary state for `config.method`.
    pub fn new(
        queries: &'a VectorMatrix,
        probes: &'a VectorMatrix,
        rows: Range<usize>,
        mode: RunMode,
        max_bucket_rows: usize,
        config: &RetrievalConfig,
    ) -> Self {
        let k = mode.k();
        Self {
            queries,
            batches: QueryBatch::split(queries, rows.clone(), config.batch_size),
            batch_size: config.batch_size,
            top_k: vec![Candidate::EMPTY; rows.len() * k],
            scratch: Scratch::new(probes, config.method.primary(), k, max_bucket_rows, config),
            max_lists: config.max_lists,
            mode,
            rows,
        }
    }

    #[inline]
    pub fn rows(&self) -> Range<usize> {
        self.rows.clone()
    }

    #[inline]
    pub fn mode(&self) -> RunMode {
        self.mode
    }

    #[inline]
    pub fn batches(&self) -> &[QueryBatch] {
        &self.batches
    }

    #[inline]
    pub fn scratch(&self) -> &Scratch<'a> {
        &self.scratch
    }

    /// Whether every batch of this worker has retired all its queries.
    pub fn is_exhausted(&self) -> bool {
        self.batches.iter().all(QueryBatch::is_exhausted)
    }

    /// Index of the batch holding query row `pos`.
    #[inline]
    pub fn batch_index(&self, pos: usize) -> usize {
        debug_assert!(self.rows.contains(&pos));
        (pos - self.rows.start) / self.batch_size
    }

    fn batch_of(&self, pos: usize) -> &QueryBatch {
        &self.batches[self.batch_index(pos)]
    }

    pub fn is_inactive(&self, pos: usize) -> bool {
        self.batch_of(pos).is_inactive(pos)
    }

    #[inline]
    fn offset(&self, pos: usize) -> usize {
        debug_assert!(self.rows.contains(&pos));
        (pos - self.rows.start) * self.mode.k()
    }

    /// The k heap-ordered result slots of the query at `pos`.
    #[inline]
    pub fn slots(&self, pos: usize) -> &[Candidate] {
        let o = self.offset(pos);
        &self.top_k[o..o + self.mode.k()]
    }

    /// Current k-th best score of the query at `pos`.
    #[inline]
    pub fn min_score(&self, pos: usize) -> f32 {
        self.slots(pos).first().map_or(f32::INFINITY, |c| c.score)
    }

    /// Copy the query's result slots into the scratch heap.
    #[inline]
    pub fn move_to_scratch(&mut self, pos: usize) {
        let o = self.offset(pos);
        let k = self.mode.k();
        self.scratch.out.heap.load(&self.top_k[o..o + k]);
    }

    /// Copy the scratch heap back into the query's result slots.
    #[inline]
    pub fn write_back(&mut self, pos: usize) {
        let o = self.offset(pos);
        let k = self.mode.k();
        self.scratch.out.heap.store(&mut self.top_k[o..o + k]);
    }

    /// Above-θ matches collected so far.
    pub fn matches(&self) -> &[Match] {
        &self.scratch.out.matches
    }

    pub fn take_matches(&mut self) -> Vec<Match> {
        std::mem::take(&mut self.scratch.out.matches)
    }

    pub fn stats(&self) -> &ScanStats {
        &self.scratch.out.stats
    }

    /// Reset counters and collected matches.
    pub fn clear(&mut self) {
        self.scratch.out.stats = ScanStats::default();
        self.scratch.out.matches.clear();
    }
}
