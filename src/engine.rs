//! Retrieval engine: bucketized probes, parallel workers, final emission.
//!
//! # Usage
//!
//! ```rust
//! use lemur::config::RetrievalConfig;
//! use lemur::engine::Engine;
//!
//! # fn main() -> Result<(), lemur::RetrieveError> {
//! let probes = vec![
//!     1.0, 0.0, //
//!     0.0, 2.0, //
//!     0.5, 0.5, //
//! ];
//! let mut engine = Engine::new(&probes, 2, RetrievalConfig::default())?;
//!
//! let top = engine.top_k(&[0.0, 1.0], 2)?;
//! assert_eq!(top[0][0].0, 1);
//!
//! let matches = engine.above_theta(&[1.0, 0.0], 0.4)?;
//! assert_eq!(matches.len(), 2);
//! # Ok(())
//! # }
//! ```
//!
//! # Run structure
//!
//! Queries are sorted by length and split into one contiguous range per
//! worker. Buckets are visited longest first; for each bucket the tuner runs
//! once on the calling thread, then every worker scans the bucket with its
//! own [`RetrievalContext`] on the rayon pool. Above-θ runs stop at the first
//! bucket that even the longest query cannot reach.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

use crate::bucket::{bucketize, ProbeBucket, TuningOutcome};
use crate::config::RetrievalConfig;
use crate::context::{Match, RetrievalContext, RunMode, ScanStats};
use crate::dispatch::Retriever;
use crate::heap::sorted_candidates;
use crate::matrix::VectorMatrix;
use crate::tuner::BucketTuner;
use crate::{Result, RetrieveError};

/// Bucketized probe set plus the worker pool that scans it.
#[derive(Debug)]
pub struct Engine {
    probes: VectorMatrix,
    buckets: Vec<ProbeBucket>,
    config: RetrievalConfig,
    pool: ThreadPool,
    max_bucket_rows: usize,
    last_stats: ScanStats,
}

impl Engine {
    /// Index a row-major probe buffer of the given dimension.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the buffer is empty
    /// or ragged, or the thread pool cannot be built.
    pub fn new(probes: &[f32], dimension: usize, config: RetrievalConfig) -> Result<Self> {
        config.validate()?;
        let probes = VectorMatrix::from_flat(probes, dimension, config.cosine)?;
        if probes.is_empty() {
            return Err(RetrieveError::EmptyIndex);
        }
        let buckets = bucketize(&probes, &config.bucketing, config.method.primary(), config.seed);
        let max_bucket_rows = buckets.iter().map(ProbeBucket::len).max().unwrap_or(0);
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .build()
            .map_err(|e| RetrieveError::ThreadPool(e.to_string()))?;

        debug!(
            probes = probes.len(),
            dimension,
            buckets = buckets.len(),
            max_bucket_rows,
            method = ?config.method,
            "indexed probes"
        );
        Ok(Self {
            probes,
            buckets,
            config,
            pool,
            max_bucket_rows,
            last_stats: ScanStats::default(),
        })
    }

    /// Index probe rows given as separate vectors.
    pub fn from_rows(rows: &[Vec<f32>], config: RetrievalConfig) -> Result<Self> {
        if rows.is_empty() {
            return Err(RetrieveError::EmptyIndex);
        }
        let dimension = rows.first().map_or(0, Vec::len);
        let mut flat = Vec::with_capacity(rows.len() * dimension);
        for row in rows {
            if row.len() != dimension {
                return Err(RetrieveError::DimensionMismatch {
                    query_dim: dimension,
                    doc_dim: row.len(),
                });
            }
            flat.extend_from_slice(row);
        }
        Self::new(&flat, dimension, config)
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.probes.dimension()
    }

    /// Number of indexed probes.
    #[inline]
    pub fn len(&self) -> usize {
        self.probes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn buckets(&self) -> &[ProbeBucket] {
        &self.buckets
    }

    /// Tuning outcome of every bucket after the last run.
    pub fn tuning(&self) -> Vec<TuningOutcome> {
        self.buckets.iter().map(ProbeBucket::tuning).collect()
    }

    /// Counters of the last run, summed over workers and the tuner.
    pub fn last_stats(&self) -> &ScanStats {
        &self.last_stats
    }

    /// Every `(query, probe)` pair with inner product `>= theta`.
    ///
    /// Queries are a row-major buffer; ids are query row indices. Matches
    /// are sorted by query id, then descending score, then probe id.
    ///
    /// # Errors
    ///
    /// `theta` must be finite and positive.
    pub fn above_theta(&mut self, queries: &[f32], theta: f32) -> Result<Vec<Match>> {
        if !(theta.is_finite() && theta > 0.0) {
            return Err(RetrieveError::InvalidParameter(format!(
                "theta must be finite and > 0, got {theta}"
            )));
        }
        let queries = self.prepare_queries(queries)?;
        let (mut matches, stats) = self.run(&queries, RunMode::AboveTheta { theta }, |contexts| {
            contexts
                .iter_mut()
                .flat_map(RetrievalContext::take_matches)
                .collect::<Vec<Match>>()
        });
        matches.sort_by(|a, b| {
            a.query_id
                .cmp(&b.query_id)
                .then(b.score.total_cmp(&a.score))
                .then(a.probe_id.cmp(&b.probe_id))
        });
        info!(
            queries = queries.len(),
            theta,
            matches = matches.len(),
            comparisons = stats.comparisons,
            "above-theta retrieval finished"
        );
        self.finish(stats);
        Ok(matches)
    }

    /// The `k` best probes per query as `(probe id, score)`, best first.
    ///
    /// The outer vector is indexed by query row. A query gets fewer than `k`
    /// results only when there are fewer than `k` probes (or with
    /// approximation enabled).
    ///
    /// # Errors
    ///
    /// `k` must be positive.
    pub fn top_k(&mut self, queries: &[f32], k: usize) -> Result<Vec<Vec<(u32, f32)>>> {
        if k == 0 {
            return Err(RetrieveError::InvalidParameter("k must be greater than 0".into()));
        }
        let queries = self.prepare_queries(queries)?;
        let (results, stats) = self.run(&queries, RunMode::TopK { k }, |contexts| {
            let mut results = vec![Vec::new(); queries.len()];
            for ctx in contexts.iter() {
                for pos in ctx.rows() {
                    results[queries.id(pos) as usize] = sorted_candidates(ctx.slots(pos))
                        .into_iter()
                        .map(|c| (c.id, c.score))
                        .collect();
                }
            }
            results
        });
        info!(
            queries = queries.len(),
            k,
            comparisons = stats.comparisons,
            "top-k retrieval finished"
        );
        self.finish(stats);
        Ok(results)
    }

    fn prepare_queries(&self, queries: &[f32]) -> Result<VectorMatrix> {
        let dimension = self.probes.dimension();
        if queries.is_empty() {
            return Err(RetrieveError::EmptyQuery);
        }
        if queries.len() % dimension != 0 {
            return Err(RetrieveError::DimensionMismatch {
                query_dim: queries.len() % dimension,
                doc_dim: dimension,
            });
        }
        VectorMatrix::from_flat(queries, dimension, self.config.cosine)
    }

    /// Visit every bucket with every worker, then hand the finished
    /// contexts to `collect`. Also returns the summed counters.
    fn run<R, F>(&mut self, queries: &VectorMatrix, mode: RunMode, collect: F) -> (R, ScanStats)
    where
        F: FnOnce(&mut [RetrievalContext<'_>]) -> R,
    {
        let Self {
            probes,
            buckets,
            config,
            pool,
            max_bucket_rows,
            ..
        } = self;
        let probes: &VectorMatrix = probes;
        let retriever = Retriever::from_method(config.method);
        let workers = pool.current_num_threads().clamp(1, queries.len());
        let chunk = queries.len().div_ceil(workers);
        let mut contexts: Vec<RetrievalContext<'_>> = (0..workers)
            .map(|w| w * chunk..((w + 1) * chunk).min(queries.len()))
            .filter(|rows| !rows.is_empty())
            .map(|rows| RetrievalContext::new(queries, probes, rows, mode, *max_bucket_rows, config))
            .collect();
        let mut tuner = BucketTuner::new(queries, probes, mode, *max_bucket_rows, config);
        let longest_query = queries.max_norm();

        for bucket in buckets.iter_mut() {
            bucket.set_after_tuning(TuningOutcome::BASELINE.list_count, TuningOutcome::BASELINE.threshold_ratio);
            match mode {
                RunMode::AboveTheta { theta } => {
                    if longest_query * bucket.norm_range().1 < theta {
                        debug!(bucket = bucket.index(), "no query reaches bucket; stopping");
                        break;
                    }
                    bucket.set_scan_threshold(theta);
                }
                RunMode::TopK { .. } => {
                    if contexts.iter().all(RetrievalContext::is_exhausted) {
                        debug!(bucket = bucket.index(), "all queries retired; stopping");
                        break;
                    }
                }
            }

            tuner.tune(bucket, &contexts);

            let bucket: &ProbeBucket = bucket;
            pool.install(|| {
                contexts.par_iter_mut().for_each(|ctx| match mode {
                    RunMode::AboveTheta { .. } => retriever.run(bucket, ctx),
                    RunMode::TopK { .. } => retriever.run_top_k(bucket, ctx),
                });
            });
        }

        let mut stats = tuner.stats().clone();
        for ctx in &contexts {
            stats.merge(ctx.stats());
        }
        (collect(&mut contexts), stats)
    }

    fn finish(&mut self, stats: ScanStats) {
        if self.config.instrument {
            stats.report();
        }
        self.last_stats = stats;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Method;
    use crate::strategy::StrategyKind;

    fn flat(rows: &[Vec<f32>]) -> Vec<f32> {
        rows.iter().flatten().copied().collect()
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(
            Engine::new(&[], 3, RetrievalConfig::default()).unwrap_err(),
            RetrieveError::EmptyIndex
        );
        assert_eq!(
            Engine::from_rows(&[], RetrievalConfig::default()).unwrap_err(),
            RetrieveError::EmptyIndex
        );
        let mut engine = Engine::new(&[1.0, 0.0, 0.0, 1.0], 2, RetrievalConfig::default()).unwrap();
        assert_eq!(engine.top_k(&[], 1).unwrap_err(), RetrieveError::EmptyQuery);
        assert!(engine.top_k(&[1.0, 0.0], 0).is_err());
        assert!(engine.above_theta(&[1.0, 0.0], 0.0).is_err());
        assert!(matches!(
            engine.top_k(&[1.0, 0.0, 1.0], 1),
            Err(RetrieveError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn ids_map_back_to_input_rows() {
        let probes = vec![vec![0.1, 0.0], vec![3.0, 0.0], vec![0.0, 2.0]];
        let mut engine = Engine::from_rows(&probes, RetrievalConfig::length_only()).unwrap();
        let queries = flat(&[vec![0.0, 1.0], vec![1.0, 0.0]]);
        let top = engine.top_k(&queries, 1).unwrap();
        assert_eq!(top[0][0].0, 2);
        assert_eq!(top[1][0].0, 1);
    }

    #[test]
    fn above_theta_sorted_output() {
        let probes = vec![vec![1.0, 0.0], vec![2.0, 0.0], vec![0.0, 1.0]];
        let config = RetrievalConfig::default().with_method(Method::Mixed(StrategyKind::ThresholdAlgorithm));
        let mut engine = Engine::from_rows(&probes, config).unwrap();
        let matches = engine.above_theta(&flat(&[vec![1.0, 0.0], vec![1.0, 1.0]]), 0.9).unwrap();
        let pairs: Vec<(u32, u32)> = matches.iter().map(|m| (m.query_id, m.probe_id)).collect();
        assert_eq!(pairs, vec![(0, 1), (0, 0), (1, 1), (1, 0), (1, 2)]);
    }

    #[test]
    fn timings_follow_instrument_toggle() {
        use std::time::Duration;

        use crate::strategy::testing::random_rows;

        let probes = random_rows(800, 8, 31);
        let queries = flat(&random_rows(60, 8, 32));
        let timed = |method: Method, instrument: bool| {
            let config = RetrievalConfig {
                instrument,
                ..RetrievalConfig::default().with_method(method)
            };
            let mut engine = Engine::from_rows(&probes, config).unwrap();
            engine.top_k(&queries, 5).unwrap();
            engine.last_stats().clone()
        };

        let length = timed(Method::Single(StrategyKind::Length), true);
        assert!(length.length_time > Duration::ZERO);

        let coordinate = timed(Method::Single(StrategyKind::Coordinate), true);
        assert!(coordinate.scan_time > Duration::ZERO);
        assert!(coordinate.preprocess_time > Duration::ZERO);

        let mixed = timed(Method::Mixed(StrategyKind::Coordinate), true);
        assert!(mixed.tuning_time > Duration::ZERO);

        let silent = timed(Method::Mixed(StrategyKind::Coordinate), false);
        assert!(silent.comparisons > 0);
        assert_eq!(silent.length_time, Duration::ZERO);
        assert_eq!(silent.scan_time, Duration::ZERO);
        assert_eq!(silent.preprocess_time, Duration::ZERO);
        assert_eq!(silent.tuning_time, Duration::ZERO);
    }

    #[test]
    fn fewer_probes_than_k() {
        let mut engine = Engine::new(&[1.0, 0.0, 0.0, 1.0], 2, RetrievalConfig::default()).unwrap();
        let top = engine.top_k(&[1.0, 1.0], 5).unwrap();
        assert_eq!(top[0].len(), 2);
    }
}
