//! Runtime configuration.
//!
//! Everything that the engine reads before a run lives in
//! [`RetrievalConfig`]. The approximation mode and instrumentation switch are
//! ordinary fields so a single build can be exercised in every mode.
//!
//! ```rust
//! use lemur::config::{Method, RetrievalConfig};
//! use lemur::strategy::StrategyKind;
//!
//! let config = RetrievalConfig::default()
//!     .with_method(Method::Mixed(StrategyKind::ThresholdAlgorithm))
//!     .with_seed(7);
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};

use crate::strategy::StrategyKind;
use crate::{Result, RetrieveError};

/// Upper limit on focus coordinates; NRA keeps one bit per list in a `u64`.
pub const MAX_LISTS_LIMIT: usize = 64;

/// Which retriever scans the buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// One strategy for every query and bucket.
    Single(StrategyKind),
    /// Length scan mixed per bucket/query with the given alternative.
    Mixed(StrategyKind),
}

impl Method {
    /// The strategy whose auxiliary state the context must own.
    pub fn primary(self) -> StrategyKind {
        match self {
            Method::Single(kind) | Method::Mixed(kind) => kind,
        }
    }

    pub fn is_mixed(self) -> bool {
        matches!(self, Method::Mixed(_))
    }
}

/// How the top-k threshold is loosened before pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Approximation {
    /// `score * (1 + gamma)` for non-negative scores, `score * (1 - gamma)` otherwise.
    #[default]
    Relative,
    /// `score + gamma * |q|`.
    Additive,
}

impl Approximation {
    /// Loosened pruning threshold for a query whose k-th best is `score`.
    ///
    /// With `gamma == 0` this is `score` itself.
    #[inline]
    pub fn loosen(self, gamma: f32, score: f32, query_norm: f32) -> f32 {
        if gamma == 0.0 || !score.is_finite() {
            return score;
        }
        match self {
            Approximation::Relative if score >= 0.0 => score * (1.0 + gamma),
            Approximation::Relative => score * (1.0 - gamma),
            Approximation::Additive => score + gamma * query_norm,
        }
    }
}

/// What the tuner measures when it compares strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TuningCost {
    /// Elapsed wall-clock nanoseconds.
    #[default]
    WallClock,
    /// Inner products and candidate checks; deterministic across runs.
    Comparisons,
}

/// How probe rows are cut into buckets.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketingParams {
    /// A bucket closes once a row is shorter than `length_ratio * bucket max`.
    pub length_ratio: f32,
    /// Hard cap on rows per bucket.
    pub max_bucket_size: usize,
    /// A bucket never closes on the length rule before this many rows.
    pub min_bucket_size: usize,
}

impl Default for BucketingParams {
    fn default() -> Self {
        Self {
            length_ratio: 0.9,
            max_bucket_size: 4096,
            min_bucket_size: 32,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub method: Method,
    /// Worker threads; 0 lets rayon decide.
    pub threads: usize,
    /// Queries per batch inside a worker.
    pub batch_size: usize,
    pub bucketing: BucketingParams,
    /// Focus coordinates kept per query queue (upper limit for tuning).
    pub max_lists: usize,
    /// Sample queries per bucket for tuning; 0 disables tuning.
    pub sample_size: usize,
    /// Seed for tuning samples and LSH hyperplanes.
    pub seed: u64,
    pub approximation: Approximation,
    /// Top-k approximation factor; 0 means exact.
    pub gamma: f32,
    /// Target recall for LSH candidate generation, in (0, 1).
    pub lsh_recall: f32,
    /// Threshold algorithm list choice: round robin instead of max term.
    pub ta_round_robin: bool,
    /// Score by cosine similarity instead of raw inner product.
    pub cosine: bool,
    /// Collect per-phase timings in every context.
    pub instrument: bool,
    pub tuning_cost: TuningCost,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            method: Method::Mixed(StrategyKind::Coordinate),
            threads: 0,
            batch_size: 64,
            bucketing: BucketingParams::default(),
            max_lists: 4,
            sample_size: 32,
            seed: 42,
            approximation: Approximation::Relative,
            gamma: 0.0,
            lsh_recall: 0.9,
            ta_round_robin: false,
            cosine: false,
            instrument: false,
            tuning_cost: TuningCost::WallClock,
        }
    }
}

impl RetrievalConfig {
    /// Plain length scan, no tuning.
    pub fn length_only() -> Self {
        Self {
            method: Method::Single(StrategyKind::Length),
            sample_size: 0,
            ..Self::default()
        }
    }

    /// Settings whose tuning decisions repeat exactly across runs.
    pub fn reproducible() -> Self {
        Self {
            threads: 1,
            tuning_cost: TuningCost::Comparisons,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    #[must_use]
    pub fn with_approximation(mut self, approximation: Approximation, gamma: f32) -> Self {
        self.approximation = approximation;
        self.gamma = gamma;
        self
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| RetrieveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| RetrieveError::Config(e.to_string()))
    }

    /// Check parameter ranges.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(RetrieveError::InvalidParameter(msg));

        if let Method::Mixed(StrategyKind::Length) = self.method {
            return invalid("mixed retrieval needs an alternative other than length".into());
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be greater than 0".into());
        }
        if self.max_lists == 0 || self.max_lists > MAX_LISTS_LIMIT {
            return invalid(format!(
                "max_lists must be in 1..={MAX_LISTS_LIMIT}, got {}",
                self.max_lists
            ));
        }
        if !(self.gamma >= 0.0 && self.gamma.is_finite()) {
            return invalid(format!("gamma must be finite and >= 0, got {}", self.gamma));
        }
        if self.approximation == Approximation::Relative && self.gamma >= 1.0 {
            return invalid(format!("relative gamma must be < 1, got {}", self.gamma));
        }
        if !(self.lsh_recall > 0.0 && self.lsh_recall < 1.0) {
            return invalid(format!(
                "lsh_recall must be in (0, 1), got {}",
                self.lsh_recall
            ));
        }
        let b = &self.bucketing;
        if !(b.length_ratio > 0.0 && b.length_ratio <= 1.0) {
            return invalid(format!(
                "length_ratio must be in (0, 1], got {}",
                b.length_ratio
            ));
        }
        if b.max_bucket_size == 0 || b.min_bucket_size > b.max_bucket_size {
            return invalid(format!(
                "bucket sizes must satisfy 0 < min <= max, got min {} max {}",
                b.min_bucket_size, b.max_bucket_size
            ));
        }
        Ok(())
    }
}
