//! lemur: exact and approximate top-k inner product retrieval.
//!
//! Given a set of queries and a set of probe vectors, finds for every query
//! the k probes with the largest inner product (or every probe above a fixed
//! threshold θ) without scoring all pairs.
//!
//! - `matrix`: length-sorted row storage (unit direction + length)
//! - `bucket`: probe buckets of similar length, query batches
//! - `strategy`: per-bucket candidate generation (length, coordinate, TA,
//!   NRA, LSH, incremental pruning)
//! - `dispatch`: single-strategy and hybrid retrievers
//! - `tuner`: per-bucket sample-based strategy selection
//! - `engine`: the façade that runs all of the above on a thread pool
//!
//! # Critical Nuances
//!
//! ## Length Dominates
//!
//! `q · p = |q| |p| cos(q, p)`. Probe sets with skewed length distributions
//! (typical for matrix factorization models) let a plain length scan stop
//! very early for long queries. For short queries against long probes the
//! length bound is loose and a direction-based strategy wins. Bucketing by
//! length and tuning per bucket exploits both regimes.
//!
//! ## Local Thresholds
//!
//! Inside a bucket every row length lies in `[norm_min, norm_max]`, so the
//! global score threshold turns into a cosine threshold `θ_b` on unit
//! directions. All non-length strategies operate on `θ_b`.
//!
//! ## Approximation
//!
//! With `gamma > 0` the top-k threshold is loosened before pruning, trading
//! recall for speed. LSH is approximate regardless of `gamma`.

pub mod bound;
pub mod bucket;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod engine;
pub mod heap;
pub mod matrix;
pub mod strategy;
pub mod tuner;

pub mod simd;

// Re-exports
pub use config::{Method, RetrievalConfig};
pub use context::Match;
pub use engine::Engine;
pub use error::{Result, RetrieveError};
pub use strategy::StrategyKind;

pub mod error;
