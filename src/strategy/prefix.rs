//! Incremental pruning over the focus coordinates.
//!
//! Rows within the length cutoff are scored coordinate by coordinate along
//! the query's focus order. After a prefix of coordinates, a row's cosine is
//! at most
//!
//! ```text
//! Σ_prefix q̂_j p̂_j + |q̂_rest| * sqrt(1 - Σ_prefix p̂_j²)
//! ```
//!
//! Rows whose bound falls below `θ_b` are dropped; the survivors are verified.

use super::{length, state_mismatch, QueryView, StrategyKind, Target, COSINE_SLACK};
use crate::bucket::ProbeBucket;
use crate::context::{AuxState, Scratch};

/// Partial sums and the surviving rows.
#[derive(Debug, Clone)]
pub struct PrefixState {
    accum: Vec<f32>,
    probe_sq: Vec<f32>,
    alive: Vec<u32>,
    next: Vec<u32>,
}

impl PrefixState {
    pub fn new(max_rows: usize) -> Self {
        Self {
            accum: vec![0.0; max_rows],
            probe_sq: vec![0.0; max_rows],
            alive: Vec::new(),
            next: Vec::new(),
        }
    }
}

pub(crate) fn scan(query: &QueryView<'_>, bucket: &ProbeBucket, target: Target, s: &mut Scratch<'_>) {
    let floor = s.out.floor(target, query.norm);
    let theta_b = bucket.local_threshold(floor, query.norm);
    if theta_b > 1.0 + COSINE_SLACK {
        return;
    }
    let focus = query.focus(s.num_lists);
    if focus.is_empty() || theta_b <= -1.0 {
        return length::scan(query, bucket, target, s);
    }
    let Scratch { out, aux, .. } = s;
    let AuxState::ApproximatePruning(state) = aux else {
        state_mismatch(StrategyKind::ApproximatePruning, aux)
    };
    debug_assert!(state.accum.len() >= bucket.len());

    let probes = out.probes;
    let start = bucket.rows().start;
    state.alive.clear();
    for (local, row) in bucket.rows().enumerate() {
        if target.cannot_reach(query.norm * probes.norm(row), floor) {
            break;
        }
        state.alive.push(local as u32);
        state.accum[local] = 0.0;
        state.probe_sq[local] = 0.0;
    }

    let mut query_rest_sq = 1.0f32;
    for &coord in focus {
        let coord = coord as usize;
        let q_j = query.direction[coord];
        query_rest_sq -= q_j * q_j;
        let query_rest = query_rest_sq.max(0.0).sqrt();

        state.next.clear();
        for &local in &state.alive {
            let l = local as usize;
            let p_j = probes.row(start + l)[coord];
            state.accum[l] += q_j * p_j;
            state.probe_sq[l] += p_j * p_j;
            let bound = state.accum[l] + query_rest * (1.0 - state.probe_sq[l]).max(0.0).sqrt();
            if bound >= theta_b - COSINE_SLACK {
                state.next.push(local);
            }
        }
        out.stats.list_steps += state.alive.len() as u64;
        std::mem::swap(&mut state.alive, &mut state.next);
        if state.alive.is_empty() {
            return;
        }
    }

    for &local in &state.alive {
        let row = start + local as usize;
        if target.cannot_reach(query.norm * probes.norm(row), out.floor(target, query.norm)) {
            continue;
        }
        out.verify(query, row, target);
    }
}
