//! Coordinate-based pruning on per-coordinate sorted lists.
//!
//! For unit vectors with `q̂ · p̂ >= θ_b`, the angle between them is at most
//! `a = acos(θ_b)`. If coordinate `j` of the query sits at angle
//! `α = acos(q̂_j)` from axis `j`, every qualifying `p̂_j` lies in
//! `[cos(α + a), cos(α - a)]`, clamped to `[-1, 1]`. Each focus coordinate
//! cuts one such interval out of its sorted list; only rows present in all
//! of them are verified.

use std::f32::consts::PI;

use super::{length, missing_index, state_mismatch, QueryView, StrategyKind, Target, COSINE_SLACK};
use crate::bucket::ProbeBucket;
use crate::context::{AuxState, Scratch};

/// Per-row hit counters and the rows that entered the first interval.
#[derive(Debug, Clone)]
pub struct CoordinateState {
    counts: Vec<u32>,
    candidates: Vec<u32>,
}

impl CoordinateState {
    pub fn new(max_rows: usize) -> Self {
        Self {
            counts: vec![0; max_rows],
            candidates: Vec::new(),
        }
    }
}

/// Interval of `p̂_j` values compatible with `q̂ · p̂ >= theta_b`.
pub(crate) fn feasible_interval(q_j: f32, theta_b: f32) -> (f32, f32) {
    let a = theta_b.clamp(-1.0, 1.0).acos();
    let alpha = q_j.clamp(-1.0, 1.0).acos();
    let lo = if alpha + a >= PI { -1.0 } else { (alpha + a).cos() };
    let hi = if alpha - a <= 0.0 { 1.0 } else { (alpha - a).cos() };
    (lo - COSINE_SLACK, hi + COSINE_SLACK)
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
    let Some(lists) = bucket.lists.as_ref() else {
        missing_index(StrategyKind::Coordinate, bucket)
    };
    let Scratch { out, aux, .. } = s;
    let AuxState::Coordinate(state) = aux else {
        state_mismatch(StrategyKind::Coordinate, aux)
    };
    debug_assert!(state.counts.len() >= bucket.len());

    state.candidates.clear();
    for (i, &coord) in focus.iter().enumerate() {
        let coord = coord as usize;
        let (lo, hi) = feasible_interval(query.direction[coord], theta_b);
        let range = lists.range(coord, lo, hi);
        out.stats.list_steps += range.len() as u64;
        let i = i as u32;
        for entry in &lists.list(coord)[range] {
            let count = &mut state.counts[entry.row as usize];
            if *count == i {
                *count += 1;
                if i == 0 {
                    state.candidates.push(entry.row);
                }
            }
        }
    }

    let needed = focus.len() as u32;
    let probes = out.probes;
    let start = bucket.rows().start;
    for &local in &state.candidates {
        let count = std::mem::take(&mut state.counts[local as usize]);
        if count != needed {
            continue;
        }
        let row = start + local as usize;
        if target.cannot_reach(query.norm * probes.norm(row), out.floor(target, query.norm)) {
            continue;
        }
        out.verify(query, row, target);
    }
}
