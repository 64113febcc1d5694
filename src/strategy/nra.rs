//! Threshold algorithm without random access.
//!
//! The focus lists are walked in lockstep and every row accumulates the
//! partial sum of the focus terms it has been seen with. The walk stops when
//! no unseen row can reach `θ_b`; the seen rows are then ranked by their
//! upper bound (partial sum plus the frontier terms of the lists they were
//! not seen in, plus the non-focus bound) and verified best first until the
//! bound drops below `θ_b`.

use super::ta::{rest_norm, unseen_bound, ListCursor};
use super::{length, missing_index, state_mismatch, QueryView, StrategyKind, Target, COSINE_SLACK};
use crate::bucket::ProbeBucket;
use crate::config::MAX_LISTS_LIMIT;
use crate::context::{AuxState, Scratch};

/// Partial sums, seen masks and the rows they were touched for.
#[derive(Debug, Clone)]
pub struct NraState {
    partial: Vec<f32>,
    masks: Vec<u64>,
    touched: Vec<u32>,
    bounds: Vec<(f32, u32)>,
    cursors: Vec<ListCursor>,
}

impl NraState {
    pub fn new(max_rows: usize) -> Self {
        Self {
            partial: vec![0.0; max_rows],
            masks: vec![0; max_rows],
            touched: Vec::new(),
            bounds: Vec::new(),
            cursors: Vec::with_capacity(MAX_LISTS_LIMIT),
        }
    }
}

pub(crate) fn scan(query: &QueryView<'_>, bucket: &ProbeBucket, target: Target, s: &mut Scratch<'_>) {
    let floor = s.out.floor(target, query.norm);
    let mut theta_b = bucket.local_threshold(floor, query.norm);
    if theta_b > 1.0 + COSINE_SLACK {
        return;
    }
    let focus = query.focus(s.num_lists.min(MAX_LISTS_LIMIT));
    if focus.is_empty() || theta_b <= -1.0 {
        return length::scan(query, bucket, target, s);
    }
    let Some(lists) = bucket.lists.as_ref() else {
        missing_index(StrategyKind::ThresholdAlgorithmNra, bucket)
    };
    let Scratch { out, aux, .. } = s;
    let AuxState::ThresholdAlgorithmNra(state) = aux else {
        state_mismatch(StrategyKind::ThresholdAlgorithmNra, aux)
    };
    debug_assert!(state.partial.len() >= bucket.len());

    state.cursors.clear();
    state.cursors.extend(focus.iter().map(|&j| {
        let j = j as usize;
        ListCursor::new(j, query.direction[j], lists.list(j))
    }));
    let rest = rest_norm(query.direction, focus);

    // Sorted access, one entry per list per round.
    'rounds: while unseen_bound(&state.cursors, rest) >= theta_b - COSINE_SLACK {
        for (bit, cursor) in state.cursors.iter_mut().enumerate() {
            let list = lists.list(cursor.coord);
            let Some(entry) = cursor.advance(list) else {
                // Every row has been seen in this list.
                break 'rounds;
            };
            out.stats.list_steps += 1;
            let local = entry.row as usize;
            if state.masks[local] == 0 {
                state.touched.push(entry.row);
            }
            state.masks[local] |= 1 << bit;
            state.partial[local] += cursor.weight * entry.value;
        }
    }

    // Upper bounds of every touched row.
    state.bounds.clear();
    for &local in &state.touched {
        let l = local as usize;
        let mask = state.masks[l];
        let missing: f32 = state
            .cursors
            .iter()
            .enumerate()
            .filter(|(bit, _)| mask & (1 << bit) == 0)
            .map(|(_, c)| c.term)
            .sum();
        state.bounds.push((state.partial[l] + missing + rest, local));
        state.partial[l] = 0.0;
        state.masks[l] = 0;
    }
    state.touched.clear();
    state
        .bounds
        .sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

    let probes = out.probes;
    let start = bucket.rows().start;
    for &(bound, local) in &state.bounds {
        if bound < theta_b - COSINE_SLACK {
            break;
        }
        let row = start + local as usize;
        let floor = out.floor(target, query.norm);
        if target.cannot_reach(query.norm * probes.norm(row), floor) {
            continue;
        }
        out.verify(query, row, target);
        if target == Target::TopK {
            theta_b = bucket.local_threshold(out.floor(target, query.norm), query.norm);
        }
    }
}
