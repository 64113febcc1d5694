//! Fagin's threshold algorithm over the focus coordinates' sorted lists.
//!
//! Each focus list is walked from the end that favors the query (descending
//! values for `q̂_j >= 0`, ascending otherwise). Every newly seen row is
//! verified immediately (random access). With `f_j` the current frontier
//! value of list `j`, no unseen row can exceed
//!
//! ```text
//! T = Σ_j q̂_j f_j + sqrt(1 - Σ_j q̂_j²)
//! ```
//!
//! since the non-focus part of `q̂ · p̂` is bounded by Cauchy-Schwarz. The walk
//! stops once `T < θ_b`.

use smallvec::SmallVec;

use super::{length, missing_index, state_mismatch, QueryView, StrategyKind, Target, COSINE_SLACK};
use crate::bucket::{ListEntry, ProbeBucket};
use crate::context::{AuxState, Scratch};

/// Cursor over one sorted list, walking from the query-favored end.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ListCursor {
    pub coord: usize,
    pub weight: f32,
    pub descending: bool,
    pub steps: usize,
    /// `weight * frontier value`, or `-inf` once the list is exhausted.
    pub term: f32,
}

impl ListCursor {
    pub fn new(coord: usize, weight: f32, list: &[ListEntry]) -> Self {
        let mut cursor = Self {
            coord,
            weight,
            descending: weight >= 0.0,
            steps: 0,
            term: f32::NEG_INFINITY,
        };
        cursor.refresh(list);
        cursor
    }

    #[inline]
    pub fn is_exhausted(&self, list: &[ListEntry]) -> bool {
        self.steps >= list.len()
    }

    /// Entry under the cursor, if any.
    #[inline]
    pub fn peek(&self, list: &[ListEntry]) -> Option<ListEntry> {
        if self.is_exhausted(list) {
            return None;
        }
        let i = if self.descending {
            list.len() - 1 - self.steps
        } else {
            self.steps
        };
        Some(list[i])
    }

    /// Step past the current entry and return it.
    #[inline]
    pub fn advance(&mut self, list: &[ListEntry]) -> Option<ListEntry> {
        let entry = self.peek(list)?;
        self.steps += 1;
        self.refresh(list);
        Some(entry)
    }

    #[inline]
    fn refresh(&mut self, list: &[ListEntry]) {
        self.term = self
            .peek(list)
            .map_or(f32::NEG_INFINITY, |e| self.weight * e.value);
    }
}

/// Upper bound on `q̂ · p̂` for rows not yet seen in any list.
#[inline]
pub(crate) fn unseen_bound(cursors: &[ListCursor], rest: f32) -> f32 {
    cursors.iter().map(|c| c.term).sum::<f32>() + rest
}

/// Norm of the query direction outside the focus coordinates.
#[inline]
pub(crate) fn rest_norm(direction: &[f32], focus: &[u32]) -> f32 {
    let focus_sq: f32 = focus
        .iter()
        .map(|&j| direction[j as usize] * direction[j as usize])
        .sum();
    (1.0 - focus_sq).max(0.0).sqrt()
}

/// Seen flags and list cursors reused across queries.
#[derive(Debug, Clone)]
pub struct TaState {
    seen: Vec<bool>,
    visited: Vec<u32>,
    cursors: SmallVec<[ListCursor; 8]>,
    round_robin: bool,
}

impl TaState {
    pub fn new(max_rows: usize, round_robin: bool) -> Self {
        Self {
            seen: vec![false; max_rows],
            visited: Vec::new(),
            cursors: SmallVec::new(),
            round_robin,
        }
    }
}

pub(crate) fn scan(query: &QueryView<'_>, bucket: &ProbeBucket, target: Target, s: &mut Scratch<'_>) {
    let floor = s.out.floor(target, query.norm);
    let mut theta_b = bucket.local_threshold(floor, query.norm);
    if theta_b > 1.0 + COSINE_SLACK {
        return;
    }
    let focus = query.focus(s.num_lists);
    if focus.is_empty() || theta_b <= -1.0 {
        return length::scan(query, bucket, target, s);
    }
    let Some(lists) = bucket.lists.as_ref() else {
        missing_index(StrategyKind::ThresholdAlgorithm, bucket)
    };
    let Scratch { out, aux, .. } = s;
    let AuxState::ThresholdAlgorithm(state) = aux else {
        state_mismatch(StrategyKind::ThresholdAlgorithm, aux)
    };
    debug_assert!(state.seen.len() >= bucket.len());

    state.cursors.clear();
    state.cursors.extend(focus.iter().map(|&j| {
        let j = j as usize;
        ListCursor::new(j, query.direction[j], lists.list(j))
    }));
    let rest = rest_norm(query.direction, focus);
    let probes = out.probes;
    let start = bucket.rows().start;
    let mut next = 0usize;

    loop {
        if unseen_bound(&state.cursors, rest) < theta_b - COSINE_SLACK {
            break;
        }
        let pick = if state.round_robin {
            let pick = next;
            next = (next + 1) % state.cursors.len();
            pick
        } else {
            let mut best = 0;
            for (i, c) in state.cursors.iter().enumerate().skip(1) {
                if c.term > state.cursors[best].term {
                    best = i;
                }
            }
            best
        };
        let cursor = &mut state.cursors[pick];
        let list = lists.list(cursor.coord);
        // An exhausted list means every row has been seen.
        let Some(entry) = cursor.advance(list) else {
            break;
        };
        out.stats.list_steps += 1;

        let local = entry.row as usize;
        if state.seen[local] {
            continue;
        }
        state.seen[local] = true;
        state.visited.push(entry.row);

        let row = start + local;
        let floor = out.floor(target, query.norm);
        if target.cannot_reach(query.norm * probes.norm(row), floor) {
            continue;
        }
        out.verify(query, row, target);
        if target == Target::TopK {
            theta_b = bucket.local_threshold(out.floor(target, query.norm), query.norm);
        }
    }

    for &local in &state.visited {
        state.seen[local as usize] = false;
    }
    state.visited.clear();
}
