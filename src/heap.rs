//! Fixed-capacity top-k heap.
//!
//! Per query, the k best candidates live in a flat array laid out as a binary
//! min-heap on score, so slot 0 is always the current k-th best (the eviction
//! candidate). The same layout is used in the shared per-query buffer and in
//! the thread-local scratch heap, which makes moving a query in and out of
//! scratch a plain slice copy.
//!
//! Unfilled slots hold [`Candidate::EMPTY`] (score `-inf`), so a fresh heap
//! admits anything and `min_score()` is `-inf` until k candidates are seen.

use std::cmp::Ordering;

/// A scored probe row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    /// External probe id.
    pub id: u32,
    /// Inner product with the query.
    pub score: f32,
}

impl Candidate {
    /// Placeholder for an unfilled slot.
    pub const EMPTY: Self = Self {
        id: u32::MAX,
        score: f32::NEG_INFINITY,
    };

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.score == f32::NEG_INFINITY && self.id == u32::MAX
    }

    /// Heap order: lower score first; on equal scores the higher id is
    /// treated as worse so the order is total and deterministic.
    #[inline]
    fn worse_than(&self, other: &Candidate) -> bool {
        match self.score.total_cmp(&other.score) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => self.id > other.id,
        }
    }
}

/// k-slot min-heap of [`Candidate`]s.
#[derive(Debug, Clone)]
pub struct TopKHeap {
    slots: Vec<Candidate>,
}

impl TopKHeap {
    /// A heap with `k` empty slots.
    pub fn new(k: usize) -> Self {
        Self {
            slots: vec![Candidate::EMPTY; k],
        }
    }

    #[inline]
    pub fn k(&self) -> usize {
        self.slots.len()
    }

    /// Current k-th best score (`-inf` while the heap has empty slots).
    #[inline]
    pub fn min_score(&self) -> f32 {
        self.slots.first().map_or(f32::INFINITY, |c| c.score)
    }

    /// Offer a candidate. It is admitted only if its score is strictly
    /// better than the current k-th best; it then evicts the root.
    ///
    /// Returns whether the candidate was admitted.
    #[inline]
    pub fn push(&mut self, id: u32, score: f32) -> bool {
        match self.slots.first() {
            Some(root) if score > root.score => {
                self.slots[0] = Candidate { id, score };
                self.sift_down(0);
                true
            }
            _ => false,
        }
    }

    /// Copy k heap-ordered slots in from a shared buffer.
    #[inline]
    pub fn load(&mut self, src: &[Candidate]) {
        self.slots.copy_from_slice(src);
    }

    /// Copy the k slots out to a shared buffer.
    #[inline]
    pub fn store(&self, dst: &mut [Candidate]) {
        dst.copy_from_slice(&self.slots);
    }

    /// Reset every slot to empty.
    pub fn clear(&mut self) {
        self.slots.fill(Candidate::EMPTY);
    }

    #[inline]
    pub fn as_slice(&self) -> &[Candidate] {
        &self.slots
    }

    /// Filled slots sorted by descending score (ties by ascending id).
    pub fn into_sorted(self) -> Vec<Candidate> {
        sorted_candidates(&self.slots)
    }

    fn sift_down(&mut self, mut pos: usize) {
        let n = self.slots.len();
        loop {
            let left = 2 * pos + 1;
            if left >= n {
                break;
            }
            let right = left + 1;
            let mut child = left;
            if right < n && self.slots[right].worse_than(&self.slots[left]) {
                child = right;
            }
            if self.slots[child].worse_than(&self.slots[pos]) {
                self.slots.swap(child, pos);
                pos = child;
            } else {
                break;
            }
        }
    }
}

/// Drop empty slots and sort by descending score, ties by ascending id.
pub fn sorted_candidates(slots: &[Candidate]) -> Vec<Candidate> {
    let mut out: Vec<Candidate> = slots.iter().filter(|c| !c.is_empty()).copied().collect();
    out.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_heap(slots: &[Candidate]) -> bool {
        (1..slots.len()).all(|i| !slots[i].worse_than(&slots[(i - 1) / 2]))
    }

    #[test]
    fn keeps_ten_best_of_fifteen() {
        let scores = [
            3.0f32, 14.0, 1.0, 9.0, 12.0, 0.5, 7.0, 11.0, 2.0, 13.0, 5.0, 8.0, 6.0, 10.0, 4.0,
        ];
        let mut heap = TopKHeap::new(10);
        for (i, &s) in scores.iter().enumerate() {
            heap.push(i as u32, s);
            assert!(is_heap(heap.as_slice()));
        }
        assert_eq!(heap.min_score(), 5.0);
        let got: Vec<f32> = heap.into_sorted().iter().map(|c| c.score).collect();
        let expected: Vec<f32> = (5..=14).rev().map(|s| s as f32).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn fresh_heap_admits_anything() {
        let mut heap = TopKHeap::new(3);
        assert_eq!(heap.min_score(), f32::NEG_INFINITY);
        assert!(heap.push(0, -100.0));
        assert_eq!(heap.into_sorted().len(), 1);
    }

    #[test]
    fn equal_score_does_not_evict() {
        let mut heap = TopKHeap::new(1);
        assert!(heap.push(7, 1.0));
        assert!(!heap.push(3, 1.0));
        assert_eq!(heap.as_slice()[0].id, 7);
    }

    #[test]
    fn load_store_roundtrip_keeps_heap_order() {
        let mut heap = TopKHeap::new(4);
        for (i, s) in [0.4f32, 0.1, 0.9, 0.3, 0.7].iter().enumerate() {
            heap.push(i as u32, *s);
        }
        let mut shared = vec![Candidate::EMPTY; 8];
        heap.store(&mut shared[4..8]);

        let mut scratch = TopKHeap::new(4);
        scratch.load(&shared[4..8]);
        assert_eq!(scratch.min_score(), 0.3);
        scratch.push(9, 0.5);
        assert_eq!(scratch.min_score(), 0.4);
    }
}
