//! Geometric bounds used to prune candidates before computing inner products.
//!
//! A [`Bound`] describes a region of Euclidean space and answers distance
//! range queries against points. [`BallBound`] is the only implementation in
//! this crate; any tree index that wants to plug into the dispatcher only has
//! to expose the same contract per node.
//!
//! # The empty sentinel
//!
//! A ball with `radius < 0` has not been computed yet. It contains nothing and
//! every distance query against it answers [`f32::INFINITY`]. Callers branch on
//! this to tell "not computed" apart from "far away", so the sentinel is never
//! normalized away.
//!
//! # Growing a ball
//!
//! [`BallBound::expand_to_include`] is a greedy O(n) update, not a minimum
//! enclosing ball: each point outside the ball drags the center half of the
//! excess distance toward it and grows the radius by the same amount. The
//! result always covers the previous ball and the new point, but can be looser
//! than optimal. Pruning only needs the bound to be sound.

use std::fmt;

use crate::simd;

/// Minimum and maximum of a distance range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceRange {
    pub lo: f32,
    pub hi: f32,
}

impl DistanceRange {
    /// The range reported by an empty bound.
    pub const UNBOUNDED: Self = Self {
        lo: f32::INFINITY,
        hi: f32::INFINITY,
    };

    /// Whether `value` lies in `[lo, hi]`.
    #[inline]
    pub fn contains(&self, value: f32) -> bool {
        self.lo <= value && value <= self.hi
    }
}

/// Distance bounds against points.
pub trait Bound {
    /// True iff the point is inside the bound. False for an empty bound.
    fn contains(&self, point: &[f32]) -> bool;

    /// Lower bound on the distance from any covered point to `point`.
    fn min_distance(&self, point: &[f32]) -> f32;

    /// Upper bound on the distance from any covered point to `point`.
    fn max_distance(&self, point: &[f32]) -> f32;

    /// Both bounds at once.
    fn range_distance(&self, point: &[f32]) -> DistanceRange;
}

/// A hypersphere bound: `{ radius, center }`.
#[derive(Debug, Clone, PartialEq)]
pub struct BallBound {
    radius: f32,
    center: Vec<f32>,
}

impl Default for BallBound {
    fn default() -> Self {
        Self::empty(0)
    }
}

impl BallBound {
    /// An empty bound of the given dimension.
    pub fn empty(dimension: usize) -> Self {
        Self {
            radius: -1.0,
            center: vec![0.0; dimension],
        }
    }

    /// A bound with an explicit radius and center.
    pub fn new(radius: f32, center: Vec<f32>) -> Self {
        Self { radius, center }
    }

    /// Smallest greedy ball covering every point yielded by `points`.
    pub fn from_points<'a, I>(dimension: usize, points: I) -> Self
    where
        I: IntoIterator<Item = &'a [f32]>,
    {
        let mut ball = Self::empty(dimension);
        ball.expand_to_include(points);
        ball
    }

    #[inline]
    pub fn radius(&self) -> f32 {
        self.radius
    }

    #[inline]
    pub fn center(&self) -> &[f32] {
        &self.center
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.center.len()
    }

    /// Whether the bound has not been computed yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.radius < 0.0
    }

    /// Range covered along one dimension, `None` for an empty bound.
    pub fn dimension_range(&self, dim: usize) -> Option<(f32, f32)> {
        if self.is_empty() {
            return None;
        }
        let c = self.center[dim];
        Some((c - self.radius, c + self.radius))
    }

    /// Minimum distance between two balls.
    pub fn min_distance_to(&self, other: &BallBound) -> f32 {
        if self.is_empty() {
            return f32::INFINITY;
        }
        let delta = simd::l2_distance(&self.center, &other.center) - self.radius - other.radius;
        delta.max(0.0)
    }

    /// Maximum distance between two balls.
    pub fn max_distance_to(&self, other: &BallBound) -> f32 {
        if self.is_empty() {
            return f32::INFINITY;
        }
        simd::l2_distance(&self.center, &other.center) + self.radius + other.radius
    }

    /// Minimum and maximum distance between two balls.
    pub fn range_distance_to(&self, other: &BallBound) -> DistanceRange {
        if self.is_empty() {
            return DistanceRange::UNBOUNDED;
        }
        let dist = simd::l2_distance(&self.center, &other.center);
        let sum_radius = self.radius + other.radius;
        DistanceRange {
            lo: (dist - sum_radius).max(0.0),
            hi: dist + sum_radius,
        }
    }

    /// Grow the ball so it covers every point in `points`.
    ///
    /// An empty ball is seeded at the first point with radius 0.
    pub fn expand_to_include<'a, I>(&mut self, points: I)
    where
        I: IntoIterator<Item = &'a [f32]>,
    {
        let mut points = points.into_iter();
        if self.is_empty() {
            let Some(first) = points.next() else {
                return;
            };
            self.center.clear();
            self.center.extend_from_slice(first);
            self.radius = 0.0;
        }

        for point in points {
            debug_assert_eq!(point.len(), self.center.len());
            let dist = simd::l2_distance(&self.center, point);
            let excess = dist - self.radius;
            if excess <= 0.0 {
                continue;
            }
            // Move excess/2 along the unit direction toward the point.
            let step = 0.5 * excess / dist;
            for (c, &p) in self.center.iter_mut().zip(point) {
                *c += step * (p - *c);
            }
            self.radius += 0.5 * excess;
        }
    }

    /// Upper bound on `query · p` over every covered `p`.
    ///
    /// Any covered `p` is `c + d` with `|d| <= r`, so `q·p <= q·c + |q|·r`.
    /// Returns `+inf` for an empty ball.
    #[inline]
    pub fn max_inner_product(&self, query: &[f32], query_norm: f32) -> f32 {
        if self.is_empty() {
            return f32::INFINITY;
        }
        simd::dot(query, &self.center) + query_norm * self.radius
    }
}

impl Bound for BallBound {
    fn contains(&self, point: &[f32]) -> bool {
        if self.is_empty() {
            return false;
        }
        simd::l2_distance(&self.center, point) <= self.radius
    }

    fn min_distance(&self, point: &[f32]) -> f32 {
        if self.is_empty() {
            return f32::INFINITY;
        }
        (simd::l2_distance(point, &self.center) - self.radius).max(0.0)
    }

    fn max_distance(&self, point: &[f32]) -> f32 {
        if self.is_empty() {
            return f32::INFINITY;
        }
        simd::l2_distance(point, &self.center) + self.radius
    }

    fn range_distance(&self, point: &[f32]) -> DistanceRange {
        if self.is_empty() {
            return DistanceRange::UNBOUNDED;
        }
        let dist = simd::l2_distance(&self.center, point);
        DistanceRange {
            lo: (dist - self.radius).max(0.0),
            hi: dist + self.radius,
        }
    }
}

impl fmt::Display for BallBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "BallBound")?;
        writeln!(f, "Radius:  {}", self.radius)?;
        write!(f, "Center:  {:?}", self.center)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_bound_is_sentinel() {
        let ball = BallBound::empty(2);
        assert!(ball.is_empty());
        assert!(!ball.contains(&[0.0, 0.0]));
        assert_eq!(ball.min_distance(&[1.0, 1.0]), f32::INFINITY);
        assert_eq!(ball.max_distance(&[1.0, 1.0]), f32::INFINITY);
        assert_eq!(ball.range_distance(&[1.0, 1.0]), DistanceRange::UNBOUNDED);
        assert_eq!(ball.dimension_range(0), None);
        assert_eq!(ball.max_inner_product(&[1.0, 0.0], 1.0), f32::INFINITY);
    }

    #[test]
    fn point_distances() {
        let ball = BallBound::new(1.0, vec![0.0, 0.0]);
        assert!(ball.contains(&[0.5, 0.5]));
        assert!(!ball.contains(&[2.0, 0.0]));
        assert!((ball.min_distance(&[3.0, 0.0]) - 2.0).abs() < 1e-6);
        assert!((ball.max_distance(&[3.0, 0.0]) - 4.0).abs() < 1e-6);
        assert_eq!(ball.min_distance(&[0.1, 0.0]), 0.0);

        let range = ball.range_distance(&[3.0, 0.0]);
        assert!((range.lo - 2.0).abs() < 1e-6);
        assert!((range.hi - 4.0).abs() < 1e-6);
    }

    #[test]
    fn ball_to_ball() {
        let a = BallBound::new(1.0, vec![0.0, 0.0]);
        let b = BallBound::new(0.5, vec![4.0, 0.0]);
        assert!((a.min_distance_to(&b) - 2.5).abs() < 1e-6);
        assert!((a.max_distance_to(&b) - 5.5).abs() < 1e-6);
        let r = a.range_distance_to(&b);
        assert!((r.lo - 2.5).abs() < 1e-6 && (r.hi - 5.5).abs() < 1e-6);

        let overlapping = BallBound::new(3.0, vec![1.0, 0.0]);
        assert_eq!(a.min_distance_to(&overlapping), 0.0);
        assert_eq!(
            BallBound::empty(2).range_distance_to(&a),
            DistanceRange::UNBOUNDED
        );
    }

    #[test]
    fn expand_seeds_then_grows() {
        let pts: Vec<Vec<f32>> = vec![vec![0.0, 0.0], vec![2.0, 0.0]];
        let ball = BallBound::from_points(2, pts.iter().map(Vec::as_slice));
        assert!((ball.radius() - 1.0).abs() < 1e-6);
        assert!((ball.center()[0] - 1.0).abs() < 1e-6);
        assert!(ball.contains(&[0.0, 0.0]));
        assert!(ball.contains(&[2.0, 0.0]));
    }

    #[test]
    fn expand_skips_covered_points() {
        let mut ball = BallBound::new(2.0, vec![0.0, 0.0]);
        ball.expand_to_include([[1.0f32, 1.0].as_slice()]);
        assert_eq!(ball.radius(), 2.0);
        assert_eq!(ball.center(), &[0.0, 0.0]);
    }

    #[test]
    fn max_inner_product_is_sound() {
        let pts: Vec<Vec<f32>> = vec![vec![1.0, 0.2], vec![0.8, -0.3], vec![0.9, 0.9]];
        let ball = BallBound::from_points(2, pts.iter().map(Vec::as_slice));
        let q = [0.3f32, -0.7];
        let bound = ball.max_inner_product(&q, simd::norm(&q));
        for p in &pts {
            assert!(simd::dot(&q, p) <= bound + 1e-5);
        }
    }
}
