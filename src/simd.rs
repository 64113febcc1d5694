//! Dense vector kernels.
//!
//! Every strategy verifies candidates with [`dot`], so it is written to
//! auto-vectorize: four independent accumulators over `chunks_exact(4)`.
//!
//! ```rust
//! use lemur::simd::{dot, norm};
//!
//! let a = [1.0_f32, 0.0, 0.0];
//! let b = [0.5_f32, 0.5, 0.0];
//! assert_eq!(dot(&a, &b), 0.5);
//! assert_eq!(norm(&[3.0, 4.0]), 5.0);
//! ```

const NORM_EPSILON: f32 = 1e-12;

/// Dot product of two vectors.
#[inline]
#[must_use]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let mut acc = [0.0f32; 4];
    let ca = a.chunks_exact(4);
    let cb = b.chunks_exact(4);
    let tail: f32 = ca
        .remainder()
        .iter()
        .zip(cb.remainder())
        .map(|(x, y)| x * y)
        .sum();
    for (x, y) in ca.zip(cb) {
        acc[0] += x[0] * y[0];
        acc[1] += x[1] * y[1];
        acc[2] += x[2] * y[2];
        acc[3] += x[3] * y[3];
    }
    (acc[0] + acc[1]) + (acc[2] + acc[3]) + tail
}

/// L2 norm of a vector.
#[inline]
#[must_use]
pub fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// L2 distance squared.
#[inline]
#[must_use]
pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// L2 (Euclidean) distance.
#[inline]
#[must_use]
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    l2_distance_squared(a, b).sqrt()
}

/// Split `v` into its unit direction (written to `out`) and its length.
///
/// Zero vectors get an all-zero direction and length 0.
#[inline]
pub fn split_direction(v: &[f32], out: &mut [f32]) -> f32 {
    debug_assert_eq!(v.len(), out.len());
    let len = norm(v);
    if len < NORM_EPSILON {
        out.fill(0.0);
        return 0.0;
    }
    for (o, x) in out.iter_mut().zip(v) {
        *o = x / len;
    }
    len
}
