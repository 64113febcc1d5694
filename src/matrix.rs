//! Row storage for query and probe vectors.
//!
//! Rows are stored split into a unit direction and a length, sorted by
//! descending length. Every pruning rule in the crate works on the
//! directions (cosine space) and recovers inner products as
//! `|q| * |p| * (q̂ · p̂)`. The original row index survives as the row id.

use crate::simd;
use crate::{Result, RetrieveError};

/// Immutable, length-sorted vector rows.
#[derive(Debug, Clone)]
pub struct VectorMatrix {
    dimension: usize,
    directions: Vec<f32>,
    norms: Vec<f32>,
    ids: Vec<u32>,
}

impl VectorMatrix {
    /// Build from a row-major buffer of `data.len() / dimension` rows.
    ///
    /// With `cosine` set, every non-zero row is given length 1 so scores
    /// become cosine similarities.
    pub fn from_flat(data: &[f32], dimension: usize, cosine: bool) -> Result<Self> {
        if dimension == 0 {
            return Err(RetrieveError::InvalidParameter(
                "dimension must be greater than 0".to_string(),
            ));
        }
        if data.len() % dimension != 0 {
            return Err(RetrieveError::InvalidParameter(format!(
                "buffer of {} values is not a multiple of dimension {}",
                data.len(),
                dimension
            )));
        }
        let rows = data.len() / dimension;
        if rows > u32::MAX as usize {
            return Err(RetrieveError::InvalidParameter(format!(
                "{rows} rows exceed the u32 id space"
            )));
        }

        let mut unsorted_dirs = vec![0.0f32; data.len()];
        let mut unsorted_norms = Vec::with_capacity(rows);
        for (src, dst) in data
            .chunks_exact(dimension)
            .zip(unsorted_dirs.chunks_exact_mut(dimension))
        {
            let len = simd::split_direction(src, dst);
            unsorted_norms.push(if cosine && len > 0.0 { 1.0 } else { len });
        }

        let mut order: Vec<u32> = (0..rows as u32).collect();
        order.sort_by(|&a, &b| {
            unsorted_norms[b as usize]
                .total_cmp(&unsorted_norms[a as usize])
                .then(a.cmp(&b))
        });

        let mut directions = Vec::with_capacity(data.len());
        let mut norms = Vec::with_capacity(rows);
        for &r in &order {
            let r = r as usize;
            directions.extend_from_slice(&unsorted_dirs[r * dimension..(r + 1) * dimension]);
            norms.push(unsorted_norms[r]);
        }

        Ok(Self {
            dimension,
            directions,
            norms,
            ids: order,
        })
    }

    /// Build from owned rows; all rows must share one dimension.
    pub fn from_rows(rows: &[Vec<f32>], cosine: bool) -> Result<Self> {
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
        Self::from_flat(&flat, dimension, cosine)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.norms.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.norms.is_empty()
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Unit direction of row `i` (all zeros for a zero row).
    #[inline]
    pub fn row(&self, i: usize) -> &[f32] {
        &self.directions[i * self.dimension..(i + 1) * self.dimension]
    }

    /// Length of row `i`.
    #[inline]
    pub fn norm(&self, i: usize) -> f32 {
        self.norms[i]
    }

    /// External id (original row index) of row `i`.
    #[inline]
    pub fn id(&self, i: usize) -> u32 {
        self.ids[i]
    }

    /// Largest row length, 0 for an empty matrix.
    #[inline]
    pub fn max_norm(&self) -> f32 {
        self.norms.first().copied().unwrap_or(0.0)
    }

    /// Write the raw (direction times length) vector of row `i` into `out`.
    pub fn raw_row_into(&self, i: usize, out: &mut [f32]) {
        let len = self.norms[i];
        for (o, d) in out.iter_mut().zip(self.row(i)) {
            *o = d * len;
        }
    }

    /// Inner product of row `qi` of `self` with row `pi` of `probes`.
    #[inline]
    pub fn inner_product(&self, qi: usize, probes: &VectorMatrix, pi: usize) -> f32 {
        self.norms[qi] * probes.norms[pi] * simd::dot(self.row(qi), probes.row(pi))
    }
}
