use rayon::prelude::*;

use crate::{
    record::RecordHandle,
    vector::{Matrix, dot},
};

/// A scored row returned by [`FlatIpIndex::search`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub handle: RecordHandle,
    pub score: f32,
}

/// Exact nearest-neighbour index scored by inner product.
///
/// For unit-normalized rows the inner product is the cosine similarity.
#[derive(Debug, Clone)]
pub struct FlatIpIndex {
    vectors: Matrix,
}

impl FlatIpIndex {
    pub fn new(vectors: Matrix) -> Self {
        Self { vectors }
    }

    /// Number of indexed vectors.
    pub fn len(&self) -> usize {
        self.vectors.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.vectors.dim()
    }

    pub fn vectors(&self) -> &Matrix {
        &self.vectors
    }

    /// Top-`m` rows by inner product with `query`.
    ///
    /// Rows with a non-finite score are dropped, so fewer than `m` hits may
    /// come back. Ties keep the lower row first. A query of the wrong
    /// dimension matches nothing.
    pub fn search(&self, query: &[f32], m: usize) -> Vec<Hit> {
        top_m(&self.vectors, query, m, |h| h)
    }

    /// Like [`FlatIpIndex::search`], but equal scores are ordered by
    /// ascending `tie_key` before the cut at `m`.
    pub fn search_by_key<K: Ord>(
        &self,
        query: &[f32],
        m: usize,
        tie_key: impl Fn(RecordHandle) -> K,
    ) -> Vec<Hit> {
        top_m(&self.vectors, query, m, tie_key)
    }
}

/// Exact top-`m` inner-product search over the rows of `matrix`.
pub fn top_m<K: Ord>(
    matrix: &Matrix,
    query: &[f32],
    m: usize,
    tie_key: impl Fn(RecordHandle) -> K,
) -> Vec<Hit> {
    if m == 0 || matrix.is_empty() || query.len() != matrix.dim() {
        return Vec::new();
    }

    let mut hits: Vec<Hit> = (0..matrix.rows())
        .into_par_iter()
        .filter_map(|row| {
            let score = dot(query, matrix.row(row));
            score.is_finite().then_some(Hit {
                handle: RecordHandle(row as u32),
                score,
            })
        })
        .collect();

    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| tie_key(a.handle).cmp(&tie_key(b.handle)))
    });
    hits.truncate(m);
    hits
}
