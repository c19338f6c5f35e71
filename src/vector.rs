use crate::factor::{FACTOR_ORDER, FactorWeights, PerFactor};

/// Norm floor used when normalizing; vectors below it normalize to zero.
pub const NORM_EPSILON: f32 = 1e-8;

/// Dense row-major `f32` matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    dim: usize,
    /// `data[row * dim + col]`
    data: Vec<f32>,
}

impl Matrix {
    pub fn zeros(rows: usize, dim: usize) -> Self {
        Self {
            rows,
            dim,
            data: vec![0.0; rows * dim],
        }
    }

    /// Build from a flat row-major buffer. Returns `None` on a length
    /// mismatch.
    pub fn from_flat(rows: usize, dim: usize, data: Vec<f32>) -> Option<Self> {
        (data.len() == rows * dim).then_some(Self { rows, dim, data })
    }

    /// Stack equal-length rows. Every row must have length `dim`.
    pub fn from_rows(dim: usize, rows: &[Vec<f32>]) -> Option<Self> {
        let mut data = Vec::with_capacity(rows.len() * dim);
        for row in rows {
            if row.len() != dim {
                return None;
            }
            data.extend_from_slice(row);
        }
        Some(Self {
            rows: rows.len(),
            dim,
            data,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn row(&self, row: usize) -> &[f32] {
        let start = row * self.dim;
        &self.data[start..start + self.dim]
    }

    pub fn as_flat(&self) -> &[f32] {
        &self.data
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Divide by `max(norm, NORM_EPSILON)` in place. A zero vector stays zero.
pub fn l2_normalize(v: &mut [f32]) {
    let n = norm(v).max(NORM_EPSILON);
    for x in v.iter_mut() {
        *x /= n;
    }
}

pub fn normalized(mut v: Vec<f32>) -> Vec<f32> {
    l2_normalize(&mut v);
    v
}

/// Arithmetic mean of equal-length vectors; `None` if `vectors` is empty.
pub fn mean_of<'a>(
    dim: usize,
    vectors: impl IntoIterator<Item = &'a [f32]>,
) -> Option<Vec<f32>> {
    let mut acc = vec![0.0_f32; dim];
    let mut count = 0usize;
    for v in vectors {
        for (a, x) in acc.iter_mut().zip(v) {
            *a += x;
        }
        count += 1;
    }
    if count == 0 {
        return None;
    }
    let scale = count as f32;
    for a in &mut acc {
        *a /= scale;
    }
    Some(acc)
}

/// Cosine similarity with a norm guard; zero vectors score 0.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let denom = norm(a) * norm(b);
    if denom <= NORM_EPSILON {
        return 0.0;
    }
    dot(a, b) / denom
}

/// Concatenate `sqrt(weight_f) * v_f` over [`FACTOR_ORDER`].
///
/// For unit-norm inputs the dot product of two fused vectors equals
/// `Σ_f weight_f · cos_f`.
pub fn fuse(vectors: &PerFactor<Vec<f32>>, sqrt_weights: &FactorWeights) -> Vec<f32> {
    let total: usize = vectors.iter().map(|(_, v)| v.len()).sum();
    let mut fused = Vec::with_capacity(total);
    for factor in FACTOR_ORDER {
        let scale = sqrt_weights[factor];
        fused.extend(vectors[factor].iter().map(|x| x * scale));
    }
    fused
}

/// Replace NaN and infinities with zero.
pub fn finite_or_zero(x: f32) -> f32 {
    if x.is_finite() { x } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factor::Factor;

    /// Small deterministic generator so the property tests need no extra
    /// dependencies.
    struct Lcg(u64);

    impl Lcg {
        fn next_f32(&mut self) -> f32 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((self.0 >> 40) as f32 / (1u64 << 24) as f32) * 2.0 - 1.0
        }

        fn unit(&mut self, dim: usize) -> Vec<f32> {
            normalized((0..dim).map(|_| self.next_f32()).collect())
        }
    }

    #[test]
    fn normalize_gives_unit_norm() {
        let v = normalized(vec![3.0, 4.0]);
        assert!((norm(&v) - 1.0).abs() < 1e-6);
        assert!((v[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn normalize_zero_stays_zero() {
        let v = normalized(vec![0.0; 4]);
        assert_eq!(v, vec![0.0; 4]);
    }

    #[test]
    fn mean_of_empty_is_none() {
        assert!(mean_of(3, std::iter::empty()).is_none());
        let rows = [vec![1.0, 0.0], vec![0.0, 1.0]];
        let mean = mean_of(2, rows.iter().map(Vec::as_slice)).unwrap();
        assert_eq!(mean, vec![0.5, 0.5]);
    }

    #[test]
    fn matrix_row_access() {
        let m = Matrix::from_flat(2, 3, (0..6).map(|i| i as f32).collect()).unwrap();
        assert_eq!(m.row(0), &[0.0, 1.0, 2.0]);
        assert_eq!(m.row(1), &[3.0, 4.0, 5.0]);
        assert!(Matrix::from_flat(2, 3, vec![0.0; 5]).is_none());
        assert!(Matrix::from_rows(2, &[vec![1.0, 2.0], vec![1.0]]).is_none());
    }

    #[test]
    fn fused_dot_equals_weighted_cosines() {
        let mut rng = Lcg(42);
        let dims = PerFactor {
            full: 16,
            desc: 16,
            what: 8,
            how: 16,
            style: 16,
        };

        for trial in 0..50 {
            let weights = PerFactor::from_fn(|_| (rng.next_f32() + 1.0) * 1.5);
            let sqrt_w = weights.sqrt();
            let a = dims.map(|_, &d| rng.unit(d));
            let b = dims.map(|_, &d| rng.unit(d));

            let fa = fuse(&a, &sqrt_w);
            let fb = fuse(&b, &sqrt_w);
            assert_eq!(fa.len(), 72);

            let expected: f32 = FACTOR_ORDER
                .iter()
                .map(|&f| weights[f] * dot(&a[f], &b[f]))
                .sum();
            let actual = dot(&fa, &fb);
            assert!(
                (actual - expected).abs() < 1e-5,
                "trial {trial}: fused {actual} vs weighted {expected}"
            );
        }
    }

    #[test]
    fn zero_weight_removes_factor() {
        let mut weights = FactorWeights::uniform(0.0);
        weights[Factor::Desc] = 1.0;
        let v = PerFactor::from_fn(|_| vec![1.0, 0.0]);
        let fused = fuse(&v, &weights.sqrt());
        assert_eq!(fused, vec![0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn cosine_of_zero_vector_is_zero() {
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert!((cosine(&[2.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn finite_or_zero_sanitizes() {
        assert_eq!(finite_or_zero(f32::NAN), 0.0);
        assert_eq!(finite_or_zero(f32::INFINITY), 0.0);
        assert_eq!(finite_or_zero(0.25), 0.25);
    }
}
