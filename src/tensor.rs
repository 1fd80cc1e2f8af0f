//! Tensor aliases and the numeric helpers shared by adapters and transforms
//!
//! Base-model activations and weights live in `f32` ([`Tensor`]). Adapter
//! parameters and adapter arithmetic live in `f64` ([`WideTensor`]); outputs
//! are narrowed back to `f32` only at the adapter boundary.

use nalgebra::{DMatrix, DVector};
use rand::Rng;

/// Ambient-precision matrix: rows are tokens, columns are features
pub type Tensor = DMatrix<f32>;

/// Wide-precision matrix used for all adapter arithmetic
pub type WideTensor = DMatrix<f64>;

pub fn widen(t: &Tensor) -> WideTensor {
    t.map(f64::from)
}

pub fn narrow(t: &WideTensor) -> Tensor {
    t.map(|v| v as f32)
}

/// Bound of the Kaiming-uniform init used for LoRA factors.
///
/// Gain is the leaky-ReLU gain at negative slope √5, i.e. `sqrt(2 / (1 + 5))`.
pub fn kaiming_bound(fan_in: usize) -> f64 {
    let slope_sq = 5.0_f64;
    let gain = (2.0 / (1.0 + slope_sq)).sqrt();
    gain / (fan_in.max(1) as f64).sqrt()
}

/// Matrix with entries drawn from `U(-bound, bound)`
pub fn uniform<R: Rng + ?Sized>(rows: usize, cols: usize, bound: f64, rng: &mut R) -> WideTensor {
    DMatrix::from_fn(rows, cols, |_, _| rng.gen_range(-bound..=bound))
}

/// Numerically stable softmax of one row of logits
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

pub fn cosine_similarity(a: &DVector<f64>, b: &DVector<f64>) -> f64 {
    let na = a.norm();
    let nb = b.norm();
    if na < 1e-12 || nb < 1e-12 {
        return 0.0;
    }
    a.dot(b) / (na * nb)
}

/// L2-normalized copy; the zero vector is returned unchanged
pub fn l2_normalize(v: &DVector<f64>) -> DVector<f64> {
    let n = v.norm();
    if n < 1e-12 {
        v.clone()
    } else {
        v / n
    }
}

/// Flatten a matrix in column-major order
pub fn flatten(t: &WideTensor) -> Vec<f64> {
    t.as_slice().to_vec()
}

/// Top right singular vector of `m` (a unit vector of length `m.ncols()`).
///
/// The sign is fixed so the entry with the largest magnitude is positive,
/// which keeps prototypes stable across recomputation.
pub fn top_right_singular_vector(m: &WideTensor) -> Option<DVector<f64>> {
    let svd = m.clone().svd(false, true);
    let v_t = svd.v_t?;
    let (best, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .fold((0usize, f64::NEG_INFINITY), |(bi, bv), (i, &s)| {
            if s > bv {
                (i, s)
            } else {
                (bi, bv)
            }
        });
    let mut v: DVector<f64> = v_t.row(best).transpose().into_owned();
    let pivot = v
        .iter()
        .cloned()
        .fold(0.0_f64, |acc, x| if x.abs() > acc.abs() { x } else { acc });
    if pivot < 0.0 {
        v = -v;
    }
    Some(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_kaiming_bound() {
        let b = kaiming_bound(8);
        let expected = (1.0_f64 / 3.0).sqrt() / 8.0_f64.sqrt();
        assert!((b - expected).abs() < 1e-12);
    }

    #[test]
    fn test_uniform_within_bound() {
        let mut rng = StdRng::seed_from_u64(7);
        let m = uniform(16, 4, 0.25, &mut rng);
        assert!(m.iter().all(|v| v.abs() <= 0.25));
        assert!(m.iter().any(|v| *v != 0.0));
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0, -1000.0]);
        let sum: f64 = p.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn test_widen_narrow_is_lossless_for_f32() {
        let t = Tensor::from_row_slice(2, 2, &[0.1, -3.5, 1e-7, 42.0]);
        assert_eq!(narrow(&widen(&t)), t);
    }

    #[test]
    fn test_top_singular_vector_of_rank_one() {
        let u = DVector::from_vec(vec![1.0, 2.0]);
        let v = DVector::from_vec(vec![0.0, 3.0, 4.0]);
        let m = &u * v.transpose();
        let top = top_right_singular_vector(&m).unwrap();
        let expected = DVector::from_vec(vec![0.0, 0.6, 0.8]);
        assert!((top - expected).norm() < 1e-9);
    }
}
