use faer::linalg::triangular_inverse::invert_lower_triangular;
use faer::{Mat, MatRef, Par, Side};
use itertools::izip;
use multiversion::multiversion;

#[inline]
pub(crate) fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

/// `ln Σ exp(x_i)`, `-inf` for an empty slice or all `-inf` entries.
pub(crate) fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn vector_dot(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());
    izip!(a, b).map(|(x, y)| x * y).sum()
}

#[multiversion(targets("x86_64+avx+avx2+fma", "x86+sse"))]
pub(crate) fn axpy_out(x: &[f64], y: &[f64], a: f64, out: &mut [f64]) {
    let n = x.len();
    assert!(y.len() == n);
    assert!(out.len() == n);

    izip!(x, y, out).for_each(|(x, y, out)| {
        *out = a.mul_add(*x, *y);
    });
}

/// Lanczos approximation (g = 7, n = 9) of `ln Γ(x)` for `x > 0`.
pub(crate) fn ln_gamma(x: f64) -> f64 {
    const COEFFICIENTS: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];

    if x < 0.5 {
        // reflection
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }

    let x = x - 1.0;
    let t = x + 7.5;
    let series = COEFFICIENTS[1..]
        .iter()
        .enumerate()
        .fold(COEFFICIENTS[0], |acc, (i, &c)| acc + c / (x + (i + 1) as f64));
    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + series.ln()
}

fn mat_all_finite(mat: &MatRef<f64>) -> bool {
    let mut ok = true;
    faer::zip!(mat).for_each(|faer::unzip!(val)| ok &= val.is_finite());
    ok
}

/// Lower Cholesky factor of a symmetric matrix, `None` unless it is positive definite.
pub(crate) fn cholesky_lower(matrix: &Mat<f64>) -> Option<Mat<f64>> {
    if matrix.nrows() != matrix.ncols() || !mat_all_finite(&matrix.as_ref()) {
        return None;
    }
    let llt = matrix.llt(Side::Lower).ok()?;
    Some(llt.L().to_owned())
}

/// Inverse of a lower triangular matrix with a non-zero diagonal.
pub(crate) fn invert_lower(lower: &Mat<f64>) -> Mat<f64> {
    let dim = lower.nrows();
    let mut inverse = Mat::<f64>::zeros(dim, dim);
    invert_lower_triangular(inverse.as_mut(), lower.as_ref(), Par::Seq);
    inverse
}

/// `out = L x` for lower triangular `L`.
pub(crate) fn lower_mul(lower: &Mat<f64>, x: &[f64], out: &mut [f64]) {
    let dim = lower.nrows();
    for row in 0..dim {
        out[row] = (0..=row).map(|k| lower[(row, k)] * x[k]).sum();
    }
}

/// `|L x|²` for lower triangular `L`.
pub(crate) fn lower_mul_norm_sq(lower: &Mat<f64>, x: &[f64]) -> f64 {
    let dim = lower.nrows();
    (0..dim)
        .map(|row| {
            let value: f64 = (0..=row).map(|k| lower[(row, k)] * x[k]).sum();
            value * value
        })
        .sum()
}

/// `L Lᵀ`.
pub(crate) fn outer_lower(lower: &Mat<f64>) -> Mat<f64> {
    lower.as_ref() * lower.transpose()
}

pub(crate) fn flatten(matrix: &Mat<f64>) -> Vec<f64> {
    let mut out = Vec::with_capacity(matrix.nrows() * matrix.ncols());
    for i in 0..matrix.nrows() {
        for j in 0..matrix.ncols() {
            out.push(matrix[(i, j)]);
        }
    }
    out
}

pub(crate) fn unflatten(values: &[f64], dim: usize) -> Mat<f64> {
    assert!(values.len() == dim * dim);
    Mat::from_fn(dim, dim, |i, j| values[i * dim + j])
}

/// Weighted mean and covariance (normalized by the weight sum) of `points`.
pub(crate) fn weighted_mean_covariance<'a>(
    dim: usize,
    points: impl Iterator<Item = (&'a [f64], f64)> + Clone,
) -> (Vec<f64>, Mat<f64>) {
    let mut mean = vec![0f64; dim];
    let mut total = 0f64;
    for (point, weight) in points.clone() {
        total += weight;
        izip!(mean.iter_mut(), point).for_each(|(m, &x)| *m += weight * x);
    }
    if total > 0.0 {
        mean.iter_mut().for_each(|m| *m /= total);
    }

    let mut covariance = Mat::<f64>::zeros(dim, dim);
    let mut delta = vec![0f64; dim];
    for (point, weight) in points {
        izip!(delta.iter_mut(), point, &mean).for_each(|(d, &x, &m)| *d = x - m);
        for i in 0..dim {
            for j in 0..=i {
                covariance[(i, j)] += weight * delta[i] * delta[j];
            }
        }
    }
    for i in 0..dim {
        for j in 0..=i {
            let value = if total > 0.0 {
                covariance[(i, j)] / total
            } else {
                0.0
            };
            covariance[(i, j)] = value;
            covariance[(j, i)] = value;
        }
    }
    (mean, covariance)
}

/// Unbiased sample mean and covariance of equally weighted points.
pub(crate) fn sample_mean_covariance(dim: usize, points: &[&[f64]]) -> (Vec<f64>, Mat<f64>) {
    let (mean, mut covariance) =
        weighted_mean_covariance(dim, points.iter().map(|&point| (point, 1.0)));
    let n = points.len() as f64;
    if n > 1.0 {
        let correction = n / (n - 1.0);
        for i in 0..dim {
            for j in 0..dim {
                covariance[(i, j)] *= correction;
            }
        }
    }
    (mean, covariance)
}

/// Draw an index from unnormalized non-negative weights.
pub(crate) fn draw_index(weights: &[f64], u: f64) -> usize {
    let total: f64 = weights.iter().sum();
    let target = u * total;
    let mut cumulative = 0.0;
    let mut last_live = 0;
    for (idx, &w) in weights.iter().enumerate() {
        if w <= 0.0 {
            continue;
        }
        cumulative += w;
        last_live = idx;
        if target < cumulative {
            return idx;
        }
    }
    last_live
}
