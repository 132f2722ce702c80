//! Fully Independent Training Conditional (FITC) approximation of a multi-output
//! gaussian process.
//!
//! Given inducing points `Z` and training points `X`, the training covariance
//! `K_ff` is replaced by
//!
//! ```text
//! C = Q_ff + diag(K_ff - Q_ff) + noise I,   with Q_ff = K_fu K_uu^-1 K_uf
//! ```
//!
//! a low rank plus diagonal matrix whose likelihood is computed in O(N M^2) time
//! (N training points, M inducing points) through Woodbury identities.

use crate::errors::{GpError, Result};
use crate::multioutput_kernels::MultiOutputKernel;
use crate::mvgauss::MultivariateGaussian;
use crate::utils::force_symmetric;
use linfa::Float;
use linfa_linalg::{cholesky::*, triangular::*};
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2, Zip};
use ndarray_einsum_beta::*;
use ndarray_stats::QuantileExt;

const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Factors of the FITC covariance reused for prediction
#[derive(Debug, Clone)]
pub(crate) struct FitcTerms<F: Float> {
    /// Cholesky factor (lower) of K_uu + nugget I
    luu: Array2<F>,
    /// Cholesky factor (lower) of Sigma = K_uu + K_uf Lambda^-1 K_fu
    ls: Array2<F>,
    /// Sigma^-1 K_uf Lambda^-1 y
    w: Array1<F>,
}

/// Multiplies each column `j` of `m` by `s[j]`
fn scale_columns<F: Float>(
    m: &ArrayBase<impl Data<Elem = F>, Ix2>,
    s: &ArrayBase<impl Data<Elem = F>, Ix1>,
) -> Result<Array2<F>> {
    einsum("ij,j->ij", &[m, s])
        .map_err(|e| GpError::LikelihoodComputationError(e.to_string()))?
        .into_dimensionality::<Ix2>()
        .map_err(|e| GpError::LikelihoodComputationError(e.to_string()))
}

/// FITC log marginal likelihood of `y` (concatenated outputs) at points `x` given
/// inducing points `z` and `noise`.
///
/// When `with_grad` is true the gradient is returned too, laid out as kernel
/// parameters, inducing points entries (row-major, output after output; zeros when
/// `with_inducings` is false) then noise.
#[allow(clippy::too_many_arguments)]
pub(crate) fn fitc_likelihood<F: Float>(
    kernel: &dyn MultiOutputKernel<F>,
    x: &[Array2<F>],
    y: &Array1<F>,
    z: &[Array2<F>],
    noise: F,
    nugget: F,
    with_grad: bool,
    with_inducings: bool,
) -> Result<(F, Option<Array1<F>>, FitcTerms<F>)> {
    let n = y.len();
    let mut kuu = kernel.eval(z, z, false)?;
    kuu.diag_mut().mapv_inplace(|v| v + nugget);
    let luu = kuu.cholesky()?;
    let kuf = kernel.eval(z, x, false)?;
    let kff = kernel.eval_diagonal(x)?;

    // Q_ff = V' V
    let v = luu.solve_triangular(&kuf, UPLO::Lower)?;
    let qff = (&v * &v).sum_axis(Axis(0));
    let lambda = Zip::from(&kff)
        .and(&qff)
        .map_collect(|&k, &q| (k - q).max(F::zero()) + noise);
    let inv_lambda = lambda.mapv(|l| F::one() / l);
    let kuf_s = scale_columns(&kuf, &inv_lambda)?;

    let sigma = &kuu + &kuf_s.dot(&kuf.t());
    let ls = sigma.cholesky()?;
    let b = kuf_s.dot(y);
    let c = ls.solve_triangular(&b.insert_axis(Axis(1)), UPLO::Lower)?;

    let log_det = F::cast(2.) * ls.diag().mapv(|v| v.ln()).sum()
        - F::cast(2.) * luu.diag().mapv(|v| v.ln()).sum()
        + lambda.mapv(|v| v.ln()).sum();
    let quad = (y * y * &inv_lambda).sum() - (&c * &c).sum();
    let ll = -F::cast(0.5) * (F::cast(n) * F::cast(LN_2PI) + log_det + quad);

    let w = ls.t().solve_triangular(&c, UPLO::Upper)?.column(0).to_owned();
    let terms = FitcTerms { luu, ls, w };
    if !with_grad {
        return Ok((ll, None, terms));
    }

    // alpha = C^-1 y, C^-1 = Lambda^-1 - gt' gt
    let alpha = (y - &kuf.t().dot(&terms.w)) * &inv_lambda;
    let gt = terms.ls.solve_triangular(&kuf_s, UPLO::Lower)?;
    // P = K_uu^-1 K_uf
    let p = terms.luu.t().solve_triangular(&v, UPLO::Upper)?;
    // d = diag(W) with W = 1/2 (alpha alpha' - C^-1)
    let d = (&alpha * &alpha - &inv_lambda + (&gt * &gt).sum_axis(Axis(0))).mapv(|v| v * F::cast(0.5));

    // psi = 2 P (W - diag(d)), phi = P (W - diag(d)) P'
    let p_alpha = p.dot(&alpha);
    let mut psi = p_alpha
        .insert_axis(Axis(1))
        .dot(&alpha.view().insert_axis(Axis(0)));
    psi = psi + p.dot(&gt.t()).dot(&gt);
    psi = psi - scale_columns(&p, &(&inv_lambda + &d.mapv(|v| v * F::cast(2.))))?;
    let phi = psi.dot(&p.t()).mapv(|v| v * F::cast(0.5));

    let n_params = kernel.n_params();
    let n_z: usize = z.iter().map(|zi| zi.len()).sum();
    let mut grad = Array1::zeros(n_params + n_z + 1);
    for id in 0..n_params {
        let dkuf = kernel.derivate(id, z, x, false)?;
        let dkuu = kernel.derivate(id, z, z, false)?;
        let dkff = kernel.derivate_diagonal(id, x)?;
        grad[id] = (&psi * &dkuf).sum() - (&phi * &dkuu).sum() + d.dot(&dkff);
    }
    if with_inducings {
        // K_ff does not depend on inducing points
        for k in 0..n_z {
            let dkuf = kernel.derivate(n_params + k, z, x, false)?;
            let dkuu = kernel.derivate(n_params + k, z, z, false)?;
            grad[n_params + k] = (&psi * &dkuf).sum() - (&phi * &dkuu).sum();
        }
    }
    grad[n_params + n_z] = d.sum();
    Ok((ll, Some(grad), terms))
}

/// FITC predictive distribution at points `x_new`
pub(crate) fn fitc_predict<F: Float>(
    kernel: &dyn MultiOutputKernel<F>,
    z: &[Array2<F>],
    terms: &FitcTerms<F>,
    x_new: &[Array2<F>],
    nugget: F,
) -> Result<MultivariateGaussian<F>> {
    let kun = kernel.eval(z, x_new, false)?;
    let mut knn = kernel.eval(x_new, x_new, false)?;
    knn.diag_mut().mapv_inplace(|v| v + nugget);
    let pn = terms.luu.solve_triangular(&kun, UPLO::Lower)?;
    let h = terms.ls.solve_triangular(&kun, UPLO::Lower)?;
    let mean = kun.t().dot(&terms.w);
    let cov = knn - pn.t().dot(&pn) + h.t().dot(&h);
    MultivariateGaussian::new(mean, force_symmetric(&cov)?)
}

fn check_counts<F: Float>(x: &[Array2<F>], counts: &[usize]) -> Result<()> {
    if counts.len() != x.len() {
        return Err(GpError::InducingPointsError(format!(
            "Expected {} inducing points counts, one per output, got {}",
            x.len(),
            counts.len()
        )));
    }
    for (i, (xi, &m)) in x.iter().zip(counts).enumerate() {
        if m == 0 || m >= xi.nrows() {
            return Err(GpError::InducingPointsError(format!(
                "Output {i}: {m} inducing points should be in [1, {})",
                xi.nrows()
            )));
        }
    }
    Ok(())
}

/// Inducing points laid on a uniform grid: for output `i`, `counts[i]` points whose
/// coordinates in each dimension go evenly from the minimum to the maximum of the
/// training inputs in that dimension.
pub(crate) fn grid_inducings<F: Float>(x: &[Array2<F>], counts: &[usize]) -> Result<Vec<Array2<F>>> {
    check_counts(x, counts)?;
    x.iter()
        .zip(counts)
        .map(|(xi, &m)| {
            let mut z = Array2::zeros((m, xi.ncols()));
            for (c, mut col) in z.columns_mut().into_iter().enumerate() {
                let (lo, up) = column_range(xi, c)?;
                col.assign(&Array1::linspace(lo, up, m));
            }
            Ok(z)
        })
        .collect()
}

/// Checks caller located inducing points against training inputs
pub(crate) fn check_inducings<F: Float>(x: &[Array2<F>], z: &[Array2<F>]) -> Result<()> {
    let counts: Vec<usize> = z.iter().map(|zi| zi.nrows()).collect();
    check_counts(x, &counts)?;
    for (i, (xi, zi)) in x.iter().zip(z).enumerate() {
        if xi.ncols() != zi.ncols() {
            return Err(GpError::InducingPointsError(format!(
                "Output {i}: inducing points dimension {} differs from inputs one {}",
                zi.ncols(),
                xi.ncols()
            )));
        }
    }
    Ok(())
}

/// Optimization bounds of inducing points coordinates: the observed range of the
/// corresponding input dimension, or the current value when frozen.
pub(crate) fn inducing_bounds<F: Float>(
    x: &[Array2<F>],
    z: &[Array2<F>],
    optimized: bool,
) -> Result<Vec<(F, F)>> {
    let mut bounds = Vec::with_capacity(z.iter().map(|zi| zi.len()).sum());
    for (xi, zi) in x.iter().zip(z) {
        let ranges = (0..xi.ncols())
            .map(|c| column_range(xi, c))
            .collect::<Result<Vec<_>>>()?;
        for row in zi.rows() {
            for (c, v) in row.iter().enumerate() {
                bounds.push(if optimized { ranges[c] } else { (*v, *v) });
            }
        }
    }
    Ok(bounds)
}

fn column_range<F: Float>(x: &Array2<F>, c: usize) -> Result<(F, F)> {
    let col = x.column(c);
    let lo = col
        .min()
        .map_err(|e| GpError::InducingPointsError(e.to_string()))?;
    let up = col
        .max()
        .map_err(|e| GpError::InducingPointsError(e.to_string()))?;
    Ok((*lo, *up))
}
