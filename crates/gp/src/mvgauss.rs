use crate::errors::{GpError, Result};
use crate::utils::{
    all_true, check_symmetric, force_diag, force_symmetric, get_observed_only, split_indices,
    upper_triangular_inverse,
};
use linfa::Float;
use linfa_linalg::{cholesky::*, triangular::*};
use ndarray::{Array, Array1, Array2, ArrayBase, Axis, Data, Ix1};
use ndarray_rand::rand::{Rng, SeedableRng};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Multivariate gaussian distribution N(mean, cov) over vectors of dimension D
///
/// The upper triangular Cholesky factor `U` of the covariance (`U' U = cov`) is computed
/// once at construction (or when the covariance is set) and used for inversion,
/// density evaluation and sampling.
///
/// ```
/// use gplib::MultivariateGaussian;
/// use ndarray::array;
///
/// let g = MultivariateGaussian::new(array![0., 1.], array![[2., 0.5], [0.5, 1.]]).unwrap();
/// // condition on the second component being observed at 1.5
/// let h = g.conditional(&array![1.5], &[false, true]).unwrap();
/// assert_eq!(h.dimension(), 1);
/// ```
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(serialize = "F: Serialize", deserialize = "F: Deserialize<'de>"))
)]
#[derive(Debug, Clone, PartialEq)]
pub struct MultivariateGaussian<F: Float> {
    mean: Array1<F>,
    cov: Array2<F>,
    /// upper triangular factor
    cov_chol: Array2<F>,
}

impl<F: Float> fmt::Display for MultivariateGaussian<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "N(mean={}, cov={})", self.mean, self.cov)
    }
}

impl<F: Float> MultivariateGaussian<F> {
    /// Constructor from mean vector (D,) and symmetric positive definite covariance (D, D)
    pub fn new(mean: Array1<F>, cov: Array2<F>) -> Result<Self> {
        check_dims(mean.len(), &cov)?;
        let cov_chol = upper_cholesky(&cov)?;
        Ok(MultivariateGaussian {
            mean,
            cov,
            cov_chol,
        })
    }

    /// Dimension D of the distribution
    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    /// Mean vector
    pub fn mean(&self) -> &Array1<F> {
        &self.mean
    }

    /// Covariance matrix
    pub fn cov(&self) -> &Array2<F> {
        &self.cov
    }

    /// Upper triangular Cholesky factor `U` such that `U' U = cov`
    pub fn cov_chol(&self) -> &Array2<F> {
        &self.cov_chol
    }

    /// Set mean, the dimension has to be unchanged
    pub fn set_mean(&mut self, mean: Array1<F>) -> Result<()> {
        if mean.len() != self.mean.len() {
            return Err(GpError::InvalidValueError(format!(
                "Mean dimension {} differs from gaussian dimension {}",
                mean.len(),
                self.mean.len()
            )));
        }
        self.mean = mean;
        Ok(())
    }

    /// Set covariance, its Cholesky factor is recomputed
    pub fn set_cov(&mut self, cov: Array2<F>) -> Result<()> {
        check_dims(self.mean.len(), &cov)?;
        self.cov_chol = upper_cholesky(&cov)?;
        self.cov = cov;
        Ok(())
    }

    /// Inverse of the covariance computed from the inverse `T` of the upper Cholesky
    /// factor as `T T'`
    pub fn cov_inv(&self) -> Result<Array2<F>> {
        let t = upper_triangular_inverse(&self.cov_chol)?;
        Ok(t.dot(&t.t()))
    }

    /// Logarithm of the probability density at `x`
    pub fn log_density(&self, x: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<F> {
        let d = self.dimension();
        if x.len() != d {
            return Err(GpError::InvalidValueError(format!(
                "Point dimension {} differs from gaussian dimension {}",
                x.len(),
                d
            )));
        }
        let mut ans = -F::cast(0.5) * F::cast(d) * F::cast(LN_2PI);
        ans -= self.cov_chol.diag().mapv(|v| v.ln()).sum();
        let diff = x.to_owned() - &self.mean;
        let sigma_inv = self.cov_inv()?;
        ans -= F::cast(0.5) * diff.dot(&sigma_inv.dot(&diff));
        Ok(ans)
    }

    /// Probability density at `x`
    pub fn density(&self, x: &ArrayBase<impl Data<Elem = F>, Ix1>) -> Result<F> {
        Ok(self.log_density(x)?.exp())
    }

    /// Draws `n` samples returned as a (n, D) matrix, one sample per row
    pub fn sample(&self, n: usize) -> Array2<F> {
        let mut rng = Xoshiro256Plus::from_entropy();
        self.sample_with_rng(n, &mut rng)
    }

    /// Draws `n` samples using the given random generator
    pub fn sample_with_rng<R: Rng>(&self, n: usize, rng: &mut R) -> Array2<F> {
        let d = self.dimension();
        let normal =
            Array::<f64, _>::random_using((n, d), StandardNormal, rng).mapv(|v| F::cast(v));
        normal.dot(&self.cov_chol) + &self.mean.view().insert_axis(Axis(0))
    }

    /// Returns the marginal distribution of the dimensions for which `observed` is true,
    /// the others being integrated out
    pub fn marginalize_hidden(&self, observed: &[bool]) -> Result<MultivariateGaussian<F>> {
        self.check_mask(observed)?;
        if all_true(observed) {
            return Ok(self.clone());
        }
        let (kept, _) = split_indices(observed);
        let mean = self.mean.select(Axis(0), &kept);
        let cov = self.cov.select(Axis(0), &kept).select(Axis(1), &kept);
        MultivariateGaussian::new(mean, cov)
    }

    /// Returns the distribution of the hidden dimensions (`observed[i] == false`)
    /// given the values of the observed ones.
    ///
    /// `observation` is either a full D-dimensional vector, of which only observed
    /// components are read, or the vector of observed values only.
    pub fn conditional(
        &self,
        observation: &ArrayBase<impl Data<Elem = F>, Ix1>,
        observed: &[bool],
    ) -> Result<MultivariateGaussian<F>> {
        self.check_mask(observed)?;
        let (obs_ix, hidden_ix) = split_indices(observed);
        let obs_values = if observation.len() == self.dimension() {
            get_observed_only(observation, observed)?
        } else if observation.len() == obs_ix.len() {
            observation.to_owned()
        } else {
            return Err(GpError::InvalidValueError(format!(
                "Observation length {} matches neither dimension {} nor observed count {}",
                observation.len(),
                self.dimension(),
                obs_ix.len()
            )));
        };

        let mean_h = self.mean.select(Axis(0), &hidden_ix);
        let cov_hh = self.cov.select(Axis(0), &hidden_ix).select(Axis(1), &hidden_ix);
        if obs_ix.is_empty() {
            return MultivariateGaussian::new(mean_h, cov_hh);
        }
        let mean_o = self.mean.select(Axis(0), &obs_ix);
        let cov_oo = self.cov.select(Axis(0), &obs_ix).select(Axis(1), &obs_ix);
        let cov_oh = self.cov.select(Axis(0), &obs_ix).select(Axis(1), &hidden_ix);

        // Sigma_oo = L L', w = L^-1 Sigma_oh and r = L^-1 (obs - mean_o)
        let chol_oo = cov_oo.cholesky()?;
        let w = chol_oo.solve_triangular(&cov_oh, UPLO::Lower)?;
        let r = chol_oo.solve_triangular(
            &(obs_values - &mean_o).insert_axis(Axis(1)),
            UPLO::Lower,
        )?;

        let mean = mean_h + w.t().dot(&r).column(0);
        let cov = force_diag(&force_symmetric(&(cov_hh - w.t().dot(&w)))?);
        MultivariateGaussian::new(mean, cov)
    }

    fn check_mask(&self, observed: &[bool]) -> Result<()> {
        if observed.len() != self.dimension() {
            return Err(GpError::InvalidValueError(format!(
                "Mask length {} differs from gaussian dimension {}",
                observed.len(),
                self.dimension()
            )));
        }
        Ok(())
    }
}

fn check_dims<F: Float>(dim: usize, cov: &Array2<F>) -> Result<()> {
    if cov.nrows() != dim || cov.ncols() != dim {
        return Err(GpError::InvalidValueError(format!(
            "Covariance shape {:?} does not match mean dimension {}",
            cov.shape(),
            dim
        )));
    }
    if !check_symmetric(cov) {
        return Err(GpError::InvalidValueError(
            "Covariance matrix is not symmetric".to_string(),
        ));
    }
    Ok(())
}

fn upper_cholesky<F: Float>(cov: &Array2<F>) -> Result<Array2<F>> {
    Ok(cov.cholesky()?.reversed_axes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, concatenate};

    fn rotated_gaussian() -> MultivariateGaussian<f64> {
        let ang = 45f64.to_radians();
        let rot = array![[ang.cos(), -ang.sin()], [ang.sin(), ang.cos()]];
        let scale = array![[16., 0.], [0., 4.]];
        let cov = rot.dot(&scale).dot(&rot.t());
        MultivariateGaussian::new(array![10., 10.], cov).unwrap()
    }

    fn spd_matrix() -> Array2<f64> {
        let a = array![
            [1., 0.2, 0.4, 0.1],
            [0.3, 2., 0.5, 0.],
            [0.1, 0.1, 1.5, 0.3],
            [0., 0.6, 0.2, 1.]
        ];
        a.dot(&a.t()) + Array2::<f64>::eye(4) * 0.1
    }

    #[test]
    fn test_cov_inv() {
        let g = rotated_gaussian();
        let inv = g.cov_inv().unwrap();
        assert_abs_diff_eq!(inv.dot(g.cov()), Array2::eye(2), epsilon = 1e-10);

        let g = MultivariateGaussian::new(Array1::zeros(4), spd_matrix()).unwrap();
        let inv = g.cov_inv().unwrap();
        assert_abs_diff_eq!(inv.dot(g.cov()), Array2::eye(4), epsilon = 1e-10);
    }

    #[test]
    fn test_cov_chol_is_upper() {
        let g = MultivariateGaussian::new(Array1::zeros(4), spd_matrix()).unwrap();
        let u = g.cov_chol();
        assert_abs_diff_eq!(u.t().dot(u), *g.cov(), epsilon = 1e-10);
        for i in 0..4 {
            for j in 0..i {
                assert_abs_diff_eq!(u[[i, j]], 0.);
            }
        }
    }

    #[test]
    fn test_not_positive_definite() {
        let res = MultivariateGaussian::new(array![0., 0.], array![[1., 2.], [2., 1.]]);
        assert!(res.is_err());
        let res = MultivariateGaussian::new(array![0.], array![[1., 0.], [0., 1.]]);
        assert!(res.is_err());
    }

    #[test]
    fn test_asymmetric_covariance() {
        // positive definite lower triangle but different upper one
        let res = MultivariateGaussian::new(array![0., 0.], array![[2., 1.], [0., 2.]]);
        assert!(matches!(res, Err(GpError::InvalidValueError(_))));

        let mut g = rotated_gaussian();
        let before = g.cov().clone();
        assert!(g.set_cov(array![[2., 0.], [1., 2.]]).is_err());
        assert_eq!(before, *g.cov());
        let inv = g.cov_inv().unwrap();
        assert_abs_diff_eq!(inv.dot(g.cov()), Array2::eye(2), epsilon = 1e-10);
    }

    #[test]
    fn test_log_density() {
        let g = MultivariateGaussian::new(array![1.], array![[4.]]).unwrap();
        let expected = -0.5 * (2. * std::f64::consts::PI * 4.).ln() - 0.5 * 0.25;
        assert_abs_diff_eq!(g.log_density(&array![2.]).unwrap(), expected, epsilon = 1e-12);
        assert_abs_diff_eq!(
            g.density(&array![2.]).unwrap(),
            expected.exp(),
            epsilon = 1e-12
        );

        let g = rotated_gaussian();
        let x = array![11., 9.];
        let diff = &x - g.mean();
        let logdet = (g.cov()[[0, 0]] * g.cov()[[1, 1]] - g.cov()[[0, 1]].powi(2)).ln();
        let quad = diff.dot(&g.cov_inv().unwrap().dot(&diff));
        let expected = -LN_2PI - 0.5 * logdet - 0.5 * quad;
        assert_abs_diff_eq!(g.log_density(&x).unwrap(), expected, epsilon = 1e-10);
        assert!(g.log_density(&array![1.]).is_err());
    }

    #[test]
    fn test_sample() {
        let g = rotated_gaussian();
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let samples = g.sample_with_rng(20000, &mut rng);
        assert_eq!(samples.shape(), &[20000, 2]);
        let mean = samples.mean_axis(Axis(0)).unwrap();
        assert_abs_diff_eq!(mean, *g.mean(), epsilon = 0.1);
        let centered = &samples - &mean;
        let cov = centered.t().dot(&centered) / 20000.;
        assert_abs_diff_eq!(cov, *g.cov(), epsilon = 0.5);
    }

    #[test]
    fn test_marginalize_hidden() {
        let cov = spd_matrix();
        let mean = array![1., 2., 3., 4.];
        let g = MultivariateGaussian::new(mean, cov.clone()).unwrap();
        let m = g.marginalize_hidden(&[true, false, true, false]).unwrap();
        assert_eq!(array![1., 3.], *m.mean());
        assert_abs_diff_eq!(
            *m.cov(),
            array![[cov[[0, 0]], cov[[0, 2]]], [cov[[2, 0]], cov[[2, 2]]]]
        );
        assert!(g.marginalize_hidden(&[true]).is_err());
        assert_eq!(g, g.marginalize_hidden(&[true; 4]).unwrap());
    }

    #[test]
    fn test_conditional_matches_block_formula() {
        let cov = spd_matrix();
        let mean = array![1., 2., 3., 4.];
        let g = MultivariateGaussian::new(mean.clone(), cov.clone()).unwrap();
        let observed = [false, true, false, true];
        let full_obs = array![0., 2.5, 0., 3.];
        let c = g.conditional(&full_obs, &observed).unwrap();
        let c_short = g.conditional(&array![2.5, 3.], &observed).unwrap();
        assert_abs_diff_eq!(*c.mean(), *c_short.mean(), epsilon = 1e-12);

        // direct block computation with a generic inverse of the 2x2 observed block
        let s_oo = array![[cov[[1, 1]], cov[[1, 3]]], [cov[[3, 1]], cov[[3, 3]]]];
        let det = s_oo[[0, 0]] * s_oo[[1, 1]] - s_oo[[0, 1]] * s_oo[[1, 0]];
        let s_oo_inv = array![[s_oo[[1, 1]], -s_oo[[0, 1]]], [-s_oo[[1, 0]], s_oo[[0, 0]]]] / det;
        let s_ho = array![[cov[[0, 1]], cov[[0, 3]]], [cov[[2, 1]], cov[[2, 3]]]];
        let s_hh = array![[cov[[0, 0]], cov[[0, 2]]], [cov[[2, 0]], cov[[2, 2]]]];
        let tmp = s_ho.dot(&s_oo_inv);
        let expected_mean = array![1., 3.] + tmp.dot(&(array![2.5, 3.] - array![2., 4.]));
        let expected_cov = &s_hh - &tmp.dot(&s_ho.t());
        assert_abs_diff_eq!(*c.mean(), expected_mean, epsilon = 1e-10);
        assert_abs_diff_eq!(*c.cov(), expected_cov, epsilon = 1e-10);
    }

    #[test]
    fn test_conditional_then_marginal_consistency() {
        let cov = spd_matrix();
        let g = MultivariateGaussian::new(array![1., 2., 3., 4.], cov).unwrap();
        // nothing observed: conditional is the marginal of hidden dimensions
        let observed = [false, false, false, false];
        let c = g.conditional(&Array1::<f64>::zeros(0), &observed).unwrap();
        assert_abs_diff_eq!(*c.cov(), *g.cov(), epsilon = 1e-12);

        // conditioning on dims 1 and 3 then marginalizing dim 2 of the result
        // equals conditioning the (0, 1, 3) marginal on dims 1 and 3
        let c = g.conditional(&array![2.5, 3.], &[false, true, false, true]).unwrap();
        let c0 = c.marginalize_hidden(&[true, false]).unwrap();
        let m = g.marginalize_hidden(&[true, true, false, true]).unwrap();
        let m0 = m.conditional(&array![2.5, 3.], &[false, true, true]).unwrap();
        assert_abs_diff_eq!(*c0.mean(), *m0.mean(), epsilon = 1e-10);
        assert_abs_diff_eq!(*c0.cov(), *m0.cov(), epsilon = 1e-10);

        // observing everything gives an empty distribution
        let all = g.conditional(&array![1., 2., 3., 4.], &[true; 4]).unwrap();
        assert_eq!(all.dimension(), 0);
    }

    #[test]
    fn test_setters() {
        let mut g = rotated_gaussian();
        g.set_mean(array![0., 0.]).unwrap();
        assert!(g.set_mean(array![0.]).is_err());
        g.set_cov(array![[1., 0.], [0., 9.]]).unwrap();
        assert_abs_diff_eq!(*g.cov_chol(), array![[1., 0.], [0., 3.]], epsilon = 1e-12);
        assert!(g.set_cov(array![[1., 2.], [2., 1.]]).is_err());
        let samples = concatenate(Axis(0), &[g.sample(3).view(), g.sample(2).view()]).unwrap();
        assert_eq!(samples.nrows(), 5);
    }

    #[cfg(feature = "serializable")]
    #[test]
    fn test_serialize() {
        let g = rotated_gaussian();
        let json = serde_json::to_string(&g).unwrap();
        let back: MultivariateGaussian<f64> = serde_json::from_str(&json).unwrap();
        assert_eq!(g, back);
    }
}
