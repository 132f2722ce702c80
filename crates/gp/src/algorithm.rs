use crate::errors::{GpError, Result};
use crate::kernels::KernelRef;
use crate::mvgauss::MultivariateGaussian;
use crate::optimization::{maximize_likelihood, OptimParams};
use crate::parameters::{GpRegParams, GpRegValidParams};

use linfa::prelude::{DatasetBase, Fit, Float};
use ndarray::{concatenate, Array1, Array2, ArrayBase, Axis, Data, Ix1, Ix2, Zip};

use log::debug;
use std::fmt;
use std::time::Instant;

/// Single-output gaussian process regression.
///
/// The output is modeled as a zero-mean gaussian process whose prior covariance is
/// given by a [`Kernel`](crate::Kernel):
///
/// ```text
/// y(x) ~ GP(0, k(x, x'))
/// ```
///
/// Training maximizes the log marginal likelihood `log N(y; 0, K(X, X))` over the
/// kernel hyperparameters within the kernel bounds. Prediction at new points is the
/// gaussian of the new outputs conditioned on the training outputs.
///
/// ```no_run
/// use gplib::{GpRegressor, SquaredExponentialKernel};
/// use ndarray::{array, Array1};
///
/// let xt = Array1::linspace(0., 10., 20).insert_axis(ndarray::Axis(1));
/// let yt = xt.column(0).mapv(f64::sin);
/// let kernel = SquaredExponentialKernel::new(array![1., 1., 0.01]).into_ref();
///
/// let mut gp = GpRegressor::with_kernel(kernel);
/// gp.set_training_set(xt, yt).expect("consistent training set");
/// let likelihood = gp.train(100, 1e-6).expect("GP training");
/// let mean = gp.predict(&array![[2.5], [7.2]]).expect("GP prediction");
/// ```
pub struct GpRegressor<F: Float> {
    kernel: Option<KernelRef<F>>,
    x: Array2<F>,
    y: Array1<F>,
    nugget: F,
}

impl<F: Float> Default for GpRegressor<F> {
    fn default() -> Self {
        GpRegressor {
            kernel: None,
            x: Array2::zeros((0, 0)),
            y: Array1::zeros(0),
            nugget: F::cast(100.0) * F::epsilon(),
        }
    }
}

impl<F: Float> fmt::Display for GpRegressor<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kernel {
            Some(k) => write!(f, "GP(kernel={}, n_train={})", k.borrow(), self.y.len()),
            None => write!(f, "GP(kernel=None, n_train={})", self.y.len()),
        }
    }
}

impl<F: Float> GpRegressor<F> {
    /// Gp parameters constructor
    pub fn params(kernel: KernelRef<F>) -> GpRegParams<F> {
        GpRegParams::new(kernel)
    }

    /// Regressor without kernel nor training data
    pub fn new() -> Self {
        Self::default()
    }

    /// Regressor using the given kernel
    pub fn with_kernel(kernel: KernelRef<F>) -> Self {
        GpRegressor {
            kernel: Some(kernel),
            ..Self::default()
        }
    }

    /// Sets the kernel, its parameters are modified by training
    pub fn set_kernel(&mut self, kernel: KernelRef<F>) {
        self.kernel = Some(kernel);
    }

    /// Kernel handle if any
    pub fn kernel(&self) -> Option<&KernelRef<F>> {
        self.kernel.as_ref()
    }

    /// Sets the value added to covariance diagonals before factorization
    pub fn set_nugget(&mut self, nugget: F) {
        self.nugget = nugget;
    }

    /// Nugget value
    pub fn nugget(&self) -> F {
        self.nugget
    }

    /// Training inputs (n, nx) and outputs (n,)
    pub fn training_set(&self) -> (&Array2<F>, &Array1<F>) {
        (&self.x, &self.y)
    }

    /// Replaces the training data, `x` (n, nx) and `y` (n,) must have the same number of rows
    pub fn set_training_set(&mut self, x: Array2<F>, y: Array1<F>) -> Result<()> {
        if x.nrows() == 0 {
            return Err(GpError::TrainingSetError("Empty training set".to_string()));
        }
        if x.nrows() != y.len() {
            return Err(GpError::TrainingSetError(format!(
                "Training inputs ({}) and outputs ({}) row numbers differ",
                x.nrows(),
                y.len()
            )));
        }
        self.x = x;
        self.y = y;
        Ok(())
    }

    fn checked_kernel(&self) -> Result<&KernelRef<F>> {
        let kernel = self
            .kernel
            .as_ref()
            .ok_or_else(|| GpError::InvalidStateError("Kernel is not set".to_string()))?;
        if self.y.is_empty() {
            return Err(GpError::InvalidStateError(
                "Training set is not set".to_string(),
            ));
        }
        Ok(kernel)
    }

    fn training_covariance(&self, kernel: &KernelRef<F>) -> Result<Array2<F>> {
        let mut k = kernel.borrow().eval(self.x.view(), self.x.view())?;
        k.diag_mut().mapv_inplace(|v| v + self.nugget);
        Ok(k)
    }

    /// Log marginal likelihood and, if requested, its gradient with respect to
    /// kernel parameters
    fn likelihood_terms(&self, with_grad: bool) -> Result<(F, Option<Array1<F>>)> {
        let kernel = self.checked_kernel()?;
        let k = self.training_covariance(kernel)?;
        let kernel = kernel.borrow();
        exact_likelihood(k, &self.y, kernel.n_params(), with_grad, |d| {
            kernel.derivate(d, self.x.view(), self.x.view())
        })
    }

    /// Log marginal likelihood of the training outputs under the current kernel
    pub fn log_marginal(&self) -> Result<F> {
        Ok(self.likelihood_terms(false)?.0)
    }

    /// Gradient of [`GpRegressor::log_marginal`] with respect to kernel parameters
    pub fn log_marginal_gradient(&self) -> Result<Array1<F>> {
        self.likelihood_terms(true)?
            .1
            .ok_or_else(|| GpError::LikelihoodComputationError("Missing gradient".to_string()))
    }

    /// Optimizes kernel parameters within kernel bounds by maximizing the log marginal
    /// likelihood, starting from the current kernel parameters.
    ///
    /// `max_iter` is the max number of likelihood evaluations and `tol` the relative
    /// tolerance on parameters. Returns the final log marginal likelihood.
    pub fn train(&mut self, max_iter: usize, tol: F) -> Result<F> {
        let kernel = self.checked_kernel()?.clone();
        let (param0, bounds) = {
            let k = kernel.borrow();
            let bounds: Vec<(F, F)> = k
                .lower_bounds()
                .iter()
                .zip(k.upper_bounds().iter())
                .map(|(lo, up)| (*lo, *up))
                .collect();
            (k.params(), bounds)
        };
        debug!("Optimize GP with param0 = {param0} and bounds = {bounds:?}");
        let now = Instant::now();
        let optim = OptimParams {
            max_eval: max_iter,
            xtol_rel: tol.to_f64().unwrap_or(0.),
            ..OptimParams::default()
        };
        let (_, best) = maximize_likelihood(
            |params: &Array1<F>, with_grad: bool| {
                kernel.borrow_mut().set_params(params)?;
                self.likelihood_terms(with_grad)
            },
            &param0,
            &bounds,
            &optim,
        )?;
        kernel.borrow_mut().set_params(&best)?;
        let ll = self.log_marginal()?;
        debug!(
            "elapsed optim = {:?}ms, log likelihood = {ll}, params = {best}",
            now.elapsed().as_millis()
        );
        Ok(ll)
    }

    /// Joint gaussian of outputs at `x` (n, nx) given the training data
    pub fn full_predict(
        &self,
        x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    ) -> Result<MultivariateGaussian<F>> {
        let kernel = self.checked_kernel()?;
        if x.ncols() != self.x.ncols() {
            return Err(GpError::InvalidValueError(format!(
                "Prediction points dimension {} differs from training one {}",
                x.ncols(),
                self.x.ncols()
            )));
        }
        let n = self.y.len();
        let all = concatenate(Axis(0), &[self.x.view(), x.view()])
            .map_err(|e| GpError::InvalidValueError(e.to_string()))?;
        let mut k = kernel.borrow().eval(all.view(), all.view())?;
        k.diag_mut().mapv_inplace(|v| v + self.nugget);
        let joint = MultivariateGaussian::new(Array1::zeros(all.nrows()), k)?;
        let mut observed = vec![true; n];
        observed.resize(all.nrows(), false);
        joint.conditional(&self.y, &observed)
    }

    /// Predicted mean of outputs at `x` (n, nx)
    pub fn predict(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array1<F>> {
        Ok(self.full_predict(x)?.mean().to_owned())
    }
}

/// Log likelihood of `y` under N(0, K) and, if requested, its gradient
/// `trace(W dK/dtheta_d)` with `W = 1/2 (alpha alpha' - K^-1)`, `alpha = K^-1 y`,
/// given the derivative matrices `derivative(d)` of `K` for `d` in `0..n_params`.
pub(crate) fn exact_likelihood<F, D>(
    k: Array2<F>,
    y: &Array1<F>,
    n_params: usize,
    with_grad: bool,
    derivative: D,
) -> Result<(F, Option<Array1<F>>)>
where
    F: Float,
    D: Fn(usize) -> Result<Array2<F>>,
{
    let prior = MultivariateGaussian::new(Array1::zeros(y.len()), k)?;
    let ll = prior.log_density(y)?;
    if !with_grad {
        return Ok((ll, None));
    }
    let k_inv = prior.cov_inv()?;
    let alpha = k_inv.dot(y);
    let half = F::cast(0.5);
    let mut w = alpha
        .view()
        .insert_axis(Axis(1))
        .dot(&alpha.view().insert_axis(Axis(0)));
    Zip::from(&mut w)
        .and(&k_inv)
        .for_each(|w, &ki| *w = half * (*w - ki));
    let grad = (0..n_params)
        .map(|d| Ok((&w * &derivative(d)?).sum()))
        .collect::<Result<Array1<F>>>()?;
    Ok((ll, Some(grad)))
}

impl<F: Float, D: Data<Elem = F>> Fit<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>, GpError>
    for GpRegValidParams<F>
{
    type Object = GpRegressor<F>;

    /// Fit kernel parameters using maximum likelihood
    fn fit(
        &self,
        dataset: &DatasetBase<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>>,
    ) -> Result<Self::Object> {
        let mut gp = GpRegressor::with_kernel(self.kernel().clone());
        gp.set_nugget(self.nugget());
        gp.set_training_set(dataset.records().to_owned(), dataset.targets().to_owned())?;
        gp.train(self.max_iter(), self.tol())?;
        Ok(gp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{Kernel, SquaredExponentialKernel};
    use approx::assert_abs_diff_eq;
    use finitediff::FiniteDiff;
    use linfa::prelude::Dataset;
    use linfa::ParamGuard;
    use ndarray::{array, Array};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Normal;
    use ndarray_rand::RandomExt;
    use rand_xoshiro::Xoshiro256Plus;

    fn sin_data(n: usize, noise: f64) -> (Array2<f64>, Array1<f64>) {
        let x = Array1::from_iter((0..n).map(|i| 0.5 * i as f64));
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let eps = Array::random_using(n, Normal::new(0., noise).unwrap(), &mut rng);
        let y = x.mapv(f64::sin) + eps;
        (x.insert_axis(Axis(1)), y)
    }

    #[test]
    fn test_missing_kernel_or_data() {
        let (x, y) = sin_data(5, 0.01);
        let mut gp = GpRegressor::<f64>::new();
        gp.set_training_set(x.clone(), y.clone()).unwrap();
        assert!(matches!(
            gp.train(10, 1e-6),
            Err(GpError::InvalidStateError(_))
        ));
        let kernel = SquaredExponentialKernel::new(array![1., 1., 0.1]).into_ref();
        let gp = GpRegressor::with_kernel(kernel);
        assert!(gp.log_marginal().is_err());
        let mut gp = GpRegressor::<f64>::new();
        assert!(gp.set_training_set(x, array![1., 2.]).is_err());
    }

    #[test]
    fn test_log_marginal_value() {
        let kernel = SquaredExponentialKernel::new(array![1.2, 0.9, 0.3]).into_ref();
        let mut gp = GpRegressor::with_kernel(kernel.clone());
        gp.set_nugget(0.);
        let x = array![[0.], [1.]];
        gp.set_training_set(x.clone(), array![0.5, -0.2]).unwrap();
        let k = kernel.borrow().eval(x.view(), x.view()).unwrap();
        let det: f64 = k[[0, 0]] * k[[1, 1]] - k[[0, 1]] * k[[1, 0]];
        let inv = array![[k[[1, 1]], -k[[0, 1]]], [-k[[1, 0]], k[[0, 0]]]] / det;
        let y = array![0.5, -0.2];
        let expected = -(2. * std::f64::consts::PI).ln() - 0.5 * det.ln() - 0.5 * y.dot(&inv.dot(&y));
        assert_abs_diff_eq!(gp.log_marginal().unwrap(), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_log_marginal_gradient() {
        let (x, y) = sin_data(20, 0.05);
        let gp_at = |p: &Array1<f64>| {
            let mut gp = GpRegressor::with_kernel(SquaredExponentialKernel::new(p.clone()).into_ref());
            gp.set_training_set(x.clone(), y.clone()).unwrap();
            gp
        };
        let p0 = array![1.1, 1.4, 0.2];
        let grad = gp_at(&p0).log_marginal_gradient().unwrap();
        let fd = p0.to_vec().central_diff(&|p: &Vec<f64>| -> f64 {
            gp_at(&Array1::from(p.clone())).log_marginal().unwrap()
        });
        for (g, f) in grad.iter().zip(fd.iter()) {
            assert_abs_diff_eq!(*g, *f, epsilon = 1e-4 * (1. + f.abs()));
        }
    }

    #[test]
    fn test_sin_regression() {
        let (x, y) = sin_data(100, 0.01);
        let mut kernel = SquaredExponentialKernel::new(array![1., 1., 0.05]);
        kernel.set_lower_bounds(&array![1e-5, 1e-5, 1e-4]).unwrap();
        kernel.set_upper_bounds(&array![5., 5., 0.1]).unwrap();
        let kernel = kernel.into_ref();
        let mut gp = GpRegressor::with_kernel(kernel.clone());
        gp.set_training_set(x, y).unwrap();
        let ll0 = gp.log_marginal().unwrap();
        let ll = gp.train(200, 1e-6).unwrap();
        assert!(ll >= ll0);

        let params = kernel.borrow().params();
        for (i, (lo, up)) in [(1e-5, 5.), (1e-5, 5.), (1e-4, 0.1)].iter().enumerate() {
            assert!(params[i] >= *lo && params[i] <= *up);
        }

        let xtest = Array1::from_iter((0..20).map(|k| 2.5 * k as f64 + 0.02 * (k + 1) as f64));
        let pred = gp.full_predict(&xtest.view().insert_axis(Axis(1))).unwrap();
        assert_abs_diff_eq!(*pred.mean(), xtest.mapv(f64::sin), epsilon = 0.1);
        assert!(linfa_linalg::cholesky::Cholesky::cholesky(pred.cov()).is_ok());
        let mean = gp.predict(&xtest.insert_axis(Axis(1))).unwrap();
        assert_abs_diff_eq!(mean, *pred.mean());
    }

    #[test]
    fn test_fit_entry_point() {
        let (x, y) = sin_data(30, 0.01);
        let kernel = SquaredExponentialKernel::new(array![1., 1., 0.05]).into_ref();
        let gp = GpRegressor::params(kernel)
            .max_iter(50)
            .check()
            .unwrap()
            .fit(&Dataset::new(x, y))
            .unwrap();
        assert_eq!(gp.training_set().0.nrows(), 30);
        assert!(format!("{gp}").starts_with("GP(kernel=SquaredExponential("));
    }
}
