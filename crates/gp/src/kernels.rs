//! Covariance functions for single-output gaussian processes.
//!
//! A kernel maps two sets of points `X` (n, d) and `Y` (m, d) to a covariance
//! matrix (n, m). Besides evaluation, kernels provide analytic derivative
//! matrices with respect to their hyperparameters and to the entries of `X`,
//! the latter being used when inducing points are optimized.
//!
//! Derivative ids are laid out as follows: ids `0..n_params()` address the
//! hyperparameters, id `n_params() + k` addresses the `k`-th entry (row-major)
//! of `X`.

use crate::errors::{GpError, Result};
use crate::utils::{entry_position, is_same_view, pairwise_sq_distances};
use linfa::Float;
use ndarray::{Array1, Array2, ArrayView2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Default lower bound reported for a hyperparameter without explicit bounds
pub const DEFAULT_LOWER_BOUND: f64 = 1e-6;
/// Default upper bound reported for a hyperparameter without explicit bounds
pub const DEFAULT_UPPER_BOUND: f64 = 1e6;
/// Step of the centered finite differences used by [`Kernel::input_derivative`]
pub const INPUT_FD_STEP: f64 = 1e-5;

/// Shared handle on a kernel, the same kernel may be referenced by the caller,
/// a multi-output kernel and a regressor.
pub type KernelRef<F> = Rc<RefCell<dyn Kernel<F>>>;

/// A trait for covariance functions used in GP regression
pub trait Kernel<F: Float>: fmt::Display {
    /// Covariance matrix between rows of `x` and rows of `y`.
    ///
    /// When `x` and `y` are the same view the result is the training covariance
    /// and may include a noise term on its diagonal.
    fn eval(&self, x: ArrayView2<F>, y: ArrayView2<F>) -> Result<Array2<F>>;

    /// Derivative of `eval(x, y)` with respect to the parameter `param_id`
    fn derivate(&self, param_id: usize, x: ArrayView2<F>, y: ArrayView2<F>) -> Result<Array2<F>>;

    /// Diagonal of `eval(x, x)`
    fn eval_diag(&self, x: ArrayView2<F>) -> Result<Array1<F>>;

    /// Diagonal of `derivate(param_id, x, x)`
    fn derivate_diag(&self, param_id: usize, x: ArrayView2<F>) -> Result<Array1<F>>;

    /// Number of hyperparameters
    fn n_params(&self) -> usize;

    /// Current hyperparameters
    fn params(&self) -> Array1<F>;

    /// Sets hyperparameters
    fn set_params(&mut self, params: &Array1<F>) -> Result<()>;

    /// Lower bounds of hyperparameters used during training
    fn lower_bounds(&self) -> Array1<F>;

    /// Upper bounds of hyperparameters used during training
    fn upper_bounds(&self) -> Array1<F>;

    /// Sets lower bounds, one per hyperparameter
    fn set_lower_bounds(&mut self, bounds: &Array1<F>) -> Result<()>;

    /// Sets upper bounds, one per hyperparameter
    fn set_upper_bounds(&mut self, bounds: &Array1<F>) -> Result<()>;

    /// Derivative of `eval(x, y)` with respect to the `entry`-th value (row-major) of `x`.
    ///
    /// When `x` and `y` are the same view the derivative is total, the entry moving
    /// in both arguments. The default implementation uses centered finite differences.
    fn input_derivative(&self, entry: usize, x: ArrayView2<F>, y: ArrayView2<F>) -> Result<Array2<F>> {
        let (r, c) = entry_position(entry, x.dim())?;
        let h = F::cast(INPUT_FD_STEP);
        let mut xp = x.to_owned();
        xp[[r, c]] += h;
        let mut xm = x.to_owned();
        xm[[r, c]] -= h;
        let (kp, km) = if is_same_view(&x, &y) {
            (
                self.eval(xp.view(), xp.view())?,
                self.eval(xm.view(), xm.view())?,
            )
        } else {
            (self.eval(xp.view(), y)?, self.eval(xm.view(), y)?)
        };
        Ok((kp - km).mapv(|v| v / (h + h)))
    }
}

/// Squared exponential kernel with parameters `[sigma, lambda, sigma_n]`
///
/// ```text
/// k(x, y) = sigma^2 exp(-|x - y|^2 / (2 lambda^2)) + sigma_n^2 [x and y are the same point set]
/// ```
///
/// The noise term `sigma_n^2 I` is only added when evaluating a point set against
/// itself, that is when both arguments are the same view.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "serializable",
    derive(Serialize, Deserialize),
    serde(bound(serialize = "F: Serialize", deserialize = "F: Deserialize<'de>"))
)]
pub struct SquaredExponentialKernel<F: Float> {
    params: Array1<F>,
    lower_bounds: Option<Array1<F>>,
    upper_bounds: Option<Array1<F>>,
}

impl<F: Float> SquaredExponentialKernel<F> {
    /// Number of hyperparameters of the squared exponential kernel
    pub const N_PARAMS: usize = 3;

    /// Constructor from `[sigma, lambda, sigma_n]`.
    ///
    /// Other lengths are accepted here but make evaluation fail.
    pub fn new(params: Array1<F>) -> Self {
        SquaredExponentialKernel {
            params,
            lower_bounds: None,
            upper_bounds: None,
        }
    }

    /// Wraps the kernel into a shared handle
    pub fn into_ref(self) -> KernelRef<F> {
        Rc::new(RefCell::new(self))
    }

    fn check_params(&self) -> Result<(F, F, F)> {
        if self.params.len() != Self::N_PARAMS {
            return Err(GpError::InvalidValueError(format!(
                "Squared exponential kernel expects 3 parameters, got {}",
                self.params.len()
            )));
        }
        Ok((self.params[0], self.params[1], self.params[2]))
    }

    /// signal part sigma^2 exp(-d2 / (2 lambda^2)) and squared distances
    fn signal(&self, x: ArrayView2<F>, y: ArrayView2<F>) -> Result<(Array2<F>, Array2<F>)> {
        let (sigma, lambda, _) = self.check_params()?;
        if x.ncols() != y.ncols() {
            return Err(GpError::InvalidValueError(format!(
                "Point dimensions differ: {} vs {}",
                x.ncols(),
                y.ncols()
            )));
        }
        let d2 = pairwise_sq_distances(&x, &y);
        let two_l2 = F::cast(2.) * lambda * lambda;
        let k = d2.mapv(|v| sigma * sigma * (-v / two_l2).exp());
        Ok((k, d2))
    }

    fn check_bounds_len(&self, bounds: &Array1<F>) -> Result<()> {
        if bounds.len() != self.params.len() {
            return Err(GpError::InvalidValueError(format!(
                "Expected {} bounds, got {}",
                self.params.len(),
                bounds.len()
            )));
        }
        Ok(())
    }
}

impl<F: Float> fmt::Display for SquaredExponentialKernel<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.check_params() {
            Ok((s, l, n)) => write!(f, "SquaredExponential(sigma={s}, lambda={l}, sigma_n={n})"),
            Err(_) => write!(f, "SquaredExponential({})", self.params),
        }
    }
}

impl<F: Float> Kernel<F> for SquaredExponentialKernel<F> {
    fn eval(&self, x: ArrayView2<F>, y: ArrayView2<F>) -> Result<Array2<F>> {
        let (_, _, noise) = self.check_params()?;
        let (mut k, _) = self.signal(x, y)?;
        if is_same_view(&x, &y) {
            k.diag_mut().mapv_inplace(|v| v + noise * noise);
        }
        Ok(k)
    }

    fn derivate(&self, param_id: usize, x: ArrayView2<F>, y: ArrayView2<F>) -> Result<Array2<F>> {
        let (sigma, lambda, noise) = self.check_params()?;
        match param_id {
            0 => {
                let (_, d2) = self.signal(x, y)?;
                let two_l2 = F::cast(2.) * lambda * lambda;
                Ok(d2.mapv(|v| F::cast(2.) * sigma * (-v / two_l2).exp()))
            }
            1 => {
                let (k, d2) = self.signal(x, y)?;
                let l3 = lambda * lambda * lambda;
                Ok(k * d2.mapv(|v| v / l3))
            }
            2 => {
                let mut res = Array2::zeros((x.nrows(), y.nrows()));
                if is_same_view(&x, &y) {
                    res.diag_mut().fill(F::cast(2.) * noise);
                }
                Ok(res)
            }
            id => self.input_derivative(id - Self::N_PARAMS, x, y),
        }
    }

    fn eval_diag(&self, x: ArrayView2<F>) -> Result<Array1<F>> {
        let (sigma, _, noise) = self.check_params()?;
        Ok(Array1::from_elem(x.nrows(), sigma * sigma + noise * noise))
    }

    fn derivate_diag(&self, param_id: usize, x: ArrayView2<F>) -> Result<Array1<F>> {
        let (sigma, _, noise) = self.check_params()?;
        let n = x.nrows();
        match param_id {
            0 => Ok(Array1::from_elem(n, F::cast(2.) * sigma)),
            1 => Ok(Array1::zeros(n)),
            2 => Ok(Array1::from_elem(n, F::cast(2.) * noise)),
            id => {
                // stationary kernel: the diagonal does not move with inputs
                entry_position(id - Self::N_PARAMS, x.dim())?;
                Ok(Array1::zeros(n))
            }
        }
    }

    fn n_params(&self) -> usize {
        self.params.len()
    }

    fn params(&self) -> Array1<F> {
        self.params.clone()
    }

    fn set_params(&mut self, params: &Array1<F>) -> Result<()> {
        if params.len() != Self::N_PARAMS {
            return Err(GpError::InvalidValueError(format!(
                "Squared exponential kernel expects 3 parameters, got {}",
                params.len()
            )));
        }
        self.params = params.clone();
        Ok(())
    }

    fn lower_bounds(&self) -> Array1<F> {
        self.lower_bounds
            .clone()
            .unwrap_or_else(|| Array1::from_elem(self.params.len(), F::cast(DEFAULT_LOWER_BOUND)))
    }

    fn upper_bounds(&self) -> Array1<F> {
        self.upper_bounds
            .clone()
            .unwrap_or_else(|| Array1::from_elem(self.params.len(), F::cast(DEFAULT_UPPER_BOUND)))
    }

    fn set_lower_bounds(&mut self, bounds: &Array1<F>) -> Result<()> {
        self.check_bounds_len(bounds)?;
        self.lower_bounds = Some(bounds.clone());
        Ok(())
    }

    fn set_upper_bounds(&mut self, bounds: &Array1<F>) -> Result<()> {
        self.check_bounds_len(bounds)?;
        self.upper_bounds = Some(bounds.clone());
        Ok(())
    }

    fn input_derivative(&self, entry: usize, x: ArrayView2<F>, y: ArrayView2<F>) -> Result<Array2<F>> {
        let (_, lambda, _) = self.check_params()?;
        let (r, c) = entry_position(entry, x.dim())?;
        let (k, _) = self.signal(x, y)?;
        let l2 = lambda * lambda;
        let mut res = Array2::zeros(k.dim());
        for j in 0..y.nrows() {
            res[[r, j]] = -k[[r, j]] * (x[[r, c]] - y[[j, c]]) / l2;
        }
        if is_same_view(&x, &y) {
            for i in 0..x.nrows() {
                res[[i, r]] += k[[i, r]] * (x[[i, c]] - y[[r, c]]) / l2;
            }
        }
        Ok(res)
    }
}
