use crate::algorithm::exact_likelihood;
use crate::errors::{GpError, Result};
use crate::multioutput_kernels::{MultiKernelRef, MultiOutputKernel};
use crate::mvgauss::MultivariateGaussian;
use crate::optimization::{maximize_likelihood, OptimParams};
use crate::parameters::{Inducings, MultiGpParams, MultiGpValidParams, ParamTuning, TrainingMethod};
use crate::sparse_algorithm::{
    check_inducings, fitc_likelihood, fitc_predict, grid_inducings, inducing_bounds,
};
use crate::utils::{flatten_matrices, flatten_vectors, split_params, unflatten};

use linfa::{Float, ParamGuard};
use ndarray::{concatenate, s, Array1, Array2, Axis};

use log::debug;
use std::fmt;
use std::time::Instant;

/// Training state of a [`MultiOutputGpRegressor`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainingMode {
    /// No training done yet, the exact likelihood is used
    Untrained,
    /// Trained with the exact likelihood
    Full,
    /// Trained with the FITC sparse approximation
    Fitc,
}

#[derive(Clone, Debug)]
struct FitcState<F: Float> {
    inducings: Vec<Array2<F>>,
    noise: F,
}

#[derive(Clone, Debug)]
enum State<F: Float> {
    Untrained,
    Full,
    Fitc(FitcState<F>),
}

/// Multi-output gaussian process regression.
///
/// Outputs are jointly modeled by a zero-mean gaussian process whose covariance is
/// given by a [`MultiOutputKernel`](crate::MultiOutputKernel). Each output `i` has its
/// own training points `X_i` (N_i, nx) and values `y_i` (N_i,).
///
/// Two training methods are available:
/// * [`MultiOutputGpRegressor::train`] maximizes the exact log marginal likelihood
///   of the concatenated outputs, in O(N^3) with N the total number of points,
/// * [`MultiOutputGpRegressor::train_fitc`] maximizes the FITC approximation built on
///   M inducing points per output, in O(N M^2). Inducing points locations and a noise
///   value are optimized along with the kernel parameters.
///
/// Prediction uses the approximation the regressor was trained with.
pub struct MultiOutputGpRegressor<F: Float> {
    kernel: Option<MultiKernelRef<F>>,
    x: Vec<Array2<F>>,
    y: Vec<Array1<F>>,
    y_flat: Array1<F>,
    nugget: F,
    state: State<F>,
}

impl<F: Float> Default for MultiOutputGpRegressor<F> {
    fn default() -> Self {
        MultiOutputGpRegressor {
            kernel: None,
            x: vec![],
            y: vec![],
            y_flat: Array1::zeros(0),
            nugget: F::cast(100.0) * F::epsilon(),
            state: State::Untrained,
        }
    }
}

impl<F: Float> fmt::Display for MultiOutputGpRegressor<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kernel = match &self.kernel {
            Some(k) => k.borrow().to_string(),
            None => "None".to_string(),
        };
        write!(
            f,
            "MultiGP(kernel={}, n_outputs={}, n_train={}, mode={:?})",
            kernel,
            self.x.len(),
            self.y_flat.len(),
            self.mode()
        )
    }
}

impl<F: Float> MultiOutputGpRegressor<F> {
    /// Multi-output GP parameters constructor
    pub fn params(kernel: MultiKernelRef<F>) -> MultiGpParams<F> {
        MultiGpParams::new(kernel)
    }

    /// Regressor without kernel nor training data
    pub fn new() -> Self {
        Self::default()
    }

    /// Regressor using the given multi-output kernel
    pub fn with_kernel(kernel: MultiKernelRef<F>) -> Self {
        MultiOutputGpRegressor {
            kernel: Some(kernel),
            ..Self::default()
        }
    }

    /// Sets the kernel, its parameters are modified by training.
    /// The regressor goes back to the untrained state.
    pub fn set_kernel(&mut self, kernel: MultiKernelRef<F>) {
        self.kernel = Some(kernel);
        self.state = State::Untrained;
    }

    /// Kernel handle if any
    pub fn kernel(&self) -> Option<&MultiKernelRef<F>> {
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

    /// Training inputs and outputs, one entry per output
    pub fn training_set(&self) -> (&[Array2<F>], &[Array1<F>]) {
        (&self.x, &self.y)
    }

    /// Replaces the training data: for each output `i`, `x[i]` (N_i, nx) and `y[i]` (N_i,).
    /// The regressor goes back to the untrained state.
    pub fn set_training_set(&mut self, x: Vec<Array2<F>>, y: Vec<Array1<F>>) -> Result<()> {
        if x.is_empty() {
            return Err(GpError::TrainingSetError("Empty training set".to_string()));
        }
        if x.len() != y.len() {
            return Err(GpError::TrainingSetError(format!(
                "Training inputs ({}) and outputs ({}) numbers differ",
                x.len(),
                y.len()
            )));
        }
        let nx = x[0].ncols();
        for (i, (xi, yi)) in x.iter().zip(y.iter()).enumerate() {
            if xi.nrows() == 0 {
                return Err(GpError::TrainingSetError(format!(
                    "Output {i}: empty training set"
                )));
            }
            if xi.nrows() != yi.len() {
                return Err(GpError::TrainingSetError(format!(
                    "Output {i}: training inputs ({}) and outputs ({}) row numbers differ",
                    xi.nrows(),
                    yi.len()
                )));
            }
            if xi.ncols() != nx {
                return Err(GpError::TrainingSetError(format!(
                    "Output {i}: inputs dimension {} differs from {nx}",
                    xi.ncols()
                )));
            }
        }
        self.y_flat = flatten_vectors(&y);
        self.x = x;
        self.y = y;
        self.state = State::Untrained;
        Ok(())
    }

    /// Current training state
    pub fn mode(&self) -> TrainingMode {
        match self.state {
            State::Untrained => TrainingMode::Untrained,
            State::Full => TrainingMode::Full,
            State::Fitc(_) => TrainingMode::Fitc,
        }
    }

    /// Inducing points, one (M_i, nx) matrix per output, when trained with FITC
    pub fn inducings(&self) -> Option<&[Array2<F>]> {
        match &self.state {
            State::Fitc(fitc) => Some(&fitc.inducings),
            _ => None,
        }
    }

    /// FITC noise value when trained with FITC
    pub fn noise(&self) -> Option<F> {
        match &self.state {
            State::Fitc(fitc) => Some(fitc.noise),
            _ => None,
        }
    }

    fn checked_kernel(&self) -> Result<&MultiKernelRef<F>> {
        let kernel = self
            .kernel
            .as_ref()
            .ok_or_else(|| GpError::InvalidStateError("Kernel is not set".to_string()))?;
        if self.x.is_empty() {
            return Err(GpError::InvalidStateError(
                "Training set is not set".to_string(),
            ));
        }
        let n_outputs = kernel.borrow().n_outputs();
        if n_outputs != self.x.len() {
            return Err(GpError::InvalidStateError(format!(
                "Kernel has {n_outputs} outputs while training set has {}",
                self.x.len()
            )));
        }
        Ok(kernel)
    }

    /// All trainable parameters.
    ///
    /// The kernel parameters, followed in FITC mode by the inducing points entries
    /// (row-major, output after output) and the noise.
    pub fn get_all_params(&self) -> Result<Array1<F>> {
        let kernel = self
            .kernel
            .as_ref()
            .ok_or_else(|| GpError::InvalidStateError("Kernel is not set".to_string()))?;
        let mut params = kernel.borrow().params().to_vec();
        if let State::Fitc(fitc) = &self.state {
            params.extend(flatten_matrices(&fitc.inducings).iter());
            params.push(fitc.noise);
        }
        Ok(Array1::from(params))
    }

    /// Sets all trainable parameters, laid out as in [`MultiOutputGpRegressor::get_all_params`]
    pub fn set_params(&mut self, params: &Array1<F>) -> Result<()> {
        let kernel = self
            .kernel
            .as_ref()
            .ok_or_else(|| GpError::InvalidStateError("Kernel is not set".to_string()))?;
        let n_k = kernel.borrow().n_params();
        let expected = match &self.state {
            State::Fitc(fitc) => n_k + fitc.inducings.iter().map(|z| z.len()).sum::<usize>() + 1,
            _ => n_k,
        };
        if params.len() != expected {
            return Err(GpError::InvalidValueError(format!(
                "Expected {expected} parameters, got {}",
                params.len()
            )));
        }
        if let State::Fitc(fitc) = &mut self.state {
            let noise = params[expected - 1];
            if noise <= F::zero() {
                return Err(GpError::InvalidValueError(format!(
                    "Noise should be strictly positive, got {noise}"
                )));
            }
            let shapes: Vec<(usize, usize)> = fitc.inducings.iter().map(|z| z.dim()).collect();
            let (kparams, inducings, _) = split_fitc_params(params, n_k, &shapes)?;
            kernel.borrow_mut().set_params(&kparams)?;
            fitc.inducings = inducings;
            fitc.noise = noise;
        } else {
            kernel.borrow_mut().set_params(params)?;
        }
        Ok(())
    }

    fn full_likelihood(
        &self,
        kernel: &dyn MultiOutputKernel<F>,
        with_grad: bool,
    ) -> Result<(F, Option<Array1<F>>)> {
        let mut k = kernel.eval(&self.x, &self.x, false)?;
        k.diag_mut().mapv_inplace(|v| v + self.nugget);
        exact_likelihood(k, &self.y_flat, kernel.n_params(), with_grad, |d| {
            kernel.derivate(d, &self.x, &self.x, false)
        })
    }

    fn likelihood_terms(&self, with_grad: bool) -> Result<(F, Option<Array1<F>>)> {
        let kernel = self.checked_kernel()?.borrow();
        match &self.state {
            State::Fitc(fitc) => fitc_likelihood(
                &*kernel,
                &self.x,
                &self.y_flat,
                &fitc.inducings,
                fitc.noise,
                self.nugget,
                with_grad,
                true,
            )
            .map(|(ll, grad, _)| (ll, grad)),
            _ => self.full_likelihood(&*kernel, with_grad),
        }
    }

    /// Log marginal likelihood of the training outputs, exact or FITC
    /// depending on the training mode
    pub fn log_marginal(&self) -> Result<F> {
        Ok(self.likelihood_terms(false)?.0)
    }

    /// Gradient of [`MultiOutputGpRegressor::log_marginal`] with respect to the
    /// parameters laid out as in [`MultiOutputGpRegressor::get_all_params`]
    pub fn log_marginal_gradient(&self) -> Result<Array1<F>> {
        self.likelihood_terms(true)?
            .1
            .ok_or_else(|| GpError::LikelihoodComputationError("Missing gradient".to_string()))
    }

    /// Optimizes kernel parameters within kernel bounds by maximizing the exact log
    /// marginal likelihood of all outputs, starting from the current kernel parameters.
    ///
    /// `max_iter` is the max number of likelihood evaluations and `tol` the relative
    /// tolerance on parameters. Returns the final log marginal likelihood.
    pub fn train(&mut self, max_iter: usize, tol: F) -> Result<F> {
        let kernel = self.checked_kernel()?.clone();
        let (param0, bounds) = {
            let k = kernel.borrow();
            (k.params(), zip_bounds(&k.lower_bounds(), &k.upper_bounds()))
        };
        debug!("Optimize multi-output GP with param0 = {param0} and bounds = {bounds:?}");
        let now = Instant::now();
        let (_, best) = maximize_likelihood(
            |params: &Array1<F>, with_grad: bool| {
                kernel.borrow_mut().set_params(params)?;
                self.full_likelihood(&*kernel.borrow(), with_grad)
            },
            &param0,
            &bounds,
            &optim_params(max_iter, tol),
        )?;
        kernel.borrow_mut().set_params(&best)?;
        self.state = State::Full;
        let ll = self.log_marginal()?;
        debug!(
            "elapsed optim = {:?}ms, log likelihood = {ll}, params = {best}",
            now.elapsed().as_millis()
        );
        Ok(ll)
    }

    /// Trains the FITC approximation with `num_inducing[i]` inducing points for output `i`.
    ///
    /// Inducing points start on a uniform grid over the observed range of each input
    /// dimension and are optimized along with the kernel parameters and the noise.
    /// Each count should be in `[1, N_i)`. Returns the final FITC log marginal likelihood.
    pub fn train_fitc(&mut self, max_iter: usize, tol: F, num_inducing: &[usize]) -> Result<F> {
        self.checked_kernel()?;
        let inducings = grid_inducings(&self.x, num_inducing)?;
        self.train_fitc_with(max_iter, tol, inducings, ParamTuning::default(), true)
    }

    /// Trains the FITC approximation starting from the given inducing points, one
    /// (M_i, nx) matrix per output.
    ///
    /// `noise` is either fixed or optimized within its bounds, inducing points
    /// locations are kept when `optimize_inducings` is false.
    pub fn train_fitc_with(
        &mut self,
        max_iter: usize,
        tol: F,
        inducings: Vec<Array2<F>>,
        noise: ParamTuning<F>,
        optimize_inducings: bool,
    ) -> Result<F> {
        let kernel = self.checked_kernel()?.clone();
        check_inducings(&self.x, &inducings)?;

        let (n_k, mut param0, mut bounds) = {
            let k = kernel.borrow();
            (
                k.n_params(),
                k.params().to_vec(),
                zip_bounds(&k.lower_bounds(), &k.upper_bounds()),
            )
        };
        param0.extend(flatten_matrices(&inducings).iter());
        param0.push(noise.init());
        bounds.extend(inducing_bounds(&self.x, &inducings, optimize_inducings)?);
        bounds.push(noise.bounds());
        let param0 = Array1::from(param0);
        let shapes: Vec<(usize, usize)> = inducings.iter().map(|z| z.dim()).collect();

        debug!("Optimize FITC GP with param0 = {param0} and bounds = {bounds:?}");
        let now = Instant::now();
        let (_, best) = maximize_likelihood(
            |params: &Array1<F>, with_grad: bool| {
                let (kparams, z, noise) = split_fitc_params(params, n_k, &shapes)?;
                kernel.borrow_mut().set_params(&kparams)?;
                fitc_likelihood(
                    &*kernel.borrow(),
                    &self.x,
                    &self.y_flat,
                    &z,
                    noise,
                    self.nugget,
                    with_grad,
                    optimize_inducings,
                )
                .map(|(ll, grad, _)| (ll, grad))
            },
            &param0,
            &bounds,
            &optim_params(max_iter, tol),
        )?;

        let (kparams, inducings, noise) = split_fitc_params(&best, n_k, &shapes)?;
        kernel.borrow_mut().set_params(&kparams)?;
        self.state = State::Fitc(FitcState { inducings, noise });
        let ll = self.log_marginal()?;
        debug!(
            "elapsed optim = {:?}ms, log likelihood = {ll}, params = {best}",
            now.elapsed().as_millis()
        );
        Ok(ll)
    }

    /// Joint gaussian of outputs at `x[i]` (n_i, nx) for each output `i` given the
    /// training data. Components are ordered output after output.
    pub fn full_predict(&self, x: &[Array2<F>]) -> Result<MultivariateGaussian<F>> {
        let kernel = self.checked_kernel()?;
        if x.len() != self.x.len() {
            return Err(GpError::InvalidValueError(format!(
                "Expected prediction points for {} outputs, got {}",
                self.x.len(),
                x.len()
            )));
        }
        let nx = self.x[0].ncols();
        if let Some(xi) = x.iter().find(|xi| xi.ncols() != nx) {
            return Err(GpError::InvalidValueError(format!(
                "Prediction points dimension {} differs from training one {nx}",
                xi.ncols()
            )));
        }
        if x.iter().all(|xi| xi.nrows() == 0) {
            return Err(GpError::InvalidValueError(
                "No prediction points".to_string(),
            ));
        }
        let kernel = kernel.borrow();
        match &self.state {
            State::Fitc(fitc) => {
                let (_, _, terms) = fitc_likelihood(
                    &*kernel,
                    &self.x,
                    &self.y_flat,
                    &fitc.inducings,
                    fitc.noise,
                    self.nugget,
                    false,
                    false,
                )?;
                fitc_predict(&*kernel, &fitc.inducings, &terms, x, self.nugget)
            }
            _ => {
                let mut all = Vec::with_capacity(x.len());
                let mut observed = Vec::with_capacity(self.y_flat.len());
                for (xt, xn) in self.x.iter().zip(x) {
                    all.push(
                        concatenate(Axis(0), &[xt.view(), xn.view()])
                            .map_err(|e| GpError::InvalidValueError(e.to_string()))?,
                    );
                    observed.extend(std::iter::repeat(true).take(xt.nrows()));
                    observed.extend(std::iter::repeat(false).take(xn.nrows()));
                }
                let mut k = kernel.eval(&all, &all, false)?;
                k.diag_mut().mapv_inplace(|v| v + self.nugget);
                let joint = MultivariateGaussian::new(Array1::zeros(observed.len()), k)?;
                joint.conditional(&self.y_flat, &observed)
            }
        }
    }

    /// Predicted mean of outputs at `x[i]` (n_i, nx) for each output `i`,
    /// concatenated output after output
    pub fn predict(&self, x: &[Array2<F>]) -> Result<Array1<F>> {
        Ok(self.full_predict(x)?.mean().to_owned())
    }

    /// Predicted means split per output
    pub fn predict_outputs(&self, x: &[Array2<F>]) -> Result<Vec<Array1<F>>> {
        let mean = self.predict(x)?;
        let mut start = 0;
        Ok(x.iter()
            .map(|xi| {
                let m = mean.slice(s![start..start + xi.nrows()]).to_owned();
                start += xi.nrows();
                m
            })
            .collect())
    }
}

/// Splits a FITC parameter vector into kernel parameters, inducing points and noise
fn split_fitc_params<F: Float>(
    params: &Array1<F>,
    n_kernel: usize,
    shapes: &[(usize, usize)],
) -> Result<(Array1<F>, Vec<Array2<F>>, F)> {
    let (kparams, rest) = split_params(&params.to_vec(), n_kernel)?;
    let (z, noise) = split_params(&rest.to_vec(), rest.len().saturating_sub(1))?;
    let noise = noise.first().copied().ok_or_else(|| {
        GpError::InvalidValueError("Missing noise in FITC parameters".to_string())
    })?;
    Ok((kparams, unflatten(&z.to_vec(), shapes)?, noise))
}

fn zip_bounds<F: Float>(lower: &Array1<F>, upper: &Array1<F>) -> Vec<(F, F)> {
    lower.iter().zip(upper.iter()).map(|(lo, up)| (*lo, *up)).collect()
}

fn optim_params<F: Float>(max_iter: usize, tol: F) -> OptimParams {
    OptimParams {
        max_eval: max_iter,
        xtol_rel: tol.to_f64().unwrap_or(0.),
        ..OptimParams::default()
    }
}

impl<F: Float> MultiGpValidParams<F> {
    /// Trains a multi-output regressor on `x[i]` (N_i, nx), `y[i]` (N_i,) for each
    /// output `i` with the configured method
    pub fn fit(&self, x: Vec<Array2<F>>, y: Vec<Array1<F>>) -> Result<MultiOutputGpRegressor<F>> {
        let mut gp = MultiOutputGpRegressor::with_kernel(self.kernel().clone());
        gp.set_nugget(self.nugget());
        gp.set_training_set(x, y)?;
        match self.method() {
            TrainingMethod::Full => {
                gp.train(self.max_iter(), self.tol())?;
            }
            TrainingMethod::Fitc(Inducings::Grid(counts)) => {
                gp.checked_kernel()?;
                let z = grid_inducings(&gp.x, counts)?;
                gp.train_fitc_with(
                    self.max_iter(),
                    self.tol(),
                    z,
                    self.noise().clone(),
                    self.optimize_inducings(),
                )?;
            }
            TrainingMethod::Fitc(Inducings::Located(z)) => {
                gp.train_fitc_with(
                    self.max_iter(),
                    self.tol(),
                    z.clone(),
                    self.noise().clone(),
                    self.optimize_inducings(),
                )?;
            }
        }
        Ok(gp)
    }
}

impl<F: Float> MultiGpParams<F> {
    /// Checks the parameters then trains a multi-output regressor,
    /// see [`MultiGpValidParams::fit`]
    pub fn fit(&self, x: Vec<Array2<F>>, y: Vec<Array1<F>>) -> Result<MultiOutputGpRegressor<F>> {
        self.check_ref()?.fit(x, y)
    }
}
