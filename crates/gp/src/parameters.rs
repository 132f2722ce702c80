use crate::errors::{GpError, Result};
use crate::kernels::KernelRef;
use crate::multioutput_kernels::MultiKernelRef;
use linfa::{Float, ParamGuard};
use ndarray::Array2;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Default max number of likelihood evaluations during training
pub const DEFAULT_MAX_ITER: usize = 200;
/// Default relative tolerance on parameters to stop training
pub const DEFAULT_TOL: f64 = 1e-6;

fn default_nugget<F: Float>() -> F {
    F::cast(100.0) * F::epsilon()
}

fn check_common<F: Float>(max_iter: usize, tol: F, nugget: F) -> Result<()> {
    if max_iter == 0 {
        return Err(GpError::InvalidValueError(
            "`max_iter` should be strictly positive".to_string(),
        ));
    }
    if tol < F::zero() {
        return Err(GpError::InvalidValueError(format!(
            "`tol` should be positive, got {tol}"
        )));
    }
    if nugget < F::zero() {
        return Err(GpError::InvalidValueError(format!(
            "`nugget` should be positive, got {nugget}"
        )));
    }
    Ok(())
}

/// A set of validated single-output GP regression parameters.
#[derive(Clone)]
pub struct GpRegValidParams<F: Float> {
    /// Covariance function, its current parameters are the starting point of training
    pub(crate) kernel: KernelRef<F>,
    /// Max number of likelihood evaluations
    pub(crate) max_iter: usize,
    /// Relative tolerance on parameters
    pub(crate) tol: F,
    /// Parameter to improve numerical stability
    pub(crate) nugget: F,
}

impl<F: Float> GpRegValidParams<F> {
    /// Get the kernel
    pub fn kernel(&self) -> &KernelRef<F> {
        &self.kernel
    }

    /// Get the max number of likelihood evaluations
    pub fn max_iter(&self) -> usize {
        self.max_iter
    }

    /// Get the relative tolerance on parameters
    pub fn tol(&self) -> F {
        self.tol
    }

    /// Get the nugget
    pub fn nugget(&self) -> F {
        self.nugget
    }
}

/// The set of hyperparameters that can be specified for the training of a
/// [`GpRegressor`](crate::GpRegressor).
#[derive(Clone)]
pub struct GpRegParams<F: Float>(GpRegValidParams<F>);

impl<F: Float> GpRegParams<F> {
    /// A constructor given the kernel to be trained
    pub fn new(kernel: KernelRef<F>) -> GpRegParams<F> {
        Self(GpRegValidParams {
            kernel,
            max_iter: DEFAULT_MAX_ITER,
            tol: F::cast(DEFAULT_TOL),
            nugget: default_nugget(),
        })
    }

    /// Set the max number of likelihood evaluations
    pub fn max_iter(mut self, max_iter: usize) -> Self {
        self.0.max_iter = max_iter;
        self
    }

    /// Set the relative tolerance on parameters
    pub fn tol(mut self, tol: F) -> Self {
        self.0.tol = tol;
        self
    }

    /// Set nugget.
    ///
    /// Nugget is added to the covariance diagonal to improve numerical stability
    pub fn nugget(mut self, nugget: F) -> Self {
        self.0.nugget = nugget;
        self
    }
}

impl<F: Float> ParamGuard for GpRegParams<F> {
    type Checked = GpRegValidParams<F>;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        check_common(self.0.max_iter, self.0.tol, self.0.nugget)?;
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}

/// Scalar parameter tuning
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum ParamTuning<F: Float> {
    /// Constant parameter (ie given not estimated)
    Fixed(F),
    /// Parameter is optimized between given bounds (lower, upper) starting from the inital guess
    Optimized {
        /// Initial guess parameter value
        init: F,
        /// Bounds of the optimized parameter (lower, upper)
        bounds: (F, F),
    },
}

impl<F: Float> Default for ParamTuning<F> {
    fn default() -> ParamTuning<F> {
        Self::Optimized {
            init: F::cast(1e-2),
            bounds: (F::cast(100.0) * F::epsilon(), F::cast(1e10)),
        }
    }
}

impl<F: Float> ParamTuning<F> {
    /// Starting (or constant) value
    pub fn init(&self) -> F {
        match self {
            ParamTuning::Fixed(v) => *v,
            ParamTuning::Optimized { init, .. } => *init,
        }
    }

    /// Bounds used by the optimizer, a fixed value gives identical bounds
    pub fn bounds(&self) -> (F, F) {
        match self {
            ParamTuning::Fixed(v) => (*v, *v),
            ParamTuning::Optimized { bounds, .. } => *bounds,
        }
    }
}

/// Inducing points specification, one entry per output
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum Inducings<F: Float> {
    /// Given numbers of points laid on a uniform grid over the observed range
    /// of each input dimension
    Grid(Vec<usize>),
    /// Points are given as (npoints, nx) matrices
    Located(Vec<Array2<F>>),
}

/// Multi-output GP training method
#[derive(Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum TrainingMethod<F: Float> {
    #[default]
    /// Exact likelihood over the joint covariance of all outputs
    Full,
    /// Fully Independent Training Conditional sparse approximation
    Fitc(Inducings<F>),
}

/// A set of validated multi-output GP regression parameters.
#[derive(Clone)]
pub struct MultiGpValidParams<F: Float> {
    pub(crate) kernel: MultiKernelRef<F>,
    pub(crate) method: TrainingMethod<F>,
    /// FITC homoscedastic noise added to the diagonal correction
    pub(crate) noise: ParamTuning<F>,
    pub(crate) optimize_inducings: bool,
    pub(crate) max_iter: usize,
    pub(crate) tol: F,
    pub(crate) nugget: F,
}

impl<F: Float> MultiGpValidParams<F> {
    /// Get the multi-output kernel
    pub fn kernel(&self) -> &MultiKernelRef<F> {
        &self.kernel
    }

    /// Get the training method
    pub fn method(&self) -> &TrainingMethod<F> {
        &self.method
    }

    /// Get the FITC noise tuning
    pub fn noise(&self) -> &ParamTuning<F> {
        &self.noise
    }

    /// Whether inducing points locations are optimized (FITC)
    pub fn optimize_inducings(&self) -> bool {
        self.optimize_inducings
    }

    /// Get the max number of likelihood evaluations
    pub fn max_iter(&self) -> usize {
        self.max_iter
    }

    /// Get the relative tolerance on parameters
    pub fn tol(&self) -> F {
        self.tol
    }

    /// Get the nugget
    pub fn nugget(&self) -> F {
        self.nugget
    }
}

/// The set of hyperparameters that can be specified for the training of a
/// [`MultiOutputGpRegressor`](crate::MultiOutputGpRegressor).
#[derive(Clone)]
pub struct MultiGpParams<F: Float>(MultiGpValidParams<F>);

impl<F: Float> MultiGpParams<F> {
    /// A constructor given the multi-output kernel to be trained
    pub fn new(kernel: MultiKernelRef<F>) -> MultiGpParams<F> {
        Self(MultiGpValidParams {
            kernel,
            method: TrainingMethod::default(),
            noise: ParamTuning::default(),
            optimize_inducings: true,
            max_iter: DEFAULT_MAX_ITER,
            tol: F::cast(DEFAULT_TOL),
            nugget: default_nugget(),
        })
    }

    /// Set the training method
    pub fn method(mut self, method: TrainingMethod<F>) -> Self {
        self.0.method = method;
        self
    }

    /// Set the FITC noise tuning
    pub fn noise(mut self, noise: ParamTuning<F>) -> Self {
        self.0.noise = noise;
        self
    }

    /// Set whether FITC inducing points locations are optimized
    pub fn optimize_inducings(mut self, optimize: bool) -> Self {
        self.0.optimize_inducings = optimize;
        self
    }

    /// Set the max number of likelihood evaluations
    pub fn max_iter(mut self, max_iter: usize) -> Self {
        self.0.max_iter = max_iter;
        self
    }

    /// Set the relative tolerance on parameters
    pub fn tol(mut self, tol: F) -> Self {
        self.0.tol = tol;
        self
    }

    /// Set nugget.
    pub fn nugget(mut self, nugget: F) -> Self {
        self.0.nugget = nugget;
        self
    }
}

impl<F: Float> ParamGuard for MultiGpParams<F> {
    type Checked = MultiGpValidParams<F>;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        check_common(self.0.max_iter, self.0.tol, self.0.nugget)?;
        match self.0.noise {
            ParamTuning::Fixed(v) if v <= F::zero() => {
                return Err(GpError::InvalidValueError(format!(
                    "Fixed noise should be strictly positive, got {v}"
                )));
            }
            ParamTuning::Optimized { init, bounds } => {
                if bounds.0 <= F::zero() || bounds.0 > bounds.1 {
                    return Err(GpError::InvalidValueError(format!(
                        "Noise bounds ({}, {}) should be positive and ordered",
                        bounds.0, bounds.1
                    )));
                }
                if init < bounds.0 || init > bounds.1 {
                    return Err(GpError::InvalidValueError(format!(
                        "Noise initial value {init} out of bounds ({}, {})",
                        bounds.0, bounds.1
                    )));
                }
            }
            _ => (),
        }
        match &self.0.method {
            TrainingMethod::Fitc(Inducings::Grid(counts)) if counts.is_empty() => {
                Err(GpError::InducingPointsError(
                    "Inducing points counts should not be empty".to_string(),
                ))
            }
            TrainingMethod::Fitc(Inducings::Located(z)) if z.is_empty() => Err(
                GpError::InducingPointsError("Inducing points should not be empty".to_string()),
            ),
            _ => Ok(&self.0),
        }
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::SquaredExponentialKernel;
    use crate::multioutput_kernels::LmcKernel;
    use ndarray::array;

    fn lmc() -> MultiKernelRef<f64> {
        let k = SquaredExponentialKernel::new(array![1., 1., 0.1]).into_ref();
        LmcKernel::new(vec![k], vec![Array2::eye(2)])
            .unwrap()
            .into_ref()
    }

    #[test]
    fn test_gp_params_check() {
        let k = SquaredExponentialKernel::new(array![1., 1., 0.1]).into_ref();
        let valid = GpRegParams::new(k.clone()).max_iter(10).check().unwrap();
        assert_eq!(valid.max_iter(), 10);
        assert_eq!(valid.nugget(), 100. * f64::EPSILON);
        assert!(GpRegParams::new(k.clone()).max_iter(0).check().is_err());
        assert!(GpRegParams::new(k).nugget(-1.).check().is_err());
    }

    #[test]
    fn test_multi_params_check() {
        let valid = MultiGpParams::new(lmc()).check().unwrap();
        assert_eq!(*valid.method(), TrainingMethod::Full);
        assert_eq!(valid.noise().init(), 1e-2);
        assert!(valid.optimize_inducings());

        let bad_noise = MultiGpParams::new(lmc()).noise(ParamTuning::Optimized {
            init: 10.,
            bounds: (1e-3, 1.),
        });
        assert!(bad_noise.check().is_err());
        assert!(MultiGpParams::new(lmc())
            .noise(ParamTuning::Fixed(0.))
            .check()
            .is_err());
        assert!(MultiGpParams::new(lmc())
            .method(TrainingMethod::Fitc(Inducings::Grid(vec![])))
            .check()
            .is_err());
        let fixed = MultiGpParams::new(lmc())
            .noise(ParamTuning::Fixed(0.5))
            .check()
            .unwrap();
        assert_eq!(fixed.noise().bounds(), (0.5, 0.5));
    }
}
