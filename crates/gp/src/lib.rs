//! This library implements [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process) regression
//! for single and multiple outputs.
//!
//! Building blocks are:
//! * [MultivariateGaussian]: gaussian distribution with density, sampling,
//!   marginalization and conditioning,
//! * [Kernel] covariance functions of a single output, implemented by the
//!   [SquaredExponentialKernel],
//! * [MultiOutputKernel] covariance functions of several outputs, implemented by the
//!   linear model of coregionalization [LmcKernel].
//!
//! Single-output regression is implemented by [GpRegressor] parameterized by [GpRegParams].
//! Its complexity is in O(N^3) in processing time and O(N^2) in memory where N is the
//! number of training points.
//!
//! Multi-output regression is implemented by [MultiOutputGpRegressor] parameterized by
//! [MultiGpParams]. Besides the exact method, it implements the Fully Independent
//! Training Conditional (FITC) sparse approximation which reduces the complexity
//! to O(N.M^2) in time and O(NM) in memory where M is the number of so-called
//! inducing points with M < N.
//!
//! Kernel hyperparameters are trained by maximizing the log marginal likelihood
//! with a gradient-based box-constrained optimizer (SLSQP, or NLopt MMA with the
//! `nlopt` feature).
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod algorithm;
mod errors;
mod kernels;
mod multi_algorithm;
mod multioutput_kernels;
mod mvgauss;
mod sparse_algorithm;

mod parameters;
pub mod utils;

mod optimization;

pub use algorithm::*;
pub use errors::*;
pub use kernels::*;
pub use multi_algorithm::*;
pub use multioutput_kernels::*;
pub use mvgauss::*;
pub use parameters::*;
