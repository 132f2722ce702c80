use thiserror::Error;

/// A result type for GP regression algorithms
pub type Result<T> = std::result::Result<T, GpError>;

/// An error when using kernels, [`MultivariateGaussian`](crate::MultivariateGaussian)
/// or one of the [`GpRegressor`](crate::GpRegressor) and
/// [`MultiOutputGpRegressor`](crate::MultiOutputGpRegressor) algorithms
#[derive(Error, Debug)]
pub enum GpError {
    /// When LikelihoodComputation computation fails
    #[error("LikelihoodComputation computation error: {0}")]
    LikelihoodComputationError(String),
    /// When linear algebra computation fails
    #[error(transparent)]
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When a linfa error occurs
    #[error(transparent)]
    LinfaError(#[from] linfa::error::Error),
    /// When the training set is empty or inconsistent
    #[error("Training set error: {0}")]
    TrainingSetError(String),
    /// When inducing points specification is not consistent with training data
    #[error("Inducing points error: {0}")]
    InducingPointsError(String),
    /// When an index does not address an existing parameter
    #[error("Index out of range: {0}")]
    IndexOutOfRangeError(String),
    /// When an object is used before being fully set up (missing kernel, ...)
    #[error("Invalid state: {0}")]
    InvalidStateError(String),
    /// When a value is invalid (length mismatch, out of bounds, ...)
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
}
