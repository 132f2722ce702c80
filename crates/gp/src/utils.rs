//! Linear algebra helpers shared by the gaussian, kernel and regression modules.
//!
//! Flat parameter vectors handled by [`flatten_matrices`] and [`unflatten`] store
//! matrix entries in row-major order, one matrix after the other.
use crate::errors::{GpError, Result};
use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, ArrayView2, Data, Ix1, Ix2, Zip};

/// Value substituted to exact zeros by [`force_diag`]
pub const MIN_DIAG_VALUE: f64 = 1e-10;

/// Inverse of an upper triangular matrix `U` computed row by row.
///
/// Fails if `U` is not square or has a zero pivot.
pub fn upper_triangular_inverse<F: Float>(
    upper_t: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Result<Array2<F>> {
    let d = upper_t.nrows();
    if d != upper_t.ncols() {
        return Err(GpError::InvalidValueError(format!(
            "Triangular inversion requires a square matrix, got ({}, {})",
            d,
            upper_t.ncols()
        )));
    }
    let mut ans = Array2::zeros((d, d));
    let mut tmp = vec![F::zero(); d];
    for i in 0..d {
        let pivot = upper_t[[i, i]];
        if pivot == F::zero() {
            return Err(GpError::InvalidValueError(format!(
                "Triangular inversion: zero pivot at index {i}"
            )));
        }
        ans[[i, i]] = F::one() / pivot;
        for j in (i + 1)..d {
            tmp[j] = upper_t[[i, j]] / pivot;
        }
        for j in (i + 1)..d {
            let factor = -tmp[j] / upper_t[[j, j]];
            ans[[i, j]] = factor;
            for k in (j + 1)..d {
                tmp[k] += factor * upper_t[[j, k]];
            }
        }
    }
    Ok(ans)
}

/// Returns the components of `v` for which `observed` is true
pub fn get_observed_only<F: Float>(
    v: &ArrayBase<impl Data<Elem = F>, Ix1>,
    observed: &[bool],
) -> Result<Array1<F>> {
    if v.len() != observed.len() {
        return Err(GpError::InvalidValueError(format!(
            "Observation mask length {} does not match vector length {}",
            observed.len(),
            v.len()
        )));
    }
    Ok(v
        .iter()
        .zip(observed)
        .filter_map(|(val, obs)| if *obs { Some(*val) } else { None })
        .collect())
}

/// Splits indices `0..predicates.len()` into the ones where the predicate is true
/// and the ones where it is false, each part keeping the original order.
pub fn split_indices(predicates: &[bool]) -> (Vec<usize>, Vec<usize>) {
    let mut true_part = Vec::with_capacity(predicates.len());
    let mut false_part = Vec::new();
    for (i, p) in predicates.iter().enumerate() {
        if *p {
            true_part.push(i);
        } else {
            false_part.push(i);
        }
    }
    (true_part, false_part)
}

/// Returns true if all values are true (also true for an empty slice)
pub fn all_true(values: &[bool]) -> bool {
    values.iter().all(|v| *v)
}

/// Checks whether the matrix is square and symmetric up to round-off errors
pub fn check_symmetric<F: Float>(a: &ArrayBase<impl Data<Elem = F>, Ix2>) -> bool {
    if !a.is_square() {
        return false;
    }
    let tol = F::cast(1e-10);
    Zip::from(a)
        .and(a.t())
        .all(|&v, &w| (v - w).abs() <= tol * (F::one() + v.abs().max(w.abs())))
}

/// Returns `(A + A') / 2`, `A` must be square
pub fn force_symmetric<F: Float>(a: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Result<Array2<F>> {
    if !a.is_square() {
        return Err(GpError::InvalidValueError(format!(
            "Cannot symmetrize a non square matrix of shape {:?}",
            a.shape()
        )));
    }
    Ok((a.to_owned() + a.t()).mapv(|v| v * F::cast(0.5)))
}

/// Returns a copy of `A` where exact zeros of the diagonal are replaced by [`MIN_DIAG_VALUE`]
pub fn force_diag<F: Float>(a: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
    let mut res = a.to_owned();
    res.diag_mut().mapv_inplace(|v| {
        if v == F::zero() {
            F::cast(MIN_DIAG_VALUE)
        } else {
            v
        }
    });
    res
}

/// Concatenates the given vectors
pub fn flatten_vectors<F: Float>(y: &[Array1<F>]) -> Array1<F> {
    y.iter().flat_map(|v| v.iter().copied()).collect()
}

/// Concatenates the entries of the given matrices, row-major, matrix after matrix
pub fn flatten_matrices<F: Float>(m: &[Array2<F>]) -> Array1<F> {
    m.iter().flat_map(|v| v.iter().copied()).collect()
}

/// Rebuilds matrices of given `(nrows, ncols)` shapes from flat `params`,
/// reverse operation of [`flatten_matrices`].
pub fn unflatten<F: Float>(params: &[F], shapes: &[(usize, usize)]) -> Result<Vec<Array2<F>>> {
    let expected: usize = shapes.iter().map(|(r, c)| r * c).sum();
    if expected != params.len() {
        return Err(GpError::InvalidValueError(format!(
            "Cannot unflatten {} values into matrices holding {} values",
            params.len(),
            expected
        )));
    }
    let mut start = 0;
    let mut res = Vec::with_capacity(shapes.len());
    for &(r, c) in shapes {
        let values = params[start..start + r * c].to_vec();
        res.push(Array2::from_shape_vec((r, c), values).map_err(|e| {
            GpError::InvalidValueError(format!("Cannot unflatten parameters: {e}"))
        })?);
        start += r * c;
    }
    Ok(res)
}

/// Splits `theta` into its first `n_first` values and the remaining ones
pub fn split_params<F: Float>(theta: &[F], n_first: usize) -> Result<(Array1<F>, Array1<F>)> {
    if n_first > theta.len() {
        return Err(GpError::InvalidValueError(format!(
            "Cannot take {} first values out of {} parameters",
            n_first,
            theta.len()
        )));
    }
    let (first, rest) = theta.split_at(n_first);
    Ok((Array1::from(first.to_vec()), Array1::from(rest.to_vec())))
}

/// Computes squared euclidean distances between each row of x and each row of y
/// resulting in a 2d array of shape (nrows(x), nrows(y))
/// *Panics* if x and y have not the same column numbers
pub fn pairwise_sq_distances<F: Float>(
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
    y: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> Array2<F> {
    assert!(x.ncols() == y.ncols());

    let mut result = Array2::zeros((x.nrows(), y.nrows()));
    for (i, x_row) in x.rows().into_iter().enumerate() {
        for (j, y_row) in y.rows().into_iter().enumerate() {
            result[[i, j]] = Zip::from(&x_row)
                .and(&y_row)
                .fold(F::zero(), |acc, &a, &b| acc + (a - b) * (a - b));
        }
    }
    result
}

/// True when both views look at the very same memory with the same layout
pub(crate) fn is_same_view<F: Float>(x: &ArrayView2<F>, y: &ArrayView2<F>) -> bool {
    x.shape() == y.shape() && x.strides() == y.strides() && x.as_ptr() == y.as_ptr()
}

/// Row and column of the `entry`-th value (row-major) of a matrix of given shape
pub(crate) fn entry_position(entry: usize, shape: (usize, usize)) -> Result<(usize, usize)> {
    let (nrows, ncols) = shape;
    if entry >= nrows * ncols {
        return Err(GpError::IndexOutOfRangeError(format!(
            "entry {entry} does not address a ({nrows}, {ncols}) matrix"
        )));
    }
    Ok((entry / ncols, entry % ncols))
}

#[inline(always)]
pub(crate) fn into_f64<F: Float>(v: &F) -> f64 {
    v.to_f64().unwrap_or(f64::NAN)
}
