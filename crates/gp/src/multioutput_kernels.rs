//! Multi-output covariance functions.
//!
//! The linear model of coregionalization ([`LmcKernel`]) combines `Q` single-output
//! kernels `k_q` with `Q` coregionalization matrices `B_q` (D, D), D being the number
//! of outputs. The covariance between the points `X_i` of output `i` and the points
//! `Y_j` of output `j` is the block
//!
//! ```text
//! K_ij = sum_q B_q(i, j) k_q(X_i, Y_j)
//! ```
//!
//! Each `B_q` is parameterized by its lower triangular Cholesky factor `A_q`
//! (`B_q = A_q A_q'`) so that any parameter value gives a positive semi-definite matrix.
//!
//! The flat parameter vector is made of
//! 1. for each q, the D*D entries of `A_q` in row-major order, entries above the
//!    diagonal being pinned to zero,
//! 2. for each q, the hyperparameters of `k_q`,
//!
//! and derivative ids continue with
//! 3. for each output i, the entries of `X_i` in row-major order.

use crate::errors::{GpError, Result};
use crate::kernels::KernelRef;
use crate::utils::{flatten_matrices, unflatten};
use linfa::Float;
use linfa_linalg::cholesky::*;
use ndarray::{s, Array1, Array2, Zip};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Largest magnitude tolerated above the diagonal of a coregionalization factor
pub const UPPER_TRIANGLE_TOL: f64 = 1e-10;
/// Default lower bound of the lower triangular coregionalization factor entries
pub const DEFAULT_COREG_LOWER_BOUND: f64 = -10.;
/// Default upper bound of the lower triangular coregionalization factor entries
pub const DEFAULT_COREG_UPPER_BOUND: f64 = 10.;

/// Shared handle on a multi-output kernel
pub type MultiKernelRef<F> = Rc<RefCell<dyn MultiOutputKernel<F>>>;

/// A trait for covariance functions over several outputs
///
/// Point sets are given as one matrix per output. The resulting matrix is made of
/// blocks `(i, j)` of shape `(x[i].nrows(), y[j].nrows())`.
pub trait MultiOutputKernel<F: Float>: fmt::Display {
    /// Joint covariance matrix between point sets `x` and `y`.
    ///
    /// When `diag` is true only the diagonal is computed (the result is a diagonal
    /// matrix), which requires `x` and `y` to be the same list.
    fn eval(&self, x: &[Array2<F>], y: &[Array2<F>], diag: bool) -> Result<Array2<F>>;

    /// Derivative of `eval(x, y, diag)` with respect to the parameter `param_id`
    fn derivate(
        &self,
        param_id: usize,
        x: &[Array2<F>],
        y: &[Array2<F>],
        diag: bool,
    ) -> Result<Array2<F>>;

    /// Diagonal of `eval(x, x, false)` as a vector
    fn eval_diagonal(&self, x: &[Array2<F>]) -> Result<Array1<F>>;

    /// Diagonal of `derivate(param_id, x, x, false)` as a vector
    fn derivate_diagonal(&self, param_id: usize, x: &[Array2<F>]) -> Result<Array1<F>>;

    /// Number of outputs D
    fn n_outputs(&self) -> usize;

    /// Number of parameters (excluding input locations)
    fn n_params(&self) -> usize;

    /// Flat parameter vector
    fn params(&self) -> Array1<F>;

    /// Sets the flat parameter vector
    fn set_params(&mut self, params: &Array1<F>) -> Result<()>;

    /// Lower bounds of the flat parameter vector
    fn lower_bounds(&self) -> Array1<F>;

    /// Upper bounds of the flat parameter vector
    fn upper_bounds(&self) -> Array1<F>;

    /// Sets lower bounds of the flat parameter vector
    fn set_lower_bounds(&mut self, bounds: &Array1<F>) -> Result<()>;

    /// Sets upper bounds of the flat parameter vector
    fn set_upper_bounds(&mut self, bounds: &Array1<F>) -> Result<()>;
}

/// Linear model of coregionalization
pub struct LmcKernel<F: Float> {
    kernels: Vec<KernelRef<F>>,
    /// lower triangular factors of the coregionalization matrices
    a: Vec<Array2<F>>,
    a_lower_bounds: Array1<F>,
    a_upper_bounds: Array1<F>,
}

impl<F: Float> fmt::Display for LmcKernel<F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Lmc(outputs={}, kernels=[", self.n_outputs())?;
        for (q, k) in self.kernels.iter().enumerate() {
            if q > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", k.borrow())?;
        }
        write!(f, "])")
    }
}

fn same_list<F: Float>(x: &[Array2<F>], y: &[Array2<F>]) -> bool {
    x.len() == y.len() && std::ptr::eq(x.as_ptr(), y.as_ptr())
}

fn offsets<F: Float>(x: &[Array2<F>]) -> Vec<usize> {
    let mut res = Vec::with_capacity(x.len() + 1);
    let mut acc = 0;
    res.push(acc);
    for xi in x {
        acc += xi.nrows();
        res.push(acc);
    }
    res
}

fn accumulate<F: Float>(acc: &mut Option<Array2<F>>, coef: F, m: Array2<F>) {
    match acc {
        Some(a) => a.scaled_add(coef, &m),
        None => *acc = Some(m.mapv(|v| coef * v)),
    }
}

impl<F: Float> LmcKernel<F> {
    /// Constructor from one kernel and one coregionalization matrix (D, D) per latent
    /// function. Coregionalization matrices have to be positive definite.
    pub fn new(kernels: Vec<KernelRef<F>>, b_matrices: Vec<Array2<F>>) -> Result<Self> {
        if kernels.is_empty() || kernels.len() != b_matrices.len() {
            return Err(GpError::InvalidValueError(format!(
                "Lmc kernel requires as many kernels ({}) as coregionalization matrices ({}), at least one",
                kernels.len(),
                b_matrices.len()
            )));
        }
        let d = b_matrices[0].nrows();
        let a = Self::factorize(&b_matrices, d)?;
        let (lower, upper) = Self::uniform_bounds(
            a.len(),
            d,
            F::cast(DEFAULT_COREG_LOWER_BOUND),
            F::cast(DEFAULT_COREG_UPPER_BOUND),
        );
        Ok(LmcKernel {
            kernels,
            a,
            a_lower_bounds: lower,
            a_upper_bounds: upper,
        })
    }

    /// Wraps the kernel into a shared handle
    pub fn into_ref(self) -> MultiKernelRef<F> {
        Rc::new(RefCell::new(self))
    }

    fn factorize(b_matrices: &[Array2<F>], d: usize) -> Result<Vec<Array2<F>>> {
        if d == 0 {
            return Err(GpError::InvalidValueError(
                "Coregionalization matrices must not be empty".to_string(),
            ));
        }
        b_matrices
            .iter()
            .map(|b| {
                if b.dim() != (d, d) {
                    return Err(GpError::InvalidValueError(format!(
                        "Coregionalization matrix of shape {:?}, expected ({d}, {d})",
                        b.shape()
                    )));
                }
                Ok(b.cholesky()?)
            })
            .collect()
    }

    fn uniform_bounds(lf: usize, d: usize, lower: F, upper: F) -> (Array1<F>, Array1<F>) {
        let mut lo = Array1::zeros(lf * d * d);
        let mut up = Array1::zeros(lf * d * d);
        for q in 0..lf {
            for a in 0..d {
                for b in 0..=a {
                    lo[q * d * d + a * d + b] = lower;
                    up[q * d * d + a * d + b] = upper;
                }
            }
        }
        (lo, up)
    }

    /// Number of latent functions Q
    pub fn lf_number(&self) -> usize {
        self.a.len()
    }

    fn n_coreg_params(&self) -> usize {
        let d = self.n_outputs();
        self.a.len() * d * d
    }

    fn n_kernel_params(&self) -> usize {
        self.kernels.iter().map(|k| k.borrow().n_params()).sum()
    }

    fn b(&self, q: usize) -> Array2<F> {
        self.a[q].dot(&self.a[q].t())
    }

    fn check_index(&self, q: usize, a: usize, b: usize) -> Result<()> {
        let d = self.n_outputs();
        if q >= self.a.len() || a >= d || b >= d {
            return Err(GpError::IndexOutOfRangeError(format!(
                "Coregionalization entry ({q}, {a}, {b}) out of ({}, {d}, {d})",
                self.a.len()
            )));
        }
        Ok(())
    }

    fn check_lower_triangular(&self, values: &Array1<F>) -> Result<()> {
        let d = self.n_outputs();
        let tol = F::cast(UPPER_TRIANGLE_TOL);
        for (i, v) in values.iter().enumerate() {
            let e = i % (d * d);
            if e % d > e / d && v.abs() > tol {
                return Err(GpError::InvalidValueError(format!(
                    "Value {v} above the diagonal of coregionalization factor {}",
                    i / (d * d)
                )));
            }
        }
        Ok(())
    }

    /// Coregionalization matrices `B_q = A_q A_q'`
    pub fn params_k(&self) -> Vec<Array2<F>> {
        (0..self.a.len()).map(|q| self.b(q)).collect()
    }

    /// Sets the coregionalization matrices, one positive definite matrix per latent function
    pub fn set_params_k(&mut self, b_matrices: &[Array2<F>]) -> Result<()> {
        if b_matrices.len() != self.a.len() {
            return Err(GpError::InvalidValueError(format!(
                "Expected {} coregionalization matrices, got {}",
                self.a.len(),
                b_matrices.len()
            )));
        }
        self.a = Self::factorize(b_matrices, self.n_outputs())?;
        Ok(())
    }

    /// Entry `(a, b)` of the factor `A_q`
    pub fn param(&self, q: usize, a: usize, b: usize) -> Result<F> {
        self.check_index(q, a, b)?;
        Ok(self.a[q][[a, b]])
    }

    /// Sets entry `(a, b)` of the factor `A_q`, entries above the diagonal must stay zero
    pub fn set_param(&mut self, q: usize, a: usize, b: usize, value: F) -> Result<()> {
        self.check_index(q, a, b)?;
        if b > a {
            if value.abs() > F::cast(UPPER_TRIANGLE_TOL) {
                return Err(GpError::InvalidValueError(format!(
                    "Cannot set {value} above the diagonal of coregionalization factor {q}"
                )));
            }
            self.a[q][[a, b]] = F::zero();
        } else {
            self.a[q][[a, b]] = value;
        }
        Ok(())
    }

    /// Hyperparameter `id` of kernel `q`
    pub fn kernel_param(&self, q: usize, id: usize) -> Result<F> {
        let k = self.kernel_at(q)?;
        let params = k.borrow().params();
        params.get(id).copied().ok_or_else(|| {
            GpError::IndexOutOfRangeError(format!("Kernel {q} has no parameter {id}"))
        })
    }

    /// Sets hyperparameter `id` of kernel `q`
    pub fn set_kernel_param(&mut self, q: usize, id: usize, value: F) -> Result<()> {
        let k = self.kernel_at(q)?;
        let mut params = k.borrow().params();
        match params.get_mut(id) {
            Some(p) => *p = value,
            None => {
                return Err(GpError::IndexOutOfRangeError(format!(
                    "Kernel {q} has no parameter {id}"
                )))
            }
        }
        k.borrow_mut().set_params(&params)
    }

    fn kernel_at(&self, q: usize) -> Result<&KernelRef<F>> {
        self.kernels.get(q).ok_or_else(|| {
            GpError::IndexOutOfRangeError(format!(
                "Kernel {q} out of {} latent functions",
                self.kernels.len()
            ))
        })
    }

    /// Inner kernels, one per latent function
    pub fn kernels(&self) -> &[KernelRef<F>] {
        &self.kernels
    }

    /// Replaces the inner kernels, their number must not change
    pub fn set_kernels(&mut self, kernels: Vec<KernelRef<F>>) -> Result<()> {
        if kernels.len() != self.kernels.len() {
            return Err(GpError::InvalidValueError(format!(
                "Expected {} kernels, got {}",
                self.kernels.len(),
                kernels.len()
            )));
        }
        self.kernels = kernels;
        Ok(())
    }

    /// Same lower bound for all lower triangular coregionalization entries
    pub fn set_uniform_lower_bound(&mut self, bound: F) {
        let (lo, _) = Self::uniform_bounds(self.a.len(), self.n_outputs(), bound, F::zero());
        self.a_lower_bounds = lo;
    }

    /// Same upper bound for all lower triangular coregionalization entries
    pub fn set_uniform_upper_bound(&mut self, bound: F) {
        let (_, up) = Self::uniform_bounds(self.a.len(), self.n_outputs(), F::zero(), bound);
        self.a_upper_bounds = up;
    }

    fn set_bounds(&mut self, bounds: &Array1<F>, lower: bool) -> Result<()> {
        if bounds.len() != self.n_params() {
            return Err(GpError::InvalidValueError(format!(
                "Expected {} bounds, got {}",
                self.n_params(),
                bounds.len()
            )));
        }
        let n_a = self.n_coreg_params();
        let coreg = bounds.slice(s![..n_a]).to_owned();
        self.check_lower_triangular(&coreg)?;
        let mut start = n_a;
        for k in self.kernels.iter() {
            let n = k.borrow().n_params();
            let kb = bounds.slice(s![start..start + n]).to_owned();
            if lower {
                k.borrow_mut().set_lower_bounds(&kb)?;
            } else {
                k.borrow_mut().set_upper_bounds(&kb)?;
            }
            start += n;
        }
        if lower {
            self.a_lower_bounds = coreg;
        } else {
            self.a_upper_bounds = coreg;
        }
        Ok(())
    }

    fn check_inputs(&self, x: &[Array2<F>], y: &[Array2<F>], diag: bool) -> Result<()> {
        let d = self.n_outputs();
        if x.len() != d || y.len() != d {
            return Err(GpError::InvalidValueError(format!(
                "Expected point sets for {d} outputs, got {} and {}",
                x.len(),
                y.len()
            )));
        }
        if diag && !same_list(x, y) {
            return Err(GpError::InvalidValueError(
                "Diagonal evaluation requires the same point sets".to_string(),
            ));
        }
        Ok(())
    }

    /// Assembles the joint matrix from its blocks, `None` standing for a zero block
    fn assemble<G>(x: &[Array2<F>], y: &[Array2<F>], mut block: G) -> Result<Array2<F>>
    where
        G: FnMut(usize, usize) -> Result<Option<Array2<F>>>,
    {
        let rows = offsets(x);
        let cols = offsets(y);
        let mut res = Array2::zeros((rows[x.len()], cols[y.len()]));
        for i in 0..x.len() {
            for j in 0..y.len() {
                if let Some(b) = block(i, j)? {
                    res.slice_mut(s![rows[i]..rows[i + 1], cols[j]..cols[j + 1]])
                        .assign(&b);
                }
            }
        }
        Ok(res)
    }

    /// Assembles the joint diagonal from per output parts, `None` standing for zeros
    fn assemble_diagonal<G>(x: &[Array2<F>], mut part: G) -> Result<Array1<F>>
    where
        G: FnMut(usize) -> Result<Option<Array1<F>>>,
    {
        let rows = offsets(x);
        let mut res = Array1::zeros(rows[x.len()]);
        for i in 0..x.len() {
            if let Some(p) = part(i)? {
                res.slice_mut(s![rows[i]..rows[i + 1]]).assign(&p);
            }
        }
        Ok(res)
    }

    /// Locates a derivative id among coregionalization entries, kernel
    /// hyperparameters and input entries of `x`
    fn locate(&self, param_id: usize, x: &[Array2<F>]) -> Result<ParamLocation> {
        let d = self.n_outputs();
        let mut id = param_id;
        if id < self.n_coreg_params() {
            let e = id % (d * d);
            return Ok(ParamLocation::Coregionalization {
                q: id / (d * d),
                a: e / d,
                b: e % d,
            });
        }
        id -= self.n_coreg_params();
        for (q, k) in self.kernels.iter().enumerate() {
            let n = k.borrow().n_params();
            if id < n {
                return Ok(ParamLocation::Kernel { q, id });
            }
            id -= n;
        }
        for (output, xo) in x.iter().enumerate() {
            if id < xo.len() {
                return Ok(ParamLocation::Input { output, entry: id });
            }
            id -= xo.len();
        }
        Err(GpError::IndexOutOfRangeError(format!(
            "Parameter {param_id} out of {} parameters and input entries",
            param_id - id
        )))
    }

    fn coreg_derivative(&self, q: usize, a: usize, b: usize, i: usize, j: usize) -> F {
        let aq = &self.a[q];
        if b > a {
            return F::zero();
        }
        let mut res = F::zero();
        if i == a {
            res += aq[[j, b]];
        }
        if j == a {
            res += aq[[i, b]];
        }
        res
    }
}

enum ParamLocation {
    Coregionalization { q: usize, a: usize, b: usize },
    Kernel { q: usize, id: usize },
    Input { output: usize, entry: usize },
}

impl<F: Float> MultiOutputKernel<F> for LmcKernel<F> {
    fn eval(&self, x: &[Array2<F>], y: &[Array2<F>], diag: bool) -> Result<Array2<F>> {
        self.check_inputs(x, y, diag)?;
        if diag {
            return Ok(Array2::from_diag(&self.eval_diagonal(x)?));
        }
        let bs = self.params_k();
        Self::assemble(x, y, |i, j| {
            let mut acc = None;
            for (q, k) in self.kernels.iter().enumerate() {
                let bij = bs[q][[i, j]];
                if bij != F::zero() {
                    accumulate(&mut acc, bij, k.borrow().eval(x[i].view(), y[j].view())?);
                }
            }
            Ok(acc)
        })
    }

    fn derivate(
        &self,
        param_id: usize,
        x: &[Array2<F>],
        y: &[Array2<F>],
        diag: bool,
    ) -> Result<Array2<F>> {
        self.check_inputs(x, y, diag)?;
        if diag {
            return Ok(Array2::from_diag(&self.derivate_diagonal(param_id, x)?));
        }
        let same = same_list(x, y);
        match self.locate(param_id, x)? {
            ParamLocation::Coregionalization { q, a, b } => Self::assemble(x, y, |i, j| {
                let coef = self.coreg_derivative(q, a, b, i, j);
                if coef == F::zero() {
                    return Ok(None);
                }
                let k = self.kernels[q].borrow().eval(x[i].view(), y[j].view())?;
                Ok(Some(k.mapv(|v| coef * v)))
            }),
            ParamLocation::Kernel { q, id } => {
                let bq = self.b(q);
                Self::assemble(x, y, |i, j| {
                    if bq[[i, j]] == F::zero() {
                        return Ok(None);
                    }
                    let dk = self.kernels[q]
                        .borrow()
                        .derivate(id, x[i].view(), y[j].view())?;
                    Ok(Some(dk.mapv(|v| bq[[i, j]] * v)))
                })
            }
            ParamLocation::Input { output, entry } => {
                let bs = self.params_k();
                Self::assemble(x, y, |i, j| {
                    let mut acc = None;
                    if i == output {
                        for (q, k) in self.kernels.iter().enumerate() {
                            let k = k.borrow();
                            let dk = k.derivate(k.n_params() + entry, x[i].view(), y[j].view())?;
                            accumulate(&mut acc, bs[q][[i, j]], dk);
                        }
                    } else if same && j == output {
                        // block (i, o) is the transpose of the partial derivative of block (o, i)
                        for (q, k) in self.kernels.iter().enumerate() {
                            let k = k.borrow();
                            let dk =
                                k.derivate(k.n_params() + entry, x[output].view(), x[i].view())?;
                            accumulate(&mut acc, bs[q][[i, j]], dk.reversed_axes());
                        }
                    }
                    Ok(acc)
                })
            }
        }
    }

    fn eval_diagonal(&self, x: &[Array2<F>]) -> Result<Array1<F>> {
        self.check_inputs(x, x, false)?;
        let bs = self.params_k();
        Self::assemble_diagonal(x, |i| {
            let mut acc = Array1::zeros(x[i].nrows());
            for (q, k) in self.kernels.iter().enumerate() {
                acc.scaled_add(bs[q][[i, i]], &k.borrow().eval_diag(x[i].view())?);
            }
            Ok(Some(acc))
        })
    }

    fn derivate_diagonal(&self, param_id: usize, x: &[Array2<F>]) -> Result<Array1<F>> {
        self.check_inputs(x, x, false)?;
        match self.locate(param_id, x)? {
            ParamLocation::Coregionalization { q, a, b } => Self::assemble_diagonal(x, |i| {
                let coef = self.coreg_derivative(q, a, b, i, i);
                if coef == F::zero() {
                    return Ok(None);
                }
                let k = self.kernels[q].borrow().eval_diag(x[i].view())?;
                Ok(Some(k.mapv(|v| coef * v)))
            }),
            ParamLocation::Kernel { q, id } => {
                let bq = self.b(q);
                Self::assemble_diagonal(x, |i| {
                    let dk = self.kernels[q].borrow().derivate_diag(id, x[i].view())?;
                    Ok(Some(dk.mapv(|v| bq[[i, i]] * v)))
                })
            }
            ParamLocation::Input { output, entry } => {
                let bs = self.params_k();
                Self::assemble_diagonal(x, |i| {
                    if i != output {
                        return Ok(None);
                    }
                    let mut acc = Array1::zeros(x[i].nrows());
                    for (q, k) in self.kernels.iter().enumerate() {
                        let k = k.borrow();
                        let dk = k.derivate_diag(k.n_params() + entry, x[i].view())?;
                        acc.scaled_add(bs[q][[i, i]], &dk);
                    }
                    Ok(Some(acc))
                })
            }
        }
    }

    fn n_outputs(&self) -> usize {
        self.a[0].nrows()
    }

    fn n_params(&self) -> usize {
        self.n_coreg_params() + self.n_kernel_params()
    }

    fn params(&self) -> Array1<F> {
        let mut res = flatten_matrices(&self.a).to_vec();
        for k in self.kernels.iter() {
            res.extend(k.borrow().params().iter().copied());
        }
        Array1::from(res)
    }

    fn set_params(&mut self, params: &Array1<F>) -> Result<()> {
        if params.len() != self.n_params() {
            return Err(GpError::InvalidValueError(format!(
                "Expected {} parameters, got {}",
                self.n_params(),
                params.len()
            )));
        }
        let n_a = self.n_coreg_params();
        let coreg = params.slice(s![..n_a]).to_owned();
        self.check_lower_triangular(&coreg)?;
        let d = self.n_outputs();
        let shapes = vec![(d, d); self.a.len()];
        let mut a = unflatten(&coreg.to_vec(), &shapes)?;
        for aq in a.iter_mut() {
            Zip::indexed(aq).for_each(|(r, c), v| {
                if c > r {
                    *v = F::zero();
                }
            });
        }
        let mut start = n_a;
        for k in self.kernels.iter() {
            let n = k.borrow().n_params();
            k.borrow_mut()
                .set_params(&params.slice(s![start..start + n]).to_owned())?;
            start += n;
        }
        self.a = a;
        Ok(())
    }

    fn lower_bounds(&self) -> Array1<F> {
        let mut res = self.a_lower_bounds.to_vec();
        for k in self.kernels.iter() {
            res.extend(k.borrow().lower_bounds().iter().copied());
        }
        Array1::from(res)
    }

    fn upper_bounds(&self) -> Array1<F> {
        let mut res = self.a_upper_bounds.to_vec();
        for k in self.kernels.iter() {
            res.extend(k.borrow().upper_bounds().iter().copied());
        }
        Array1::from(res)
    }

    fn set_lower_bounds(&mut self, bounds: &Array1<F>) -> Result<()> {
        self.set_bounds(bounds, true)
    }

    fn set_upper_bounds(&mut self, bounds: &Array1<F>) -> Result<()> {
        self.set_bounds(bounds, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{Kernel, SquaredExponentialKernel};
    use approx::assert_abs_diff_eq;
    use finitediff::FiniteDiff;
    use ndarray::{array, Array};
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::RandomExt;
    use rand_xoshiro::Xoshiro256Plus;

    const KPARAMS: [[f64; 3]; 2] = [[1.2, 0.8, 0.1], [0.7, 1.5, 0.2]];

    fn b_matrices() -> Vec<Array2<f64>> {
        vec![
            array![[1.5, 0.4], [0.4, 1.0]],
            array![[0.8, -0.3], [-0.3, 0.6]],
        ]
    }

    fn lmc_with(params: Option<&Array1<f64>>) -> LmcKernel<f64> {
        let kernels: Vec<KernelRef<f64>> = KPARAMS
            .iter()
            .map(|p| SquaredExponentialKernel::new(Array1::from(p.to_vec())).into_ref())
            .collect();
        let mut lmc = LmcKernel::new(kernels, b_matrices()).unwrap();
        if let Some(p) = params {
            lmc.set_params(p).unwrap();
        }
        lmc
    }

    fn point_sets(sizes: &[usize], seed: u64) -> Vec<Array2<f64>> {
        let mut rng = Xoshiro256Plus::seed_from_u64(seed);
        sizes
            .iter()
            .map(|&n| Array::random_using((n, 2), Uniform::new(-1., 1.), &mut rng))
            .collect()
    }

    fn weighted_sum(m: &Array2<f64>) -> f64 {
        m.indexed_iter()
            .map(|((i, j), v)| v * (1. + 0.3 * i as f64 + 0.7 * j as f64))
            .sum()
    }

    #[test]
    fn test_coregionalization_factor() {
        let lmc = lmc_with(None);
        for (b, bq) in b_matrices().iter().zip(lmc.params_k()) {
            assert_abs_diff_eq!(*b, bq, epsilon = 1e-12);
        }
        assert_eq!(lmc.n_outputs(), 2);
        assert_eq!(lmc.lf_number(), 2);
        assert_eq!(lmc.n_params(), 2 * 4 + 2 * 3);
        assert_abs_diff_eq!(lmc.param(0, 0, 1).unwrap(), 0.);
        assert!(lmc.param(2, 0, 0).is_err());
    }

    #[test]
    fn test_eval_blocks() {
        let lmc = lmc_with(None);
        let x = point_sets(&[4, 3], 0);
        let k = lmc.eval(&x, &x, false).unwrap();
        assert_eq!(k.dim(), (7, 7));
        assert_abs_diff_eq!(k, k.t(), epsilon = 1e-12);
        let k0 = SquaredExponentialKernel::new(array![1.2, 0.8, 0.1]);
        let k1 = SquaredExponentialKernel::new(array![0.7, 1.5, 0.2]);
        let bs = b_matrices();
        let expected = k0.eval(x[0].view(), x[1].view()).unwrap() * bs[0][[0, 1]]
            + k1.eval(x[0].view(), x[1].view()).unwrap() * bs[1][[0, 1]];
        assert_abs_diff_eq!(k.slice(s![0..4, 4..7]), expected, epsilon = 1e-12);
        assert!(linfa_linalg::cholesky::Cholesky::cholesky(&k).is_ok());
    }

    #[test]
    fn test_diag_mode() {
        let lmc = lmc_with(None);
        let x = point_sets(&[4, 3], 1);
        let full = lmc.eval(&x, &x, false).unwrap();
        let diag = lmc.eval(&x, &x, true).unwrap();
        assert_abs_diff_eq!(diag, Array2::from_diag(&full.diag()), epsilon = 1e-12);
        let other = x.clone();
        assert!(lmc.eval(&x, &other, true).is_err());

        for id in 0..lmc.n_params() + 14 {
            let full = lmc.derivate(id, &x, &x, false).unwrap();
            let diag = lmc.derivate(id, &x, &x, true).unwrap();
            assert_abs_diff_eq!(diag, Array2::from_diag(&full.diag()), epsilon = 1e-10);
        }
        assert!(lmc.derivate_diagonal(lmc.n_params() + 14, &x).is_err());
    }

    #[test]
    fn test_params_round_trip() {
        let mut lmc = lmc_with(None);
        let p = lmc.params();
        lmc.set_params(&p).unwrap();
        assert_eq!(lmc.params(), p);

        let mut q = p.clone();
        q[0] = 2.;
        q[2] = -0.5;
        q[8 + 4] = 3.;
        lmc.set_params(&q).unwrap();
        assert_eq!(lmc.params(), q);
        assert_abs_diff_eq!(lmc.param(0, 0, 0).unwrap(), 2.);
        assert_abs_diff_eq!(lmc.kernel_param(1, 1).unwrap(), 3.);
    }

    #[test]
    fn test_upper_triangle_rejected() {
        let mut lmc = lmc_with(None);
        let mut p = lmc.params();
        p[1] = 0.5;
        assert!(lmc.set_params(&p).is_err());
        p[1] = 1e-12;
        assert!(lmc.set_params(&p).is_ok());
        assert_abs_diff_eq!(lmc.param(0, 0, 1).unwrap(), 0.);
        assert!(lmc.set_param(1, 0, 1, 0.3).is_err());
        assert!(lmc.set_param(1, 1, 0, 0.3).is_ok());
        assert!(lmc.set_params(&Array1::zeros(3)).is_err());
    }

    #[test]
    fn test_accessors() {
        let mut lmc = lmc_with(None);
        lmc.set_kernel_param(0, 2, 0.05).unwrap();
        assert_abs_diff_eq!(lmc.kernels()[0].borrow().params()[2], 0.05);
        assert!(lmc.set_kernel_param(0, 3, 0.05).is_err());
        assert!(lmc.kernel_param(2, 0).is_err());

        lmc.set_params_k(&[Array2::eye(2), Array2::eye(2) * 4.]).unwrap();
        assert_abs_diff_eq!(lmc.param(1, 1, 1).unwrap(), 2., epsilon = 1e-12);
        assert!(lmc.set_params_k(&[Array2::eye(2)]).is_err());

        let k = SquaredExponentialKernel::new(array![1., 1., 0.1]).into_ref();
        assert!(lmc.set_kernels(vec![k.clone()]).is_err());
        lmc.set_kernels(vec![k.clone(), k]).unwrap();
        assert_eq!(lmc.n_params(), 14);
    }

    #[test]
    fn test_bounds() {
        let mut lmc = lmc_with(None);
        let lo = lmc.lower_bounds();
        let up = lmc.upper_bounds();
        assert_eq!(lo.len(), lmc.n_params());
        assert_eq!(lo.slice(s![..4]), array![-10., 0., -10., -10.]);
        assert_eq!(up.slice(s![..4]), array![10., 0., 10., 10.]);
        assert_eq!(lo.slice(s![8..11]), array![1e-6, 1e-6, 1e-6]);

        lmc.set_uniform_lower_bound(-1.);
        lmc.set_uniform_upper_bound(1.);
        assert_eq!(lmc.lower_bounds().slice(s![4..8]), array![-1., 0., -1., -1.]);
        assert_eq!(lmc.upper_bounds().slice(s![4..8]), array![1., 0., 1., 1.]);

        let mut new_up = lmc.upper_bounds();
        new_up[13] = 0.5;
        lmc.set_upper_bounds(&new_up).unwrap();
        assert_abs_diff_eq!(lmc.kernels()[1].borrow().upper_bounds()[2], 0.5);
        new_up[1] = 1.;
        assert!(lmc.set_upper_bounds(&new_up).is_err());
        assert!(lmc.set_lower_bounds(&array![0.]).is_err());
    }

    #[test]
    fn test_derivate_params() {
        let lmc = lmc_with(None);
        let x = point_sets(&[3, 4], 2);
        let y = point_sets(&[2, 3], 3);
        let p0 = lmc.params();
        for same in [true, false] {
            let fd = p0.to_vec().central_diff(&|p: &Vec<f64>| -> f64 {
                let mut p = Array1::from(p.clone());
                // entries above the diagonal of both factors stay pinned
                p[1] = 0.;
                p[5] = 0.;
                let lmc = lmc_with(Some(&p));
                let k = if same {
                    lmc.eval(&x, &x, false).unwrap()
                } else {
                    lmc.eval(&x, &y, false).unwrap()
                };
                weighted_sum(&k)
            });
            for (id, expected) in fd.iter().enumerate() {
                let dk = if same {
                    lmc.derivate(id, &x, &x, false).unwrap()
                } else {
                    lmc.derivate(id, &x, &y, false).unwrap()
                };
                assert_abs_diff_eq!(weighted_sum(&dk), *expected, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_derivate_inputs() {
        let lmc = lmc_with(None);
        let sizes = [3, 4];
        let x = point_sets(&sizes, 4);
        let y = point_sets(&[2, 3], 5);
        let flat = flatten_matrices(&x).to_vec();
        let shapes: Vec<(usize, usize)> = sizes.iter().map(|&n| (n, 2)).collect();
        for same in [true, false] {
            let fd = flat.central_diff(&|v: &Vec<f64>| -> f64 {
                let xp = unflatten(v, &shapes).unwrap();
                let k = if same {
                    lmc.eval(&xp, &xp, false).unwrap()
                } else {
                    lmc.eval(&xp, &y, false).unwrap()
                };
                weighted_sum(&k)
            });
            for (entry, expected) in fd.iter().enumerate() {
                let id = lmc.n_params() + entry;
                let dk = if same {
                    lmc.derivate(id, &x, &x, false).unwrap()
                } else {
                    lmc.derivate(id, &x, &y, false).unwrap()
                };
                assert_abs_diff_eq!(weighted_sum(&dk), *expected, epsilon = 1e-5);
            }
        }
    }
}
