use crate::errors::{GpError, Result};
use crate::utils::{into_f64, split_indices};
use linfa::Float;
use ndarray::{arr1, Array1};
use std::cell::RefCell;

/// Stopping criteria of the hyperparameters optimization
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct OptimParams {
    pub max_eval: usize,
    pub xtol_rel: f64,
    pub ftol_rel: f64,
}

impl Default for OptimParams {
    fn default() -> Self {
        OptimParams {
            max_eval: 200,
            xtol_rel: 1e-6,
            ftol_rel: 1e-8,
        }
    }
}

/// Parameters whose lower and upper bounds coincide are held fixed: the optimizer
/// only sees the remaining (active) ones.
struct ReducedProblem {
    active: Vec<usize>,
    full: Vec<f64>,
}

impl ReducedProblem {
    fn new<F: Float>(param0: &Array1<F>, bounds: &[(F, F)]) -> Self {
        let movable: Vec<bool> = bounds.iter().map(|(lo, up)| lo < up).collect();
        let (active, _) = split_indices(&movable);
        // start point clamped into the box
        let full = param0
            .iter()
            .zip(bounds)
            .map(|(v, (lo, up))| into_f64(&v.max(*lo).min(*up)))
            .collect();
        ReducedProblem { active, full }
    }

    fn expand(&self, x: &[f64]) -> Vec<f64> {
        let mut full = self.full.clone();
        for (k, &i) in self.active.iter().enumerate() {
            full[i] = x[k];
        }
        full
    }

    fn reduce(&self, full: &[f64]) -> Vec<f64> {
        self.active.iter().map(|&i| full[i]).collect()
    }
}

/// Minimizes `objfn` starting from `param0` within `bounds` with NLOPT::Mma.
/// Returns the best objective value and the corresponding parameters.
#[cfg(feature = "nlopt")]
pub(crate) fn optimize_params<ObjF, F>(
    objfn: ObjF,
    param0: &Array1<F>,
    bounds: &[(F, F)],
    params: &OptimParams,
) -> (f64, Array1<f64>)
where
    ObjF: Fn(&[f64], Option<&mut [f64]>, &mut ()) -> f64,
    F: Float,
{
    use nlopt::*;

    let problem = ReducedProblem::new(param0, bounds);
    if problem.active.is_empty() {
        let fval = objfn(&problem.full, None, &mut ());
        return (fval, arr1(&problem.full));
    }
    let reduced = |x: &[f64], grad: Option<&mut [f64]>, u: &mut ()| -> f64 {
        reduced_objective(&objfn, &problem, x, grad, u)
    };

    let mut x = problem.reduce(&problem.full);
    let lower: Vec<f64> = problem.active.iter().map(|&i| into_f64(&bounds[i].0)).collect();
    let upper: Vec<f64> = problem.active.iter().map(|&i| into_f64(&bounds[i].1)).collect();

    // block to drop optimizer and allow problem borrowing after
    let res = {
        let mut optimizer = Nlopt::new(Algorithm::Mma, x.len(), reduced, Target::Minimize, ());
        let setup = optimizer
            .set_lower_bounds(&lower)
            .and_then(|_| optimizer.set_upper_bounds(&upper))
            .and_then(|_| optimizer.set_maxeval(params.max_eval as u32))
            .and_then(|_| optimizer.set_xtol_rel(params.xtol_rel))
            .and_then(|_| optimizer.set_ftol_rel(params.ftol_rel));
        if let Err(status) = setup {
            log::warn!("NLOPT Mma setup failed status={status:?}");
        }
        optimizer.optimize(&mut x)
    };
    match res {
        Ok((_, fmin)) => (fmin, arr1(&problem.expand(&x))),
        Err((status, fmin)) => {
            log::warn!("NLOPT Mma optimizer in GP stopped with status={status:?}");
            (fmin, arr1(&problem.expand(&x)))
        }
    }
}

/// Minimizes `objfn` starting from `param0` within `bounds` with Slsqp.
/// Returns the best objective value and the corresponding parameters.
#[cfg(not(feature = "nlopt"))]
pub(crate) fn optimize_params<ObjF, F>(
    objfn: ObjF,
    param0: &Array1<F>,
    bounds: &[(F, F)],
    params: &OptimParams,
) -> (f64, Array1<f64>)
where
    ObjF: Fn(&[f64], Option<&mut [f64]>, &mut ()) -> f64,
    F: Float,
{
    use slsqp::{minimize, StopTols};

    let problem = ReducedProblem::new(param0, bounds);
    if problem.active.is_empty() {
        let fval = objfn(&problem.full, None, &mut ());
        return (fval, arr1(&problem.full));
    }
    let reduced = |x: &[f64], grad: Option<&mut [f64]>, u: &mut ()| -> f64 {
        reduced_objective(&objfn, &problem, x, grad, u)
    };

    let xinit = problem.reduce(&problem.full);
    let bounds: Vec<_> = problem
        .active
        .iter()
        .map(|&i| (into_f64(&bounds[i].0), into_f64(&bounds[i].1)))
        .collect();
    let cons: Vec<fn(&[f64], Option<&mut [f64]>, &mut ()) -> f64> = vec![];

    match minimize(
        reduced,
        &xinit,
        &bounds,
        &cons,
        (),
        params.max_eval,
        Some(StopTols {
            xtol_rel: params.xtol_rel,
            ftol_rel: params.ftol_rel,
            ..StopTols::default()
        }),
    ) {
        Ok((_, x_opt, fval)) => (fval, arr1(&problem.expand(&x_opt))),
        Err((status, x_opt, fval)) => {
            log::warn!("Slsqp optimizer in GP stopped with status={status:?}");
            (fval, arr1(&problem.expand(&x_opt)))
        }
    }
}

/// Maximizes a log likelihood over parameters within `bounds` starting from `param0`.
///
/// `loglik(params, with_gradient)` sets the parameters and returns the log likelihood
/// and, when requested, its gradient. The first error it raises stops the search:
/// subsequent evaluations are short-circuited and the error is returned.
/// Otherwise returns the best parameters and the log likelihood found by the optimizer.
pub(crate) fn maximize_likelihood<F, L>(
    loglik: L,
    param0: &Array1<F>,
    bounds: &[(F, F)],
    params: &OptimParams,
) -> Result<(F, Array1<F>)>
where
    F: Float,
    L: Fn(&Array1<F>, bool) -> Result<(F, Option<Array1<F>>)>,
{
    let error: RefCell<Option<GpError>> = RefCell::new(None);
    let objfn = |x: &[f64], grad: Option<&mut [f64]>, _params: &mut ()| -> f64 {
        if error.borrow().is_some() {
            return f64::INFINITY;
        }
        if x.iter().any(|v| v.is_nan()) {
            *error.borrow_mut() = Some(GpError::LikelihoodComputationError(
                "NaN found in parameters".to_string(),
            ));
            return f64::INFINITY;
        }
        let p: Array1<F> = x.iter().map(|v| F::cast(*v)).collect();
        match loglik(&p, grad.is_some()) {
            Ok((ll, g)) => {
                if let (Some(grad), Some(g)) = (grad, g) {
                    grad.iter_mut()
                        .zip(g.iter())
                        .for_each(|(gi, v)| *gi = -into_f64(v));
                }
                let fval = -into_f64(&ll);
                if fval.is_nan() {
                    f64::INFINITY
                } else {
                    fval
                }
            }
            Err(err) => {
                *error.borrow_mut() = Some(err);
                f64::INFINITY
            }
        }
    };
    let (fmin, xopt) = optimize_params(objfn, param0, bounds, params);
    if let Some(err) = error.into_inner() {
        return Err(err);
    }
    Ok((F::cast(-fmin), xopt.mapv(|v| F::cast(v))))
}

fn reduced_objective<ObjF>(
    objfn: &ObjF,
    problem: &ReducedProblem,
    x: &[f64],
    grad: Option<&mut [f64]>,
    u: &mut (),
) -> f64
where
    ObjF: Fn(&[f64], Option<&mut [f64]>, &mut ()) -> f64,
{
    let full = problem.expand(x);
    match grad {
        Some(grad) => {
            let mut full_grad = vec![0.; full.len()];
            let fval = objfn(&full, Some(&mut full_grad), u);
            for (k, &i) in problem.active.iter().enumerate() {
                grad[k] = full_grad[i];
            }
            fval
        }
        None => objfn(&full, None, u),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::cell::Cell;

    fn shifted_quadratic(x: &[f64], grad: Option<&mut [f64]>, _u: &mut ()) -> f64 {
        let center = [1., -2., 0.5];
        if let Some(grad) = grad {
            for i in 0..3 {
                grad[i] = 2. * (x[i] - center[i]);
            }
        }
        x.iter().zip(center).map(|(v, c)| (v - c) * (v - c)).sum()
    }

    #[test]
    fn test_optimize_within_bounds() {
        let (fmin, xmin) = optimize_params(
            shifted_quadratic,
            &array![0., 0., 0.],
            &[(-5., 5.), (-1., 5.), (-5., 5.)],
            &OptimParams::default(),
        );
        // second coordinate stops on its lower bound
        assert_abs_diff_eq!(xmin, array![1., -1., 0.5], epsilon = 1e-4);
        assert_abs_diff_eq!(fmin, 1., epsilon = 1e-4);
    }

    #[test]
    fn test_fixed_parameters_are_kept() {
        let calls = Cell::new(0);
        let objfn = |x: &[f64], grad: Option<&mut [f64]>, u: &mut ()| -> f64 {
            calls.set(calls.get() + 1);
            assert_abs_diff_eq!(x[1], 3.);
            shifted_quadratic(x, grad, u)
        };
        let (_, xmin) = optimize_params(
            objfn,
            &array![0., 7., 0.],
            &[(-5., 5.), (3., 3.), (-5., 5.)],
            &OptimParams::default(),
        );
        assert!(calls.get() > 0);
        assert_abs_diff_eq!(xmin, array![1., 3., 0.5], epsilon = 1e-4);
    }

    #[test]
    fn test_maximize_likelihood() {
        let (ll, p) = maximize_likelihood(
            |p: &Array1<f64>, with_grad: bool| {
                let ll = -(p[0] - 2.).powi(2) - (p[1] + 1.).powi(2);
                let grad = with_grad.then(|| array![-2. * (p[0] - 2.), -2. * (p[1] + 1.)]);
                Ok((ll, grad))
            },
            &array![0., 0.],
            &[(-5., 5.), (-5., 5.)],
            &OptimParams::default(),
        )
        .unwrap();
        assert_abs_diff_eq!(p, array![2., -1.], epsilon = 1e-4);
        assert_abs_diff_eq!(ll, 0., epsilon = 1e-6);
    }

    #[test]
    fn test_likelihood_error_stops_search() {
        let calls = Cell::new(0);
        let res = maximize_likelihood(
            |p: &Array1<f64>, _with_grad: bool| {
                calls.set(calls.get() + 1);
                if calls.get() > 1 {
                    Err(GpError::LikelihoodComputationError("boom".to_string()))
                } else {
                    Ok((-p[0] * p[0], Some(array![-2. * p[0]])))
                }
            },
            &array![1.],
            &[(-5., 5.)],
            &OptimParams::default(),
        );
        assert!(matches!(res, Err(GpError::LikelihoodComputationError(_))));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_all_parameters_fixed() {
        let (fmin, xmin) = optimize_params(
            shifted_quadratic,
            &array![0., 0., 0.],
            &[(1., 1.), (-2., -2.), (0., 0.)],
            &OptimParams::default(),
        );
        assert_abs_diff_eq!(xmin, array![1., -2., 0.]);
        assert_abs_diff_eq!(fmin, 0.25);
    }
}
