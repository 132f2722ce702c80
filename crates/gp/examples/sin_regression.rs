use gplib::{Kernel, LmcKernel, MultiOutputGpRegressor, SquaredExponentialKernel};
use gplib::{GpRegressor, Inducings, ParamTuning, TrainingMethod};
use ndarray::{array, concatenate, Array, Array1, Axis};
use ndarray_npy::write_npy;
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;

fn main() {
    env_logger::init();

    let mut rng = Xoshiro256Plus::seed_from_u64(42);
    let xt = Array1::linspace(0., 49.5, 100).insert_axis(Axis(1));
    let noise = Array::random_using(100, Normal::new(0., 0.05).expect("normal law"), &mut rng);
    let yt = xt.column(0).mapv(f64::sin) + noise;

    let mut se = SquaredExponentialKernel::new(array![1.0, 1.0, 0.01]);
    se.set_lower_bounds(&array![1e-5, 1e-5, 1e-4])
        .expect("lower bounds");
    se.set_upper_bounds(&array![5., 5., 0.1]).expect("upper bounds");
    let se = se.into_ref();

    println!("Train single-output GP of 'sin' on {} noisy points", xt.nrows());
    let mut gp = GpRegressor::with_kernel(se.clone());
    gp.set_training_set(xt.clone(), yt.clone())
        .expect("training set");
    let ll = gp.train(200, 1e-6).expect("GP training");
    println!("log likelihood = {ll}, kernel = {}", se.borrow());

    let xtest = Array1::linspace(0.2, 49.2, 50).insert_axis(Axis(1));
    let pred = gp.full_predict(&xtest).expect("GP prediction");
    let sigma = pred.cov().diag().mapv(f64::sqrt);
    let err = pred.mean() - &xtest.column(0).mapv(f64::sin);
    println!("max abs error = {}", err.fold(0., |acc: f64, v| acc.max(v.abs())));
    let res = concatenate![
        Axis(1),
        xtest.view(),
        pred.mean().view().insert_axis(Axis(1)),
        sigma.view().insert_axis(Axis(1))
    ];
    write_npy("sin_regression_gp.npy", &res).expect("cannot save GP predictions");

    println!("Train 2-output FITC GP of 'sin' and 'cos' with 20 inducing points per output");
    let lmc = LmcKernel::new(vec![se], vec![array![[1.0, 0.0], [0.0, 1.0]]])
        .expect("LMC kernel")
        .into_ref();
    let ycos = xt.column(0).mapv(f64::cos);
    let mgp = MultiOutputGpRegressor::params(lmc)
        .method(TrainingMethod::Fitc(Inducings::Grid(vec![20, 20])))
        .noise(ParamTuning::Optimized {
            init: 1e-2,
            bounds: (1e-6, 1.),
        })
        .max_iter(100)
        .fit(vec![xt.clone(), xt], vec![yt, ycos])
        .expect("FITC training");
    println!("{mgp}");
    let preds = mgp
        .predict_outputs(&[xtest.clone(), xtest.clone()])
        .expect("FITC prediction");
    let res = concatenate![
        Axis(1),
        xtest.view(),
        preds[0].view().insert_axis(Axis(1)),
        preds[1].view().insert_axis(Axis(1))
    ];
    write_npy("sin_regression_fitc.npy", &res).expect("cannot save FITC predictions");
}
