use criterion::{criterion_group, criterion_main, Criterion};
use gplib::{Kernel, LmcKernel, MultiOutputGpRegressor, SquaredExponentialKernel};
use ndarray::{array, Array, Array2};
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;

fn criterion_kernel(c: &mut Criterion) {
    let mut rng = Xoshiro256Plus::seed_from_u64(42);
    let mut group = c.benchmark_group("kernel");
    for nt in [100, 400] {
        let xt = Array::random_using((nt, 3), Uniform::new(-1., 1.), &mut rng);
        let kernel = SquaredExponentialKernel::new(array![1.0, 0.5, 0.01]);

        group.bench_function(format!("se eval {nt}"), |b| {
            b.iter(|| std::hint::black_box(kernel.eval(xt.view(), xt.view()).expect("eval")))
        });
        group.bench_function(format!("se derivate {nt}"), |b| {
            b.iter(|| std::hint::black_box(kernel.derivate(1, xt.view(), xt.view()).expect("derivate")))
        });
    }
    group.finish();
}

fn criterion_likelihood(c: &mut Criterion) {
    let mut rng = Xoshiro256Plus::seed_from_u64(42);
    let mut group = c.benchmark_group("likelihood");
    group.sample_size(20);
    for nt in [100, 300] {
        let xt: Vec<Array2<f64>> = (0..2)
            .map(|_| Array::random_using((nt, 1), Uniform::new(0., 10.), &mut rng))
            .collect();
        let yt = vec![xt[0].column(0).mapv(f64::sin), xt[1].column(0).mapv(f64::cos)];
        let se = SquaredExponentialKernel::new(array![1.0, 1.0, 0.01]).into_ref();
        let lmc = LmcKernel::new(vec![se], vec![array![[1.0, 0.5], [0.5, 1.0]]])
            .expect("LMC kernel")
            .into_ref();

        let mut exact = MultiOutputGpRegressor::with_kernel(lmc.clone());
        exact
            .set_training_set(xt.clone(), yt.clone())
            .expect("training set");
        group.bench_function(format!("exact {nt}x2"), |b| {
            b.iter(|| std::hint::black_box(exact.log_marginal_gradient().expect("exact gradient")))
        });

        let mut fitc = MultiOutputGpRegressor::with_kernel(lmc);
        fitc.set_training_set(xt, yt).expect("training set");
        fitc.train_fitc(1, 1e-6, &[20, 20]).expect("FITC setup");
        group.bench_function(format!("fitc {nt}x2"), |b| {
            b.iter(|| std::hint::black_box(fitc.log_marginal_gradient().expect("FITC gradient")))
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_kernel, criterion_likelihood);
criterion_main!(benches);
