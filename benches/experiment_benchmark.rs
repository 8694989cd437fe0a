use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use competing_risks::datasets::{generate_synthetic_competing, Dataset};
use competing_risks::driver::SearchSpace;
use competing_risks::metrics::cause_specific_c_index;
use competing_risks::optimization::negative_log_likelihood_and_gradient;
use competing_risks::{CauseSpecificCox, ParameterSampler};
use ndarray::Array1;

fn benchmark_cox_fitting(c: &mut Criterion) {
    let mut group = c.benchmark_group("cox_fitting");
    group.sample_size(20);

    for &n_samples in [200, 1000, 5000].iter() {
        let mut data = generate_synthetic_competing(n_samples, 42).unwrap();
        data.standardize_covariates().unwrap();
        let split = n_samples * 9 / 10;
        let train = data.subset(&(0..split).collect::<Vec<_>>()).unwrap();
        let val = data.subset(&(split..n_samples).collect::<Vec<_>>()).unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(n_samples), &n_samples, |b, _| {
            b.iter(|| {
                let mut model = CauseSpecificCox::new()
                    .with_learning_rate(1e-2)
                    .with_max_epochs(20)
                    .with_batch_size(100);
                model.fit(black_box(&train), black_box(&val), 2).unwrap();
            });
        });
    }
    group.finish();
}

fn benchmark_partial_likelihood(c: &mut Criterion) {
    let mut group = c.benchmark_group("partial_likelihood");

    for &n_samples in [1000, 10000].iter() {
        let data = generate_synthetic_competing(n_samples, 7).unwrap();
        let events = data.cause_indicator(1);
        let beta = Array1::from_elem(data.n_features(), 0.1);

        group.bench_with_input(BenchmarkId::from_parameter(n_samples), &n_samples, |b, _| {
            b.iter(|| {
                negative_log_likelihood_and_gradient(
                    black_box(data.covariates()),
                    black_box(data.times()),
                    black_box(&events),
                    black_box(beta.view()),
                )
            });
        });
    }
    group.finish();
}

fn benchmark_prediction(c: &mut Criterion) {
    let mut group = c.benchmark_group("prediction");

    let mut data = generate_synthetic_competing(2000, 3).unwrap();
    data.standardize_covariates().unwrap();
    let mut model = CauseSpecificCox::new().with_max_epochs(20).with_learning_rate(1e-2);
    model.fit(&data, &data, 2).unwrap();
    let times = Array1::linspace(0.1, 10.0, 100);

    group.bench_function("cumulative_incidence", |b| {
        b.iter(|| model.predict_cif(black_box(data.covariates()), black_box(times.view())).unwrap());
    });

    let risk = model.predict_risk(data.covariates(), 1).unwrap();
    group.bench_function("cause_specific_c_index", |b| {
        b.iter(|| {
            cause_specific_c_index(
                black_box(risk.view()),
                black_box(data.times()),
                black_box(data.events()),
                1,
            )
            .unwrap()
        });
    });
    group.finish();
}

fn benchmark_parameter_sampling(c: &mut Criterion) {
    let mut group = c.benchmark_group("parameter_sampling");
    let grid = SearchSpace::new(Dataset::Seer, 1000).nfg().unwrap();

    for &n_iter in [10, 100, 512].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(n_iter), &n_iter, |b, &n_iter| {
            b.iter(|| ParameterSampler::new(grid.clone(), n_iter, black_box(0)).sample().unwrap());
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    benchmark_cox_fitting,
    benchmark_partial_likelihood,
    benchmark_prediction,
    benchmark_parameter_sampling
);
criterion_main!(benches);
