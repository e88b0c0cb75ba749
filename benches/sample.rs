use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use ces_rs::{
    ChainSettings, ChainState, Constraint, FnSurrogate, GaussianPrior, LikelihoodEvaluator,
    ParameterPrior, Prediction,
};
use faer::Mat;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn make_chain(dim: usize, max_iterations: u64) -> ChainState<GaussianPrior, ChaCha8Rng> {
    let prior = GaussianPrior::from_parameters(
        (0..dim).map(|i| ParameterPrior::new(format!("x{}", i), 0., 1., Constraint::Unbounded)),
    )
    .unwrap();
    let evaluator =
        LikelihoodEvaluator::new(vec![0.5; dim], Mat::<f64>::identity(dim, dim).as_ref()).unwrap();
    let settings = ChainSettings {
        step_size: 0.3,
        max_iterations,
        burn_in: 0,
        ..Default::default()
    };
    ChainState::new(
        evaluator,
        prior,
        &settings,
        &vec![0.; dim],
        ChaCha8Rng::seed_from_u64(42),
    )
    .unwrap()
}

fn run_chain(dim: usize, max_iterations: u64) -> f64 {
    let mut chain = make_chain(dim, max_iterations);
    let mut surrogate = FnSurrogate::new(dim, |x: &[f64]| {
        Ok(Prediction::new(x.to_vec(), Some(vec![0.1; x.len()])))
    });
    chain.sample_to_end(&mut surrogate).unwrap();
    chain.acceptance_ratio()
}

fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("make chain 10", |b| {
        b.iter(|| make_chain(black_box(10), black_box(1000)))
    });
    c.bench_function("make chain 100", |b| {
        b.iter(|| make_chain(black_box(100), black_box(1000)))
    });

    c.bench_function("sample chain 10", |b| {
        b.iter(|| run_chain(black_box(10), black_box(1000)))
    });
    c.bench_function("sample chain 100", |b| {
        b.iter(|| run_chain(black_box(100), black_box(1000)))
    });

    let ratio = run_chain(10, 1000);
    let prediction = Prediction::new(vec![0.5; 10], Some(vec![0.1; 10]));
    c.bench_function("single step 10", |b| {
        b.iter_batched(
            || make_chain(10, 10),
            |mut chain| {
                chain.step(black_box(&prediction)).unwrap();
                chain
            },
            BatchSize::SmallInput,
        )
    });
    assert_eq!(run_chain(10, 1000), ratio);
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
