use std::hint::black_box;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use deepset::{
    autodiff::Tape,
    batch::PaddedBatch,
    dataset::{generate, GeneratorConfig},
    nn::{masked_mse, Architecture, DeepSet},
    tensor::Tensor,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn aggregate(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(12345u64);
    let mut group = c.benchmark_group("aggregate");
    for n_sets in [10, 50, 100] {
        let sets = generate(&mut rng, n_sets, &GeneratorConfig::default());
        let batch = PaddedBatch::tight(&sets).unwrap();
        let elems: Vec<f32> = (0..batch.max_elements() * 32).map(|_| rng.gen()).collect();
        let embedded = Tensor::new(&[batch.max_elements(), 32], &elems).unwrap();
        let dense = batch.incidence.to_dense();
        group.bench_with_input(BenchmarkId::new("sparse", n_sets), &n_sets, |b, _| {
            b.iter(|| black_box(batch.incidence.matmul(&embedded)))
        });
        group.bench_with_input(BenchmarkId::new("dense", n_sets), &n_sets, |b, _| {
            b.iter(|| black_box(dense.matmul(&embedded)))
        });
    }
    group.finish();
}

fn train_step(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(12345u64);
    let sets = generate(&mut rng, 100, &GeneratorConfig::default());
    let batch = PaddedBatch::tight(&sets).unwrap();
    let architecture = Architecture {
        phi_width: 32,
        phi_depth: 2,
        rho_width: 32,
        rho_depth: 2,
    };
    let model = DeepSet::new(&mut rng, 2, &architecture);
    c.bench_function("forward_backward", |b| {
        b.iter(|| {
            let tape = Tape::default();
            let forward = model.forward(&tape, &batch).unwrap();
            let loss = masked_mse(&tape, &forward.output, &batch).unwrap();
            black_box(loss.gradients().unwrap());
        })
    });
}

criterion_group!(benches, aggregate, train_step);
criterion_main!(benches);
