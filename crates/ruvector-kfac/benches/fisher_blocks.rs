//! Benchmarks for Fisher block updates and products

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ndarray::{Array, ArrayD, IxDyn};
use rand::prelude::*;
use rand_distr::StandardNormal;
use ruvector_kfac::prelude::*;

fn randn(rng: &mut StdRng, shape: &[usize]) -> ArrayD<f64> {
    Array::from_shape_fn(IxDyn(shape), |_| rng.sample(StandardNormal))
}

fn registry() -> FactorRegistry {
    FactorRegistry::with_config(FactorConfig::default()).unwrap()
}

fn bench_fully_connected_kfac(c: &mut Criterion) {
    let mut group = c.benchmark_group("fully_connected_kfac");

    for (input_dim, output_dim) in [(32, 16), (64, 32), (128, 64)] {
        let batch_size = 32;
        let mut rng = StdRng::seed_from_u64(42);
        let registry = registry();

        let inputs = Tensor::new(randn(&mut rng, &[batch_size, input_dim]));
        let outputs = Tensor::zeros(&[batch_size, output_dim]);
        let grads = Tensor::new(randn(&mut rng, &[batch_size, output_dim]));
        let mut block = FullyConnectedKFACBasicFB::new(&registry, true);
        block.register_additional_tower(inputs, outputs).unwrap();
        block
            .instantiate_factors(&[vec![vec![grads]]], 1e-3)
            .unwrap();
        block.register_inverse().unwrap();

        let label = format!("{}x{}", input_dim, output_dim);
        group.throughput(Throughput::Elements((input_dim * output_dim) as u64));

        group.bench_function(BenchmarkId::new("covariance_update", &label), |b| {
            b.iter(|| registry.make_covariance_updates_default().unwrap());
        });

        group.bench_function(BenchmarkId::new("inverse_update", &label), |b| {
            b.iter(|| {
                // a fresh covariance generation so the inverses are stale
                registry.make_covariance_updates_default().unwrap();
                registry.make_inverse_updates().unwrap();
            });
        });

        let gradient = Params::WeightAndBias(
            randn(&mut rng, &[input_dim, output_dim]),
            randn(&mut rng, &[output_dim]),
        );
        group.bench_with_input(
            BenchmarkId::new("multiply_inverse", &label),
            &gradient,
            |b, g| {
                b.iter(|| block.multiply_inverse(black_box(g)).unwrap());
            },
        );
    }

    group.finish();
}

fn bench_conv_kfc(c: &mut Criterion) {
    let mut group = c.benchmark_group("conv_kfc");

    for channels in [4, 8, 16] {
        let mut rng = StdRng::seed_from_u64(42);
        let registry = registry();
        let params = Params::Weight(Tensor::zeros(&[3, 3, channels, channels]));

        let inputs = Tensor::new(randn(&mut rng, &[8, 8, 8, channels]));
        let outputs = Tensor::zeros(&[8, 8, 8, channels]);
        let grads = Tensor::new(randn(&mut rng, &[8, 8, 8, channels]));
        let mut block = ConvKFCBasicFB::new(&registry, &params, Padding::Same).unwrap();
        block.register_additional_tower(inputs, outputs).unwrap();
        block
            .instantiate_factors(&[vec![vec![grads]]], 1e-3)
            .unwrap();
        block.register_inverse().unwrap();

        group.throughput(Throughput::Elements((9 * channels * channels) as u64));

        group.bench_function(BenchmarkId::new("covariance_update", channels), |b| {
            b.iter(|| registry.make_covariance_updates_default().unwrap());
        });

        registry.make_inverse_updates().unwrap();
        let gradient = Params::Weight(randn(&mut rng, &[3, 3, channels, channels]));
        group.bench_with_input(
            BenchmarkId::new("multiply_inverse", channels),
            &gradient,
            |b, g| {
                b.iter(|| block.multiply_inverse(black_box(g)).unwrap());
            },
        );
    }

    group.finish();
}

fn bench_diagonal(c: &mut Criterion) {
    let mut group = c.benchmark_group("diagonal");

    for dim in [64, 256] {
        let batch_size = 32;
        let mut rng = StdRng::seed_from_u64(42);
        let registry = registry();

        let mut block = FullyConnectedDiagonalFB::new(&registry, false);
        block
            .register_additional_tower(
                Tensor::new(randn(&mut rng, &[batch_size, dim])),
                Tensor::zeros(&[batch_size, dim]),
            )
            .unwrap();
        let grads = Tensor::new(randn(&mut rng, &[batch_size, dim]));
        block
            .instantiate_factors(&[vec![vec![grads]]], 1e-3)
            .unwrap();
        block.register_inverse().unwrap();
        registry.make_covariance_updates_default().unwrap();
        registry.make_inverse_updates().unwrap();

        group.throughput(Throughput::Elements((dim * dim) as u64));

        let gradient = Params::Weight(randn(&mut rng, &[dim, dim]));
        group.bench_with_input(
            BenchmarkId::new("fc_multiply_inverse", dim),
            &gradient,
            |b, g| {
                b.iter(|| block.multiply_inverse(black_box(g)).unwrap());
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_fully_connected_kfac,
    bench_conv_kfc,
    bench_diagonal,
);
criterion_main!(benches);
