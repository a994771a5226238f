use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::time::Duration;

use burn::prelude::*;
use burn::tensor::Distribution;
use burn_ndarray::NdArray;

use surv_transformer_rs::survtransformer::architectures::base::attention::MixedAttention;
use surv_transformer_rs::survtransformer::architectures::base::config::ModelConfig;
use surv_transformer_rs::survtransformer::architectures::base::transformer::ExecutionContext;

type BenchBackend = NdArray<f32>;

fn create_layer(dim: usize, num_pathways: usize, device: &<BenchBackend as Backend>::Device) -> MixedAttention<BenchBackend> {
    let mut config = ModelConfig::new(vec![8; num_pathways]);
    config.wsi_projection_dim = dim;
    config.dropout = 0.0;
    let ctx = ExecutionContext::<BenchBackend>::new(42, device.clone());
    MixedAttention::new(&config, &ctx)
}

/// Linear attention should keep cost close to linear in the patch count.
fn bench_patch_scaling(c: &mut Criterion) {
    let device = <BenchBackend as Backend>::Device::default();
    let layer = create_layer(64, 8, &device);

    let mut group = c.benchmark_group("mixed_attention_patches");
    group.measurement_time(Duration::from_secs(10));
    for patches in [64usize, 256, 1024, 4096] {
        let tokens = Tensor::<BenchBackend, 3>::random([1, 8 + patches, 64], Distribution::Normal(0.0, 1.0), &device);
        group.bench_with_input(BenchmarkId::from_parameter(patches), &tokens, |b, tokens| {
            b.iter(|| black_box(layer.forward(tokens.clone(), None, false)))
        });
    }
    group.finish();
}

fn bench_with_attention_maps(c: &mut Criterion) {
    let device = <BenchBackend as Backend>::Device::default();
    let layer = create_layer(64, 8, &device);
    let tokens = Tensor::<BenchBackend, 3>::random([2, 8 + 512, 64], Distribution::Normal(0.0, 1.0), &device);

    c.bench_function("mixed_attention_return_attention", |b| {
        b.iter(|| black_box(layer.forward(tokens.clone(), None, true)))
    });
}

criterion_group!(benches, bench_patch_scaling, bench_with_attention_maps);
criterion_main!(benches);
