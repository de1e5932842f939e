use crate::benchmarks::{BenchDevice, BenchDeviceHandler};
use candle::{DType, Device, Tensor};
use candle_vision_ops::{
    three_interpolate, three_interpolate_backward, three_interpolate_weights, three_nn,
};
use criterion::{criterion_group, Criterion, Throughput};
use std::hint::black_box;
use std::time::Instant;

fn run_benchmark(c: &mut Criterion, device: &Device, dtype: DType, name: &str) {
    // Feature propagation from 1024 to 4096 points, as in a point-cloud decoder.
    let (b, channels, m, n) = (4, 128, 1024, 4096);
    let features = Tensor::randn(0f32, 1., (b, channels, m), device)
        .unwrap()
        .to_dtype(dtype)
        .unwrap();
    let source = Tensor::rand(0f32, 1., (b, m, 3), device).unwrap();
    let target = Tensor::rand(0f32, 1., (b, n, 3), device).unwrap();
    let (dist, index) = three_nn(&target, &source).unwrap();
    let weight = three_interpolate_weights(&dist)
        .unwrap()
        .to_dtype(dtype)
        .unwrap();
    let grad = Tensor::ones((b, channels, n), dtype, device).unwrap();

    let bytes = b * channels * n * dtype.size_in_bytes();
    let mut group = c.benchmark_group(device.bench_name(name));
    group.throughput(Throughput::Bytes(bytes as u64));
    group.bench_function("fwd", |bencher| {
        bencher.iter_custom(|iters| {
            let start = Instant::now();
            for _i in 0..iters {
                three_interpolate(black_box(&features), black_box(&index), black_box(&weight))
                    .unwrap();
            }
            device.sync().unwrap();
            start.elapsed()
        })
    });
    group.bench_function("bwd", |bencher| {
        bencher.iter_custom(|iters| {
            let start = Instant::now();
            for _i in 0..iters {
                three_interpolate_backward(black_box(&grad), &index, &weight, m).unwrap();
            }
            device.sync().unwrap();
            start.elapsed()
        })
    });
    group.finish();
}

fn criterion_benchmark(c: &mut Criterion) {
    let handler = BenchDeviceHandler::new().unwrap();
    for device in handler.devices {
        run_benchmark(c, &device, DType::F32, "three_interpolate_f32");
        run_benchmark(c, &device, DType::F16, "three_interpolate_f16");
    }
}

criterion_group!(benches, criterion_benchmark);
