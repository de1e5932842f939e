use crate::benchmarks::{BenchDevice, BenchDeviceHandler};
use candle::{DType, Device, Module, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_vision_ops::{
    modulated_deform_conv2d, modulated_deform_conv2d_pack, DeformConvConfig,
    ModulatedDeformConv2dConfig,
};
use criterion::{criterion_group, Criterion, Throughput};
use std::hint::black_box;
use std::time::Instant;

fn run_benchmark(c: &mut Criterion, device: &Device, dtype: DType, name: &str) {
    let (channels, size) = match device {
        Device::Cpu => (64, 32),
        _ => (256, 64),
    };
    let cfg = DeformConvConfig {
        padding: (1, 1),
        ..Default::default()
    };
    let input = Tensor::randn(0f32, 1., (1, channels, size, size), device)
        .unwrap()
        .to_dtype(dtype)
        .unwrap();
    let weight = Tensor::randn(0f32, 0.1, (channels, channels, 3, 3), device)
        .unwrap()
        .to_dtype(dtype)
        .unwrap();
    let offset = Tensor::randn(0f32, 0.5, (1, 18, size, size), device)
        .unwrap()
        .to_dtype(dtype)
        .unwrap();
    let mask = Tensor::rand(0f32, 1., (1, 9, size, size), device)
        .unwrap()
        .to_dtype(dtype)
        .unwrap();

    let bytes = input.dims().iter().product::<usize>() * dtype.size_in_bytes();
    let mut group = c.benchmark_group(device.bench_name(name));
    group.throughput(Throughput::Bytes(bytes as u64));
    group.bench_function("fwd", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            for _i in 0..iters {
                modulated_deform_conv2d(
                    black_box(&input),
                    black_box(&offset),
                    black_box(&mask),
                    black_box(&weight),
                    None,
                    &cfg,
                )
                .unwrap();
            }
            device.sync().unwrap();
            start.elapsed()
        })
    });
    group.finish();
}

fn run_pack_benchmark(c: &mut Criterion, device: &Device, name: &str) {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let cfg = ModulatedDeformConv2dConfig {
        padding: 1,
        ..Default::default()
    };
    let layer = modulated_deform_conv2d_pack(32, 32, 3, cfg, true, vb).unwrap();
    let input = Tensor::randn(0f32, 1., (2, 32, 32, 32), device).unwrap();

    let bytes = input.dims().iter().product::<usize>() * DType::F32.size_in_bytes();
    let mut group = c.benchmark_group(device.bench_name(name));
    group.throughput(Throughput::Bytes(bytes as u64));
    group.bench_function("fwd_bwd", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();
            for _i in 0..iters {
                let ys = layer.forward(black_box(&input)).unwrap();
                ys.sum_all().unwrap().backward().unwrap();
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
        run_benchmark(c, &device, DType::F32, "modulated_deform_conv2d_f32");
        if !matches!(device, Device::Cpu) {
            run_benchmark(c, &device, DType::F16, "modulated_deform_conv2d_f16");
        }
        run_pack_benchmark(c, &device, "modulated_deform_conv2d_pack");
    }
}

criterion_group!(benches, criterion_benchmark);
