//! Three nearest neighbors interpolation.
//!
//! Used by point-cloud feature propagation layers: every target point gathers the features of
//! three source points and blends them with a per-neighbor weight.
//!
//! ```rust
//! use candle::{Device, Tensor};
//! use candle_vision_ops::three_interpolate::{three_interpolate, three_interpolate_weights, three_nn};
//! let dev = &Device::Cpu;
//! // Source points, one feature channel per point.
//! let source = Tensor::new(&[[[0f32, 0., 0.], [1., 0., 0.], [0., 1., 0.], [5., 5., 5.]]], dev)?;
//! let features = Tensor::new(&[[[1f32, 2., 3., 100.]]], dev)?;
//! let target = Tensor::new(&[[[0f32, 0., 0.]]], dev)?;
//! let (dist, index) = three_nn(&target, &source)?;
//! assert_eq!(index.to_vec3::<u32>()?, [[[0, 1, 2]]]);
//! let weight = three_interpolate_weights(&dist)?;
//! let ys = three_interpolate(&features, &index, &weight)?;
//! // The target sits on the first source point.
//! assert!((ys.flatten_all()?.to_vec1::<f32>()?[0] - 1.).abs() < 1e-4);
//! # Ok::<(), candle::Error>(())
//! ```
use candle::backend::BackendStorage;
use candle::{CpuStorage, Layout, Result, Shape, Tensor, WithDType, D};
use rayon::prelude::*;

use crate::error::OpError;
use crate::utils::{contiguous, index_vec, to_host};

/// Number of neighbors blended for each target point.
pub const NUM_NEIGHBORS: usize = 3;

const DIST_EPS: f64 = 1e-8;

struct ThreeInterpolate;

impl candle::CustomOp3 for ThreeInterpolate {
    fn name(&self) -> &'static str {
        "three-interpolate"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
        s3: &CpuStorage,
        l3: &Layout,
    ) -> Result<(CpuStorage, Shape)> {
        let (b, c, m) = l1.shape().dims3()?;
        let (_, n, _) = l2.shape().dims3()?;
        let index = index_vec(s2, l2, self.name())?;

        fn inner<T: WithDType>(
            features: &[T],
            l_features: &Layout,
            index: &[usize],
            weight: &[T],
            l_weight: &Layout,
            (b, c, m, n): (usize, usize, usize, usize),
        ) -> Result<(CpuStorage, Shape)> {
            let features = contiguous(features, l_features, "features")?;
            let weight = contiguous(weight, l_weight, "weight")?;
            let mut dst = vec![T::zero(); b * c * n];
            if !dst.is_empty() {
                dst.par_chunks_mut(n).enumerate().for_each(|(bc, dst)| {
                    let batch = bc / c;
                    let src = &features[bc * m..(bc + 1) * m];
                    let nn = batch * n * NUM_NEIGHBORS..(batch + 1) * n * NUM_NEIGHBORS;
                    let (index, weight) = (&index[nn.clone()], &weight[nn]);
                    for (j, dst) in dst.iter_mut().enumerate() {
                        let mut acc = 0f64;
                        for k in j * NUM_NEIGHBORS..(j + 1) * NUM_NEIGHBORS {
                            acc += weight[k].to_f64() * src[index[k]].to_f64();
                        }
                        *dst = T::from_f64(acc);
                    }
                });
            }
            Ok((T::to_cpu_storage_owned(dst), Shape::from((b, c, n))))
        }

        use CpuStorage as C;
        let dims = (b, c, m, n);
        match (s1, s3) {
            (C::BF16(f), C::BF16(w)) => inner::<half::bf16>(f, l1, &index, w, l3, dims),
            (C::F16(f), C::F16(w)) => inner::<half::f16>(f, l1, &index, w, l3, dims),
            (C::F32(f), C::F32(w)) => inner::<f32>(f, l1, &index, w, l3, dims),
            (C::F64(f), C::F64(w)) => inner::<f64>(f, l1, &index, w, l3, dims),
            _ => Err(candle::Error::UnsupportedDTypeForOp(s1.dtype(), self.name())),
        }
    }

    fn bwd(
        &self,
        features: &Tensor,
        index: &Tensor,
        weight: &Tensor,
        _res: &Tensor,
        grad_res: &Tensor,
    ) -> Result<(Option<Tensor>, Option<Tensor>, Option<Tensor>)> {
        let m = features.dim(2)?;
        let grad_res = grad_res.contiguous()?;
        let grad_features =
            grad_res.apply_op3_no_bwd(index, weight, &ThreeInterpolateBackward { m })?;
        let grad_weight = grad_res.apply_op3_no_bwd(features, index, &ThreeInterpolateWeightGrad)?;
        Ok((Some(grad_features), None, Some(grad_weight)))
    }
}

/// Scatter-add of the output gradient onto the source points.
struct ThreeInterpolateBackward {
    m: usize,
}

impl candle::CustomOp3 for ThreeInterpolateBackward {
    fn name(&self) -> &'static str {
        "three-interpolate-bwd"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
        s3: &CpuStorage,
        l3: &Layout,
    ) -> Result<(CpuStorage, Shape)> {
        let (b, c, n) = l1.shape().dims3()?;
        let index = index_vec(s2, l2, self.name())?;

        fn inner<T: WithDType>(
            grad: &[T],
            l_grad: &Layout,
            index: &[usize],
            weight: &[T],
            l_weight: &Layout,
            (b, c, m, n): (usize, usize, usize, usize),
        ) -> Result<(CpuStorage, Shape)> {
            let grad = contiguous(grad, l_grad, "grad")?;
            let weight = contiguous(weight, l_weight, "weight")?;
            let mut dst = vec![T::zero(); b * c * m];
            // Each (batch, channel) row of the result is owned by a single task.
            if !dst.is_empty() {
                dst.par_chunks_mut(m).enumerate().for_each(|(bc, dst)| {
                    let batch = bc / c;
                    let grad = &grad[bc * n..(bc + 1) * n];
                    let nn = batch * n * NUM_NEIGHBORS..(batch + 1) * n * NUM_NEIGHBORS;
                    let (index, weight) = (&index[nn.clone()], &weight[nn]);
                    let mut acc = vec![0f64; m];
                    for (j, g) in grad.iter().enumerate() {
                        let g = g.to_f64();
                        for k in j * NUM_NEIGHBORS..(j + 1) * NUM_NEIGHBORS {
                            acc[index[k]] += weight[k].to_f64() * g;
                        }
                    }
                    for (d, a) in dst.iter_mut().zip(acc) {
                        *d = T::from_f64(a)
                    }
                });
            }
            Ok((T::to_cpu_storage_owned(dst), Shape::from((b, c, m))))
        }

        use CpuStorage as C;
        let dims = (b, c, self.m, n);
        match (s1, s3) {
            (C::BF16(g), C::BF16(w)) => inner::<half::bf16>(g, l1, &index, w, l3, dims),
            (C::F16(g), C::F16(w)) => inner::<half::f16>(g, l1, &index, w, l3, dims),
            (C::F32(g), C::F32(w)) => inner::<f32>(g, l1, &index, w, l3, dims),
            (C::F64(g), C::F64(w)) => inner::<f64>(g, l1, &index, w, l3, dims),
            _ => Err(candle::Error::UnsupportedDTypeForOp(s1.dtype(), self.name())),
        }
    }
}

/// Gradient with respect to the interpolation weights, reduced over channels.
struct ThreeInterpolateWeightGrad;

impl candle::CustomOp3 for ThreeInterpolateWeightGrad {
    fn name(&self) -> &'static str {
        "three-interpolate-weight-bwd"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
        s3: &CpuStorage,
        l3: &Layout,
    ) -> Result<(CpuStorage, Shape)> {
        let (b, c, n) = l1.shape().dims3()?;
        let (_, _, m) = l2.shape().dims3()?;
        let index = index_vec(s3, l3, self.name())?;

        fn inner<T: WithDType>(
            grad: &[T],
            l_grad: &Layout,
            features: &[T],
            l_features: &Layout,
            index: &[usize],
            (b, c, m, n): (usize, usize, usize, usize),
        ) -> Result<(CpuStorage, Shape)> {
            let grad = contiguous(grad, l_grad, "grad")?;
            let features = contiguous(features, l_features, "features")?;
            let mut dst = vec![T::zero(); b * n * NUM_NEIGHBORS];
            if !dst.is_empty() {
                dst.par_chunks_mut(NUM_NEIGHBORS)
                    .enumerate()
                    .for_each(|(bn, dst)| {
                        let (batch, j) = (bn / n, bn % n);
                        for (k, dst) in dst.iter_mut().enumerate() {
                            let src = index[bn * NUM_NEIGHBORS + k];
                            let mut acc = 0f64;
                            for ch in 0..c {
                                let row = batch * c + ch;
                                acc += grad[row * n + j].to_f64() * features[row * m + src].to_f64();
                            }
                            *dst = T::from_f64(acc);
                        }
                    });
            }
            Ok((
                T::to_cpu_storage_owned(dst),
                Shape::from((b, n, NUM_NEIGHBORS)),
            ))
        }

        use CpuStorage as C;
        let dims = (b, c, m, n);
        match (s1, s2) {
            (C::BF16(g), C::BF16(f)) => inner::<half::bf16>(g, l1, f, l2, &index, dims),
            (C::F16(g), C::F16(f)) => inner::<half::f16>(g, l1, f, l2, &index, dims),
            (C::F32(g), C::F32(f)) => inner::<f32>(g, l1, f, l2, &index, dims),
            (C::F64(g), C::F64(f)) => inner::<f64>(g, l1, f, l2, &index, dims),
            _ => Err(candle::Error::UnsupportedDTypeForOp(s1.dtype(), self.name())),
        }
    }
}

/// Brute force search of the three closest source points of every target point.
struct ThreeNn;

impl candle::CustomOp2 for ThreeNn {
    fn name(&self) -> &'static str {
        "three-nn"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
    ) -> Result<(CpuStorage, Shape)> {
        let (b, n, _) = l1.shape().dims3()?;
        let (_, m, _) = l2.shape().dims3()?;

        fn inner<T: WithDType>(
            target: &[T],
            l_target: &Layout,
            source: &[T],
            l_source: &Layout,
            (b, n, m): (usize, usize, usize),
        ) -> Result<(CpuStorage, Shape)> {
            let target = contiguous(target, l_target, "target")?;
            let source = contiguous(source, l_source, "source")?;
            let mut dst = vec![0u32; b * n * NUM_NEIGHBORS];
            if !dst.is_empty() {
                dst.par_chunks_mut(NUM_NEIGHBORS)
                    .enumerate()
                    .for_each(|(bn, dst)| {
                        let batch = bn / n;
                        let p = &target[bn * 3..bn * 3 + 3];
                        let mut best = [(f64::INFINITY, 0usize); NUM_NEIGHBORS];
                        for (i, q) in source[batch * m * 3..(batch + 1) * m * 3]
                            .chunks_exact(3)
                            .enumerate()
                        {
                            let d2: f64 = p
                                .iter()
                                .zip(q)
                                .map(|(p, q)| {
                                    let d = p.to_f64() - q.to_f64();
                                    d * d
                                })
                                .sum();
                            // Strict comparisons keep the lowest index on ties.
                            if d2 < best[0].0 {
                                best = [(d2, i), best[0], best[1]];
                            } else if d2 < best[1].0 {
                                best = [best[0], (d2, i), best[1]];
                            } else if d2 < best[2].0 {
                                best[2] = (d2, i);
                            }
                        }
                        for (d, (_, i)) in dst.iter_mut().zip(best) {
                            *d = i as u32
                        }
                    });
            }
            Ok((CpuStorage::U32(dst), Shape::from((b, n, NUM_NEIGHBORS))))
        }

        use CpuStorage as C;
        match (s1, s2) {
            (C::BF16(t), C::BF16(s)) => inner::<half::bf16>(t, l1, s, l2, (b, n, m)),
            (C::F16(t), C::F16(s)) => inner::<half::f16>(t, l1, s, l2, (b, n, m)),
            (C::F32(t), C::F32(s)) => inner::<f32>(t, l1, s, l2, (b, n, m)),
            (C::F64(t), C::F64(s)) => inner::<f64>(t, l1, s, l2, (b, n, m)),
            _ => Err(candle::Error::UnsupportedDTypeForOp(s1.dtype(), self.name())),
        }
    }
}

/// Validates an `index`/`weight` pair against a batch size, returns the number of target
/// points.
fn check_neighbors(op: &'static str, b: usize, index: &Tensor, weight: &Tensor) -> Result<usize> {
    let (ib, n, k) = index.dims3()?;
    if ib != b || k != NUM_NEIGHBORS {
        Err(OpError::shape_mismatch(
            op,
            (b, n, NUM_NEIGHBORS),
            index.shape().clone(),
        ))?
    }
    if weight.shape() != index.shape() {
        Err(OpError::shape_mismatch(
            op,
            index.shape().clone(),
            weight.shape().clone(),
        ))?
    }
    if !index.dtype().is_int() {
        Err(candle::Error::UnsupportedDTypeForOp(index.dtype(), op))?
    }
    Ok(n)
}

fn check_same_dtype(op: &'static str, lhs: &Tensor, rhs: &Tensor) -> Result<()> {
    if lhs.dtype() != rhs.dtype() {
        Err(candle::Error::DTypeMismatchBinaryOp {
            lhs: lhs.dtype(),
            rhs: rhs.dtype(),
            op,
        })?
    }
    Ok(())
}

/// Blends the features of three source points for every target point.
///
/// * `features` - `(batch, channels, m)` features of the source points.
/// * `index` - `(batch, n, 3)` integer indexes in `[0, m)` of the neighbors.
/// * `weight` - `(batch, n, 3)` blending weights, used as is.
///
/// Returns `(batch, channels, n)` with
/// `out[b, c, j] = sum_k weight[b, j, k] * features[b, c, index[b, j, k]]`.
///
/// Indexes are not validated, an index outside of `[0, m)` results in a panic. The op is
/// differentiable with respect to `features` and `weight`.
pub fn three_interpolate(features: &Tensor, index: &Tensor, weight: &Tensor) -> Result<Tensor> {
    const OP: &str = "three-interpolate";
    let (b, c, m) = features.dims3()?;
    let n = check_neighbors(OP, b, index, weight)?;
    check_same_dtype(OP, features, weight)?;
    tracing::trace!(b, c, m, n, "three-interpolate");
    let device = features.device();
    let features = to_host(OP, features)?.contiguous()?;
    let index = to_host(OP, index)?.contiguous()?;
    let weight = to_host(OP, weight)?.contiguous()?;
    features
        .apply_op3(&index, &weight, ThreeInterpolate)?
        .to_device(device)
}

/// Gradient of [`three_interpolate`] with respect to the features.
///
/// `grad_output` has shape `(batch, channels, n)`, the result has shape
/// `(batch, channels, m)`. Contributions of target points sharing a source point are summed.
pub fn three_interpolate_backward(
    grad_output: &Tensor,
    index: &Tensor,
    weight: &Tensor,
    m: usize,
) -> Result<Tensor> {
    const OP: &str = "three-interpolate-bwd";
    let (b, c, n) = grad_output.dims3()?;
    let n_index = check_neighbors(OP, b, index, weight)?;
    if n_index != n {
        Err(OpError::shape_mismatch(
            OP,
            (b, c, n_index),
            grad_output.shape().clone(),
        ))?
    }
    check_same_dtype(OP, grad_output, weight)?;
    let device = grad_output.device();
    let grad_output = to_host(OP, grad_output)?.contiguous()?;
    let index = to_host(OP, index)?.contiguous()?;
    let weight = to_host(OP, weight)?.contiguous()?;
    grad_output
        .apply_op3_no_bwd(&index, &weight, &ThreeInterpolateBackward { m })?
        .to_device(device)
}

/// Gradient of [`three_interpolate`] with respect to the weights, `(batch, n, 3)`.
pub fn three_interpolate_weight_backward(
    grad_output: &Tensor,
    features: &Tensor,
    index: &Tensor,
) -> Result<Tensor> {
    const OP: &str = "three-interpolate-weight-bwd";
    let (b, c, n) = grad_output.dims3()?;
    let (fb, fc, _) = features.dims3()?;
    if (fb, fc) != (b, c) {
        Err(OpError::shape_mismatch(
            OP,
            (b, c, features.dim(2)?),
            features.shape().clone(),
        ))?
    }
    let (ib, in_, k) = index.dims3()?;
    if (ib, in_, k) != (b, n, NUM_NEIGHBORS) {
        Err(OpError::shape_mismatch(
            OP,
            (b, n, NUM_NEIGHBORS),
            index.shape().clone(),
        ))?
    }
    check_same_dtype(OP, grad_output, features)?;
    let device = grad_output.device();
    let grad_output = to_host(OP, grad_output)?.contiguous()?;
    let features = to_host(OP, features)?.contiguous()?;
    let index = to_host(OP, index)?.contiguous()?;
    grad_output
        .apply_op3_no_bwd(&features, &index, &ThreeInterpolateWeightGrad)?
        .to_device(device)
}

/// Finds the three nearest source points of every target point.
///
/// * `target` - `(batch, n, 3)` coordinates.
/// * `source` - `(batch, m, 3)` coordinates, `m` has to be at least 3.
///
/// Returns `(dist, index)`, both `(batch, n, 3)`, sorted by increasing euclidean distance.
/// `index` is `u32`. The distances are recomputed from the gathered points so they are
/// differentiable with respect to both point sets.
pub fn three_nn(target: &Tensor, source: &Tensor) -> Result<(Tensor, Tensor)> {
    const OP: &str = "three-nn";
    let (b, n, d) = target.dims3()?;
    let (sb, m, sd) = source.dims3()?;
    if d != 3 || sb != b || sd != 3 {
        Err(OpError::shape_mismatch(OP, (b, m, 3), source.shape().clone()))?
    }
    if m < NUM_NEIGHBORS {
        Err(OpError::invalid_config(
            OP,
            format!("at least {NUM_NEIGHBORS} source points are required, got {m}"),
        ))?
    }
    check_same_dtype(OP, target, source)?;
    let device = target.device();
    let index = to_host(OP, target)?
        .contiguous()?
        .apply_op2_no_bwd(&to_host(OP, source)?.contiguous()?, &ThreeNn)?
        .to_device(device)?;

    let flat = index
        .reshape((b, n * NUM_NEIGHBORS, 1))?
        .broadcast_as((b, n * NUM_NEIGHBORS, 3))?
        .contiguous()?;
    let nearest = source
        .contiguous()?
        .gather(&flat, 1)?
        .reshape((b, n, NUM_NEIGHBORS, 3))?;
    let dist = target
        .unsqueeze(2)?
        .broadcast_sub(&nearest)?
        .sqr()?
        .sum(D::Minus1)?
        .sqrt()?;
    Ok((dist, index))
}

/// Normalized inverse distance weights, `(batch, n, 3)`, summing to one on the last dim.
pub fn three_interpolate_weights(dist: &Tensor) -> Result<Tensor> {
    let recip = (dist + DIST_EPS)?.recip()?;
    let norm = recip.sum_keepdim(D::Minus1)?;
    recip.broadcast_div(&norm)
}
