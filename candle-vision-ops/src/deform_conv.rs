//! Modulated deformable convolution (DCNv2).
//!
//! The op samples its input at the regular convolution grid moved by a learned `(dy, dx)`
//! offset per output location and kernel tap, scales every sample by a learned mask, and then
//! contracts the samples with the kernel weights. It is implemented as a deformable im2col
//! followed by a grouped matmul.
//!
//! Offsets are laid out as `(batch, 2 * deform_groups * kh * kw, out_h, out_w)`. For group `g`
//! and tap `k = i * kw + j`, channel `g * 2 * kh * kw + 2 * k` holds `dy` and the next channel
//! holds `dx`. Masks are laid out as `(batch, deform_groups * kh * kw, out_h, out_w)`.
use candle::backend::BackendStorage;
use candle::{CpuStorage, Layout, Result, Shape, Tensor, WithDType};
use rayon::prelude::*;

use crate::error::{check_groups, OpError};
use crate::utils::{contiguous, conv_out_size, to_host};

/// Hyper-parameters of a deformable convolution, `(h, w)` pairs for the spatial ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DeformConvConfig {
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub dilation: (usize, usize),
    pub groups: usize,
    pub deform_groups: usize,
}

impl Default for DeformConvConfig {
    fn default() -> Self {
        Self {
            stride: (1, 1),
            padding: (0, 0),
            dilation: (1, 1),
            groups: 1,
            deform_groups: 1,
        }
    }
}

impl DeformConvConfig {
    pub fn validate(&self, op: &'static str) -> std::result::Result<(), OpError> {
        if self.stride.0 == 0 || self.stride.1 == 0 {
            return Err(OpError::invalid_config(
                op,
                format!("stride has to be positive, got {:?}", self.stride),
            ));
        }
        if self.dilation.0 == 0 || self.dilation.1 == 0 {
            return Err(OpError::invalid_config(
                op,
                format!("dilation has to be positive, got {:?}", self.dilation),
            ));
        }
        if self.groups == 0 || self.deform_groups == 0 {
            return Err(OpError::invalid_config(
                op,
                format!(
                    "groups ({}) and deform_groups ({}) have to be positive",
                    self.groups, self.deform_groups
                ),
            ));
        }
        Ok(())
    }
}

/// Sizes shared by the forward and backward kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    channels: usize,
    height: usize,
    width: usize,
    kernel: (usize, usize),
    out: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    dilation: (usize, usize),
    deform_groups: usize,
}

impl Geometry {
    fn taps(&self) -> usize {
        self.kernel.0 * self.kernel.1
    }

    fn out_len(&self) -> usize {
        self.out.0 * self.out.1
    }

    fn plane_len(&self) -> usize {
        self.height * self.width
    }

    fn channels_per_deform_group(&self) -> usize {
        self.channels / self.deform_groups
    }

    /// Number of channels of the concatenated offset and mask tensor.
    fn offset_mask_channels(&self) -> usize {
        3 * self.deform_groups * self.taps()
    }

    /// Sampling positions of one output location for one tap, offsets and mask read from the
    /// offset/mask slab of a batch element.
    fn sample<T: WithDType>(&self, om: &[T], group: usize, k: usize, l: usize) -> Sample {
        let (taps, len) = (self.taps(), self.out_len());
        let off_y = (group * 2 * taps + 2 * k) * len + l;
        let off_x = off_y + len;
        let mask = (2 * self.deform_groups * taps + group * taps + k) * len + l;
        let (i, j) = (k / self.kernel.1, k % self.kernel.1);
        let (oy, ox) = (l / self.out.1, l % self.out.1);
        let y = (oy * self.stride.0 + i * self.dilation.0) as f64 - self.padding.0 as f64;
        let x = (ox * self.stride.1 + j * self.dilation.1) as f64 - self.padding.1 as f64;
        Sample {
            y: y + om[off_y].to_f64(),
            x: x + om[off_x].to_f64(),
            mask: om[mask].to_f64(),
        }
    }

    fn inside(&self, y: f64, x: f64) -> bool {
        y > -1. && x > -1. && y < self.height as f64 && x < self.width as f64
    }

    /// The up to four integer neighbors of `(y, x)` that lie in the image, with their
    /// bilinear weights.
    fn corners(&self, y: f64, x: f64) -> impl Iterator<Item = (usize, f64)> {
        let (y0, x0) = (y.floor(), x.floor());
        let (ly, lx) = (y - y0, x - x0);
        let (hy, hx) = (1. - ly, 1. - lx);
        let (y0, x0) = (y0 as i64, x0 as i64);
        let (h, w) = (self.height as i64, self.width as i64);
        [
            (y0, x0, hy * hx),
            (y0, x0 + 1, hy * lx),
            (y0 + 1, x0, ly * hx),
            (y0 + 1, x0 + 1, ly * lx),
        ]
        .into_iter()
        .filter(move |&(yy, xx, _)| yy >= 0 && xx >= 0 && yy < h && xx < w)
        .map(move |(yy, xx, wt)| ((yy * w + xx) as usize, wt))
    }

    /// Bilinear sample of a single channel plane, zero outside of the image.
    fn bilinear<T: WithDType>(&self, plane: &[T], y: f64, x: f64) -> f64 {
        if !self.inside(y, x) {
            return 0.;
        }
        self.corners(y, x)
            .map(|(idx, wt)| wt * plane[idx].to_f64())
            .sum()
    }

    /// Derivatives of the bilinear sample with respect to `y` and `x`, taken on the cell whose
    /// top-left corner is `floor((y, x))`.
    fn coordinate_weight<T: WithDType>(&self, plane: &[T], y: f64, x: f64) -> (f64, f64) {
        if !self.inside(y, x) {
            return (0., 0.);
        }
        let (y0, x0) = (y.floor(), x.floor());
        let (ly, lx) = (y - y0, x - x0);
        let (y0, x0) = (y0 as i64, x0 as i64);
        let (h, w) = (self.height as i64, self.width as i64);
        let at = |yy: i64, xx: i64| {
            if yy >= 0 && xx >= 0 && yy < h && xx < w {
                plane[(yy * w + xx) as usize].to_f64()
            } else {
                0.
            }
        };
        let (v00, v01) = (at(y0, x0), at(y0, x0 + 1));
        let (v10, v11) = (at(y0 + 1, x0), at(y0 + 1, x0 + 1));
        let dy = (1. - lx) * (v10 - v00) + lx * (v11 - v01);
        let dx = (1. - ly) * (v01 - v00) + ly * (v11 - v10);
        (dy, dx)
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    y: f64,
    x: f64,
    mask: f64,
}

fn deformable_im2col<T: WithDType>(
    geom: &Geometry,
    batch: usize,
    input: &[T],
    offset_mask: &[T],
) -> Vec<T> {
    let (c, taps, len) = (geom.channels, geom.taps(), geom.out_len());
    let om_len = geom.offset_mask_channels() * len;
    let c_per_group = geom.channels_per_deform_group();
    let mut columns = vec![T::zero(); batch * c * taps * len];
    if columns.is_empty() {
        return columns;
    }
    columns
        .par_chunks_mut(taps * len)
        .enumerate()
        .for_each(|(bc, columns)| {
            let (b, ch) = (bc / c, bc % c);
            let plane = &input[bc * geom.plane_len()..(bc + 1) * geom.plane_len()];
            let om = &offset_mask[b * om_len..(b + 1) * om_len];
            let group = ch / c_per_group;
            for k in 0..taps {
                for l in 0..len {
                    let s = geom.sample(om, group, k, l);
                    let v = s.mask * geom.bilinear(plane, s.y, s.x);
                    columns[k * len + l] = T::from_f64(v);
                }
            }
        });
    columns
}

fn deformable_col2im<T: WithDType>(
    geom: &Geometry,
    batch: usize,
    grad_columns: &[T],
    offset_mask: &[T],
) -> Vec<T> {
    let (c, taps, len) = (geom.channels, geom.taps(), geom.out_len());
    let om_len = geom.offset_mask_channels() * len;
    let c_per_group = geom.channels_per_deform_group();
    let mut grad_input = vec![T::zero(); batch * c * geom.plane_len()];
    if grad_input.is_empty() {
        return grad_input;
    }
    // A channel plane only receives gradients from its own column rows, so planes are
    // processed independently.
    grad_input
        .par_chunks_mut(geom.plane_len())
        .enumerate()
        .for_each(|(bc, grad_plane)| {
            let (b, ch) = (bc / c, bc % c);
            let grad_columns = &grad_columns[bc * taps * len..(bc + 1) * taps * len];
            let om = &offset_mask[b * om_len..(b + 1) * om_len];
            let group = ch / c_per_group;
            let mut acc = vec![0f64; geom.plane_len()];
            for k in 0..taps {
                for l in 0..len {
                    let s = geom.sample(om, group, k, l);
                    if !geom.inside(s.y, s.x) {
                        continue;
                    }
                    let g = grad_columns[k * len + l].to_f64() * s.mask;
                    for (idx, wt) in geom.corners(s.y, s.x) {
                        acc[idx] += wt * g
                    }
                }
            }
            for (d, a) in grad_plane.iter_mut().zip(acc) {
                *d = T::from_f64(a)
            }
        });
    grad_input
}

fn deformable_col2im_coord<T: WithDType>(
    geom: &Geometry,
    batch: usize,
    grad_columns: &[T],
    input: &[T],
    offset_mask: &[T],
) -> Vec<T> {
    let (c, taps, len, dg) = (geom.channels, geom.taps(), geom.out_len(), geom.deform_groups);
    let om_len = geom.offset_mask_channels() * len;
    let c_per_group = geom.channels_per_deform_group();
    let mut grad_offset = vec![0f64; batch * dg * 2 * taps * len];
    let mut grad_mask = vec![0f64; batch * dg * taps * len];
    if grad_mask.is_empty() {
        return vec![];
    }
    grad_offset
        .par_chunks_mut(2 * taps * len)
        .zip(grad_mask.par_chunks_mut(taps * len))
        .enumerate()
        .for_each(|(bg, (grad_offset, grad_mask))| {
            let (b, group) = (bg / dg, bg % dg);
            let om = &offset_mask[b * om_len..(b + 1) * om_len];
            for k in 0..taps {
                for l in 0..len {
                    let s = geom.sample(om, group, k, l);
                    let (mut gy, mut gx, mut gm) = (0f64, 0f64, 0f64);
                    for ch in group * c_per_group..(group + 1) * c_per_group {
                        let bc = b * c + ch;
                        let plane = &input[bc * geom.plane_len()..(bc + 1) * geom.plane_len()];
                        let g = grad_columns[(bc * taps + k) * len + l].to_f64();
                        if g == 0. {
                            continue;
                        }
                        let (wy, wx) = geom.coordinate_weight(plane, s.y, s.x);
                        gy += wy * g * s.mask;
                        gx += wx * g * s.mask;
                        gm += geom.bilinear(plane, s.y, s.x) * g;
                    }
                    grad_offset[2 * k * len + l] = gy;
                    grad_offset[(2 * k + 1) * len + l] = gx;
                    grad_mask[k * len + l] = gm;
                }
            }
        });
    // Same channel layout as the offset/mask input: all the offsets of a batch element
    // followed by all its masks.
    let (off_len, mask_len) = (dg * 2 * taps * len, dg * taps * len);
    let mut dst = Vec::with_capacity(grad_offset.len() + grad_mask.len());
    for b in 0..batch {
        dst.extend(
            grad_offset[b * off_len..(b + 1) * off_len]
                .iter()
                .chain(&grad_mask[b * mask_len..(b + 1) * mask_len])
                .map(|&v| T::from_f64(v)),
        );
    }
    dst
}

/// `(input, offset_mask) -> columns` with columns of shape `(batch, c * kh * kw, out_h * out_w)`.
struct DeformIm2Col {
    geom: Geometry,
}

impl candle::CustomOp2 for DeformIm2Col {
    fn name(&self) -> &'static str {
        "deform-im2col"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
    ) -> Result<(CpuStorage, Shape)> {
        let geom = &self.geom;
        let batch = l1.shape().dims4()?.0;

        fn inner<T: WithDType>(
            geom: &Geometry,
            batch: usize,
            input: &[T],
            l_input: &Layout,
            om: &[T],
            l_om: &Layout,
        ) -> Result<CpuStorage> {
            let input = contiguous(input, l_input, "input")?;
            let om = contiguous(om, l_om, "offset")?;
            let columns = deformable_im2col(geom, batch, input, om);
            Ok(T::to_cpu_storage_owned(columns))
        }

        use CpuStorage as C;
        let storage = match (s1, s2) {
            (C::BF16(i), C::BF16(o)) => inner::<half::bf16>(geom, batch, i, l1, o, l2)?,
            (C::F16(i), C::F16(o)) => inner::<half::f16>(geom, batch, i, l1, o, l2)?,
            (C::F32(i), C::F32(o)) => inner::<f32>(geom, batch, i, l1, o, l2)?,
            (C::F64(i), C::F64(o)) => inner::<f64>(geom, batch, i, l1, o, l2)?,
            _ => Err(candle::Error::UnsupportedDTypeForOp(s1.dtype(), self.name()))?,
        };
        let shape = Shape::from((batch, geom.channels * geom.taps(), geom.out_len()));
        Ok((storage, shape))
    }

    fn bwd(
        &self,
        input: &Tensor,
        offset_mask: &Tensor,
        _res: &Tensor,
        grad_res: &Tensor,
    ) -> Result<(Option<Tensor>, Option<Tensor>)> {
        let geom = self.geom;
        let grad_res = grad_res.contiguous()?;
        let grad_input = grad_res.apply_op2_no_bwd(offset_mask, &DeformCol2Im { geom })?;
        let grad_om = grad_res.apply_op3_no_bwd(input, offset_mask, &DeformCol2ImCoord { geom })?;
        Ok((Some(grad_input), Some(grad_om)))
    }
}

/// `(grad_columns, offset_mask) -> grad_input`.
struct DeformCol2Im {
    geom: Geometry,
}

impl candle::CustomOp2 for DeformCol2Im {
    fn name(&self) -> &'static str {
        "deform-col2im"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
    ) -> Result<(CpuStorage, Shape)> {
        let geom = &self.geom;
        let batch = l1.shape().dims3()?.0;

        fn inner<T: WithDType>(
            geom: &Geometry,
            batch: usize,
            grad: &[T],
            l_grad: &Layout,
            om: &[T],
            l_om: &Layout,
        ) -> Result<CpuStorage> {
            let grad = contiguous(grad, l_grad, "grad")?;
            let om = contiguous(om, l_om, "offset")?;
            Ok(T::to_cpu_storage_owned(deformable_col2im(geom, batch, grad, om)))
        }

        use CpuStorage as C;
        let storage = match (s1, s2) {
            (C::BF16(g), C::BF16(o)) => inner::<half::bf16>(geom, batch, g, l1, o, l2)?,
            (C::F16(g), C::F16(o)) => inner::<half::f16>(geom, batch, g, l1, o, l2)?,
            (C::F32(g), C::F32(o)) => inner::<f32>(geom, batch, g, l1, o, l2)?,
            (C::F64(g), C::F64(o)) => inner::<f64>(geom, batch, g, l1, o, l2)?,
            _ => Err(candle::Error::UnsupportedDTypeForOp(s1.dtype(), self.name()))?,
        };
        let shape = Shape::from((batch, geom.channels, geom.height, geom.width));
        Ok((storage, shape))
    }
}

/// `(grad_columns, input, offset_mask) -> grad_offset_mask`.
struct DeformCol2ImCoord {
    geom: Geometry,
}

impl candle::CustomOp3 for DeformCol2ImCoord {
    fn name(&self) -> &'static str {
        "deform-col2im-coord"
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
        let geom = &self.geom;
        let batch = l1.shape().dims3()?.0;

        #[allow(clippy::too_many_arguments)]
        fn inner<T: WithDType>(
            geom: &Geometry,
            batch: usize,
            grad: &[T],
            l_grad: &Layout,
            input: &[T],
            l_input: &Layout,
            om: &[T],
            l_om: &Layout,
        ) -> Result<CpuStorage> {
            let grad = contiguous(grad, l_grad, "grad")?;
            let input = contiguous(input, l_input, "input")?;
            let om = contiguous(om, l_om, "offset")?;
            let dst = deformable_col2im_coord(geom, batch, grad, input, om);
            Ok(T::to_cpu_storage_owned(dst))
        }

        use CpuStorage as C;
        let storage = match (s1, s2, s3) {
            (C::BF16(g), C::BF16(i), C::BF16(o)) => {
                inner::<half::bf16>(geom, batch, g, l1, i, l2, o, l3)?
            }
            (C::F16(g), C::F16(i), C::F16(o)) => {
                inner::<half::f16>(geom, batch, g, l1, i, l2, o, l3)?
            }
            (C::F32(g), C::F32(i), C::F32(o)) => inner::<f32>(geom, batch, g, l1, i, l2, o, l3)?,
            (C::F64(g), C::F64(i), C::F64(o)) => inner::<f64>(geom, batch, g, l1, i, l2, o, l3)?,
            _ => Err(candle::Error::UnsupportedDTypeForOp(s1.dtype(), self.name()))?,
        };
        let shape = Shape::from((
            batch,
            geom.offset_mask_channels(),
            geom.out.0,
            geom.out.1,
        ));
        Ok((storage, shape))
    }
}

/// Validates the arguments of the modulated deformable convolution and derives the sizes
/// used by the kernels.
fn check_args(
    op: &'static str,
    input: &Tensor,
    offset: &Tensor,
    mask: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    cfg: &DeformConvConfig,
) -> Result<Geometry> {
    cfg.validate(op)?;
    let (b, c, h, w) = input.dims4()?;
    let (o, c_per_group, kh, kw) = weight.dims4()?;
    if kh == 0 || kw == 0 {
        Err(OpError::invalid_config(
            op,
            format!("empty kernel {kh}x{kw}"),
        ))?
    }
    check_groups(op, "input", c, cfg.groups)?;
    check_groups(op, "output", o, cfg.groups)?;
    check_groups(op, "deformable input", c, cfg.deform_groups)?;
    if c_per_group * cfg.groups != c {
        Err(OpError::shape_mismatch(
            op,
            (o, c / cfg.groups, kh, kw),
            weight.shape().clone(),
        ))?
    }
    let no_fit = || {
        OpError::invalid_config(
            op,
            format!("kernel {kh}x{kw} does not fit in the padded {h}x{w} input"),
        )
    };
    let out_h = conv_out_size(h, kh, cfg.padding.0, cfg.stride.0, cfg.dilation.0)
        .ok_or_else(no_fit)?;
    let out_w = conv_out_size(w, kw, cfg.padding.1, cfg.stride.1, cfg.dilation.1)
        .ok_or_else(no_fit)?;
    let taps = kh * kw;
    let dg = cfg.deform_groups;
    if offset.dims() != [b, 2 * dg * taps, out_h, out_w] {
        Err(OpError::shape_mismatch(
            op,
            (b, 2 * dg * taps, out_h, out_w),
            offset.shape().clone(),
        ))?
    }
    if mask.dims() != [b, dg * taps, out_h, out_w] {
        Err(OpError::shape_mismatch(
            op,
            (b, dg * taps, out_h, out_w),
            mask.shape().clone(),
        ))?
    }
    if let Some(bias) = bias {
        if bias.dims() != [o] {
            Err(OpError::shape_mismatch(op, o, bias.shape().clone()))?
        }
    }
    Ok(Geometry {
        channels: c,
        height: h,
        width: w,
        kernel: (kh, kw),
        out: (out_h, out_w),
        stride: cfg.stride,
        padding: cfg.padding,
        dilation: cfg.dilation,
        deform_groups: dg,
    })
}

/// `weight` reshaped to `(batch, groups, out_c / groups, c / groups * kh * kw)` so that it can
/// be contracted with the grouped columns.
fn grouped_weight(weight: &Tensor, batch: usize, groups: usize) -> Result<Tensor> {
    let (o, c_per_group, kh, kw) = weight.dims4()?;
    weight
        .reshape((groups, o / groups, c_per_group * kh * kw))?
        .broadcast_as((batch, groups, o / groups, c_per_group * kh * kw))?
        .contiguous()
}

/// Modulated deformable 2D convolution.
///
/// * `input` - `(batch, c, h, w)`.
/// * `offset` - `(batch, 2 * deform_groups * kh * kw, out_h, out_w)`.
/// * `mask` - `(batch, deform_groups * kh * kw, out_h, out_w)`, used without squashing.
/// * `weight` - `(out_c, c / groups, kh, kw)`.
/// * `bias` - optional `(out_c,)`.
///
/// The op is differentiable with respect to all of its tensor arguments. `input`, `mask`,
/// `weight` and `bias` are cast to the dtype of `offset`, which lets a layer running in a
/// reduced precision feed a full precision input.
pub fn modulated_deform_conv2d(
    input: &Tensor,
    offset: &Tensor,
    mask: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    cfg: &DeformConvConfig,
) -> Result<Tensor> {
    const OP: &str = "modulated-deform-conv2d";
    let geom = check_args(OP, input, offset, mask, weight, bias, cfg)?;
    let dtype = offset.dtype();
    let b = input.dim(0)?;
    let (o, _, _, _) = weight.dims4()?;
    tracing::trace!(?geom, b, o, ?dtype, "modulated-deform-conv2d");

    let device = input.device();
    let input = to_host(OP, &input.to_dtype(dtype)?)?.contiguous()?;
    let offset_mask = Tensor::cat(
        &[to_host(OP, offset)?, to_host(OP, &mask.to_dtype(dtype)?)?],
        1,
    )?;
    let columns = input
        .apply_op2(&offset_mask, DeformIm2Col { geom })?
        .to_device(device)?;

    let groups = cfg.groups;
    let columns = columns.reshape((
        b,
        groups,
        geom.channels / groups * geom.taps(),
        geom.out_len(),
    ))?;
    let weight = grouped_weight(&weight.to_dtype(dtype)?, b, groups)?;
    let ys = weight
        .matmul(&columns)?
        .reshape((b, o, geom.out.0, geom.out.1))?;
    match bias {
        None => Ok(ys),
        Some(bias) => {
            let bias = bias.to_dtype(dtype)?.reshape((1, o, 1, 1))?;
            ys.broadcast_add(&bias)
        }
    }
}

/// Deformable 2D convolution without modulation (DCNv1), every sample has a unit mask.
pub fn deform_conv2d(
    input: &Tensor,
    offset: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    cfg: &DeformConvConfig,
) -> Result<Tensor> {
    let (b, c, h, w) = offset.dims4()?;
    let mask = Tensor::ones((b, c / 2, h, w), offset.dtype(), offset.device())?;
    modulated_deform_conv2d(input, offset, &mask, weight, bias, cfg)
}

/// Gradients of [`modulated_deform_conv2d`] with respect to each of its arguments.
#[derive(Debug, Clone)]
pub struct ModulatedDeformConvGrads {
    pub input: Tensor,
    pub offset: Tensor,
    pub mask: Tensor,
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

/// Backward pass of [`modulated_deform_conv2d`] given the gradient of its output.
///
/// This computes the same values as autograd does but without recording a graph, the bias
/// gradient is only computed when `has_bias` is set.
pub fn modulated_deform_conv2d_backward(
    grad_output: &Tensor,
    input: &Tensor,
    offset: &Tensor,
    mask: &Tensor,
    weight: &Tensor,
    has_bias: bool,
    cfg: &DeformConvConfig,
) -> Result<ModulatedDeformConvGrads> {
    const OP: &str = "modulated-deform-conv2d-bwd";
    let geom = check_args(OP, input, offset, mask, weight, None, cfg)?;
    let b = input.dim(0)?;
    let (o, c_per_group, kh, kw) = weight.dims4()?;
    if grad_output.dims() != [b, o, geom.out.0, geom.out.1] {
        Err(OpError::shape_mismatch(
            OP,
            (b, o, geom.out.0, geom.out.1),
            grad_output.shape().clone(),
        ))?
    }
    let dtype = offset.dtype();
    let device = input.device();
    let groups = cfg.groups;
    let col_rows = c_per_group * geom.taps();

    let input = to_host(OP, &input.to_dtype(dtype)?)?.contiguous()?;
    let offset_mask = Tensor::cat(
        &[to_host(OP, offset)?, to_host(OP, &mask.to_dtype(dtype)?)?],
        1,
    )?;
    let columns = input
        .apply_op2_no_bwd(&offset_mask, &DeformIm2Col { geom })?
        .to_device(device)?
        .reshape((b, groups, col_rows, geom.out_len()))?;

    let grad_output = grad_output.to_dtype(dtype)?;
    let grad_ys = grad_output.reshape((b, groups, o / groups, geom.out_len()))?;
    let weight = grouped_weight(&weight.to_dtype(dtype)?, b, groups)?;
    let grad_columns = weight
        .transpose(2, 3)?
        .contiguous()?
        .matmul(&grad_ys)?
        .reshape((b, geom.channels * geom.taps(), geom.out_len()))?;
    let grad_weight = grad_ys
        .matmul(&columns.transpose(2, 3)?.contiguous()?)?
        .sum(0)?
        .reshape((o, c_per_group, kh, kw))?;
    let grad_bias = if has_bias {
        Some(grad_output.sum((0, 2, 3))?)
    } else {
        None
    };

    let grad_columns = to_host(OP, &grad_columns)?.contiguous()?;
    let grad_input = grad_columns
        .apply_op2_no_bwd(&offset_mask, &DeformCol2Im { geom })?
        .to_device(device)?;
    let grad_om = grad_columns
        .apply_op3_no_bwd(&input, &offset_mask, &DeformCol2ImCoord { geom })?
        .to_device(device)?;
    let n_offset = 2 * geom.deform_groups * geom.taps();
    Ok(ModulatedDeformConvGrads {
        input: grad_input,
        offset: grad_om.narrow(1, 0, n_offset)?,
        mask: grad_om.narrow(1, n_offset, geom.deform_groups * geom.taps())?,
        weight: grad_weight,
        bias: grad_bias,
    })
}
