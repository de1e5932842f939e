//! Modulated deformable convolution layers.
//!
//! [`ModulatedDeformConv2d`] takes its offsets and masks as explicit inputs while
//! [`ModulatedDeformConv2dPack`] predicts them from its input with a regular convolution.
use candle::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Init, VarBuilder};

use crate::deform_conv::{modulated_deform_conv2d as dcn_fwd, DeformConvConfig};
use crate::error::check_groups;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ModulatedDeformConv2dConfig {
    pub stride: usize,
    pub padding: usize,
    pub dilation: usize,
    pub groups: usize,
    pub deform_groups: usize,
}

impl Default for ModulatedDeformConv2dConfig {
    fn default() -> Self {
        Self {
            stride: 1,
            padding: 0,
            dilation: 1,
            groups: 1,
            deform_groups: 1,
        }
    }
}

impl From<ModulatedDeformConv2dConfig> for DeformConvConfig {
    fn from(c: ModulatedDeformConv2dConfig) -> Self {
        Self {
            stride: (c.stride, c.stride),
            padding: (c.padding, c.padding),
            dilation: (c.dilation, c.dilation),
            groups: c.groups,
            deform_groups: c.deform_groups,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModulatedDeformConv2d {
    weight: Tensor,
    bias: Option<Tensor>,
    config: ModulatedDeformConv2dConfig,
    span: tracing::Span,
}

impl ModulatedDeformConv2d {
    pub fn new(weight: Tensor, bias: Option<Tensor>, config: ModulatedDeformConv2dConfig) -> Self {
        let span = tracing::span!(tracing::Level::TRACE, "modulated-deform-conv2d");
        Self {
            weight,
            bias,
            config,
            span,
        }
    }

    pub fn config(&self) -> &ModulatedDeformConv2dConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Kernel height and width.
    pub fn kernel_size(&self) -> Result<(usize, usize)> {
        let (_, _, kh, kw) = self.weight.dims4()?;
        Ok((kh, kw))
    }

    /// Applies the convolution, `x` is cast to the dtype of the weights first.
    pub fn forward(&self, x: &Tensor, offset: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let x = x.to_dtype(self.weight.dtype())?;
        dcn_fwd(
            &x,
            offset,
            mask,
            &self.weight,
            self.bias.as_ref(),
            &self.config.into(),
        )
    }
}

/// A [`ModulatedDeformConv2d`] bundled with the convolution that predicts its offsets and masks.
///
/// The predictor outputs `3 * deform_groups * k * k` channels, the first two thirds are the
/// offsets and a sigmoid of the last third gives the masks. It is zero initialized so that a
/// fresh layer samples the regular grid with masks of 0.5.
#[derive(Debug, Clone)]
pub struct ModulatedDeformConv2dPack {
    inner: ModulatedDeformConv2d,
    conv_offset: Conv2d,
    span: tracing::Span,
}

impl ModulatedDeformConv2dPack {
    pub fn new(inner: ModulatedDeformConv2d, conv_offset: Conv2d) -> Self {
        let span = tracing::span!(tracing::Level::TRACE, "modulated-deform-conv2d-pack");
        Self {
            inner,
            conv_offset,
            span,
        }
    }

    pub fn inner(&self) -> &ModulatedDeformConv2d {
        &self.inner
    }

    pub fn conv_offset(&self) -> &Conv2d {
        &self.conv_offset
    }

    /// Offsets and masks predicted for `x`.
    pub fn offset_and_mask(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (kh, kw) = self.inner.kernel_size()?;
        let n = self.inner.config.deform_groups * kh * kw;
        let out = self.conv_offset.forward(x)?;
        let offset = out.narrow(1, 0, 2 * n)?;
        let mask = candle_nn::ops::sigmoid(&out.narrow(1, 2 * n, n)?)?;
        Ok((offset, mask))
    }
}

impl Module for ModulatedDeformConv2dPack {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let x = x.to_dtype(self.inner.weight.dtype())?;
        let (offset, mask) = self.offset_and_mask(&x)?;
        self.inner.forward(&x, &offset, &mask)
    }
}

fn dcn_weight(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    cfg: &ModulatedDeformConv2dConfig,
    vb: &VarBuilder,
) -> Result<Tensor> {
    const OP: &str = "modulated-deform-conv2d";
    DeformConvConfig::from(*cfg).validate(OP)?;
    check_groups(OP, "input", in_channels, cfg.groups)?;
    check_groups(OP, "output", out_channels, cfg.groups)?;
    check_groups(OP, "deformable input", in_channels, cfg.deform_groups)?;
    let bound = 1. / ((in_channels * kernel_size * kernel_size) as f64).sqrt();
    let init = Init::Uniform {
        lo: -bound,
        up: bound,
    };
    vb.get_with_hints(
        (
            out_channels,
            in_channels / cfg.groups,
            kernel_size,
            kernel_size,
        ),
        "weight",
        init,
    )
}

/// Creates or loads a modulated deformable convolution, the weights are named `"weight"` and
/// `"bias"`.
pub fn modulated_deform_conv2d(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    cfg: ModulatedDeformConv2dConfig,
    vb: VarBuilder,
) -> Result<ModulatedDeformConv2d> {
    let weight = dcn_weight(in_channels, out_channels, kernel_size, &cfg, &vb)?;
    let bias = vb.get_with_hints(out_channels, "bias", Init::Const(0.))?;
    Ok(ModulatedDeformConv2d::new(weight, Some(bias), cfg))
}

pub fn modulated_deform_conv2d_no_bias(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    cfg: ModulatedDeformConv2dConfig,
    vb: VarBuilder,
) -> Result<ModulatedDeformConv2d> {
    let weight = dcn_weight(in_channels, out_channels, kernel_size, &cfg, &vb)?;
    Ok(ModulatedDeformConv2d::new(weight, None, cfg))
}

/// Creates or loads a [`ModulatedDeformConv2dPack`], the predictor lives under
/// `"conv_offset"`.
pub fn modulated_deform_conv2d_pack(
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    cfg: ModulatedDeformConv2dConfig,
    bias: bool,
    vb: VarBuilder,
) -> Result<ModulatedDeformConv2dPack> {
    let inner = if bias {
        modulated_deform_conv2d(in_channels, out_channels, kernel_size, cfg, vb.clone())?
    } else {
        modulated_deform_conv2d_no_bias(in_channels, out_channels, kernel_size, cfg, vb.clone())?
    };
    let vb = vb.pp("conv_offset");
    let offset_channels = 3 * cfg.deform_groups * kernel_size * kernel_size;
    let weight = vb.get_with_hints(
        (offset_channels, in_channels, kernel_size, kernel_size),
        "weight",
        Init::Const(0.),
    )?;
    let offset_bias = vb.get_with_hints(offset_channels, "bias", Init::Const(0.))?;
    let conv_cfg = Conv2dConfig {
        padding: cfg.padding,
        stride: cfg.stride,
        dilation: cfg.dilation,
        groups: 1,
        ..Default::default()
    };
    let conv_offset = Conv2d::new(weight, Some(offset_bias), conv_cfg);
    Ok(ModulatedDeformConv2dPack::new(inner, conv_offset))
}
