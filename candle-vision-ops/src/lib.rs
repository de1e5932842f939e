//! Point-cloud and deformable convolution ops for candle.
//!
//! - [`three_interpolate()`]: weighted gather of the features of three neighboring points,
//!   together with the brute force [`three_nn`] search that produces the neighbors.
//! - [`modulated_deform_conv2d`]: modulated deformable convolution (DCNv2), with the
//!   [`dcn::ModulatedDeformConv2dPack`] layer predicting its own offsets and masks.
//!
//! All the ops are differentiable through candle's autograd and also expose their backward
//! passes as standalone functions. The kernels run on the cpu, tensors living on other devices
//! are moved to host memory and the results moved back.
pub mod dcn;
pub mod deform_conv;
pub mod error;
pub mod three_interpolate;
mod utils;

pub use dcn::{
    modulated_deform_conv2d_pack, ModulatedDeformConv2d, ModulatedDeformConv2dConfig,
    ModulatedDeformConv2dPack,
};
pub use deform_conv::{
    deform_conv2d, modulated_deform_conv2d, modulated_deform_conv2d_backward, DeformConvConfig,
    ModulatedDeformConvGrads,
};
pub use error::OpError;
pub use three_interpolate::{
    three_interpolate, three_interpolate_backward, three_interpolate_weight_backward,
    three_interpolate_weights, three_nn,
};
