use candle::backend::BackendStorage;
use candle::{CpuStorage, Device, Layout, Result, Tensor};

/// Returns the part of `data` covered by a contiguous `layout`.
pub(crate) fn contiguous<'a, T>(data: &'a [T], layout: &Layout, what: &str) -> Result<&'a [T]> {
    match layout.contiguous_offsets() {
        None => candle::bail!("{what} has to be contiguous"),
        Some((o1, o2)) => Ok(&data[o1..o2]),
    }
}

/// Decodes an integer index storage into `usize` offsets.
///
/// Negative values wrap around and are caught by the bounds checks of the kernels.
pub(crate) fn index_vec(storage: &CpuStorage, layout: &Layout, op: &'static str) -> Result<Vec<usize>> {
    match storage {
        CpuStorage::U8(data) => Ok(contiguous(data, layout, "index")?
            .iter()
            .map(|&v| v as usize)
            .collect()),
        CpuStorage::U32(data) => Ok(contiguous(data, layout, "index")?
            .iter()
            .map(|&v| v as usize)
            .collect()),
        CpuStorage::I64(data) => Ok(contiguous(data, layout, "index")?
            .iter()
            .map(|&v| v as usize)
            .collect()),
        _ => Err(candle::Error::UnsupportedDTypeForOp(storage.dtype(), op)),
    }
}

/// Spatial output size of a convolution along one axis, `None` when the dilated kernel does
/// not fit in the padded input.
pub(crate) fn conv_out_size(
    input: usize,
    kernel: usize,
    padding: usize,
    stride: usize,
    dilation: usize,
) -> Option<usize> {
    let span = dilation * (kernel.max(1) - 1) + 1;
    let padded = input + 2 * padding;
    if padded < span || stride == 0 {
        None
    } else {
        Some((padded - span) / stride + 1)
    }
}

/// The kernels only have a cpu implementation, operands living on an accelerator are moved
/// to host memory. `to_device` records the transfer so gradients flow back to the device.
pub(crate) fn to_host(op: &'static str, xs: &Tensor) -> Result<Tensor> {
    if xs.device().is_cpu() {
        return Ok(xs.clone());
    }
    tracing::debug!(op, device = ?xs.device().location(), "staging operand to host memory");
    xs.to_device(&Device::Cpu)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_size() {
        // 3x3 input, 2x2 kernel, padding 1.
        assert_eq!(conv_out_size(3, 2, 1, 1, 1), Some(4));
        // Same padding.
        assert_eq!(conv_out_size(64, 3, 1, 1, 1), Some(64));
        assert_eq!(conv_out_size(64, 3, 1, 2, 1), Some(32));
        assert_eq!(conv_out_size(7, 3, 0, 1, 2), Some(3));
        assert_eq!(conv_out_size(2, 5, 0, 1, 1), None);
        assert_eq!(conv_out_size(4, 3, 0, 0, 1), None);
    }

    #[test]
    fn index_decoding() -> Result<()> {
        let layout = Layout::contiguous((2, 3));
        let storage = CpuStorage::U32(vec![0, 1, 2, 5, 4, 3]);
        assert_eq!(index_vec(&storage, &layout, "test")?, [0, 1, 2, 5, 4, 3]);
        let storage = CpuStorage::I64(vec![7; 6]);
        assert_eq!(index_vec(&storage, &layout, "test")?, [7; 6]);
        let storage = CpuStorage::F32(vec![0.; 6]);
        assert!(index_vec(&storage, &layout, "test").is_err());
        Ok(())
    }
}
