//! Shared output-extent arithmetic for convolution and pooling layers.

use anyhow::{ensure, Result};

use crate::graph::PoolingConvention;

/// Standard convolution arithmetic: `floor((in + 2*pad - kernel) / stride) + 1`.
pub fn conv_output(input: usize, kernel: usize, pad: usize, stride: usize) -> Result<usize> {
    ensure!(kernel > 0 && stride > 0, "kernel and stride must be positive");
    let padded = input + 2 * pad;
    ensure!(
        padded >= kernel,
        "kernel {} exceeds padded input extent {}",
        kernel,
        padded
    );
    Ok((padded - kernel) / stride + 1)
}

/// Pooling output extent under the given edge convention.
///
/// `Valid` floors (`(in - window) / stride + 1`); `Full` ceils, allowing the
/// last window to overhang the input edge.
pub fn pool_output(
    input: usize,
    window: usize,
    stride: usize,
    convention: PoolingConvention,
) -> Result<usize> {
    ensure!(window > 0 && stride > 0, "window and stride must be positive");
    ensure!(
        window <= input,
        "pooling window {} exceeds input extent {}",
        window,
        input
    );
    let span = input - window;
    let out = match convention {
        PoolingConvention::Valid => span / stride + 1,
        PoolingConvention::Full => span.div_ceil(stride) + 1,
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mnist_conv_chain_extents() {
        // 28x28, 5x5 valid conv, then 2x2 stride-2 max pool.
        let conv = conv_output(28, 5, 0, 1).unwrap();
        assert_eq!(conv, 24);
        let pooled = pool_output(conv, 2, 2, PoolingConvention::Valid).unwrap();
        assert_eq!(pooled, 12);
    }

    #[test]
    fn full_convention_ceils() {
        assert_eq!(pool_output(5, 2, 2, PoolingConvention::Valid).unwrap(), 2);
        assert_eq!(pool_output(5, 2, 2, PoolingConvention::Full).unwrap(), 3);
    }

    #[test]
    fn oversized_kernel_is_rejected() {
        assert!(conv_output(3, 5, 0, 1).is_err());
        assert!(pool_output(3, 5, 1, PoolingConvention::Valid).is_err());
    }
}
