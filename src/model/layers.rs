use candle_core::{Module, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, VarBuilder};

use crate::config::Activation;

/// Left/right zero padding that makes a strided convolution produce
/// `ceil(len / stride)` frames.
pub(crate) fn same_padding(len: usize, filter_width: usize, stride: usize) -> (usize, usize) {
    let stride = stride.max(1);
    let out_len = len.div_ceil(stride);
    let total = ((out_len.saturating_sub(1)) * stride + filter_width).saturating_sub(len);
    (total / 2, total - total / 2)
}

pub(crate) fn apply_activation(activation: Activation, xs: &Tensor) -> candle_core::Result<Tensor> {
    match activation {
        Activation::Relu => xs.relu(),
        Activation::Tanh => xs.tanh(),
        Activation::Sigmoid => candle_nn::ops::sigmoid(xs),
        // Channels are axis 1 of (batch, channels, time).
        Activation::Softmax => candle_nn::ops::softmax(xs, 1),
        Activation::Linear => Ok(xs.clone()),
    }
}

/// Temporal convolution over (batch, channels, time) with "same" padding.
pub(crate) struct SameConv1d {
    conv: Conv1d,
    filter_width: usize,
    stride: usize,
}

impl SameConv1d {
    pub(crate) fn load(
        in_c: usize,
        out_c: usize,
        filter_width: usize,
        stride: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let cfg = Conv1dConfig {
            stride,
            ..Default::default()
        };
        Ok(Self {
            conv: candle_nn::conv1d(in_c, out_c, filter_width, cfg, vb)?,
            filter_width,
            stride,
        })
    }

    pub(crate) fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (left, right) = same_padding(xs.dim(2)?, self.filter_width, self.stride);
        let xs = if left + right > 0 {
            xs.pad_with_zeros(2, left, right)?
        } else {
            xs.clone()
        };
        self.conv.forward(&xs)
    }
}
