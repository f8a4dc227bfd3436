//! Convolutional block attention: channel and spatial gating.
//! See: [arXiv:1807.06521 [cs.CV]](<https://arxiv.org/abs/1807.06521>)

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{linear, ops, Activation, Linear, VarBuilder};
use serde::Deserialize;

use super::conv::{conv2d, Conv2d, Conv2dConfig, KernelSize, Padding};
use crate::Error;

/// Rescales every channel by a weight computed from its average and max
/// activations.
#[derive(Debug, Clone)]
pub struct ChannelGate {
    hidden: Linear,
    output: Linear,
    span: tracing::Span,
}

/// Create a [`ChannelGate`] over `channels` channels with a bottleneck of
/// `channels / reduction_ratio` (at least one) units.
pub fn channel_gate(
    channels: usize,
    reduction_ratio: usize,
    vb: VarBuilder,
) -> crate::Result<ChannelGate> {
    if reduction_ratio == 0 {
        return Err(Error::invalid_layer(
            "channel_gate",
            "reduction_ratio must be at least 1",
        ));
    }
    let reduced = (channels / reduction_ratio).max(1);
    Ok(ChannelGate {
        hidden: linear(channels, reduced, vb.pp("mlp.0"))?,
        output: linear(reduced, channels, vb.pp("mlp.2"))?,
        span: tracing::span!(tracing::Level::TRACE, "channel-gate"),
    })
}

impl ChannelGate {
    fn mlp(&self, xs: &Tensor) -> Result<Tensor> {
        self.output.forward(&self.hidden.forward(xs)?.relu()?)
    }

    /// The per channel weights in `(0, 1)`, shaped `(B, C, 1, 1)`.
    pub fn attention(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, c, _, _) = xs.dims4()?;
        let flat = xs.flatten_from(2)?;
        let avg = flat.mean(D::Minus1)?;
        let max = flat.max(D::Minus1)?;
        let logits = (self.mlp(&avg)? + self.mlp(&max)?)?;
        ops::sigmoid(&logits)?.reshape((b, c, 1, 1))
    }
}

impl Module for ChannelGate {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        xs.broadcast_mul(&self.attention(xs)?)
    }
}

/// Rescales every spatial position by a weight computed from the max and mean
/// over its channels.
#[derive(Debug, Clone)]
pub struct SpatialGate {
    conv: Conv2d,
    span: tracing::Span,
}

/// Create a [`SpatialGate`] whose attention map is computed with a
/// `kernel_size` convolution (7 in the CBAM paper).
pub fn spatial_gate(kernel_size: impl Into<KernelSize>, vb: VarBuilder) -> crate::Result<SpatialGate> {
    Ok(SpatialGate {
        conv: conv2d(2, 1, Conv2dConfig::new(kernel_size), vb.pp("spatial"))?,
        span: tracing::span!(tracing::Level::TRACE, "spatial-gate"),
    })
}

impl SpatialGate {
    /// The per position weights in `(0, 1)`, shaped `(B, 1, H, W)`.
    pub fn attention(&self, xs: &Tensor) -> Result<Tensor> {
        let max = xs.max_keepdim(1)?;
        let mean = xs.mean_keepdim(1)?;
        let compressed = Tensor::cat(&[max, mean], 1)?;
        ops::sigmoid(&self.conv.forward(&compressed)?)
    }
}

impl Module for SpatialGate {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        xs.broadcast_mul(&self.attention(xs)?)
    }
}

fn default_spatial_kernel() -> KernelSize {
    KernelSize::Square(7)
}

/// A config for a [`Cbam`] block.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct CbamConfig {
    /// The number of output channels of the convolution.
    pub filters: usize,
    /// The channel gate bottleneck ratio.
    pub reduction_ratio: usize,
    /// The kernel size of the convolution.
    pub kernel_size: KernelSize,
    /// The padding of the convolution.
    #[serde(default)]
    pub padding: Padding,
    /// An activation applied after the convolution.
    #[serde(default)]
    pub activation: Option<Activation>,
    /// Skip the spatial gate.
    #[serde(default)]
    pub no_spatial: bool,
    /// The kernel size of the spatial gate.
    #[serde(default = "default_spatial_kernel")]
    pub spatial_kernel_size: KernelSize,
}

impl CbamConfig {
    /// Create a new config.
    pub fn new(filters: usize, reduction_ratio: usize, kernel_size: impl Into<KernelSize>) -> Self {
        Self {
            filters,
            reduction_ratio,
            kernel_size: kernel_size.into(),
            padding: Padding::Same,
            activation: None,
            no_spatial: false,
            spatial_kernel_size: default_spatial_kernel(),
        }
    }

    /// Set the padding of the convolution.
    pub fn padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    /// Set the activation applied after the convolution.
    pub fn activation(mut self, activation: Option<Activation>) -> Self {
        self.activation = activation;
        self
    }

    /// Set whether to skip the spatial gate.
    pub fn no_spatial(mut self, no_spatial: bool) -> Self {
        self.no_spatial = no_spatial;
        self
    }

    pub(crate) fn conv_config(&self) -> Conv2dConfig {
        Conv2dConfig::new(self.kernel_size)
            .padding(self.padding)
            .activation(self.activation)
    }
}

/// A convolution followed by a [`ChannelGate`] and a [`SpatialGate`].
#[derive(Debug, Clone)]
pub struct Cbam {
    conv: Conv2d,
    channel_gate: ChannelGate,
    spatial_gate: Option<SpatialGate>,
    span: tracing::Span,
}

/// Create a [`Cbam`] block over `in_channels` input channels.
pub fn cbam(in_channels: usize, config: CbamConfig, vb: VarBuilder) -> crate::Result<Cbam> {
    let conv = conv2d(in_channels, config.filters, config.conv_config(), vb.pp("conv"))?;
    let channel_gate = channel_gate(config.filters, config.reduction_ratio, vb.pp("channel_gate"))?;
    let spatial_gate = if config.no_spatial {
        None
    } else {
        Some(spatial_gate(config.spatial_kernel_size, vb.pp("spatial_gate"))?)
    };
    Ok(Cbam {
        conv,
        channel_gate,
        spatial_gate,
        span: tracing::span!(tracing::Level::TRACE, "cbam"),
    })
}

impl Module for Cbam {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let xs = self.conv.forward(xs)?;
        let xs = self.channel_gate.forward(&xs)?;
        match &self.spatial_gate {
            Some(gate) => gate.forward(&xs),
            None => Ok(xs),
        }
    }
}
