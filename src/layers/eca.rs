//! Efficient channel attention.
//! See: [arXiv:1910.03151 [cs.CV]](<https://arxiv.org/abs/1910.03151>)

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{init, ops, Activation, VarBuilder};
use serde::Deserialize;

use super::conv::{conv2d, Conv2d, Conv2dConfig, KernelSize, Padding};
use crate::Error;

/// The 1D kernel width picked for `channels` channels when none is given:
/// the nearest odd number to `(log2(C) + 1) / 2`, rounding up.
pub fn adaptive_kernel_size(channels: usize) -> usize {
    const GAMMA: f64 = 2.;
    const B: f64 = 1.;
    let t = ((channels as f64).log2() / GAMMA + B / GAMMA).abs() as usize;
    if t % 2 == 1 {
        t
    } else {
        t + 1
    }
}

/// Rescales channels by weights computed with a 1D convolution across the
/// globally pooled channel descriptor.
#[derive(Debug, Clone)]
pub struct Eca {
    kernel: Tensor,
    span: tracing::Span,
}

/// Create an [`Eca`] over `channels` channels. `k_size` defaults to
/// [`adaptive_kernel_size`].
pub fn eca(channels: usize, k_size: Option<usize>, vb: VarBuilder) -> crate::Result<Eca> {
    let k_size = k_size.unwrap_or_else(|| adaptive_kernel_size(channels));
    if k_size % 2 == 0 {
        return Err(Error::invalid_layer(
            "eca",
            format!("kernel size must be odd, got {k_size}"),
        ));
    }
    let kernel = vb.get_with_hints((1, 1, k_size), "weight", init::DEFAULT_KAIMING_NORMAL)?;
    Ok(Eca {
        kernel,
        span: tracing::span!(tracing::Level::TRACE, "eca"),
    })
}

impl Eca {
    /// The width of the 1D kernel.
    pub fn kernel_size(&self) -> usize {
        self.kernel.dims()[2]
    }

    /// The per channel weights in `(0, 1)`, shaped `(B, C, 1, 1)`.
    pub fn attention(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, c, _, _) = xs.dims4()?;
        let pooled = xs.flatten_from(2)?.mean(D::Minus1)?.reshape((b, 1, c))?;
        let padding = (self.kernel_size() - 1) / 2;
        let logits = pooled.conv1d(&self.kernel, padding, 1, 1, 1)?;
        ops::sigmoid(&logits)?.reshape((b, c, 1, 1))
    }
}

impl Module for Eca {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        xs.broadcast_mul(&self.attention(xs)?)
    }
}

/// A config for an [`EcaConv`].
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct EcaConvConfig {
    /// The number of output channels of the convolution.
    pub filters: usize,
    /// The width of the channel attention kernel, derived from `filters` when unset.
    #[serde(default)]
    pub eca_k_size: Option<usize>,
    /// The kernel size of the convolution.
    pub kernel_size: KernelSize,
    /// The padding of the convolution.
    #[serde(default)]
    pub padding: Padding,
    /// An activation applied after the convolution.
    #[serde(default)]
    pub activation: Option<Activation>,
}

impl EcaConvConfig {
    /// Create a new config.
    pub fn new(filters: usize, kernel_size: impl Into<KernelSize>) -> Self {
        Self {
            filters,
            eca_k_size: None,
            kernel_size: kernel_size.into(),
            padding: Padding::Same,
            activation: None,
        }
    }

    /// Set the width of the channel attention kernel.
    pub fn eca_k_size(mut self, eca_k_size: usize) -> Self {
        self.eca_k_size = Some(eca_k_size);
        self
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

    pub(crate) fn conv_config(&self) -> Conv2dConfig {
        Conv2dConfig::new(self.kernel_size)
            .padding(self.padding)
            .activation(self.activation)
    }
}

/// A convolution followed by an [`Eca`].
#[derive(Debug, Clone)]
pub struct EcaConv {
    conv: Conv2d,
    eca: Eca,
    span: tracing::Span,
}

/// Create an [`EcaConv`] over `in_channels` input channels.
pub fn eca_conv(in_channels: usize, config: EcaConvConfig, vb: VarBuilder) -> crate::Result<EcaConv> {
    Ok(EcaConv {
        conv: conv2d(in_channels, config.filters, config.conv_config(), vb.pp("conv"))?,
        eca: eca(config.filters, config.eca_k_size, vb.pp("eca"))?,
        span: tracing::span!(tracing::Level::TRACE, "eca-conv"),
    })
}

impl Module for EcaConv {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        self.eca.forward(&self.conv.forward(xs)?)
    }
}
