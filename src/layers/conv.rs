//! A 2D convolution with rectangular kernels and `same`/`valid` padding.
//!
//! Every layer variant in this crate is built out of [`Conv2d`].

use candle_core::{Module, Result, Tensor};
use candle_nn::{init, Activation, Init, VarBuilder};
use serde::Deserialize;

use crate::Error;

/// The spatial size of a convolution kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum KernelSize {
    /// A `k x k` kernel.
    Square(usize),
    /// A `kh x kw` kernel.
    Rect(usize, usize),
}

impl KernelSize {
    /// The kernel height and width.
    pub fn dims(&self) -> (usize, usize) {
        match *self {
            KernelSize::Square(k) => (k, k),
            KernelSize::Rect(kh, kw) => (kh, kw),
        }
    }
}

impl From<usize> for KernelSize {
    fn from(k: usize) -> Self {
        KernelSize::Square(k)
    }
}

impl From<(usize, usize)> for KernelSize {
    fn from((kh, kw): (usize, usize)) -> Self {
        KernelSize::Rect(kh, kw)
    }
}

/// How the borders of the input are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    /// Zero pad so the output has `ceil(input / stride)` pixels along each axis.
    #[default]
    Same,
    /// No padding.
    Valid,
}

/// The number of zeros added before and after an axis for [`Padding::Same`].
///
/// An odd total puts the extra zero after the axis.
pub fn same_padding(input: usize, kernel: usize, stride: usize, dilation: usize) -> (usize, usize) {
    let effective = dilation * (kernel - 1) + 1;
    let output = input.div_ceil(stride);
    let total = ((output - 1) * stride + effective).saturating_sub(input);
    (total / 2, total - total / 2)
}

/// A config for a [`Conv2d`].
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Conv2dConfig {
    /// The kernel size.
    pub kernel: KernelSize,
    /// The stride along both axes.
    pub stride: usize,
    /// The dilation along both axes.
    pub dilation: usize,
    /// The number of channel groups.
    pub groups: usize,
    /// The padding mode.
    pub padding: Padding,
    /// Whether to add a learned bias.
    pub bias: bool,
    /// An activation applied to the output.
    pub activation: Option<Activation>,
}

impl Default for Conv2dConfig {
    fn default() -> Self {
        Self {
            kernel: KernelSize::Square(3),
            stride: 1,
            dilation: 1,
            groups: 1,
            padding: Padding::Same,
            bias: true,
            activation: None,
        }
    }
}

impl Conv2dConfig {
    /// Create a new config with the given kernel size.
    pub fn new(kernel: impl Into<KernelSize>) -> Self {
        Self {
            kernel: kernel.into(),
            ..Default::default()
        }
    }

    /// Set the stride.
    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    /// Set the dilation.
    pub fn dilation(mut self, dilation: usize) -> Self {
        self.dilation = dilation;
        self
    }

    /// Set the number of channel groups.
    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    /// Set the padding mode.
    pub fn padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    /// Set whether the convolution has a bias.
    pub fn bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    /// Set the output activation.
    pub fn activation(mut self, activation: Option<Activation>) -> Self {
        self.activation = activation;
        self
    }

    /// The output height and width for an input of `h x w`, or `None` if the
    /// kernel does not fit a `valid` input.
    pub fn output_hw(&self, h: usize, w: usize) -> Option<(usize, usize)> {
        let (kh, kw) = self.kernel.dims();
        if kh == 0 || kw == 0 || self.stride == 0 || self.dilation == 0 {
            return None;
        }
        match self.padding {
            Padding::Same => Some((h.div_ceil(self.stride), w.div_ceil(self.stride))),
            Padding::Valid => {
                let eh = self.dilation * (kh - 1) + 1;
                let ew = self.dilation * (kw - 1) + 1;
                if h < eh || w < ew {
                    return None;
                }
                Some(((h - eh) / self.stride + 1, (w - ew) / self.stride + 1))
            }
        }
    }
}

/// A 2D convolution over `(batch, channels, height, width)` inputs.
#[derive(Debug, Clone)]
pub struct Conv2d {
    weight: Tensor,
    bias: Option<Tensor>,
    config: Conv2dConfig,
    span: tracing::Span,
}

impl Conv2d {
    /// The kernel, shaped `(out, in / groups, kh, kw)`.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// The config the convolution was built with.
    pub fn config(&self) -> &Conv2dConfig {
        &self.config
    }

    /// The number of output channels.
    pub fn out_channels(&self) -> usize {
        self.weight.dims()[0]
    }
}

/// Create a [`Conv2d`] with its parameters stored under `vb`.
pub fn conv2d(
    in_channels: usize,
    out_channels: usize,
    config: Conv2dConfig,
    vb: VarBuilder,
) -> crate::Result<Conv2d> {
    let (kh, kw) = config.kernel.dims();
    if in_channels == 0 || out_channels == 0 || kh == 0 || kw == 0 {
        return Err(Error::invalid_layer(
            "conv2d",
            format!("zero sized convolution {in_channels}->{out_channels} with kernel {kh}x{kw}"),
        ));
    }
    if config.stride == 0 || config.dilation == 0 || config.groups == 0 {
        return Err(Error::invalid_layer(
            "conv2d",
            "stride, dilation and groups must be at least 1",
        ));
    }
    if in_channels % config.groups != 0 || out_channels % config.groups != 0 {
        return Err(Error::invalid_layer(
            "conv2d",
            format!(
                "{in_channels} input and {out_channels} output channels are not divisible into {} groups",
                config.groups
            ),
        ));
    }
    let in_per_group = in_channels / config.groups;
    let weight = vb.get_with_hints(
        (out_channels, in_per_group, kh, kw),
        "weight",
        init::DEFAULT_KAIMING_NORMAL,
    )?;
    let bias = if config.bias {
        let bound = 1. / ((in_per_group * kh * kw) as f64).sqrt();
        Some(vb.get_with_hints(
            out_channels,
            "bias",
            Init::Uniform {
                lo: -bound,
                up: bound,
            },
        )?)
    } else {
        None
    };
    Ok(Conv2d {
        weight,
        bias,
        config,
        span: tracing::span!(tracing::Level::TRACE, "conv2d"),
    })
}

impl Module for Conv2d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let Conv2dConfig {
            kernel,
            stride,
            dilation,
            groups,
            padding,
            ..
        } = self.config;
        let (_, _, h, w) = xs.dims4()?;
        let xs = match padding {
            Padding::Same => {
                let (kh, kw) = kernel.dims();
                let (top, bottom) = same_padding(h, kh, stride, dilation);
                let (left, right) = same_padding(w, kw, stride, dilation);
                xs.pad_with_zeros(2, top, bottom)?
                    .pad_with_zeros(3, left, right)?
            }
            Padding::Valid => xs.clone(),
        };
        let mut ys = xs.conv2d(&self.weight, 0, stride, dilation, groups)?;
        if let Some(bias) = &self.bias {
            ys = ys.broadcast_add(&bias.reshape((1, self.out_channels(), 1, 1))?)?;
        }
        match &self.config.activation {
            Some(activation) => ys.apply(activation),
            None => Ok(ys),
        }
    }
}
