//! Mixed depthwise convolution: channels are split into groups and every group
//! is convolved with a different kernel size.
//! See: [arXiv:1907.09595 [cs.CV]](<https://arxiv.org/abs/1907.09595>)

use candle_core::{Module, Result, Tensor};
use candle_nn::{Activation, VarBuilder};
use serde::Deserialize;

use super::conv::{conv2d, Conv2d, Conv2dConfig, KernelSize};
use crate::Error;

/// Splits `total` channels into `groups` near-equal parts, the first part
/// taking the remainder.
///
/// ```rust
/// assert_eq!(conv_variants::split_channels(49, 4), vec![13, 12, 12, 12]);
/// ```
pub fn split_channels(total: usize, groups: usize) -> Vec<usize> {
    if groups == 0 {
        return Vec::new();
    }
    let mut split = vec![total / groups; groups];
    split[0] += total - split.iter().sum::<usize>();
    split
}

/// A config for a [`MixConv`].
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MixConvConfig {
    /// The number of output channels.
    pub channels_out: usize,
    /// One kernel size per channel group.
    pub kernel_sizes: Vec<KernelSize>,
    /// Use a depthwise convolution followed by a pointwise projection in each group.
    #[serde(default)]
    pub depthwise: bool,
    /// An activation applied to the concatenated output.
    #[serde(default)]
    pub activation: Option<Activation>,
}

impl MixConvConfig {
    /// Create a new config.
    pub fn new<K: Into<KernelSize>>(
        channels_out: usize,
        kernel_sizes: impl IntoIterator<Item = K>,
    ) -> Self {
        Self {
            channels_out,
            kernel_sizes: kernel_sizes.into_iter().map(Into::into).collect(),
            depthwise: false,
            activation: None,
        }
    }

    /// Set whether every group is a depthwise convolution.
    pub fn depthwise(mut self, depthwise: bool) -> Self {
        self.depthwise = depthwise;
        self
    }

    /// Set the output activation.
    pub fn activation(mut self, activation: Option<Activation>) -> Self {
        self.activation = activation;
        self
    }
}

#[derive(Debug, Clone)]
enum MixGroup {
    Full(Conv2d),
    Depthwise { depthwise: Conv2d, pointwise: Conv2d },
}

impl Module for MixGroup {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            MixGroup::Full(conv) => conv.forward(xs),
            MixGroup::Depthwise {
                depthwise,
                pointwise,
            } => pointwise.forward(&depthwise.forward(xs)?),
        }
    }
}

/// A mixed kernel size convolution.
#[derive(Debug, Clone)]
pub struct MixConv {
    groups: Vec<MixGroup>,
    in_splits: Vec<usize>,
    activation: Option<Activation>,
    span: tracing::Span,
}

/// Create a [`MixConv`] over `in_channels` input channels.
pub fn mix_conv(in_channels: usize, config: MixConvConfig, vb: VarBuilder) -> crate::Result<MixConv> {
    let MixConvConfig {
        channels_out,
        kernel_sizes,
        depthwise,
        activation,
    } = config;
    let groups = kernel_sizes.len();
    if groups == 0 {
        return Err(Error::invalid_layer("mix_conv", "no kernel sizes given"));
    }
    if groups > in_channels || groups > channels_out {
        return Err(Error::invalid_layer(
            "mix_conv",
            format!("{groups} kernel sizes cannot split {in_channels} input and {channels_out} output channels"),
        ));
    }
    let in_splits = split_channels(in_channels, groups);
    let out_splits = split_channels(channels_out, groups);
    let groups = kernel_sizes
        .iter()
        .zip(in_splits.iter().zip(&out_splits))
        .enumerate()
        .map(|(i, (kernel, (&cin, &cout)))| {
            let vb = vb.pp(format!("group{i}"));
            let group = if depthwise {
                MixGroup::Depthwise {
                    depthwise: conv2d(
                        cin,
                        cin,
                        Conv2dConfig::new(*kernel).groups(cin),
                        vb.pp("depthwise"),
                    )?,
                    pointwise: conv2d(cin, cout, Conv2dConfig::new(1), vb.pp("pointwise"))?,
                }
            } else {
                MixGroup::Full(conv2d(cin, cout, Conv2dConfig::new(*kernel), vb)?)
            };
            Ok(group)
        })
        .collect::<crate::Result<Vec<_>>>()?;
    Ok(MixConv {
        groups,
        in_splits,
        activation,
        span: tracing::span!(tracing::Level::TRACE, "mix-conv"),
    })
}

impl MixConv {
    /// The number of input channels routed to each kernel size.
    pub fn in_splits(&self) -> &[usize] {
        &self.in_splits
    }
}

impl Module for MixConv {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut offset = 0;
        let mut outputs = Vec::with_capacity(self.groups.len());
        for (group, &channels) in self.groups.iter().zip(&self.in_splits) {
            outputs.push(group.forward(&xs.narrow(1, offset, channels)?)?);
            offset += channels;
        }
        let ys = Tensor::cat(&outputs, 1)?;
        match &self.activation {
            Some(activation) => ys.apply(activation),
            None => Ok(ys),
        }
    }
}
