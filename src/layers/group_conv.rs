//! Grouped convolution: input and output channels split into groups that
//! are convolved independently.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Activation, VarBuilder};
use serde::Deserialize;

use super::conv::{conv2d, Conv2d, Conv2dConfig, KernelSize, Padding};
use crate::Error;

/// A config for a [`GroupConv2d`].
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct GroupConv2dConfig {
    /// The number of output channels.
    pub filters: usize,
    /// The kernel size.
    pub kernel_size: KernelSize,
    /// The number of groups both channel axes are split into.
    pub groups: usize,
    /// The padding mode.
    #[serde(default)]
    pub padding: Padding,
    /// An activation applied to the output.
    #[serde(default)]
    pub activation: Option<Activation>,
}

impl GroupConv2dConfig {
    /// Create a new config.
    pub fn new(filters: usize, kernel_size: impl Into<KernelSize>, groups: usize) -> Self {
        Self {
            filters,
            kernel_size: kernel_size.into(),
            groups,
            padding: Padding::Same,
            activation: None,
        }
    }

    /// Set the padding mode.
    pub fn padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    /// Set the output activation.
    pub fn activation(mut self, activation: Option<Activation>) -> Self {
        self.activation = activation;
        self
    }

    pub(crate) fn conv_config(&self) -> Conv2dConfig {
        Conv2dConfig::new(self.kernel_size)
            .groups(self.groups)
            .padding(self.padding)
            .activation(self.activation)
    }
}

/// A grouped convolution: each group of input channels only feeds its own
/// group of output channels.
#[derive(Debug, Clone)]
pub struct GroupConv2d {
    conv: Conv2d,
    span: tracing::Span,
}

/// Create a [`GroupConv2d`] over `in_channels` input channels.
pub fn group_conv2d(
    in_channels: usize,
    config: GroupConv2dConfig,
    vb: VarBuilder,
) -> crate::Result<GroupConv2d> {
    let GroupConv2dConfig {
        filters, groups, ..
    } = config;
    if groups == 0 || in_channels % groups != 0 || filters % groups != 0 {
        return Err(Error::invalid_layer(
            "group_conv2d",
            format!("{in_channels} input and {filters} output channels cannot be split into {groups} groups"),
        ));
    }
    Ok(GroupConv2d {
        conv: conv2d(in_channels, filters, config.conv_config(), vb)?,
        span: tracing::span!(tracing::Level::TRACE, "group-conv"),
    })
}

impl GroupConv2d {
    /// The kernel, shaped `(filters, in_channels / groups, kh, kw)`.
    pub fn weight(&self) -> &Tensor {
        self.conv.weight()
    }
}

impl Module for GroupConv2d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        self.conv.forward(xs)
    }
}
