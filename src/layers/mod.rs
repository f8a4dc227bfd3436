//! Convolution layer variants.
//!
//! Every layer takes channels first `(batch, channels, height, width)` inputs.
//! Layers are built with a constructor function taking a [`VarBuilder`], like
//! the layers in `candle_nn`, or from a serializable [`LayerSpec`].

pub mod attention_augmented;
pub mod conv;
pub mod drop_block;
pub mod eca;
pub mod gates;
pub mod group_conv;
pub mod mix_conv;

pub use attention_augmented::*;
pub use conv::*;
pub use drop_block::*;
pub use eca::*;
pub use gates::*;
pub use group_conv::*;
pub use mix_conv::*;

use candle_core::{ModuleT, Result, Tensor};
use candle_nn::VarBuilder;
use serde::Deserialize;

use crate::Error;

fn default_spatial_kernel() -> KernelSize {
    KernelSize::Square(7)
}

/// A description of one layer, used to build models from config files.
///
/// ```rust
/// use conv_variants::LayerSpec;
///
/// let spec: LayerSpec = serde_json::from_str(
///     r#"{"type": "group_conv2d", "filters": 60, "kernel_size": [3, 3], "groups": 6, "activation": "relu"}"#,
/// )
/// .unwrap();
/// assert_eq!(spec.output_dims((48, 36, 54)).unwrap(), (60, 36, 54));
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    /// A plain [`Conv2d`].
    Conv2d {
        /// The number of output channels.
        filters: usize,
        /// The convolution settings.
        #[serde(flatten)]
        config: Conv2dConfig,
    },
    /// An [`AaConv`].
    AaConv(AaConvConfig),
    /// A [`MixConv`].
    MixConv(MixConvConfig),
    /// A [`ChannelGate`].
    ChannelGate {
        /// The bottleneck ratio.
        reduction_ratio: usize,
    },
    /// A [`SpatialGate`].
    SpatialGate {
        /// The attention map kernel size.
        #[serde(default = "default_spatial_kernel")]
        kernel_size: KernelSize,
    },
    /// A [`Cbam`] block.
    Cbam(CbamConfig),
    /// An [`Eca`] without a convolution in front.
    Eca {
        /// The 1D kernel width, derived from the channel count when unset.
        #[serde(default)]
        k_size: Option<usize>,
    },
    /// An [`EcaConv`].
    EcaConv(EcaConvConfig),
    /// A [`DropBlock`].
    DropBlock(DropBlockConfig),
    /// A [`GroupConv2d`].
    GroupConv2d(GroupConv2dConfig),
}

impl LayerSpec {
    /// A short name for the layer kind.
    pub fn name(&self) -> &'static str {
        match self {
            LayerSpec::Conv2d { .. } => "conv2d",
            LayerSpec::AaConv(_) => "aa_conv",
            LayerSpec::MixConv(_) => "mix_conv",
            LayerSpec::ChannelGate { .. } => "channel_gate",
            LayerSpec::SpatialGate { .. } => "spatial_gate",
            LayerSpec::Cbam(_) => "cbam",
            LayerSpec::Eca { .. } => "eca",
            LayerSpec::EcaConv(_) => "eca_conv",
            LayerSpec::DropBlock(_) => "drop_block",
            LayerSpec::GroupConv2d(_) => "group_conv2d",
        }
    }

    /// The `(channels, height, width)` this layer produces for an input of
    /// `(channels, height, width)`.
    pub fn output_dims(&self, (c, h, w): (usize, usize, usize)) -> crate::Result<(usize, usize, usize)> {
        let conv_output = |channels: usize, config: Conv2dConfig| {
            config
                .output_hw(h, w)
                .map(|(h, w)| (channels, h, w))
                .ok_or_else(|| {
                    Error::invalid_layer(
                        self.name(),
                        format!("kernel {:?} does not fit a {h}x{w} input", config.kernel.dims()),
                    )
                })
        };
        match self {
            LayerSpec::Conv2d { filters, config } => conv_output(*filters, *config),
            LayerSpec::AaConv(config) => Ok((config.channels_out, h, w)),
            LayerSpec::MixConv(config) => Ok((config.channels_out, h, w)),
            LayerSpec::ChannelGate { .. }
            | LayerSpec::SpatialGate { .. }
            | LayerSpec::Eca { .. }
            | LayerSpec::DropBlock(_) => Ok((c, h, w)),
            LayerSpec::Cbam(config) => conv_output(config.filters, config.conv_config()),
            LayerSpec::EcaConv(config) => conv_output(config.filters, config.conv_config()),
            LayerSpec::GroupConv2d(config) => conv_output(config.filters, config.conv_config()),
        }
    }

    /// Build the layer for inputs shaped `(channels, height, width)`.
    pub fn build(&self, input: (usize, usize, usize), vb: VarBuilder) -> crate::Result<Box<dyn ModuleT>> {
        let (c, _, _) = input;
        let layer: Box<dyn ModuleT> = match self {
            LayerSpec::Conv2d { filters, config } => Box::new(conv2d(c, *filters, *config, vb)?),
            LayerSpec::AaConv(config) => Box::new(aa_conv(input, *config, vb)?),
            LayerSpec::MixConv(config) => Box::new(mix_conv(c, config.clone(), vb)?),
            LayerSpec::ChannelGate { reduction_ratio } => {
                Box::new(channel_gate(c, *reduction_ratio, vb)?)
            }
            LayerSpec::SpatialGate { kernel_size } => Box::new(spatial_gate(*kernel_size, vb)?),
            LayerSpec::Cbam(config) => Box::new(cbam(c, *config, vb)?),
            LayerSpec::Eca { k_size } => Box::new(eca(c, *k_size, vb)?),
            LayerSpec::EcaConv(config) => Box::new(eca_conv(c, *config, vb)?),
            LayerSpec::DropBlock(config) => {
                Box::new(DropBlock::new(config.keep_prob, config.block_size)?)
            }
            LayerSpec::GroupConv2d(config) => Box::new(group_conv2d(c, *config, vb)?),
        };
        Ok(layer)
    }
}

/// A sequence of layers built from [`LayerSpec`]s.
pub struct LayerStack {
    layers: Vec<(&'static str, Box<dyn ModuleT>)>,
    output_dims: (usize, usize, usize),
    span: tracing::Span,
}

impl LayerStack {
    /// Build every layer in order, feeding each one the output dims of the previous.
    pub fn new(
        specs: &[LayerSpec],
        input: (usize, usize, usize),
        vb: VarBuilder,
    ) -> crate::Result<Self> {
        let mut dims = input;
        let mut layers = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            let layer = spec.build(dims, vb.pp(format!("layer{i}")))?;
            let next = spec.output_dims(dims)?;
            tracing::debug!("layer{i} {}: {dims:?} -> {next:?}", spec.name());
            layers.push((spec.name(), layer));
            dims = next;
        }
        Ok(Self {
            layers,
            output_dims: dims,
            span: tracing::span!(tracing::Level::TRACE, "layers"),
        })
    }

    /// The `(channels, height, width)` of the last layer's output.
    pub fn output_dims(&self) -> (usize, usize, usize) {
        self.output_dims
    }

    /// The names of the layers, in order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.layers.iter().map(|(name, _)| *name)
    }

    /// The number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the stack has no layers.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl ModuleT for LayerStack {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let mut xs = xs.clone();
        for (_, layer) in &self.layers {
            xs = layer.forward_t(&xs, train)?;
        }
        Ok(xs)
    }
}
