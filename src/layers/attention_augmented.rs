//! Attention augmented convolution.
//!
//! A regular convolution whose output is concatenated with multi-head
//! self-attention computed over every spatial position of the input.
//! See: [arXiv:1904.09925 [cs.CV]](<https://arxiv.org/abs/1904.09925>)

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{ops, Init, VarBuilder};
use serde::Deserialize;

use super::conv::{conv2d, Conv2d, Conv2dConfig, KernelSize};
use crate::Error;

fn default_relative() -> bool {
    true
}

/// A config for an [`AaConv`].
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct AaConvConfig {
    /// The number of output channels, convolution and attention combined.
    pub channels_out: usize,
    /// The kernel size of the convolution branch.
    pub kernel_size: KernelSize,
    /// The total depth of the queries and keys.
    pub depth_k: usize,
    /// The total depth of the values, which is also the number of attention
    /// channels in the output.
    pub depth_v: usize,
    /// The number of attention heads.
    pub num_heads: usize,
    /// Whether to add learned relative position logits.
    #[serde(default = "default_relative")]
    pub relative: bool,
}

impl AaConvConfig {
    /// Create a new config with relative position logits enabled.
    pub fn new(
        channels_out: usize,
        kernel_size: impl Into<KernelSize>,
        depth_k: usize,
        depth_v: usize,
        num_heads: usize,
    ) -> Self {
        Self {
            channels_out,
            kernel_size: kernel_size.into(),
            depth_k,
            depth_v,
            num_heads,
            relative: true,
        }
    }

    /// Set whether to add relative position logits.
    pub fn relative(mut self, relative: bool) -> Self {
        self.relative = relative;
        self
    }

    fn validate(&self) -> crate::Result<()> {
        let Self {
            channels_out,
            depth_k,
            depth_v,
            num_heads,
            ..
        } = *self;
        if num_heads == 0 || depth_k < num_heads || depth_v < num_heads {
            return Err(Error::invalid_layer(
                "aa_conv",
                format!("depth_k ({depth_k}) and depth_v ({depth_v}) must be at least num_heads ({num_heads})"),
            ));
        }
        if depth_k % num_heads != 0 || depth_v % num_heads != 0 {
            return Err(Error::invalid_layer(
                "aa_conv",
                format!("depth_k ({depth_k}) and depth_v ({depth_v}) must be divisible by num_heads ({num_heads})"),
            ));
        }
        if channels_out <= depth_v {
            return Err(Error::invalid_layer(
                "aa_conv",
                format!("channels_out ({channels_out}) must be larger than depth_v ({depth_v})"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct RelativeEmbeddings {
    key_rel_w: Tensor,
    key_rel_h: Tensor,
    height: usize,
    width: usize,
}

impl RelativeEmbeddings {
    /// Width and height logits for queries shaped `(B, Nh, H, W, dkh)`, each
    /// shaped `(B, Nh, H*W, H*W)`.
    fn logits(&self, q: &Tensor) -> Result<(Tensor, Tensor)> {
        let (b, nh, h, w, _) = q.dims5()?;
        let hw = h * w;

        // [x, y, y'] for query (x, y) and key column y'
        let rel_w = relative_logits_1d(q, &self.key_rel_w)?
            .reshape((b, nh, hw, 1, w))?
            .broadcast_as((b, nh, hw, h, w))?
            .reshape((b, nh, hw, hw))?;

        // [y, x, x'] for query (x, y) and key row x'
        let q_t = q.transpose(2, 3)?.contiguous()?;
        let rel_h = relative_logits_1d(&q_t, &self.key_rel_h)?
            .transpose(2, 3)?
            .contiguous()?
            .reshape((b, nh, hw, h, 1))?
            .broadcast_as((b, nh, hw, h, w))?
            .reshape((b, nh, hw, hw))?;

        Ok((rel_w, rel_h))
    }
}

/// Logits of `q: (B, Nh, X, Y, d)` against relative embeddings `(2Y - 1, d)`,
/// indexed by absolute key position along the last axis: `(B, Nh, X, Y, Y)`.
fn relative_logits_1d(q: &Tensor, rel_k: &Tensor) -> Result<Tensor> {
    let (b, nh, x, y, d) = q.dims5()?;
    let logits = q.reshape((b * nh * x * y, d))?.matmul(&rel_k.t()?)?;
    let logits = rel_to_abs(&logits.reshape((b * nh * x, y, 2 * y - 1))?)?;
    logits.reshape((b, nh, x, y, y))
}

/// Converts `(N, L, 2L - 1)` relative logits into `(N, L, L)` absolute logits.
pub fn rel_to_abs(xs: &Tensor) -> Result<Tensor> {
    let (n, l, m) = xs.dims3()?;
    if m != 2 * l - 1 {
        candle_core::bail!("relative logits must be shaped (N, L, 2L - 1), got {:?}", xs.shape());
    }
    let xs = xs.pad_with_zeros(2, 0, 1)?.reshape((n, 2 * l * l))?;
    let xs = xs.pad_with_zeros(1, 0, l - 1)?.reshape((n, l + 1, 2 * l - 1))?;
    xs.narrow(1, 0, l)?.narrow(2, l - 1, l)
}

/// Splits channels into heads: `(B, d, H, W) -> (B, Nh, H, W, d / Nh)`.
pub fn split_heads_2d(xs: &Tensor, num_heads: usize) -> Result<Tensor> {
    let (b, d, h, w) = xs.dims4()?;
    if d % num_heads != 0 {
        candle_core::bail!("{d} channels cannot be split into {num_heads} heads");
    }
    xs.reshape((b, num_heads, d / num_heads, h, w))?
        .permute((0, 1, 3, 4, 2))?
        .contiguous()
}

/// Merges heads back into channels last: `(B, Nh, H, W, dh) -> (B, H, W, Nh * dh)`.
pub fn combine_heads_2d(xs: &Tensor) -> Result<Tensor> {
    let (b, nh, h, w, dh) = xs.dims5()?;
    xs.permute((0, 2, 3, 1, 4))?
        .contiguous()?
        .reshape((b, h, w, nh * dh))
}

/// An attention augmented convolution.
#[derive(Debug, Clone)]
pub struct AaConv {
    conv: Conv2d,
    qkv: Conv2d,
    attn_out: Conv2d,
    relative: Option<RelativeEmbeddings>,
    config: AaConvConfig,
    span: tracing::Span,
}

/// Create an [`AaConv`] for inputs shaped `(channels, height, width)`.
///
/// The spatial size is only used by the relative position embeddings.
pub fn aa_conv(
    (in_channels, height, width): (usize, usize, usize),
    config: AaConvConfig,
    vb: VarBuilder,
) -> crate::Result<AaConv> {
    config.validate()?;
    let AaConvConfig {
        channels_out,
        kernel_size,
        depth_k,
        depth_v,
        num_heads,
        relative,
    } = config;
    let conv = conv2d(
        in_channels,
        channels_out - depth_v,
        Conv2dConfig::new(kernel_size),
        vb.pp("conv"),
    )?;
    let qkv = conv2d(
        in_channels,
        2 * depth_k + depth_v,
        Conv2dConfig::new(1),
        vb.pp("qkv"),
    )?;
    let attn_out = conv2d(depth_v, depth_v, Conv2dConfig::new(1), vb.pp("attn_out"))?;
    let relative = if relative {
        if height == 0 || width == 0 {
            return Err(Error::invalid_layer(
                "aa_conv",
                "relative logits need a non-empty input",
            ));
        }
        let dkh = depth_k / num_heads;
        let init = Init::Randn {
            mean: 0.,
            stdev: (dkh as f64).powf(-0.5),
        };
        Some(RelativeEmbeddings {
            key_rel_w: vb.get_with_hints((2 * width - 1, dkh), "key_rel_w", init)?,
            key_rel_h: vb.get_with_hints((2 * height - 1, dkh), "key_rel_h", init)?,
            height,
            width,
        })
    } else {
        None
    };
    Ok(AaConv {
        conv,
        qkv,
        attn_out,
        relative,
        config,
        span: tracing::span!(tracing::Level::TRACE, "aa-conv"),
    })
}

impl AaConv {
    /// The config the layer was built with.
    pub fn config(&self) -> &AaConvConfig {
        &self.config
    }

    /// Multi-head self-attention over all positions: `(B, C, H, W) -> (B, depth_v, H, W)`.
    pub fn self_attention_2d(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, _, h, w) = xs.dims4()?;
        if let Some(relative) = &self.relative {
            if (h, w) != (relative.height, relative.width) {
                candle_core::bail!(
                    "relative attention was built for {}x{} inputs, got {h}x{w}",
                    relative.height,
                    relative.width
                );
            }
        }
        let AaConvConfig {
            depth_k: dk,
            depth_v: dv,
            num_heads: nh,
            ..
        } = self.config;
        let (dkh, dvh) = (dk / nh, dv / nh);

        let qkv = self.qkv.forward(xs)?;
        let q = split_heads_2d(&qkv.narrow(1, 0, dk)?, nh)?;
        let q = (q * (dkh as f64).powf(-0.5))?;
        let k = split_heads_2d(&qkv.narrow(1, dk, dk)?, nh)?;
        let v = split_heads_2d(&qkv.narrow(1, 2 * dk, dv)?, nh)?;

        let flat_q = q.reshape((b, nh, h * w, dkh))?;
        let flat_k = k.reshape((b, nh, h * w, dkh))?;
        let flat_v = v.reshape((b, nh, h * w, dvh))?;

        let mut logits = flat_q.matmul(&flat_k.t()?.contiguous()?)?;
        if let Some(relative) = &self.relative {
            let (rel_w, rel_h) = relative.logits(&q)?;
            logits = ((logits + rel_w)? + rel_h)?;
        }
        let weights = ops::softmax(&logits, D::Minus1)?;
        let attn = weights.matmul(&flat_v)?.reshape((b, nh, h, w, dvh))?;
        let attn = combine_heads_2d(&attn)?.permute((0, 3, 1, 2))?.contiguous()?;
        self.attn_out.forward(&attn)
    }
}

impl Module for AaConv {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let conv_out = self.conv.forward(xs)?;
        let attn_out = self.self_attention_2d(xs)?;
        Tensor::cat(&[conv_out, attn_out], 1)
    }
}
