//! Structured dropout that drops contiguous square regions of a feature map.
//! See: [arXiv:1810.12890 [cs.CV]](<https://arxiv.org/abs/1810.12890>)

use candle_core::{DType, ModuleT, Result, Tensor};
use serde::Deserialize;

use crate::Error;

/// A config for a [`DropBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct DropBlockConfig {
    /// The expected fraction of activations kept during training.
    pub keep_prob: f32,
    /// The side of every dropped square.
    pub block_size: usize,
}

/// DropBlock regularization. Only active in training mode.
#[derive(Debug, Clone)]
pub struct DropBlock {
    keep_prob: f32,
    block_size: usize,
    span: tracing::Span,
}

impl DropBlock {
    /// Create a new [`DropBlock`].
    pub fn new(keep_prob: f32, block_size: usize) -> crate::Result<Self> {
        if !(keep_prob > 0. && keep_prob <= 1.) {
            return Err(Error::invalid_layer(
                "drop_block",
                format!("keep_prob must be in (0, 1], got {keep_prob}"),
            ));
        }
        if block_size == 0 {
            return Err(Error::invalid_layer(
                "drop_block",
                "block_size must be at least 1",
            ));
        }
        Ok(Self {
            keep_prob,
            block_size,
            span: tracing::span!(tracing::Level::TRACE, "drop-block"),
        })
    }

    /// The block size used for an `h x w` feature map.
    pub fn block_size_for(&self, h: usize, w: usize) -> usize {
        self.block_size.min(h).min(w)
    }

    /// The probability of a valid position seeding a dropped block.
    pub fn gamma(&self, h: usize, w: usize) -> f64 {
        let bs = self.block_size_for(h, w);
        let valid = ((h - bs + 1) * (w - bs + 1)) as f64;
        (1. - self.keep_prob as f64) / (bs * bs) as f64 * (h * w) as f64 / valid
    }

    /// A mask of ones with zeroed blocks, shaped like `xs`.
    pub fn keep_mask(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = xs.dims4()?;
        if h == 0 || w == 0 {
            return xs.ones_like();
        }
        let bs = self.block_size_for(h, w);
        let gamma = self.gamma(h, w) as f32;
        let seeds = Tensor::rand(0f32, 1f32, (b, c, h - bs + 1, w - bs + 1), xs.device())?
            .lt(gamma)?
            .to_dtype(xs.dtype())?;
        // every seed covers the bs x bs block starting at its position
        let dropped = seeds
            .pad_with_zeros(2, bs - 1, bs - 1)?
            .pad_with_zeros(3, bs - 1, bs - 1)?
            .max_pool2d_with_stride(bs, 1)?;
        dropped.affine(-1., 1.)
    }
}

impl ModuleT for DropBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (_, _, h, w) = xs.dims4()?;
        if !train || self.keep_prob >= 1. || h == 0 || w == 0 {
            return Ok(xs.clone());
        }
        let mask = self.keep_mask(xs)?;
        let count = mask.elem_count() as f64;
        let kept = mask.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64;
        if kept == 0. {
            return xs.zeros_like();
        }
        (xs * mask)? * (count / kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn inference_is_identity() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let xs = Tensor::rand(0f32, 1f32, (2, 3, 8, 8), &dev)?;
        let layer = DropBlock::new(0.5, 3)?;
        let ys = layer.forward_t(&xs, false)?;
        let diff = (ys - &xs)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.);
        Ok(())
    }

    #[test]
    fn training_rescales_to_preserve_the_mean() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let xs = Tensor::ones((1, 1, 16, 16), DType::F32, &dev)?;
        let layer = DropBlock::new(0.5, 3)?;
        let ys = layer.forward_t(&xs, true)?;
        assert_eq!(ys.dims(), xs.dims());
        let mean = ys.mean_all()?.to_scalar::<f32>()?;
        assert!((mean - 1.).abs() < 1e-4, "mean was {mean}");

        // kept activations all share one scale
        let values = ys.flatten_all()?.to_vec1::<f32>()?;
        let scale = values.iter().copied().fold(0f32, f32::max);
        assert!(values.iter().all(|&v| v == 0. || v == scale));
        Ok(())
    }

    #[test]
    fn gamma_matches_the_paper() -> anyhow::Result<()> {
        let layer = DropBlock::new(0.9, 7)?;
        let expected = 0.1 / 49. * (36. * 36.) / (30. * 30.);
        assert!((layer.gamma(36, 36) - expected).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn block_is_clamped_to_small_maps() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let layer = DropBlock::new(0.8, 9)?;
        assert_eq!(layer.block_size_for(4, 6), 4);
        let xs = Tensor::ones((2, 2, 4, 6), DType::F32, &dev)?;
        assert_eq!(layer.forward_t(&xs, true)?.dims(), &[2, 2, 4, 6]);
        Ok(())
    }

    #[test]
    fn empty_maps_pass_through() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let layer = DropBlock::new(0.9, 3)?;
        for dims in [(2, 3, 0, 5), (2, 3, 5, 0)] {
            let xs = Tensor::zeros(dims, DType::F32, &dev)?;
            assert_eq!(layer.forward_t(&xs, true)?.dims(), xs.dims());
            assert_eq!(layer.keep_mask(&xs)?.dims(), xs.dims());
        }
        Ok(())
    }

    #[test]
    fn rejects_invalid_keep_prob() {
        assert!(DropBlock::new(0., 3).is_err());
        assert!(DropBlock::new(1.5, 3).is_err());
        assert!(DropBlock::new(0.9, 0).is_err());
    }
}
