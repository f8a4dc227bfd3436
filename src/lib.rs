//! # conv-variants
//!
//! Convolution layer variants implemented in [Candle](https://github.com/huggingface/candle),
//! and a small harness that trains each one on MNIST or CIFAR-10 to check
//! that shapes line up and gradients reach every parameter.
//!
//! The layers:
//! - [`AaConv`]: a convolution concatenated with multi-head 2D self attention
//!   over the spatial positions, with optional relative position logits
//! - [`MixConv`]: channel groups convolved with different kernel sizes
//! - [`ChannelGate`], [`SpatialGate`] and [`Cbam`]: convolutional block attention
//! - [`Eca`] and [`EcaConv`]: efficient channel attention
//! - [`DropBlock`]: structured dropout of contiguous spatial blocks
//! - [`GroupConv2d`]: a grouped convolution
//!
//! ## Usage
//!
//! ```rust
//! use candle_core::{DType, Device, Module, Tensor};
//! use candle_nn::{VarBuilder, VarMap};
//! use conv_variants::*;
//!
//! # fn main() -> conv_variants::Result<()> {
//! let dev = Device::Cpu;
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
//! let cbam = cbam(3, CbamConfig::new(50, 2, (3, 3)), vb.pp("cbam"))?;
//! let xs = Tensor::randn(0f32, 1., (2, 3, 12, 16), &dev)?;
//! assert_eq!(cbam.forward(&xs)?.dims(), &[2, 50, 12, 16]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

pub mod config;
pub mod dataset;
pub mod device;
mod error;
pub mod layers;
pub mod metrics;
pub mod model;

pub use config::*;
pub use dataset::*;
pub use device::*;
pub use error::*;
pub use layers::*;
pub use metrics::*;
pub use model::*;
