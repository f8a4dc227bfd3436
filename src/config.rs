//! Classifier, training and run configuration.

use std::path::{Path, PathBuf};

use candle_nn::Activation;
use serde::Deserialize;

use crate::dataset::{DatasetKind, LoadOptions};
use crate::layers::*;
use crate::Result;

fn default_hidden_units() -> usize {
    128
}

fn default_classes() -> usize {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
/// A config for the dense head of a [`ConvClassifier`](crate::ConvClassifier).
pub struct ClassifierConfig {
    /// The width of the hidden dense layer.
    #[serde(default = "default_hidden_units")]
    pub hidden_units: usize,
    /// The number of classes.
    #[serde(default = "default_classes")]
    pub classes: usize,
    /// The dropout rate between the dense layers, if any.
    #[serde(default)]
    pub dropout_rate: Option<f32>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            hidden_units: default_hidden_units(),
            classes: default_classes(),
            dropout_rate: None,
        }
    }
}

impl ClassifierConfig {
    /// Set the width of the hidden dense layer.
    pub fn hidden_units(mut self, hidden_units: usize) -> Self {
        self.hidden_units = hidden_units;
        self
    }

    /// Set the number of classes.
    pub fn classes(mut self, classes: usize) -> Self {
        self.classes = classes;
        self
    }

    /// Set the dropout rate between the dense layers.
    pub fn dropout_rate(mut self, dropout_rate: Option<f32>) -> Self {
        self.dropout_rate = dropout_rate;
        self
    }
}

/// How a [`ConvClassifier`](crate::ConvClassifier) is trained.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// The number of passes over the training set.
    pub epochs: usize,
    /// The number of images per optimizer step.
    pub batch_size: usize,
    /// The Adam learning rate.
    pub learning_rate: f64,
    /// Log a line after every epoch.
    pub verbose: bool,
    /// Seed for the per epoch shuffle.
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 2,
            batch_size: 32,
            learning_rate: 1e-3,
            verbose: true,
            seed: None,
        }
    }
}

impl TrainingConfig {
    /// Set the number of epochs.
    pub fn epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    /// Set the batch size.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the learning rate.
    pub fn learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Set whether to log every epoch.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Set the shuffle seed.
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }
}

/// A complete harness run: which data, which layers, and how to train.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RunConfig {
    /// The dataset to train on.
    #[serde(default)]
    pub dataset: DatasetKind,
    /// The directory holding the dataset files.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// How the dataset is trimmed and reshaped.
    #[serde(default)]
    pub load: LoadOptions,
    /// The layers under test, in order.
    pub layers: Vec<LayerSpec>,
    /// The dense head.
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// The training loop.
    #[serde(default)]
    pub training: TrainingConfig,
}

impl RunConfig {
    /// Create a run of the given layers with default settings.
    pub fn new(layers: Vec<LayerSpec>) -> Self {
        Self {
            dataset: DatasetKind::default(),
            data_dir: None,
            load: LoadOptions::default(),
            layers,
            classifier: ClassifierConfig::default(),
            training: TrainingConfig::default(),
        }
    }

    /// Read a run from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// The run the harness performs for a layer preset.
    pub fn preset(preset: LayerPreset) -> Self {
        let relu = Some(Activation::Relu);
        // dense head with dropout, trained for five epochs
        let sequential = |layers: Vec<LayerSpec>, repeats: usize, max_instances: usize| {
            let mut run = Self::new(layers);
            run.load = LoadOptions::default()
                .repeats(repeats)
                .max_instances(Some(max_instances));
            run.classifier = run.classifier.dropout_rate(Some(0.2));
            run.training = run.training.epochs(5);
            run
        };
        match preset {
            LayerPreset::AaConv => Self::new(vec![LayerSpec::AaConv(AaConvConfig::new(32, 3, 8, 8, 4))]),
            LayerPreset::MixConv | LayerPreset::MixConvDepthwise => sequential(
                vec![LayerSpec::MixConv(
                    MixConvConfig::new(53, [(3, 3), (5, 5)])
                        .depthwise(preset == LayerPreset::MixConvDepthwise)
                        .activation(relu),
                )],
                2,
                600,
            ),
            LayerPreset::ChannelGate => Self::new(vec![
                LayerSpec::Conv2d {
                    filters: 32,
                    config: Conv2dConfig::new(3).activation(relu),
                },
                LayerSpec::ChannelGate { reduction_ratio: 3 },
            ]),
            LayerPreset::SpatialGate => Self::new(vec![
                LayerSpec::Conv2d {
                    filters: 32,
                    config: Conv2dConfig::new(3).activation(relu),
                },
                LayerSpec::SpatialGate {
                    kernel_size: KernelSize::Square(7),
                },
            ]),
            LayerPreset::Cbam => sequential(
                vec![LayerSpec::Cbam(CbamConfig::new(50, 2, (3, 3)).activation(relu))],
                1,
                60000,
            ),
            LayerPreset::Eca => Self::new(vec![LayerSpec::EcaConv(
                EcaConvConfig::new(50, (3, 3)).eca_k_size(3).activation(relu),
            )]),
            LayerPreset::DropBlock => sequential(
                vec![
                    LayerSpec::Conv2d {
                        filters: 50,
                        config: Conv2dConfig::new((3, 3)).activation(relu),
                    },
                    LayerSpec::DropBlock(DropBlockConfig {
                        keep_prob: 0.9,
                        block_size: 7,
                    }),
                ],
                1,
                60000,
            ),
            LayerPreset::GroupConv => {
                let mut run = Self::new(vec![LayerSpec::GroupConv2d(
                    GroupConv2dConfig::new(60, (3, 3), 6).activation(relu),
                )]);
                run.load = run.load.repeats(6);
                run
            }
        }
    }
}

/// The layer stacks the harness knows how to run without a config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LayerPreset {
    /// An attention augmented convolution.
    AaConv,
    /// A mixed kernel convolution.
    MixConv,
    /// A mixed kernel depthwise convolution.
    MixConvDepthwise,
    /// A convolution followed by a channel gate.
    ChannelGate,
    /// A convolution followed by a spatial gate.
    SpatialGate,
    /// A CBAM block.
    Cbam,
    /// A convolution with efficient channel attention.
    Eca,
    /// A convolution followed by DropBlock.
    DropBlock,
    /// A grouped convolution.
    GroupConv,
}
