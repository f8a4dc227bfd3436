//! A classifier that runs a [`LayerStack`], flattens its output, and feeds
//! it through a relu dense layer with optional dropout to the class logits.
//!
//! [`ConvClassifier::train`] fits it with Adam and cross entropy, and
//! [`ConvClassifier::gradient_flow`] checks that every parameter receives a
//! gradient.

use std::path::Path;

use candle_core::{DType, Device, Module, ModuleT, Tensor, D};
use candle_nn::{loss, ops, AdamW, Dropout, Linear, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::{ClassifierConfig, TrainingConfig};
use crate::dataset::ImageDataset;
use crate::layers::{LayerSpec, LayerStack};
use crate::metrics::{Mean, SparseCategoricalAccuracy};
use crate::{Error, Result};

/// The metrics of one training epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochReport {
    /// The epoch number, starting at 1.
    pub epoch: usize,
    /// The mean training batch loss.
    pub train_loss: f32,
    /// The training accuracy in `[0, 1]`.
    pub train_accuracy: f32,
    /// The mean test batch loss.
    pub test_loss: f32,
    /// The test accuracy in `[0, 1]`.
    pub test_accuracy: f32,
}

/// The reports of every epoch of a training run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingHistory {
    /// One report per epoch, in order.
    pub epochs: Vec<EpochReport>,
}

impl TrainingHistory {
    /// The report of the last epoch.
    pub fn last(&self) -> Option<&EpochReport> {
        self.epochs.last()
    }
}

/// The loss and accuracy of a model on a labeled set of images.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalReport {
    /// The mean batch loss.
    pub loss: f32,
    /// The accuracy in `[0, 1]`.
    pub accuracy: f32,
}

/// The gradient of one parameter after a backward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterGradient {
    /// The parameter name, e.g. `layers.layer0.qkv.weight`.
    pub name: String,
    /// The parameter shape.
    pub shape: Vec<usize>,
    /// The L2 norm of the gradient, `None` if the loss does not depend on it.
    pub norm: Option<f32>,
}

impl ParameterGradient {
    /// Whether the gradient exists, is finite and is not all zeros.
    pub fn flows(&self) -> bool {
        matches!(self.norm, Some(norm) if norm.is_finite() && norm > 0.)
    }
}

/// The gradients of every parameter of a model after one backward pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GradientReport {
    /// Every parameter, sorted by name.
    pub parameters: Vec<ParameterGradient>,
}

impl GradientReport {
    /// The parameters gradients do not reach.
    pub fn blocked(&self) -> impl Iterator<Item = &ParameterGradient> {
        self.parameters.iter().filter(|p| !p.flows())
    }

    /// Whether every parameter receives a usable gradient.
    pub fn all_flow(&self) -> bool {
        self.blocked().next().is_none()
    }
}

/// The layers under test followed by a dense classification head:
/// `layers -> flatten -> dense + relu -> [dropout] -> dense`.
pub struct ConvClassifier {
    device: Device,
    varmap: VarMap,
    layers: LayerStack,
    hidden: Linear,
    dropout: Option<Dropout>,
    output: Linear,
    input_dims: (usize, usize, usize),
    config: ClassifierConfig,
}

impl ConvClassifier {
    /// Create a new classifier for images shaped `(channels, height, width)`.
    ///
    /// # Example
    /// ```rust
    /// use conv_variants::{ClassifierConfig, ConvClassifier, DropBlockConfig, LayerSpec};
    ///
    /// let dev = candle_core::Device::Cpu;
    /// let layers = [LayerSpec::DropBlock(DropBlockConfig { keep_prob: 0.9, block_size: 3 })];
    /// let classifier = ConvClassifier::new(&layers, (1, 8, 8), ClassifierConfig::default(), &dev).unwrap();
    /// assert_eq!(classifier.layer_output_dims(), (1, 8, 8));
    /// ```
    pub fn new(
        layers: &[LayerSpec],
        input_dims: (usize, usize, usize),
        config: ClassifierConfig,
        dev: &Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
        Self::new_inner(dev.clone(), varmap, vb, layers, input_dims, config)
    }

    fn new_inner(
        device: Device,
        varmap: VarMap,
        vb: VarBuilder,
        layers: &[LayerSpec],
        input_dims: (usize, usize, usize),
        config: ClassifierConfig,
    ) -> Result<Self> {
        let layers = LayerStack::new(layers, input_dims, vb.pp("layers"))?;
        let (c, h, w) = layers.output_dims();
        let features = c * h * w;
        if features == 0 {
            return Err(Error::invalid_layer(
                "classifier",
                format!("layers produce an empty {c}x{h}x{w} output"),
            ));
        }
        let hidden = candle_nn::linear(features, config.hidden_units, vb.pp("dense0"))?;
        let output = candle_nn::linear(config.hidden_units, config.classes, vb.pp("dense1"))?;
        tracing::debug!(
            "Built classifier {:?} -> {features} features -> {} -> {} classes",
            layers.names().collect::<Vec<_>>(),
            config.hidden_units,
            config.classes
        );
        Ok(Self {
            device,
            varmap,
            layers,
            hidden,
            dropout: config.dropout_rate.map(Dropout::new),
            output,
            input_dims,
            config,
        })
    }

    /// Load a classifier saved with [`ConvClassifier::save`]. The layers and
    /// config must match the ones it was saved with.
    pub fn load(
        path: impl AsRef<Path>,
        layers: &[LayerSpec],
        input_dims: (usize, usize, usize),
        config: ClassifierConfig,
        dev: &Device,
    ) -> Result<Self> {
        let mut classifier = Self::new(layers, input_dims, config, dev)?;
        classifier.varmap.load(path)?;
        Ok(classifier)
    }

    /// Save every parameter to a safetensors file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }

    /// The parameters of the classifier.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// The config of the dense head.
    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// The `(channels, height, width)` the classifier expects.
    pub fn input_dims(&self) -> (usize, usize, usize) {
        self.input_dims
    }

    /// The `(channels, height, width)` produced by the layers under test.
    pub fn layer_output_dims(&self) -> (usize, usize, usize) {
        self.layers.output_dims()
    }

    /// The output of the layers under test for `(N, C, H, W)` images.
    pub fn features(&self, images: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        self.layers.forward_t(images, train)
    }

    /// The class logits for `(N, C, H, W)` images.
    pub fn forward_t(&self, images: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let xs = self.features(images, train)?.flatten_from(1)?;
        let xs = self.hidden.forward(&xs)?.relu()?;
        let xs = match &self.dropout {
            Some(dropout) => dropout.forward_t(&xs, train)?,
            None => xs,
        };
        self.output.forward(&xs)
    }

    /// The class probabilities for `(N, C, H, W)` images.
    pub fn predict(&self, images: &Tensor) -> Result<Tensor> {
        let logits = self.forward_t(&images.to_device(&self.device)?, false)?;
        Ok(ops::softmax(&logits, D::Minus1)?)
    }

    /// The loss and accuracy on a labeled set, evaluated in batches.
    pub fn evaluate(&self, images: &Tensor, labels: &Tensor, batch_size: usize) -> Result<EvalReport> {
        let mut mean_loss = Mean::default();
        let mut accuracy = SparseCategoricalAccuracy::default();
        self.evaluate_into(images, labels, batch_size, &mut mean_loss, &mut accuracy)?;
        Ok(EvalReport {
            loss: mean_loss.result(),
            accuracy: accuracy.result(),
        })
    }

    fn evaluate_into(
        &self,
        images: &Tensor,
        labels: &Tensor,
        batch_size: usize,
        mean_loss: &mut Mean,
        accuracy: &mut SparseCategoricalAccuracy,
    ) -> Result<()> {
        let len = images.dims()[0];
        let batch_size = batch_size.max(1);
        for start in (0..len).step_by(batch_size) {
            let size = batch_size.min(len - start);
            let images = images.narrow(0, start, size)?.to_device(&self.device)?;
            let labels = labels.narrow(0, start, size)?.to_device(&self.device)?;
            let logits = self.forward_t(&images, false)?;
            let loss = loss::cross_entropy(&logits, &labels)?;
            mean_loss.update(loss.to_scalar::<f32>()?);
            accuracy.update(&labels, &logits)?;
        }
        Ok(())
    }

    /// Train the classifier with Adam and sparse categorical cross entropy,
    /// evaluating on the test split after every epoch.
    ///
    /// # Example
    /// ```rust
    /// use conv_variants::*;
    ///
    /// let dev = candle_core::Device::Cpu;
    /// let dataset = ImageDataset::synthetic(64, 16, (1, 8, 8), 4, &dev).unwrap();
    /// let layers = [LayerSpec::GroupConv2d(GroupConv2dConfig::new(4, 3, 1))];
    /// let config = ClassifierConfig::default().hidden_units(16).classes(4);
    /// let mut classifier = ConvClassifier::new(&layers, dataset.input_dims(), config, &dev).unwrap();
    /// let history = classifier
    ///     .train(&dataset, &TrainingConfig::default().epochs(1).seed(Some(0)))
    ///     .unwrap();
    /// assert_eq!(history.epochs.len(), 1);
    /// ```
    pub fn train(&mut self, dataset: &ImageDataset, config: &TrainingConfig) -> Result<TrainingHistory> {
        if dataset.input_dims() != self.input_dims {
            return Err(Error::invalid_layer(
                "classifier",
                format!(
                    "built for {:?} inputs but the dataset has {:?}",
                    self.input_dims,
                    dataset.input_dims()
                ),
            ));
        }
        let params = ParamsAdamW {
            lr: config.learning_rate,
            eps: 1e-7,
            weight_decay: 0.,
            ..Default::default()
        };
        let mut optimizer = AdamW::new(self.varmap.all_vars(), params)?;
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let batch_size = config.batch_size.max(1);

        let mut train_loss = Mean::default();
        let mut train_accuracy = SparseCategoricalAccuracy::default();
        let mut test_loss = Mean::default();
        let mut test_accuracy = SparseCategoricalAccuracy::default();
        let mut history = TrainingHistory::default();

        for epoch in 1..config.epochs + 1 {
            let mut indices = (0..dataset.train_len() as u32).collect::<Vec<_>>();
            indices.shuffle(&mut rng);
            for (batch, indices) in indices.chunks(batch_size).enumerate() {
                let index = Tensor::from_slice(indices, indices.len(), dataset.train_images().device())?;
                let images = dataset
                    .train_images()
                    .index_select(&index, 0)?
                    .to_device(&self.device)?;
                let labels = dataset
                    .train_labels()
                    .index_select(&index, 0)?
                    .to_device(&self.device)?;

                let logits = self.forward_t(&images, true)?;
                let loss = loss::cross_entropy(&logits, &labels)?;
                let value = loss.to_scalar::<f32>()?;
                if !value.is_finite() {
                    return Err(Error::NonFiniteLoss { epoch, batch });
                }
                optimizer.backward_step(&loss)?;

                tracing::debug!("Batch: {batch:5} Loss: {value:5.5}");
                train_loss.update(value);
                train_accuracy.update(&labels, &logits)?;
            }

            self.evaluate_into(
                dataset.test_images(),
                dataset.test_labels(),
                batch_size,
                &mut test_loss,
                &mut test_accuracy,
            )?;

            let report = EpochReport {
                epoch,
                train_loss: train_loss.result(),
                train_accuracy: train_accuracy.result(),
                test_loss: test_loss.result(),
                test_accuracy: test_accuracy.result(),
            };
            if config.verbose {
                tracing::info!(
                    "Epoch {}, Loss: {:.5}, Accuracy: {:.2}%, Test Loss: {:.5}, Test Accuracy: {:.2}%",
                    report.epoch,
                    report.train_loss,
                    report.train_accuracy * 100.,
                    report.test_loss,
                    report.test_accuracy * 100.,
                );
            }
            history.epochs.push(report);

            train_loss.reset();
            train_accuracy.reset();
            test_loss.reset();
            test_accuracy.reset();
        }
        Ok(history)
    }

    /// Run one training mode forward and backward pass and report the
    /// gradient reaching every parameter.
    pub fn gradient_flow(&self, images: &Tensor, labels: &Tensor) -> Result<GradientReport> {
        let images = images.to_device(&self.device)?;
        let labels = labels.to_device(&self.device)?;
        let logits = self.forward_t(&images, true)?;
        let grads = loss::cross_entropy(&logits, &labels)?.backward()?;

        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("parameter map lock poisoned".to_string()))?;
        let mut parameters = vars
            .iter()
            .map(|(name, var)| {
                let norm = grads
                    .get(var.as_tensor())
                    .map(|grad| grad.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>())
                    .transpose()?;
                Ok(ParameterGradient {
                    name: name.clone(),
                    shape: var.dims().to_vec(),
                    norm,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        parameters.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(GradientReport { parameters })
    }
}
