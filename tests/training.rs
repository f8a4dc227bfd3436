//! End to end checks of the classification harness on synthetic data.

use candle_core::{Device, Tensor};
use candle_nn::Activation;
use conv_variants::*;
use pretty_assertions::assert_eq;

fn conv(filters: usize) -> LayerSpec {
    LayerSpec::Conv2d {
        filters,
        config: Conv2dConfig::new(3).activation(Some(Activation::Relu)),
    }
}

/// One small stack per layer kind.
fn every_layer_kind() -> Vec<Vec<LayerSpec>> {
    vec![
        vec![conv(8)],
        vec![LayerSpec::AaConv(AaConvConfig::new(8, 3, 4, 4, 2))],
        vec![LayerSpec::AaConv(AaConvConfig::new(8, 3, 4, 4, 2).relative(false))],
        vec![LayerSpec::MixConv(MixConvConfig::new(8, [3, 5]))],
        vec![LayerSpec::MixConv(MixConvConfig::new(8, [3, 5]).depthwise(true))],
        vec![conv(32), LayerSpec::ChannelGate { reduction_ratio: 2 }],
        vec![
            conv(8),
            LayerSpec::SpatialGate {
                kernel_size: KernelSize::Square(7),
            },
        ],
        vec![LayerSpec::Cbam(CbamConfig::new(32, 2, (3, 3)))],
        vec![conv(8), LayerSpec::Eca { k_size: None }],
        vec![LayerSpec::EcaConv(EcaConvConfig::new(8, (3, 3)).eca_k_size(3))],
        vec![
            conv(8),
            LayerSpec::DropBlock(DropBlockConfig {
                keep_prob: 0.9,
                block_size: 3,
            }),
        ],
        vec![LayerSpec::GroupConv2d(GroupConv2dConfig::new(6, 3, 3))],
    ]
}

#[test]
fn gradients_reach_every_parameter() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let dataset = ImageDataset::synthetic(8, 0, (3, 6, 8), 3, &dev)?;
    let config = ClassifierConfig::default()
        .hidden_units(32)
        .classes(3)
        .dropout_rate(Some(0.2));
    for layers in every_layer_kind() {
        let classifier = ConvClassifier::new(&layers, dataset.input_dims(), config, &dev)?;
        let report = classifier.gradient_flow(dataset.train_images(), dataset.train_labels())?;
        let names = layers.iter().map(LayerSpec::name).collect::<Vec<_>>();
        // the layer weights plus both dense layers
        assert!(report.parameters.len() >= 5, "{names:?}: {report:?}");
        let blocked = report.blocked().map(|p| p.name.clone()).collect::<Vec<_>>();
        assert_eq!(blocked, Vec::<String>::new(), "{names:?}");
    }
    Ok(())
}

#[test]
fn relative_attention_has_position_embeddings() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let layers = [LayerSpec::AaConv(AaConvConfig::new(8, 3, 4, 4, 2))];
    let classifier = ConvClassifier::new(&layers, (3, 6, 8), ClassifierConfig::default(), &dev)?;
    let dataset = ImageDataset::synthetic(4, 0, (3, 6, 8), 10, &dev)?;
    let report = classifier.gradient_flow(dataset.train_images(), dataset.train_labels())?;
    let shape_of = |suffix: &str| {
        report
            .parameters
            .iter()
            .find(|p| p.name.ends_with(suffix))
            .map(|p| p.shape.clone())
    };
    assert_eq!(shape_of("key_rel_w"), Some(vec![15, 2]));
    assert_eq!(shape_of("key_rel_h"), Some(vec![11, 2]));
    Ok(())
}

#[test]
fn training_learns_synthetic_classes() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let dataset = ImageDataset::synthetic(256, 64, (1, 8, 8), 4, &dev)?;
    let layers = [conv(4)];
    let config = ClassifierConfig::default().hidden_units(32).classes(4);
    let mut classifier = ConvClassifier::new(&layers, dataset.input_dims(), config, &dev)?;

    let training = TrainingConfig::default()
        .epochs(8)
        .batch_size(32)
        .learning_rate(1e-2)
        .seed(Some(42));
    let history = classifier.train(&dataset, &training)?;
    assert_eq!(history.epochs.len(), 8);
    let epochs = history.epochs.iter().map(|e| e.epoch).collect::<Vec<_>>();
    assert_eq!(epochs, (1..=8).collect::<Vec<_>>());

    let first = history.epochs[0];
    let last = *history.last().unwrap();
    assert!(last.train_loss < first.train_loss, "{history:?}");
    assert!(last.test_accuracy > 0.5, "{history:?}");

    let eval = classifier.evaluate(dataset.test_images(), dataset.test_labels(), 16)?;
    assert!((eval.accuracy - last.test_accuracy).abs() < 1e-6);
    Ok(())
}

#[test]
fn predictions_are_probabilities() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let layers = [LayerSpec::Cbam(CbamConfig::new(6, 2, 3))];
    let config = ClassifierConfig::default().hidden_units(8).classes(5);
    let classifier = ConvClassifier::new(&layers, (2, 5, 7), config, &dev)?;
    let images = Tensor::rand(0f32, 1., (3, 2, 5, 7), &dev)?;
    let probabilities = classifier.predict(&images)?;
    assert_eq!(probabilities.dims(), &[3, 5]);
    for row in probabilities.sum(1)?.to_vec1::<f32>()? {
        assert!((row - 1.).abs() < 1e-5);
    }
    Ok(())
}

#[test]
fn saved_classifier_predicts_the_same() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let dataset = ImageDataset::synthetic(32, 8, (2, 6, 6), 3, &dev)?;
    let layers = [
        LayerSpec::MixConv(MixConvConfig::new(6, [3, 5]).depthwise(true)),
        LayerSpec::DropBlock(DropBlockConfig {
            keep_prob: 0.8,
            block_size: 2,
        }),
    ];
    let config = ClassifierConfig::default()
        .hidden_units(16)
        .classes(3)
        .dropout_rate(Some(0.5));
    let mut classifier = ConvClassifier::new(&layers, dataset.input_dims(), config, &dev)?;
    classifier.train(&dataset, &TrainingConfig::default().epochs(1).verbose(false))?;

    let path = std::env::temp_dir().join(format!("conv-variants-{}.safetensors", std::process::id()));
    classifier.save(&path)?;
    let loaded = ConvClassifier::load(&path, &layers, dataset.input_dims(), config, &dev)?;
    std::fs::remove_file(&path)?;

    let expected = classifier.predict(dataset.test_images())?;
    let actual = loaded.predict(dataset.test_images())?;
    let diff = (expected - actual)?.abs()?.max_keepdim(1)?.max(0)?.squeeze(0)?;
    assert!(diff.to_scalar::<f32>()? < 1e-6);
    Ok(())
}

#[test]
fn mismatched_dataset_is_rejected() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let dataset = ImageDataset::synthetic(4, 4, (1, 6, 6), 2, &dev)?;
    let mut classifier = ConvClassifier::new(&[conv(2)], (3, 6, 6), ClassifierConfig::default(), &dev)?;
    let result = classifier.train(&dataset, &TrainingConfig::default());
    assert!(matches!(result, Err(Error::InvalidLayer { .. })));
    Ok(())
}

#[test]
fn non_finite_loss_stops_before_the_update() -> anyhow::Result<()> {
    let dev = Device::Cpu;
    let images = Tensor::full(f32::NAN, (4, 1, 6, 6), &dev)?;
    let labels = Tensor::new(&[0u32, 1, 0, 1], &dev)?;
    let dataset = ImageDataset::new(images.clone(), labels.clone(), images, labels)?;
    let config = ClassifierConfig::default().hidden_units(4).classes(2);
    let mut classifier = ConvClassifier::new(&[conv(2)], dataset.input_dims(), config, &dev)?;

    let snapshot = |classifier: &ConvClassifier| -> candle_core::Result<Vec<Vec<f32>>> {
        classifier
            .varmap()
            .all_vars()
            .iter()
            .map(|var| var.flatten_all()?.to_vec1::<f32>())
            .collect()
    };
    let mut before = snapshot(&classifier)?;
    let training = TrainingConfig::default().epochs(2).batch_size(4).seed(Some(0));
    let result = classifier.train(&dataset, &training);
    assert!(
        matches!(result, Err(Error::NonFiniteLoss { epoch: 1, batch: 0 })),
        "{result:?}"
    );
    let mut after = snapshot(&classifier)?;
    // all_vars does not promise an order
    before.sort_by(|a, b| a.partial_cmp(b).unwrap());
    after.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(before, after);
    Ok(())
}

/// Trains every preset on the real dataset. Needs the binary dataset files
/// under `$CONV_VARIANTS_DATA/mnist` and `$CONV_VARIANTS_DATA/cifar10`.
#[test]
#[ignore]
fn presets_train_on_real_data() -> anyhow::Result<()> {
    use clap::ValueEnum;

    let dev = accelerated_device_if_available()?;
    for preset in LayerPreset::value_variants() {
        let mut run = RunConfig::preset(*preset);
        run.load = run.load.max_instances(Some(256));
        run.training = run.training.epochs(1);
        let dataset = ImageDataset::load(run.dataset, default_data_dir(run.dataset), &run.load, &dev)?;
        let mut classifier = ConvClassifier::new(&run.layers, dataset.input_dims(), run.classifier, &dev)?;
        let report = classifier.gradient_flow(
            &dataset.train_images().narrow(0, 0, 8)?,
            &dataset.train_labels().narrow(0, 0, 8)?,
        )?;
        assert!(report.all_flow(), "{preset:?}: {report:?}");
        let history = classifier.train(&dataset, &run.training)?;
        assert_eq!(history.epochs.len(), 1);
    }
    Ok(())
}
