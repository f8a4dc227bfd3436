use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use conv_variants::*;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run one built in layer stack. Every preset runs when neither this nor
    /// `--config` is given.
    #[arg(long, value_enum, conflicts_with = "config")]
    preset: Option<LayerPreset>,

    /// Read the run from a JSON file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum)]
    dataset: Option<DatasetKind>,

    /// The directory holding the dataset files.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Keep only the first N images of each split.
    #[arg(long)]
    max_instances: Option<usize>,

    /// Repeat the image channels N times.
    #[arg(long)]
    repeats: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Run on the CPU even if an accelerator is available.
    #[arg(long)]
    cpu: bool,

    /// Check that gradients reach every parameter before training.
    #[arg(long)]
    check_gradients: bool,

    /// Save the trained parameters to this safetensors file.
    #[arg(long)]
    save: Option<PathBuf>,
}

impl Args {
    fn runs(&self) -> anyhow::Result<Vec<(String, RunConfig)>> {
        let runs = match (&self.config, self.preset) {
            (Some(path), _) => vec![(path.display().to_string(), RunConfig::from_file(path)?)],
            (None, Some(preset)) => vec![(format!("{preset:?}"), RunConfig::preset(preset))],
            (None, None) => LayerPreset::value_variants()
                .iter()
                .map(|preset| (format!("{preset:?}"), RunConfig::preset(*preset)))
                .collect(),
        };
        Ok(runs
            .into_iter()
            .map(|(name, run)| (name, self.apply(run)))
            .collect())
    }

    fn apply(&self, mut run: RunConfig) -> RunConfig {
        if let Some(dataset) = self.dataset {
            run.dataset = dataset;
        }
        if let Some(data_dir) = &self.data_dir {
            run.data_dir = Some(data_dir.clone());
        }
        if let Some(epochs) = self.epochs {
            run.training.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            run.training.batch_size = batch_size;
        }
        if let Some(max_instances) = self.max_instances {
            run.load.max_instances = Some(max_instances);
        }
        if let Some(repeats) = self.repeats {
            run.load.repeats = repeats;
        }
        if self.seed.is_some() {
            run.training.seed = self.seed;
        }
        run.classifier.classes = run.dataset.classes();
        run
    }
}

fn run(name: &str, run: RunConfig, args: &Args) -> anyhow::Result<()> {
    let dev = device(args.cpu)?;
    let data_dir = run
        .data_dir
        .clone()
        .unwrap_or_else(|| default_data_dir(run.dataset));
    let dataset = ImageDataset::load(run.dataset, &data_dir, &run.load, &dev)?;

    let mut classifier = ConvClassifier::new(&run.layers, dataset.input_dims(), run.classifier, &dev)?;
    tracing::info!(
        "{name}: {:?} -> {:?}",
        dataset.input_dims(),
        classifier.layer_output_dims()
    );

    if args.check_gradients {
        let len = run.training.batch_size.clamp(1, dataset.train_len().max(1));
        let report = classifier.gradient_flow(
            &dataset.train_images().narrow(0, 0, len)?,
            &dataset.train_labels().narrow(0, 0, len)?,
        )?;
        for parameter in report.blocked() {
            tracing::warn!("{name}: no gradient reaches {} {:?}", parameter.name, parameter.shape);
        }
        if !report.all_flow() {
            anyhow::bail!("{name}: gradients do not reach every parameter");
        }
        tracing::info!("{name}: gradients reach all {} parameters", report.parameters.len());
    }

    classifier.train(&dataset, &run.training)?;
    let eval = classifier.evaluate(
        dataset.test_images(),
        dataset.test_labels(),
        run.training.batch_size,
    )?;
    tracing::info!(
        "{name}: Test Loss: {:.5}, Test Accuracy: {:.2}%",
        eval.loss,
        eval.accuracy * 100.
    );

    if let Some(path) = &args.save {
        classifier.save(path)?;
        tracing::info!("{name}: saved parameters to {}", path.display());
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    for (name, config) in args.runs()? {
        run(&name, config, &args)?;
    }
    Ok(())
}
