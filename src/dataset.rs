//! MNIST and CIFAR-10 loading.
//!
//! Both datasets are read from their standard binary distributions:
//!
//! * MNIST: `train-images-idx3-ubyte`, `train-labels-idx1-ubyte`,
//!   `t10k-images-idx3-ubyte`, `t10k-labels-idx1-ubyte`
//! * CIFAR-10: `data_batch_1.bin` .. `data_batch_5.bin`, `test_batch.bin`
//!
//! Images are scaled to `[0, 1]` and stored channels first.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{safetensors, DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::{Error, Result};

const MNIST_IMAGES_MAGIC: u32 = 2051;
const MNIST_LABELS_MAGIC: u32 = 2049;
const CIFAR_SIDE: usize = 32;
const CIFAR_IMAGE_BYTES: usize = 3 * CIFAR_SIDE * CIFAR_SIDE;

/// A dataset the harness can train on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    /// 28x28 grayscale digits.
    #[default]
    Mnist,
    /// 32x32 RGB images in ten classes.
    Cifar10,
}

impl DatasetKind {
    /// The `(channels, height, width)` of one image before channels are repeated.
    pub fn image_dims(&self) -> (usize, usize, usize) {
        match self {
            DatasetKind::Mnist => (1, 28, 28),
            DatasetKind::Cifar10 => (3, CIFAR_SIDE, CIFAR_SIDE),
        }
    }

    /// The number of classes.
    pub fn classes(&self) -> usize {
        10
    }
}

fn default_max_instances() -> Option<usize> {
    Some(1000)
}

fn default_repeats() -> usize {
    1
}

/// How a dataset is trimmed and reshaped after loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct LoadOptions {
    /// Keep at most this many images from each split.
    #[serde(default = "default_max_instances")]
    pub max_instances: Option<usize>,
    /// Repeat every channel this many times along the channel axis.
    #[serde(default = "default_repeats")]
    pub repeats: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            max_instances: default_max_instances(),
            repeats: default_repeats(),
        }
    }
}

impl LoadOptions {
    /// Set the maximum number of images kept from each split.
    pub fn max_instances(mut self, max_instances: Option<usize>) -> Self {
        self.max_instances = max_instances;
        self
    }

    /// Set how many times every channel is repeated.
    pub fn repeats(mut self, repeats: usize) -> Self {
        self.repeats = repeats;
        self
    }
}

/// Raw images and labels of one split.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSplit {
    /// Pixels of every image, `channels * height * width` bytes each, channels first.
    pub pixels: Vec<u8>,
    /// One label per image.
    pub labels: Vec<u8>,
    /// The `(channels, height, width)` of one image.
    pub dims: (usize, usize, usize),
}

impl RawSplit {
    /// The number of images.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the split has no images.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Check that there are `channels * height * width` pixel bytes per label.
    pub fn validate(&self) -> Result<()> {
        let (c, h, w) = self.dims;
        let expected = self.len().checked_mul(c * h * w);
        if expected != Some(self.pixels.len()) {
            return Err(Error::InvalidSplit(format!(
                "{} labels of {c}x{h}x{w} images need {} pixel bytes, found {}",
                self.len(),
                expected.map_or_else(|| "too many".to_string(), |n| n.to_string()),
                self.pixels.len()
            )));
        }
        Ok(())
    }

    fn to_tensors(&self, options: &LoadOptions, dev: &Device) -> Result<(Tensor, Tensor)> {
        self.validate()?;
        let (c, h, w) = self.dims;
        let n = options
            .max_instances
            .map_or(self.len(), |max| max.min(self.len()));
        let pixels = self.pixels[..n * c * h * w]
            .iter()
            .map(|&p| p as f32 / 255.)
            .collect::<Vec<_>>();
        let images = Tensor::from_vec(pixels, (n, c, h, w), dev)?;
        let images = repeat_channels(&images, options.repeats)?;
        let labels = self.labels[..n].iter().map(|&l| l as u32).collect::<Vec<_>>();
        let labels = Tensor::from_vec(labels, n, dev)?;
        Ok((images, labels))
    }
}

/// Repeats every channel `repeats` times in place: `[c0, c1] -> [c0, c0, c1, c1]`.
pub fn repeat_channels(images: &Tensor, repeats: usize) -> candle_core::Result<Tensor> {
    if repeats <= 1 {
        return Ok(images.clone());
    }
    let (n, c, h, w) = images.dims4()?;
    images
        .unsqueeze(2)?
        .broadcast_as((n, c, repeats, h, w))?
        .reshape((n, c * repeats, h, w))
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    if !path.exists() {
        return Err(Error::MissingFile(path.to_path_buf()));
    }
    Ok(std::fs::read(path)?)
}

fn read_u32_be(bytes: &[u8], offset: usize) -> Option<u32> {
    let word = bytes.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
}

fn invalid(path: &Path, format: &'static str, reason: impl Into<String>) -> Error {
    Error::InvalidDataset {
        path: path.to_path_buf(),
        format,
        reason: reason.into(),
    }
}

/// Parses an IDX3 image file into `(pixels, rows, cols)`.
pub fn parse_idx_images(path: &Path, bytes: &[u8]) -> Result<(Vec<u8>, usize, usize)> {
    let header = |offset| read_u32_be(bytes, offset).ok_or_else(|| invalid(path, "IDX", "truncated header"));
    let magic = header(0)?;
    if magic != MNIST_IMAGES_MAGIC {
        return Err(invalid(
            path,
            "IDX",
            format!("expected image magic {MNIST_IMAGES_MAGIC}, got {magic}"),
        ));
    }
    let count = header(4)? as usize;
    let rows = header(8)? as usize;
    let cols = header(12)? as usize;
    let data = &bytes[16..];
    let needed = count
        .checked_mul(rows)
        .and_then(|n| n.checked_mul(cols))
        .ok_or_else(|| invalid(path, "IDX", format!("{count} images of {rows}x{cols} overflow")))?;
    if data.len() < needed {
        return Err(invalid(
            path,
            "IDX",
            format!("{count} images of {rows}x{cols} need {needed} bytes, found {}", data.len()),
        ));
    }
    Ok((data[..needed].to_vec(), rows, cols))
}

/// Parses an IDX1 label file.
pub fn parse_idx_labels(path: &Path, bytes: &[u8]) -> Result<Vec<u8>> {
    let header = |offset| read_u32_be(bytes, offset).ok_or_else(|| invalid(path, "IDX", "truncated header"));
    let magic = header(0)?;
    if magic != MNIST_LABELS_MAGIC {
        return Err(invalid(
            path,
            "IDX",
            format!("expected label magic {MNIST_LABELS_MAGIC}, got {magic}"),
        ));
    }
    let count = header(4)? as usize;
    let data = &bytes[8..];
    if data.len() < count {
        return Err(invalid(
            path,
            "IDX",
            format!("{count} labels need {count} bytes, found {}", data.len()),
        ));
    }
    let labels = data[..count].to_vec();
    let classes = DatasetKind::Mnist.classes();
    if let Some(label) = labels.iter().find(|&&label| label as usize >= classes) {
        return Err(invalid(path, "IDX", format!("label {label} out of range")));
    }
    Ok(labels)
}

fn load_mnist_split(dir: &Path, images: &str, labels: &str) -> Result<RawSplit> {
    let images_path = dir.join(images);
    let labels_path = dir.join(labels);
    let (pixels, rows, cols) = parse_idx_images(&images_path, &read_file(&images_path)?)?;
    let labels = parse_idx_labels(&labels_path, &read_file(&labels_path)?)?;
    let images = pixels.len() / (rows * cols).max(1);
    if images != labels.len() {
        return Err(invalid(
            &labels_path,
            "IDX",
            format!("{} labels for {images} images", labels.len()),
        ));
    }
    Ok(RawSplit {
        pixels,
        labels,
        dims: (1, rows, cols),
    })
}

/// Parses a CIFAR-10 binary batch: records of one label byte followed by
/// 3072 channel first pixel bytes.
pub fn parse_cifar_batch(path: &Path, bytes: &[u8]) -> Result<RawSplit> {
    let record = CIFAR_IMAGE_BYTES + 1;
    if bytes.len() % record != 0 {
        return Err(invalid(
            path,
            "CIFAR-10",
            format!("{} bytes is not a whole number of {record} byte records", bytes.len()),
        ));
    }
    let count = bytes.len() / record;
    let mut pixels = Vec::with_capacity(count * CIFAR_IMAGE_BYTES);
    let mut labels = Vec::with_capacity(count);
    for chunk in bytes.chunks_exact(record) {
        if chunk[0] >= 10 {
            return Err(invalid(path, "CIFAR-10", format!("label {} out of range", chunk[0])));
        }
        labels.push(chunk[0]);
        pixels.extend_from_slice(&chunk[1..]);
    }
    Ok(RawSplit {
        pixels,
        labels,
        dims: DatasetKind::Cifar10.image_dims(),
    })
}

fn load_cifar_split<'a>(dir: &Path, files: impl IntoIterator<Item = &'a str>) -> Result<RawSplit> {
    let mut split = RawSplit {
        pixels: Vec::new(),
        labels: Vec::new(),
        dims: DatasetKind::Cifar10.image_dims(),
    };
    for file in files {
        let path = dir.join(file);
        let batch = parse_cifar_batch(&path, &read_file(&path)?)?;
        split.pixels.extend(batch.pixels);
        split.labels.extend(batch.labels);
    }
    Ok(split)
}

/// Train and test images with their labels, stored as tensors.
#[derive(Clone, Debug)]
pub struct ImageDataset {
    train_images: Tensor,
    train_labels: Tensor,
    test_images: Tensor,
    test_labels: Tensor,
}

impl ImageDataset {
    /// Load a dataset from the directory holding its binary files.
    pub fn load(
        kind: DatasetKind,
        dir: impl AsRef<Path>,
        options: &LoadOptions,
        dev: &Device,
    ) -> Result<Self> {
        let dir = dir.as_ref();
        let (train, test) = match kind {
            DatasetKind::Mnist => (
                load_mnist_split(dir, "train-images-idx3-ubyte", "train-labels-idx1-ubyte")?,
                load_mnist_split(dir, "t10k-images-idx3-ubyte", "t10k-labels-idx1-ubyte")?,
            ),
            DatasetKind::Cifar10 => (
                load_cifar_split(
                    dir,
                    [
                        "data_batch_1.bin",
                        "data_batch_2.bin",
                        "data_batch_3.bin",
                        "data_batch_4.bin",
                        "data_batch_5.bin",
                    ],
                )?,
                load_cifar_split(dir, ["test_batch.bin"])?,
            ),
        };
        tracing::info!(
            "Loaded {kind:?} from {}: {} train/{} test images",
            dir.display(),
            train.len(),
            test.len()
        );
        Self::from_raw(&train, &test, options, dev)
    }

    /// Build a dataset from raw splits.
    pub fn from_raw(train: &RawSplit, test: &RawSplit, options: &LoadOptions, dev: &Device) -> Result<Self> {
        let (train_images, train_labels) = train.to_tensors(options, dev)?;
        let (test_images, test_labels) = test.to_tensors(options, dev)?;
        Ok(Self {
            train_images,
            train_labels,
            test_images,
            test_labels,
        })
    }

    /// Build a dataset from `(N, C, H, W)` image tensors and `(N,)` `u32` label
    /// tensors.
    pub fn new(
        train_images: Tensor,
        train_labels: Tensor,
        test_images: Tensor,
        test_labels: Tensor,
    ) -> Result<Self> {
        let mut dims = None;
        for (images, labels) in [(&train_images, &train_labels), (&test_images, &test_labels)] {
            let (n, c, h, w) = images.dims4()?;
            if labels.dims1()? != n || labels.dtype() != DType::U32 {
                return Err(Error::InvalidSplit(format!(
                    "{n} images need {n} u32 labels, got {:?} {:?}",
                    labels.shape(),
                    labels.dtype()
                )));
            }
            if *dims.get_or_insert((c, h, w)) != (c, h, w) {
                return Err(Error::InvalidSplit(format!(
                    "train and test images differ in shape: {dims:?} and {:?}",
                    (c, h, w)
                )));
            }
        }
        Ok(Self {
            train_images,
            train_labels,
            test_images,
            test_labels,
        })
    }

    /// Create a random dataset of `(channels, height, width)` images where the
    /// class of an image is marked by a bright column at a class dependent
    /// position. Seeded, so it is the same on every call.
    pub fn synthetic(
        train_len: usize,
        test_len: usize,
        (c, h, w): (usize, usize, usize),
        classes: usize,
        dev: &Device,
    ) -> Result<Self> {
        if classes == 0 || classes > u8::MAX as usize + 1 {
            return Err(Error::InvalidSplit(format!(
                "synthetic data needs 1 to 256 classes, got {classes}"
            )));
        }
        let mut rng = StdRng::seed_from_u64(0);
        let mut split = |len: usize| {
            let mut pixels = Vec::with_capacity(len * c * h * w);
            let mut labels = Vec::with_capacity(len);
            for _ in 0..len {
                let label = rng.gen_range(0..classes);
                let column = label * w / classes;
                for _ in 0..c {
                    for _ in 0..h {
                        for x in 0..w {
                            let value = if x == column { 255 } else { rng.gen_range(0..64u8) };
                            pixels.push(value);
                        }
                    }
                }
                labels.push(label as u8);
            }
            RawSplit {
                pixels,
                labels,
                dims: (c, h, w),
            }
        };
        let train = split(train_len);
        let test = split(test_len);
        Self::from_raw(&train, &test, &LoadOptions::default().max_instances(None), dev)
    }

    /// Save the dataset to a safetensors file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let tensors = HashMap::from([
            ("train_images".to_string(), self.train_images.clone()),
            ("train_labels".to_string(), self.train_labels.clone()),
            ("test_images".to_string(), self.test_images.clone()),
            ("test_labels".to_string(), self.test_labels.clone()),
        ]);
        safetensors::save(&tensors, path)?;
        Ok(())
    }

    /// Load a dataset saved with [`ImageDataset::save`].
    pub fn load_safetensors<P: AsRef<Path>>(path: P, dev: &Device) -> Result<Self> {
        let mut tensors = safetensors::load(path, dev)?;
        let mut take = |name: &str| {
            tensors
                .remove(name)
                .ok_or_else(|| Error::MissingTensor(name.to_string()))
        };
        Ok(Self {
            train_images: take("train_images")?,
            train_labels: take("train_labels")?,
            test_images: take("test_images")?,
            test_labels: take("test_labels")?,
        })
    }

    /// Training images, `(N, C, H, W)`.
    pub fn train_images(&self) -> &Tensor {
        &self.train_images
    }

    /// Training labels, `(N,)` `u32`.
    pub fn train_labels(&self) -> &Tensor {
        &self.train_labels
    }

    /// Test images, `(N, C, H, W)`.
    pub fn test_images(&self) -> &Tensor {
        &self.test_images
    }

    /// Test labels, `(N,)` `u32`.
    pub fn test_labels(&self) -> &Tensor {
        &self.test_labels
    }

    /// The `(channels, height, width)` of one image.
    pub fn input_dims(&self) -> (usize, usize, usize) {
        let dims = self.train_images.dims();
        (dims[1], dims[2], dims[3])
    }

    /// The number of training images.
    pub fn train_len(&self) -> usize {
        self.train_images.dims()[0]
    }

    /// The number of test images.
    pub fn test_len(&self) -> usize {
        self.test_images.dims()[0]
    }
}

/// The directory datasets are read from when none is given: `$CONV_VARIANTS_DATA`,
/// or `data/<dataset>` under the current directory.
pub fn default_data_dir(kind: DatasetKind) -> PathBuf {
    let root = std::env::var_os("CONV_VARIANTS_DATA")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data"));
    match kind {
        DatasetKind::Mnist => root.join("mnist"),
        DatasetKind::Cifar10 => root.join("cifar10"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn idx_images(count: u32, rows: u32, cols: u32, pixels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for word in [MNIST_IMAGES_MAGIC, count, rows, cols] {
            bytes.extend_from_slice(&word.to_be_bytes());
        }
        bytes.extend_from_slice(pixels);
        bytes
    }

    fn idx_labels(labels: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MNIST_LABELS_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&(labels.len() as u32).to_be_bytes());
        bytes.extend_from_slice(labels);
        bytes
    }

    #[test]
    fn parses_idx_files() -> anyhow::Result<()> {
        let path = Path::new("images");
        let (pixels, rows, cols) = parse_idx_images(path, &idx_images(2, 2, 3, &[7; 12]))?;
        assert_eq!((pixels.len(), rows, cols), (12, 2, 3));
        assert_eq!(parse_idx_labels(path, &idx_labels(&[3, 9]))?, vec![3, 9]);
        Ok(())
    }

    #[test]
    fn rejects_wrong_magic_and_truncation() {
        let path = Path::new("images");
        assert!(matches!(
            parse_idx_images(path, &idx_labels(&[1, 2])),
            Err(Error::InvalidDataset { .. })
        ));
        assert!(matches!(
            parse_idx_images(path, &idx_images(2, 2, 3, &[7; 5])),
            Err(Error::InvalidDataset { .. })
        ));
        assert!(matches!(
            parse_idx_labels(path, &[0, 0]),
            Err(Error::InvalidDataset { .. })
        ));
    }

    #[test]
    fn rejects_out_of_range_mnist_labels() {
        let result = parse_idx_labels(Path::new("labels"), &idx_labels(&[3, 10]));
        assert!(matches!(result, Err(Error::InvalidDataset { .. })));
    }

    #[test]
    fn rejects_image_and_label_count_mismatch() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join(format!("conv-variants-mnist-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("train-images-idx3-ubyte"), idx_images(2, 2, 2, &[0; 8]))?;
        std::fs::write(dir.join("train-labels-idx1-ubyte"), idx_labels(&[1, 2, 3]))?;
        let result = ImageDataset::load(DatasetKind::Mnist, &dir, &LoadOptions::default(), &Device::Cpu);
        std::fs::remove_dir_all(&dir)?;
        match result {
            Err(Error::InvalidDataset { path, .. }) => {
                assert!(path.ends_with("train-labels-idx1-ubyte"))
            }
            other => panic!("expected a count mismatch, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn parses_cifar_records() -> anyhow::Result<()> {
        let mut bytes = vec![4u8];
        bytes.extend(std::iter::repeat(1).take(CIFAR_IMAGE_BYTES));
        bytes.push(9);
        bytes.extend(std::iter::repeat(2).take(CIFAR_IMAGE_BYTES));
        let split = parse_cifar_batch(Path::new("batch"), &bytes)?;
        assert_eq!(split.labels, vec![4, 9]);
        assert_eq!(split.pixels.len(), 2 * CIFAR_IMAGE_BYTES);
        assert_eq!(split.pixels[CIFAR_IMAGE_BYTES], 2);

        bytes.pop();
        assert!(parse_cifar_batch(Path::new("batch"), &bytes).is_err());
        Ok(())
    }

    #[test]
    fn scales_truncates_and_repeats() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let split = RawSplit {
            pixels: vec![0, 255, 51, 102, 0, 0, 0, 0, 9, 9, 9, 9],
            labels: vec![1, 2, 3],
            dims: (1, 2, 2),
        };
        let options = LoadOptions::default().max_instances(Some(2)).repeats(2);
        let dataset = ImageDataset::from_raw(&split, &split, &options, &dev)?;
        assert_eq!(dataset.train_images().dims(), &[2, 2, 2, 2]);
        assert_eq!(dataset.train_labels().to_vec1::<u32>()?, vec![1, 2]);
        let first = dataset.train_images().get(0)?.to_vec3::<f32>()?;
        assert_eq!(first[0], first[1]);
        assert_eq!(first[0], vec![vec![0., 1.], vec![0.2, 0.4]]);
        Ok(())
    }

    #[test]
    fn inconsistent_split_is_an_error() {
        let split = RawSplit {
            pixels: vec![0; 3],
            labels: vec![1, 2],
            dims: (1, 2, 2),
        };
        let result = ImageDataset::from_raw(&split, &split, &LoadOptions::default(), &Device::Cpu);
        assert!(matches!(result, Err(Error::InvalidSplit(_))));
    }

    #[test]
    fn synthetic_data_needs_classes() {
        let result = ImageDataset::synthetic(4, 4, (1, 4, 4), 0, &Device::Cpu);
        assert!(matches!(result, Err(Error::InvalidSplit(_))));
    }

    #[test]
    fn tensor_splits_must_line_up() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let images = Tensor::zeros((3, 1, 4, 4), DType::F32, &dev)?;
        let labels = Tensor::zeros(3, DType::U32, &dev)?;
        let dataset = ImageDataset::new(images.clone(), labels.clone(), images.clone(), labels.clone())?;
        assert_eq!(dataset.input_dims(), (1, 4, 4));

        let short = Tensor::zeros(2, DType::U32, &dev)?;
        let result = ImageDataset::new(images.clone(), short, images.clone(), labels.clone());
        assert!(matches!(result, Err(Error::InvalidSplit(_))));

        let other = Tensor::zeros((3, 2, 4, 4), DType::F32, &dev)?;
        let result = ImageDataset::new(images, labels.clone(), other, labels);
        assert!(matches!(result, Err(Error::InvalidSplit(_))));
        Ok(())
    }

    #[test]
    fn repeats_each_channel_in_place() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let xs = Tensor::new(&[[[[1f32]], [[2.]]]], &dev)?;
        let ys = repeat_channels(&xs, 3)?;
        assert_eq!(ys.flatten_all()?.to_vec1::<f32>()?, vec![1., 1., 1., 2., 2., 2.]);
        Ok(())
    }

    #[test]
    fn missing_files_are_reported() {
        let dir = std::env::temp_dir().join("conv-variants-missing");
        let result = ImageDataset::load(DatasetKind::Mnist, &dir, &LoadOptions::default(), &Device::Cpu);
        assert!(matches!(result, Err(Error::MissingFile(_))));
    }

    #[test]
    fn dataset_round_trips_through_safetensors() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let dataset = ImageDataset::synthetic(6, 4, (1, 5, 5), 3, &dev)?;
        let path = std::env::temp_dir().join("conv-variants-dataset.safetensors");
        dataset.save(&path)?;
        let loaded = ImageDataset::load_safetensors(&path, &dev)?;
        std::fs::remove_file(&path)?;
        assert_eq!(loaded.input_dims(), (1, 5, 5));
        assert_eq!(loaded.test_len(), 4);
        assert_eq!(
            loaded.train_labels().to_vec1::<u32>()?,
            dataset.train_labels().to_vec1::<u32>()?
        );
        Ok(())
    }
}
