/// NumPy volume dataset loader (.npy image and label stacks)
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use candle_core::{Device, Result, Tensor};
use ndarray::{s, Array4, Array5, ArrayD, Axis, Ix4, Ix5};
use ndarray_npy::{ReadNpyError, ReadNpyExt};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use crate::SegError;

fn read_npy<T: ndarray_npy::ReadableElement>(path: &Path) -> std::result::Result<ArrayD<T>, ReadNpyError> {
    let file = File::open(path).map_err(ReadNpyError::Io)?;
    ArrayD::<T>::read_npy(BufReader::new(file))
}

/// Read an image stack stored as f32, or as u8 scaled to [0, 1]
fn read_images(path: &Path) -> crate::Result<ArrayD<f32>> {
    match read_npy::<f32>(path) {
        Ok(images) => Ok(images),
        Err(f32_err) => match read_npy::<u8>(path) {
            Ok(images) => Ok(images.mapv(|x| x as f32 / 255.0)),
            Err(_) => Err(f32_err.into()),
        },
    }
}

/// Read a label stack stored as i64 (NumPy's default int) or u8
fn read_labels(path: &Path) -> crate::Result<ArrayD<i64>> {
    match read_npy::<i64>(path) {
        Ok(labels) => Ok(labels),
        Err(i64_err) => match read_npy::<u8>(path) {
            Ok(labels) => Ok(labels.mapv(i64::from)),
            Err(_) => Err(i64_err.into()),
        },
    }
}

/// Dataset of co-registered image and label volumes
pub struct VolumeDataset {
    images: Array5<f32>, // [N, C, D, H, W]
    labels: Array4<u32>, // [N, D, H, W]
}

impl VolumeDataset {
    /// Load `images_file` and `labels_file` from a split directory
    ///
    /// Images may be `[N, D, H, W]` (single channel) or `[N, C, D, H, W]`.
    /// Labels may carry a singleton channel axis.
    pub fn from_directory<P: AsRef<Path>>(
        path: P,
        images_file: &str,
        labels_file: &str,
        channels: usize,
        num_classes: usize,
    ) -> crate::Result<Self> {
        let dir = path.as_ref();

        log::info!("Loading volume dataset from: {:?}", dir);

        let images = read_images(&dir.join(images_file))?;
        let images = match images.ndim() {
            4 => images.insert_axis(Axis(1)),
            5 => images,
            n => {
                return Err(SegError::Data(format!(
                    "{} must be 4D or 5D, got {}D",
                    images_file, n
                )))
            }
        };
        let images = images.into_dimensionality::<Ix5>()?;

        log::info!("Loaded images: shape {:?}", images.shape());

        let labels = read_labels(&dir.join(labels_file))?;
        let labels = match labels.ndim() {
            4 => labels,
            5 if labels.shape()[1] == 1 => labels.remove_axis(Axis(1)),
            _ => {
                return Err(SegError::Data(format!(
                    "{} must be [N, D, H, W] or [N, 1, D, H, W], got {:?}",
                    labels_file,
                    labels.shape()
                )))
            }
        };
        let labels = labels.into_dimensionality::<Ix4>()?;

        log::info!("Loaded labels: shape {:?}", labels.shape());

        if images.shape()[1] != channels {
            return Err(SegError::Data(format!(
                "expected {} image channels, found {}",
                channels,
                images.shape()[1]
            )));
        }

        let labels = Self::convert_labels(&labels, num_classes)?;
        Self::from_parts(images, labels)
    }

    fn convert_labels(labels: &Array4<i64>, num_classes: usize) -> crate::Result<Array4<u32>> {
        if let Some(&bad) = labels
            .iter()
            .find(|&&l| l < 0 || l as usize >= num_classes)
        {
            return Err(SegError::Data(format!(
                "label {} outside [0, {})",
                bad, num_classes
            )));
        }
        Ok(labels.mapv(|l| l as u32))
    }

    /// Build from in-memory arrays
    pub fn from_arrays(
        images: Array5<f32>,
        labels: Array4<u32>,
        num_classes: usize,
    ) -> crate::Result<Self> {
        if let Some(&bad) = labels.iter().find(|&&l| l as usize >= num_classes) {
            return Err(SegError::Data(format!(
                "label {} outside [0, {})",
                bad, num_classes
            )));
        }

        Self::from_parts(images, labels)
    }

    /// Shape checks for labels already known to be in range
    fn from_parts(images: Array5<f32>, labels: Array4<u32>) -> crate::Result<Self> {
        if images.shape()[0] != labels.shape()[0] {
            return Err(SegError::Data(format!(
                "Sample count mismatch: images {} != labels {}",
                images.shape()[0],
                labels.shape()[0]
            )));
        }

        if images.shape()[2..] != labels.shape()[1..] {
            return Err(SegError::Data(format!(
                "Volume shape mismatch: images {:?} != labels {:?}",
                &images.shape()[2..],
                &labels.shape()[1..]
            )));
        }

        log::info!(
            "Dataset loaded: {} volumes, volume shape {:?}, channels={}",
            images.shape()[0],
            &images.shape()[2..],
            images.shape()[1]
        );

        Ok(Self { images, labels })
    }

    /// Get number of volumes
    pub fn len(&self) -> usize {
        self.images.shape()[0]
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn channels(&self) -> usize {
        self.images.shape()[1]
    }

    /// Spatial shape [depth, height, width] of every volume
    pub fn volume_shape(&self) -> [usize; 3] {
        let shape = self.images.shape();
        [shape[2], shape[3], shape[4]]
    }
}

/// Batches fixed-size sub-volumes out of a `VolumeDataset`
pub struct VolumeDataLoader {
    dataset: VolumeDataset,
    batch_size: usize,
    crop_shape: [usize; 3],
    current_idx: usize,
    indices: Vec<usize>,
    shuffle: bool,
    rng: StdRng,
}

impl VolumeDataLoader {
    /// Create new data loader
    ///
    /// With `shuffle` the sample order is permuted every epoch and crops are
    /// placed at random; otherwise crops are centred.
    pub fn new(
        dataset: VolumeDataset,
        batch_size: usize,
        crop_shape: [usize; 3],
        shuffle: bool,
        seed: Option<u64>,
    ) -> crate::Result<Self> {
        if batch_size == 0 {
            return Err(SegError::Data("batch_size must be > 0".to_string()));
        }

        let volume_shape = dataset.volume_shape();
        if crop_shape.iter().zip(volume_shape.iter()).any(|(c, v)| c > v) {
            return Err(SegError::Data(format!(
                "crop shape {:?} exceeds volume shape {:?}",
                crop_shape, volume_shape
            )));
        }

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let mut loader = Self {
            indices: (0..dataset.len()).collect(),
            dataset,
            batch_size,
            crop_shape,
            current_idx: 0,
            shuffle,
            rng,
        };

        if loader.shuffle {
            loader.indices.shuffle(&mut loader.rng);
        }

        Ok(loader)
    }

    fn crop_origin(&mut self) -> [usize; 3] {
        let volume_shape = self.dataset.volume_shape();
        let mut origin = [0usize; 3];
        for axis in 0..3 {
            let slack = volume_shape[axis] - self.crop_shape[axis];
            origin[axis] = if self.shuffle {
                self.rng.gen_range(0..=slack)
            } else {
                slack / 2
            };
        }
        origin
    }

    /// Get next batch (inputs [B, C, D, H, W] f32, labels [B, D, H, W] u32)
    pub fn next_batch(&mut self) -> Result<Option<(Tensor, Tensor)>> {
        if self.current_idx >= self.indices.len() {
            return Ok(None);
        }

        let end_idx = (self.current_idx + self.batch_size).min(self.indices.len());
        let batch_indices = self.indices[self.current_idx..end_idx].to_vec();
        let actual_batch_size = batch_indices.len();

        let [cd, ch, cw] = self.crop_shape;
        let channels = self.dataset.channels();

        let mut input_data = Vec::with_capacity(actual_batch_size * channels * cd * ch * cw);
        let mut target_data = Vec::with_capacity(actual_batch_size * cd * ch * cw);

        for idx in batch_indices {
            let [z, y, x] = self.crop_origin();

            let image = self
                .dataset
                .images
                .slice(s![idx, .., z..z + cd, y..y + ch, x..x + cw]);
            let label = self
                .dataset
                .labels
                .slice(s![idx, z..z + cd, y..y + ch, x..x + cw]);

            input_data.extend(image.iter().copied());
            target_data.extend(label.iter().copied());
        }

        self.current_idx = end_idx;

        let input_tensor = Tensor::from_vec(
            input_data,
            (actual_batch_size, channels, cd, ch, cw),
            &Device::Cpu,
        )?;
        let target_tensor =
            Tensor::from_vec(target_data, (actual_batch_size, cd, ch, cw), &Device::Cpu)?;

        Ok(Some((input_tensor, target_tensor)))
    }

    /// Reset loader for new epoch
    pub fn reset(&mut self) {
        self.current_idx = 0;

        if self.shuffle {
            self.indices.shuffle(&mut self.rng);
        }
    }

    /// Get number of batches
    pub fn num_batches(&self) -> usize {
        (self.dataset.len() + self.batch_size - 1) / self.batch_size
    }

    /// Get dataset reference
    pub fn dataset(&self) -> &VolumeDataset {
        &self.dataset
    }
}

impl super::BatchDataLoader for VolumeDataLoader {
    fn next_batch(&mut self) -> Result<Option<(Tensor, Tensor)>> {
        VolumeDataLoader::next_batch(self)
    }

    fn reset(&mut self) {
        VolumeDataLoader::reset(self)
    }

    fn num_batches(&self) -> usize {
        VolumeDataLoader::num_batches(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use ndarray_npy::WriteNpyExt;

    fn ramp_dataset(samples: usize, side: usize) -> crate::Result<VolumeDataset> {
        // Voxel value encodes its sample index and position
        let images = Array5::from_shape_fn((samples, 1, side, side, side), |(n, _, z, y, x)| {
            (n * 1000 + z * 100 + y * 10 + x) as f32
        });
        let labels = Array4::from_shape_fn((samples, side, side, side), |(_, z, _, _)| {
            (z % 2) as u32
        });
        VolumeDataset::from_arrays(images, labels, 2)
    }

    #[test]
    fn test_batches_cover_dataset() -> crate::Result<()> {
        let dataset = ramp_dataset(5, 4)?;
        let mut loader = VolumeDataLoader::new(dataset, 2, [4, 4, 4], false, None)?;

        assert_eq!(loader.num_batches(), 3);

        let mut sizes = Vec::new();
        while let Some((inputs, labels)) = loader.next_batch()? {
            assert_eq!(inputs.dtype(), DType::F32);
            assert_eq!(labels.dtype(), DType::U32);
            assert_eq!(&inputs.dims()[1..], &[1, 4, 4, 4]);
            assert_eq!(&labels.dims()[1..], &[4, 4, 4]);
            sizes.push(inputs.dim(0)?);
        }
        assert_eq!(sizes, vec![2, 2, 1]);

        loader.reset();
        assert!(loader.next_batch()?.is_some());

        Ok(())
    }

    #[test]
    fn test_center_crop() -> crate::Result<()> {
        let dataset = ramp_dataset(1, 6)?;
        let mut loader = VolumeDataLoader::new(dataset, 1, [2, 2, 2], false, None)?;

        let (inputs, _) = loader.next_batch()?.unwrap();
        let values = inputs.flatten_all()?.to_vec1::<f32>()?;

        // Slack of 4 on every axis puts the origin at (2, 2, 2)
        assert_eq!(values[0], 222.0);
        assert_eq!(values[7], 333.0);

        Ok(())
    }

    #[test]
    fn test_seeded_shuffle_is_reproducible() -> crate::Result<()> {
        let first = |seed| -> crate::Result<Vec<f32>> {
            let mut loader = VolumeDataLoader::new(ramp_dataset(8, 4)?, 8, [2, 2, 2], true, Some(seed))?;
            let (inputs, _) = loader.next_batch()?.unwrap();
            Ok(inputs.flatten_all()?.to_vec1::<f32>()?)
        };

        assert_eq!(first(42)?, first(42)?);

        Ok(())
    }

    #[test]
    fn test_random_crop_stays_in_bounds() -> crate::Result<()> {
        let dataset = ramp_dataset(3, 6)?;
        let mut loader = VolumeDataLoader::new(dataset, 3, [4, 4, 4], true, Some(1))?;

        let (_, labels) = loader.next_batch()?.unwrap();
        assert_eq!(labels.dims(), &[3, 4, 4, 4]);

        Ok(())
    }

    #[test]
    fn test_shuffle_changes_order_between_epochs() -> crate::Result<()> {
        let mut loader = VolumeDataLoader::new(ramp_dataset(8, 4)?, 8, [4, 4, 4], true, Some(3))?;
        let voxels = 4 * 4 * 4;

        let mut orders = Vec::new();
        for _ in 0..5 {
            loader.reset();
            let (inputs, _) = loader.next_batch()?.unwrap();
            assert!(loader.next_batch()?.is_none());

            let values = inputs.flatten_all()?.to_vec1::<f32>()?;
            let order: Vec<usize> = values
                .chunks(voxels)
                .map(|sample| sample[0] as usize / 1000)
                .collect();

            let mut sorted = order.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, (0..8).collect::<Vec<_>>());
            orders.push(order);
        }

        assert!(orders.iter().any(|order| order != &orders[0]));

        Ok(())
    }

    #[test]
    fn test_random_crop_origins_vary_within_slack() -> crate::Result<()> {
        let mut loader = VolumeDataLoader::new(ramp_dataset(16, 8)?, 16, [2, 2, 2], true, Some(5))?;

        let (inputs, _) = loader.next_batch()?.unwrap();
        let values = inputs.flatten_all()?.to_vec1::<f32>()?;

        let mut origins = Vec::new();
        for sample in values.chunks(8) {
            let first = sample[0] as usize;
            let offset = first - (first / 1000) * 1000;
            let (z, y, x) = (offset / 100, (offset / 10) % 10, offset % 10);

            // Slack of 6 on every axis
            assert!(z <= 6 && y <= 6 && x <= 6);
            assert_eq!(sample[7] as usize, first + 111);
            origins.push((z, y, x));
        }

        origins.sort_unstable();
        origins.dedup();
        assert!(origins.len() > 1);

        Ok(())
    }

    #[test]
    fn test_crop_larger_than_volume_fails() -> crate::Result<()> {
        let dataset = ramp_dataset(1, 4)?;
        assert!(VolumeDataLoader::new(dataset, 1, [8, 4, 4], false, None).is_err());
        Ok(())
    }

    #[test]
    fn test_label_out_of_range_rejected() {
        let images = Array5::<f32>::zeros((1, 1, 2, 2, 2));
        let labels = Array4::<u32>::from_elem((1, 2, 2, 2), 3);
        assert!(VolumeDataset::from_arrays(images, labels, 2).is_err());
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let images = Array5::<f32>::zeros((1, 1, 2, 2, 2));
        let labels = Array4::<u32>::zeros((1, 2, 2, 3));
        assert!(VolumeDataset::from_arrays(images, labels, 2).is_err());
    }

    #[test]
    fn test_from_directory_u8_images() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let images = ndarray::Array4::<u8>::from_elem((2, 4, 4, 4), 255);
        let labels = Array5::<u8>::from_elem((2, 1, 4, 4, 4), 1);
        images.write_npy(File::create(dir.path().join("images.npy"))?)?;
        labels.write_npy(File::create(dir.path().join("labels.npy"))?)?;

        let dataset = VolumeDataset::from_directory(dir.path(), "images.npy", "labels.npy", 1, 2)?;
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.channels(), 1);
        assert_eq!(dataset.volume_shape(), [4, 4, 4]);

        let mut loader = VolumeDataLoader::new(dataset, 2, [4, 4, 4], false, None)?;
        let (inputs, labels) = loader.next_batch()?.unwrap();
        assert_eq!(inputs.max_keepdim(0)?.flatten_all()?.to_vec1::<f32>()?[0], 1.0);
        assert_eq!(labels.flatten_all()?.to_vec1::<u32>()?[0], 1);

        Ok(())
    }

    #[test]
    fn test_from_directory_rejects_negative_and_large_labels() -> crate::Result<()> {
        for bad in [-1i64, 2] {
            let dir = tempfile::tempdir()?;

            let images = Array5::<f32>::zeros((1, 1, 2, 2, 2));
            let mut labels = Array4::<i64>::zeros((1, 2, 2, 2));
            labels[[0, 1, 1, 1]] = bad;
            images.write_npy(File::create(dir.path().join("images.npy"))?)?;
            labels.write_npy(File::create(dir.path().join("labels.npy"))?)?;

            let result =
                VolumeDataset::from_directory(dir.path(), "images.npy", "labels.npy", 1, 2);
            assert!(matches!(result, Err(SegError::Data(_))));
        }

        Ok(())
    }

    #[test]
    fn test_from_directory_rejects_channel_mismatch() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;

        let images = Array5::<f32>::zeros((1, 2, 2, 2, 2));
        let labels = Array4::<i64>::zeros((1, 2, 2, 2));
        images.write_npy(File::create(dir.path().join("images.npy"))?)?;
        labels.write_npy(File::create(dir.path().join("labels.npy"))?)?;

        let result = VolumeDataset::from_directory(dir.path(), "images.npy", "labels.npy", 1, 2);
        assert!(matches!(result, Err(SegError::Data(_))));

        Ok(())
    }
}
