/// Data loading modules for volumetric segmentation training
pub mod volume_dataset;

pub use volume_dataset::{VolumeDataLoader, VolumeDataset};

use std::collections::HashMap;
use std::fmt;

use candle_core::{Result, Tensor};

use crate::config::Config;

/// Dataset split a loader serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataMode {
    Train,
    Validation,
}

impl fmt::Display for DataMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataMode::Train => write!(f, "train"),
            DataMode::Validation => write!(f, "validation"),
        }
    }
}

/// Generic data loader trait
///
/// Batches are produced on the CPU; placing them on the compute device is
/// up to the consumer.
pub trait BatchDataLoader {
    /// Get next batch of (input volume, label volume) tensors
    fn next_batch(&mut self) -> Result<Option<(Tensor, Tensor)>>;

    /// Reset loader for new epoch
    fn reset(&mut self);

    /// Get total number of batches
    fn num_batches(&self) -> usize;
}

pub type DataLoaders = HashMap<DataMode, Box<dyn BatchDataLoader>>;

/// Build one loader per split found under `config.data.root`
///
/// The training split is required. A missing validation split is skipped.
pub fn get_data_loaders(config: &Config) -> crate::Result<DataLoaders> {
    let data = &config.data;
    let mut loaders: DataLoaders = HashMap::new();

    for (mode, dir_name) in [
        (DataMode::Train, &data.train_dir),
        (DataMode::Validation, &data.validation_dir),
    ] {
        let dir = data.root.join(dir_name);

        if !dir.is_dir() {
            if mode == DataMode::Train {
                return Err(crate::SegError::Data(format!(
                    "training split not found at {:?}",
                    dir
                )));
            }
            log::warn!("{} split not found at {:?}, skipping", mode, dir);
            continue;
        }

        let dataset = VolumeDataset::from_directory(
            &dir,
            &data.images_file,
            &data.labels_file,
            config.model.input_channels,
            config.num_classes,
        )?;

        let loader = VolumeDataLoader::new(
            dataset,
            config.training.batch_size,
            config.model.spatial_shape(),
            mode == DataMode::Train,
            config.training.seed,
        )?;

        log::info!("{} loader: {} batches", mode, loader.num_batches());
        loaders.insert(mode, Box::new(loader));
    }

    Ok(loaders)
}
