/// Training loop for SegmentationTransformer3D
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Optimizer, VarBuilder, VarMap};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array3;

use super::loss::CrossEntropyLoss;
use super::optimizer::{Adam, AdamConfig};
use crate::config::Config;
use crate::data::{get_data_loaders, DataLoaders, DataMode};
use crate::models::SegmentationTransformer3D;
use crate::visualize::{build_viewer, VolumeViewer};
use crate::SegError;

/// First channel of the first sample, detached from the autograd graph
fn output_preview(output: &Tensor) -> candle_core::Result<Tensor> {
    Ok(output.i((0, 0))?.detach())
}

fn progress_style() -> crate::Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template("{prefix} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .map_err(|e| SegError::Config(format!("progress bar template: {}", e)))?
        .progress_chars("#>-"))
}

/// Trainer for SegmentationTransformer3D
pub struct SegmentationTrainer {
    config: Config,
    data_loaders: DataLoaders,
    model: SegmentationTransformer3D,
    varmap: VarMap,
    optimizer: Adam,
    loss: CrossEntropyLoss,
    viewer: Box<dyn VolumeViewer>,
    device: Device,
    epochs_run: usize,
}

impl SegmentationTrainer {
    /// Create a trainer with loaders from `config.data` and the configured viewer
    pub fn new(config: Config) -> crate::Result<Self> {
        config.validate()?;
        let data_loaders = get_data_loaders(&config)?;
        let viewer = build_viewer(&config.visualization);
        Self::build(config, data_loaders, viewer)
    }

    /// Create a trainer around existing loaders and viewer
    pub fn with_loaders(
        config: Config,
        data_loaders: DataLoaders,
        viewer: Box<dyn VolumeViewer>,
    ) -> crate::Result<Self> {
        config.validate()?;
        Self::build(config, data_loaders, viewer)
    }

    /// Assemble from an already validated config
    fn build(
        config: Config,
        data_loaders: DataLoaders,
        viewer: Box<dyn VolumeViewer>,
    ) -> crate::Result<Self> {
        let device = config.device.resolve()?;
        log::info!("Using device: {:?}", device);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = SegmentationTransformer3D::new(
            config.model.clone(),
            config.num_classes,
            config.training.dropout_probability,
            vb,
        )?;

        let num_params: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
        log::info!(
            "Model: {} patches, {} parameters",
            config.model.num_patches(),
            num_params
        );

        let optimizer = Adam::new(
            varmap.all_vars(),
            AdamConfig {
                lr: config.training.learning_rate,
                weight_decay: config.training.weight_decay,
                amsgrad: config.training.amsgrad,
                ..Default::default()
            },
        )?;

        Ok(Self {
            config,
            data_loaders,
            model,
            varmap,
            optimizer,
            loss: CrossEntropyLoss::new(),
            viewer,
            device,
            epochs_run: 0,
        })
    }

    /// Full training loop
    pub fn train(&mut self) -> crate::Result<()> {
        let num_epochs = self.config.training.num_epochs;
        log::info!("Starting training for {} epochs", num_epochs);

        for epoch in 0..num_epochs {
            match self.train_epoch(epoch)? {
                Some(avg_loss) => log::info!(
                    "Epoch {}/{} complete: avg_loss={:.4}, step={}",
                    epoch + 1,
                    num_epochs,
                    avg_loss,
                    self.optimizer.step_count()
                ),
                None => log::info!("Epoch {}/{} complete: no batches", epoch + 1, num_epochs),
            }
        }

        log::info!("Training complete!");
        Ok(())
    }

    /// Train for one epoch
    ///
    /// Returns the mean batch loss, or `None` when the loader yielded no
    /// batches. The last batch's output is shown once the loop ends.
    pub fn train_epoch(&mut self, epoch: usize) -> crate::Result<Option<f32>> {
        let loader = self
            .data_loaders
            .get_mut(&DataMode::Train)
            .ok_or_else(|| SegError::Data("no training data loader".to_string()))?;
        loader.reset();

        let progress = ProgressBar::new(loader.num_batches() as u64);
        progress.set_style(progress_style()?);
        progress.set_prefix(format!(
            "Epoch {}/{}",
            epoch + 1,
            self.config.training.num_epochs
        ));

        let mut total_loss = 0.0f32;
        let mut num_batches = 0usize;
        let mut last_output: Option<Tensor> = None;

        while let Some((image, label)) = loader.next_batch()? {
            let image = image.to_device(&self.device)?;
            let label = label.to_device(&self.device)?;

            log::debug!("Input shape: {:?}, label shape: {:?}", image.dims(), label.dims());

            let model_output = self.model.forward(&image, true)?;
            let loss = self.loss.forward(&model_output, &label)?;

            // Gradients are recomputed from scratch on every backward pass
            let grads = loss.backward()?;
            self.optimizer.step(&grads)?;

            let loss_val = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            total_loss += loss_val;
            num_batches += 1;

            progress.set_message(format!("Loss: {:.4}", loss_val));
            progress.inc(1);

            // Keep only the detached preview so this batch's graph can be freed
            last_output = Some(output_preview(&model_output)?);
        }

        progress.finish();
        self.epochs_run += 1;

        match last_output {
            Some(output) => self.show_output(&output)?,
            None => log::warn!("Epoch {} yielded no batches, nothing to show", epoch + 1),
        }

        if num_batches == 0 {
            Ok(None)
        } else {
            Ok(Some(total_loss / num_batches as f32))
        }
    }

    /// Validation hook; not implemented, has no effect
    pub fn validate_epoch(&mut self) -> crate::Result<()> {
        Ok(())
    }

    /// Show a [depth, height, width] preview volume
    fn show_output(&mut self, preview: &Tensor) -> crate::Result<()> {
        let volume = preview
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?;
        let (depth, height, width) = volume.dims3()?;
        let data = volume.flatten_all()?.to_vec1::<f32>()?;

        let volume = Array3::from_shape_vec((depth, height, width), data)?;
        self.viewer.show(&volume)
    }

    /// Number of completed epochs
    pub fn epochs_run(&self) -> usize {
        self.epochs_run
    }

    pub fn optimizer(&self) -> &Adam {
        &self.optimizer
    }

    pub fn model(&self) -> &SegmentationTransformer3D {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceKind, ViewerKind};
    use crate::data::{BatchDataLoader, VolumeDataLoader, VolumeDataset};
    use crate::visualize::NoopViewer;
    use ndarray::{Array4, Array5};
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    /// Records the shape of every volume it is shown
    struct RecordingViewer {
        shown: Rc<RefCell<Vec<(usize, usize, usize)>>>,
    }

    impl VolumeViewer for RecordingViewer {
        fn show(&mut self, volume: &Array3<f32>) -> crate::Result<()> {
            self.shown.borrow_mut().push(volume.dim());
            Ok(())
        }
    }

    /// Loader that never yields a batch
    struct EmptyLoader;

    impl BatchDataLoader for EmptyLoader {
        fn next_batch(&mut self) -> candle_core::Result<Option<(Tensor, Tensor)>> {
            Ok(None)
        }

        fn reset(&mut self) {}

        fn num_batches(&self) -> usize {
            0
        }
    }

    fn tiny_config(num_epochs: usize) -> Config {
        let mut config = Config::default();
        config.device = DeviceKind::Cpu;
        config.num_classes = 2;
        config.model.embed_size = 8;
        config.model.num_heads = 2;
        config.model.patch_size = 2;
        config.model.input_shape = [1, 4, 4, 4];
        config.model.input_channels = 1;
        config.model.channels = 2;
        config.model.num_layers = 1;
        config.model.expansion = 2.0;
        config.training.num_epochs = num_epochs;
        config.training.batch_size = 2;
        config.training.learning_rate = 1e-2;
        config.training.seed = Some(0);
        config.visualization.viewer = ViewerKind::None;
        config
    }

    fn train_loader(config: &Config, samples: usize) -> crate::Result<DataLoaders> {
        let images = Array5::from_shape_fn((samples, 1, 4, 4, 4), |(n, _, z, y, x)| {
            ((n + z + y + x) % 3) as f32
        });
        let labels = Array4::from_shape_fn((samples, 4, 4, 4), |(n, z, y, x)| {
            ((n + z + y + x) % 3 == 0) as u32
        });
        let dataset = VolumeDataset::from_arrays(images, labels, config.num_classes)?;
        let loader = VolumeDataLoader::new(
            dataset,
            config.training.batch_size,
            config.model.spatial_shape(),
            true,
            config.training.seed,
        )?;

        let mut loaders: DataLoaders = HashMap::new();
        loaders.insert(DataMode::Train, Box::new(loader));
        Ok(loaders)
    }

    fn param_snapshot(trainer: &SegmentationTrainer) -> crate::Result<Vec<Vec<f32>>> {
        let mut snapshot = Vec::new();
        for var in trainer.varmap().all_vars() {
            snapshot.push(var.as_tensor().flatten_all()?.to_vec1::<f32>()?);
        }
        snapshot.sort_by(|a, b| a.len().cmp(&b.len()).then(a.partial_cmp(b).unwrap()));
        Ok(snapshot)
    }

    #[test]
    fn test_step_count_matches_batches() -> crate::Result<()> {
        let config = tiny_config(1);
        let loaders = train_loader(&config, 5)?;
        let mut trainer = SegmentationTrainer::with_loaders(config, loaders, Box::new(NoopViewer))?;

        let avg_loss = trainer.train_epoch(0)?.expect("batches were produced");

        // 5 samples at batch size 2
        assert_eq!(trainer.optimizer().step_count(), 3);
        assert!(avg_loss.is_finite());
        assert!(avg_loss >= 0.0);

        Ok(())
    }

    #[test]
    fn test_train_runs_every_epoch() -> crate::Result<()> {
        let config = tiny_config(3);
        let loaders = train_loader(&config, 4)?;
        let shown = Rc::new(RefCell::new(Vec::new()));
        let viewer = RecordingViewer {
            shown: shown.clone(),
        };
        let mut trainer = SegmentationTrainer::with_loaders(config, loaders, Box::new(viewer))?;

        trainer.train()?;

        assert_eq!(trainer.epochs_run(), 3);
        assert_eq!(trainer.optimizer().step_count(), 3 * 2);
        // One view per epoch of the first output channel
        assert_eq!(*shown.borrow(), vec![(4, 4, 4); 3]);

        Ok(())
    }

    #[test]
    fn test_training_updates_parameters() -> crate::Result<()> {
        let config = tiny_config(1);
        let loaders = train_loader(&config, 2)?;
        let mut trainer = SegmentationTrainer::with_loaders(config, loaders, Box::new(NoopViewer))?;

        let before = param_snapshot(&trainer)?;
        trainer.train_epoch(0)?;
        let after = param_snapshot(&trainer)?;

        assert_ne!(before, after);

        Ok(())
    }

    #[test]
    fn test_validate_epoch_has_no_effect() -> crate::Result<()> {
        let config = tiny_config(1);
        let loaders = train_loader(&config, 2)?;
        let mut trainer = SegmentationTrainer::with_loaders(config, loaders, Box::new(NoopViewer))?;

        let before = param_snapshot(&trainer)?;
        trainer.validate_epoch()?;

        assert_eq!(param_snapshot(&trainer)?, before);
        assert_eq!(trainer.optimizer().step_count(), 0);
        assert_eq!(trainer.epochs_run(), 0);

        Ok(())
    }

    #[test]
    fn test_empty_epoch_shows_nothing() -> crate::Result<()> {
        let config = tiny_config(2);
        let mut loaders: DataLoaders = HashMap::new();
        loaders.insert(DataMode::Train, Box::new(EmptyLoader));
        let shown = Rc::new(RefCell::new(Vec::new()));
        let viewer = RecordingViewer {
            shown: shown.clone(),
        };
        let mut trainer = SegmentationTrainer::with_loaders(config, loaders, Box::new(viewer))?;

        assert_eq!(trainer.train_epoch(0)?, None);
        trainer.train()?;

        assert_eq!(trainer.epochs_run(), 3);
        assert_eq!(trainer.optimizer().step_count(), 0);
        assert!(shown.borrow().is_empty());

        Ok(())
    }

    #[test]
    fn test_missing_train_loader_is_an_error() -> crate::Result<()> {
        let config = tiny_config(1);
        let mut trainer =
            SegmentationTrainer::with_loaders(config, HashMap::new(), Box::new(NoopViewer))?;

        assert!(matches!(trainer.train(), Err(SegError::Data(_))));

        Ok(())
    }

    #[test]
    fn test_output_preview_is_detached() -> crate::Result<()> {
        let device = Device::Cpu;
        let weights = candle_core::Var::randn(0f32, 1.0, (2, 3, 4, 4, 4), &device)?;
        let output = (weights.as_tensor() * 2.0)?;
        assert!(output.track_op());

        let preview = output_preview(&output)?;

        assert!(!preview.track_op());
        assert_eq!(preview.dims(), &[4, 4, 4]);
        let expected = output.i((0, 0))?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(preview.flatten_all()?.to_vec1::<f32>()?, expected);

        Ok(())
    }

    #[test]
    fn test_progress_style_template_parses() -> crate::Result<()> {
        progress_style()?;
        Ok(())
    }

    #[test]
    fn test_new_rejects_invalid_config_before_loading_data() {
        let mut config = tiny_config(1);
        config.model.num_heads = 3;
        config.data.root = std::path::PathBuf::from("does/not/exist");

        let result = SegmentationTrainer::new(config);
        assert!(matches!(result, Err(SegError::Config(_))));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = tiny_config(1);
        config.model.num_heads = 3;

        let result = SegmentationTrainer::with_loaders(config, HashMap::new(), Box::new(NoopViewer));
        assert!(matches!(result, Err(SegError::Config(_))));
    }
}
