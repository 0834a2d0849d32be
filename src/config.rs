/// Run configuration for voxel segmentation training
///
/// Every section deserializes with defaults, so a JSON file only needs the
/// fields it overrides.
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::SegError;

/// Model hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Token embedding dimension
    pub embed_size: usize,

    /// Number of attention heads
    pub num_heads: usize,

    /// Side length of the cubic patches
    pub patch_size: usize,

    /// Input volume shape: [channels, depth, height, width]
    pub input_shape: [usize; 4],

    /// Number of image channels
    pub input_channels: usize,

    /// Feature channels of the voxel decoder
    pub channels: usize,

    /// Number of transformer blocks
    pub num_layers: usize,

    /// FFN expansion factor (embed_size * expansion)
    pub expansion: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            embed_size: 128,
            num_heads: 8,
            patch_size: 8,
            input_shape: [1, 64, 64, 64],
            input_channels: 1,
            channels: 8,
            num_layers: 4,
            expansion: 4.0,
        }
    }
}

impl ModelConfig {
    /// Spatial shape [depth, height, width]
    pub fn spatial_shape(&self) -> [usize; 3] {
        [self.input_shape[1], self.input_shape[2], self.input_shape[3]]
    }

    /// Number of patch tokens in one volume
    pub fn num_patches(&self) -> usize {
        let [d, h, w] = self.spatial_shape();
        d * h * w / self.patch_size.pow(3)
    }

    /// Patch grid shape [depth, height, width] in patches
    pub fn patch_grid(&self) -> [usize; 3] {
        let [d, h, w] = self.spatial_shape();
        [d / self.patch_size, h / self.patch_size, w / self.patch_size]
    }

    /// Get head dimension
    pub fn head_dim(&self) -> usize {
        self.embed_size / self.num_heads
    }
}

/// Training hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub num_epochs: usize,
    pub batch_size: usize,
    pub dropout_probability: f32,
    /// L2 penalty added to the gradient by Adam
    pub weight_decay: f64,
    pub amsgrad: bool,
    /// Seed for shuffling and crop placement; entropy-seeded when unset
    pub seed: Option<u64>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            num_epochs: 10,
            batch_size: 2,
            dropout_probability: 0.1,
            weight_decay: 1e-4,
            amsgrad: true,
            seed: None,
        }
    }
}

/// Dataset location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Directory holding one sub-directory per split
    pub root: PathBuf,
    pub train_dir: String,
    pub validation_dir: String,
    pub images_file: String,
    pub labels_file: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/nucmm"),
            train_dir: "train".to_string(),
            validation_dir: "val".to_string(),
            images_file: "images.npy".to_string(),
            labels_file: "labels.npy".to_string(),
        }
    }
}

/// How the per-epoch output volume is displayed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewerKind {
    Terminal,
    Npy,
    None,
}

impl FromStr for ViewerKind {
    type Err = SegError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "terminal" => Ok(Self::Terminal),
            "npy" => Ok(Self::Npy),
            "none" => Ok(Self::None),
            other => Err(SegError::Config(format!(
                "Invalid viewer: {}. Must be 'terminal', 'npy', or 'none'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualizationConfig {
    pub viewer: ViewerKind,
    /// Snapshot directory for the `npy` viewer
    pub output_dir: PathBuf,
}

impl Default for VisualizationConfig {
    fn default() -> Self {
        Self {
            viewer: ViewerKind::Terminal,
            output_dir: PathBuf::from("snapshots"),
        }
    }
}

/// Compute target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceKind {
    /// CUDA device 0 when available, CPU otherwise
    Auto,
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceKind {
    pub fn resolve(&self) -> crate::Result<Device> {
        let device = match *self {
            DeviceKind::Auto => {
                if candle_core::utils::cuda_is_available() {
                    Device::new_cuda(0)?
                } else {
                    Device::Cpu
                }
            }
            DeviceKind::Cpu => Device::Cpu,
            DeviceKind::Cuda(ordinal) => Device::new_cuda(ordinal)?,
            DeviceKind::Metal(ordinal) => Device::new_metal(ordinal)?,
        };
        Ok(device)
    }
}

impl FromStr for DeviceKind {
    type Err = SegError;

    fn from_str(s: &str) -> crate::Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        let (kind, ordinal) = match lower.split_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal.parse::<usize>().map_err(|_| {
                    SegError::Config(format!("Invalid device ordinal in '{}'", s))
                })?;
                (kind, ordinal)
            }
            None => (lower.as_str(), 0),
        };

        match kind {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda(ordinal)),
            "metal" | "mps" => Ok(Self::Metal(ordinal)),
            _ => Err(SegError::Config(format!(
                "Invalid device: {}. Must be 'auto', 'cpu', 'cuda[:N]', or 'metal[:N]'",
                s
            ))),
        }
    }
}

impl TryFrom<String> for DeviceKind {
    type Error = SegError;

    fn try_from(value: String) -> crate::Result<Self> {
        value.parse()
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Auto => write!(f, "auto"),
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Cuda(ordinal) => write!(f, "cuda:{}", ordinal),
            DeviceKind::Metal(ordinal) => write!(f, "metal:{}", ordinal),
        }
    }
}

impl From<DeviceKind> for String {
    fn from(value: DeviceKind) -> Self {
        value.to_string()
    }
}

/// Complete run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub data: DataConfig,
    pub visualization: VisualizationConfig,
    /// Number of segmentation classes (background included)
    pub num_classes: usize,
    pub device: DeviceKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            training: TrainingConfig::default(),
            data: DataConfig::default(),
            visualization: VisualizationConfig::default(),
            num_classes: 2,
            device: DeviceKind::Auto,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let config: Config = serde_json::from_reader(std::io::BufReader::new(file))?;
        log::info!("Loaded configuration from {:?}", path.as_ref());
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> crate::Result<()> {
        let model = &self.model;

        if model.embed_size == 0 || model.num_heads == 0 {
            return Err(SegError::Config(
                "embed_size and num_heads must be > 0".to_string(),
            ));
        }

        if model.embed_size % model.num_heads != 0 {
            return Err(SegError::Config(
                "embed_size must be divisible by num_heads".to_string(),
            ));
        }

        if model.patch_size == 0 {
            return Err(SegError::Config("patch_size must be > 0".to_string()));
        }

        if model.input_shape.iter().any(|&d| d == 0) {
            return Err(SegError::Config(format!(
                "input_shape must not contain zeros: {:?}",
                model.input_shape
            )));
        }

        if model.input_shape[0] != model.input_channels {
            return Err(SegError::Config(format!(
                "input_shape channels ({}) != input_channels ({})",
                model.input_shape[0], model.input_channels
            )));
        }

        if let Some(dim) = model
            .spatial_shape()
            .into_iter()
            .find(|d| d % model.patch_size != 0)
        {
            return Err(SegError::Config(format!(
                "spatial dim {} is not divisible by patch_size {}",
                dim, model.patch_size
            )));
        }

        if model.channels == 0 || model.num_layers == 0 {
            return Err(SegError::Config(
                "channels and num_layers must be > 0".to_string(),
            ));
        }

        if !(model.expansion > 0.0) {
            return Err(SegError::Config("expansion must be > 0".to_string()));
        }

        if self.num_classes < 2 {
            return Err(SegError::Config("num_classes must be >= 2".to_string()));
        }

        let training = &self.training;

        if !(training.learning_rate > 0.0) {
            return Err(SegError::Config("learning_rate must be > 0".to_string()));
        }

        if !(0.0..1.0).contains(&training.dropout_probability) {
            return Err(SegError::Config(format!(
                "dropout_probability must be in [0, 1), got {}",
                training.dropout_probability
            )));
        }

        if training.batch_size == 0 {
            return Err(SegError::Config("batch_size must be > 0".to_string()));
        }

        if !(training.weight_decay >= 0.0) {
            return Err(SegError::Config("weight_decay must be >= 0".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.model.num_patches(), 512);
        assert_eq!(config.model.patch_grid(), [8, 8, 8]);
        assert_eq!(config.model.head_dim(), 16);
    }

    #[test]
    fn test_rejects_indivisible_patch() {
        let mut config = Config::default();
        config.model.input_shape = [1, 64, 60, 64];
        assert!(matches!(config.validate(), Err(SegError::Config(_))));
    }

    #[test]
    fn test_rejects_channel_mismatch() {
        let mut config = Config::default();
        config.model.input_channels = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_heads_and_dropout() {
        let mut config = Config::default();
        config.model.num_heads = 3;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.training.dropout_probability = 1.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.num_classes = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_nan_hyperparameters() {
        let mut config = Config::default();
        config.model.expansion = f32::NAN;
        assert!(matches!(config.validate(), Err(SegError::Config(_))));

        let mut config = Config::default();
        config.training.weight_decay = f64::NAN;
        assert!(matches!(config.validate(), Err(SegError::Config(_))));

        let mut config = Config::default();
        config.training.learning_rate = f64::NAN;
        assert!(matches!(config.validate(), Err(SegError::Config(_))));
    }

    #[test]
    fn test_device_parsing() {
        assert_eq!("cpu".parse::<DeviceKind>().unwrap(), DeviceKind::Cpu);
        assert_eq!("CUDA".parse::<DeviceKind>().unwrap(), DeviceKind::Cuda(0));
        assert_eq!("cuda:2".parse::<DeviceKind>().unwrap(), DeviceKind::Cuda(2));
        assert_eq!("auto".parse::<DeviceKind>().unwrap(), DeviceKind::Auto);
        assert!("tpu".parse::<DeviceKind>().is_err());
        assert!("cuda:x".parse::<DeviceKind>().is_err());
        assert_eq!(DeviceKind::Cuda(1).to_string(), "cuda:1");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "num_classes": 3,
            "device": "cpu",
            "model": { "embed_size": 64, "num_heads": 4 },
            "training": { "num_epochs": 2 },
            "visualization": { "viewer": "none" }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.num_classes, 3);
        assert_eq!(config.device, DeviceKind::Cpu);
        assert_eq!(config.model.embed_size, 64);
        assert_eq!(config.model.patch_size, 8);
        assert_eq!(config.training.num_epochs, 2);
        assert!(config.training.amsgrad);
        assert_eq!(config.visualization.viewer, ViewerKind::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_file_roundtrip() -> crate::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.device = DeviceKind::Cpu;
        config.training.seed = Some(7);
        std::fs::write(&path, serde_json::to_string_pretty(&config)?)?;

        let loaded = Config::from_json_file(&path)?;
        assert_eq!(loaded.device, DeviceKind::Cpu);
        assert_eq!(loaded.training.seed, Some(7));

        Ok(())
    }
}
