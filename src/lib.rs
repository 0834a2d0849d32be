//! Voxel segmentation - 3D transformer segmentation training on candle
//!
//! Trains a patch-based transformer that maps a volumetric image
//! `[batch, channels, depth, height, width]` to per-voxel class logits.
//!
//! # Architecture
//!
//! - **Patch embedding**: non-overlapping cubic patches projected to tokens
//! - **Encoder**: pre-norm transformer blocks over the patch grid
//! - **Voxel head**: un-patchify, input skip, per-voxel class projection
//!
//! # Example
//!
//! ```ignore
//! use segmentation_voxel::{Config, SegmentationTrainer};
//!
//! let mut trainer = SegmentationTrainer::new(Config::default())?;
//! trainer.train()?;
//! ```

pub mod config;
pub mod data;
pub mod layers;
pub mod models;
pub mod training;
pub mod visualize;

// Re-export commonly used items
pub use config::Config;
pub use models::SegmentationTransformer3D;
pub use training::SegmentationTrainer;

/// Library error types
#[derive(Debug, thiserror::Error)]
pub enum SegError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Visualization error: {0}")]
    Visualization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("NumPy read error: {0}")]
    NpyRead(#[from] ndarray_npy::ReadNpyError),

    #[error("NumPy write error: {0}")]
    NpyWrite(#[from] ndarray_npy::WriteNpyError),

    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

pub type Result<T> = std::result::Result<T, SegError>;
