/// Training infrastructure for the segmentation transformer
pub mod loss;
pub mod optimizer;
pub mod trainer;

pub use loss::CrossEntropyLoss;
pub use optimizer::{Adam, AdamConfig};
pub use trainer::SegmentationTrainer;
