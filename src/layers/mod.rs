/// Neural network layer primitives
///
/// Building blocks for the 3D segmentation transformer:
/// - Patch tokenization (patchify / unpatchify, patch embedding)
/// - Learned positional embedding over the patch grid
/// - Multi-head self-attention
/// - Feed-forward (SwiGLU)
/// - Normalization (RMS norm)

pub mod attention;
pub mod feed_forward;
pub mod linear;
pub mod normalization;
pub mod patch;
pub mod positional;

pub use attention::Attention;
pub use feed_forward::SwiGLU;
pub use linear::Linear;
pub use normalization::RMSNorm;
pub use patch::{patchify, unpatchify, PatchEmbedding};
pub use positional::LearnedPositionalEmbedding;
