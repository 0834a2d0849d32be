/// Voxel-wise cross-entropy loss
use candle_core::{DType, Result, Tensor};

/// Mean cross entropy over every voxel of every sample
///
/// Stateless; gradients flow through candle's `log_softmax` / `nll`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self
    }

    /// # Arguments
    /// * `logits` - [batch, num_classes, D, H, W]
    /// * `labels` - class indices [batch, D, H, W] or [batch, 1, D, H, W]
    ///
    /// # Returns
    /// Scalar loss tensor
    pub fn forward(&self, logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
        let (batch, num_classes, depth, height, width) = logits.dims5()?;

        let labels = if labels.rank() == 5 && labels.dim(1)? == 1 {
            labels.squeeze(1)?
        } else {
            labels.clone()
        };

        if labels.dims() != &[batch, depth, height, width] {
            candle_core::bail!(
                "labels {:?} do not match logits {:?}",
                labels.dims(),
                logits.dims()
            );
        }

        let voxels = batch * depth * height * width;

        // [B, K, D, H, W] -> [B * D * H * W, K]
        let flat_logits = logits
            .permute((0, 2, 3, 4, 1))?
            .reshape((voxels, num_classes))?;
        let flat_labels = labels.flatten_all()?.to_dtype(DType::U32)?;

        candle_nn::loss::cross_entropy(&flat_logits, &flat_labels)
    }
}
