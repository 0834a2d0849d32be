/// Learned positional embedding over the patch grid
use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// One learned vector per patch position, added to the patch tokens
pub struct LearnedPositionalEmbedding {
    embedding: Tensor, // [num_patches, embed_size]
}

impl LearnedPositionalEmbedding {
    pub fn new(num_patches: usize, embed_size: usize, vb: VarBuilder) -> Result<Self> {
        let embedding = vb.get_with_hints(
            (num_patches, embed_size),
            "embedding",
            Init::Randn {
                mean: 0.0,
                stdev: 0.02,
            },
        )?;
        Ok(Self { embedding })
    }

    /// tokens: [batch, num_patches, embed_size]
    pub fn forward(&self, tokens: &Tensor) -> Result<Tensor> {
        let (_, num_patches, _) = tokens.dims3()?;
        let (expected, _) = self.embedding.dims2()?;
        if num_patches != expected {
            candle_core::bail!(
                "got {} patch tokens, positional embedding covers {}",
                num_patches,
                expected
            );
        }
        tokens.broadcast_add(&self.embedding)
    }
}
