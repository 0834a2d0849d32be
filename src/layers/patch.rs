/// Cubic patch tokenization of volumes
use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::linear::Linear;

/// Cut a volume into non-overlapping cubic patches
///
/// `[batch, channels, D, H, W]` -> `[batch, num_patches, channels * p^3]`.
/// Patches are ordered depth-major over the patch grid; each patch vector
/// is channel-major.
pub fn patchify(volume: &Tensor, patch_size: usize) -> Result<Tensor> {
    let (batch, channels, depth, height, width) = volume.dims5()?;
    let p = patch_size;

    if depth % p != 0 || height % p != 0 || width % p != 0 {
        candle_core::bail!(
            "volume {:?} is not divisible into patches of size {}",
            volume.dims(),
            p
        );
    }

    let (gd, gh, gw) = (depth / p, height / p, width / p);

    volume
        .reshape(vec![batch, channels, gd, p, gh, p, gw, p])?
        .permute(vec![0usize, 2, 4, 6, 1, 3, 5, 7])?
        .contiguous()?
        .reshape((batch, gd * gh * gw, channels * p * p * p))
}

/// Inverse of `patchify`
///
/// `[batch, num_patches, channels * p^3]` -> `[batch, channels, D, H, W]`
/// for a patch grid of `grid` = [depth, height, width] patches.
pub fn unpatchify(tokens: &Tensor, patch_size: usize, grid: [usize; 3]) -> Result<Tensor> {
    let (batch, num_patches, features) = tokens.dims3()?;
    let p = patch_size;
    let [gd, gh, gw] = grid;

    if num_patches != gd * gh * gw || features % (p * p * p) != 0 {
        candle_core::bail!(
            "tokens {:?} do not match grid {:?} with patch size {}",
            tokens.dims(),
            grid,
            p
        );
    }
    let channels = features / (p * p * p);

    tokens
        .reshape(vec![batch, gd, gh, gw, channels, p, p, p])?
        .permute(vec![0usize, 4, 1, 5, 2, 6, 3, 7])?
        .contiguous()?
        .reshape((batch, channels, gd * p, gh * p, gw * p))
}

/// Patchify followed by a linear projection to the embedding size
pub struct PatchEmbedding {
    patch_size: usize,
    proj: Linear,
}

impl PatchEmbedding {
    pub fn new(
        input_channels: usize,
        patch_size: usize,
        embed_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let patch_dim = input_channels * patch_size.pow(3);
        let proj = Linear::new(patch_dim, embed_size, true, vb.pp("proj"))?;
        Ok(Self { patch_size, proj })
    }

    /// `[batch, C, D, H, W]` -> `[batch, num_patches, embed_size]`
    pub fn forward(&self, volume: &Tensor) -> Result<Tensor> {
        let patches = patchify(volume, self.patch_size)?;
        self.proj.forward(&patches)
    }
}
