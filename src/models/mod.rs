/// 3D segmentation transformer
use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use crate::config::ModelConfig;
use crate::layers::{
    unpatchify, Attention, LearnedPositionalEmbedding, Linear, PatchEmbedding, RMSNorm, SwiGLU,
};

fn dropout(x: Tensor, p: f32, train: bool) -> Result<Tensor> {
    if train && p > 0.0 {
        candle_nn::ops::dropout(&x, p)
    } else {
        Ok(x)
    }
}

/// Pre-norm transformer block
///
/// x = x + dropout(attn(norm(x)))
/// x = x + dropout(mlp(norm(x)))
pub struct TransformerBlock {
    attn_norm: RMSNorm,
    self_attn: Attention,
    mlp_norm: RMSNorm,
    mlp: SwiGLU,
    dropout: f32,
}

impl TransformerBlock {
    pub fn new(config: &ModelConfig, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let norm_eps = 1e-5;

        Ok(Self {
            attn_norm: RMSNorm::new(config.embed_size, norm_eps, vb.pp("attn_norm"))?,
            self_attn: Attention::new(
                config.embed_size,
                config.num_heads,
                dropout,
                vb.pp("self_attn"),
            )?,
            mlp_norm: RMSNorm::new(config.embed_size, norm_eps, vb.pp("mlp_norm"))?,
            mlp: SwiGLU::new(config.embed_size, config.expansion, vb.pp("mlp"))?,
            dropout,
        })
    }

    /// hidden_states: [batch, num_patches, embed_size]
    pub fn forward(&self, hidden_states: &Tensor, train: bool) -> Result<Tensor> {
        let attn_out = self
            .self_attn
            .forward(&self.attn_norm.forward(hidden_states)?, train)?;
        let hidden_states = (hidden_states + dropout(attn_out, self.dropout, train)?)?;

        let mlp_out = self.mlp.forward(&self.mlp_norm.forward(&hidden_states)?)?;
        hidden_states + dropout(mlp_out, self.dropout, train)?
    }
}

/// Decodes patch tokens back to per-voxel class logits
///
/// Tokens are projected to `channels` features per voxel of their patch and
/// un-patchified; the input volume is concatenated as a skip and a
/// per-voxel linear layer produces the logits.
pub struct VoxelHead {
    patch_size: usize,
    grid: [usize; 3],
    norm: RMSNorm,
    token_proj: Linear,
    classifier: Linear,
}

impl VoxelHead {
    pub fn new(config: &ModelConfig, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let token_proj = Linear::new(
            config.embed_size,
            config.channels * config.patch_size.pow(3),
            true,
            vb.pp("token_proj"),
        )?;
        let classifier = Linear::new(
            config.channels + config.input_channels,
            num_classes,
            true,
            vb.pp("classifier"),
        )?;

        Ok(Self {
            patch_size: config.patch_size,
            grid: config.patch_grid(),
            norm: RMSNorm::new(config.embed_size, 1e-5, vb.pp("norm"))?,
            token_proj,
            classifier,
        })
    }

    /// tokens [batch, num_patches, embed], input [batch, C, D, H, W]
    /// -> logits [batch, num_classes, D, H, W]
    pub fn forward(&self, tokens: &Tensor, input: &Tensor) -> Result<Tensor> {
        let features = self.token_proj.forward(&self.norm.forward(tokens)?)?;
        let features = unpatchify(&features, self.patch_size, self.grid)?.gelu()?;

        let features = Tensor::cat(&[&features, input], 1)?;

        // Channels-last for the per-voxel projection, then back
        let logits = self
            .classifier
            .forward(&features.permute((0, 2, 3, 4, 1))?.contiguous()?)?;
        logits.permute((0, 4, 1, 2, 3))?.contiguous()
    }
}

/// Transformer over cubic patches producing per-voxel class logits
pub struct SegmentationTransformer3D {
    config: ModelConfig,
    num_classes: usize,
    patch_embed: PatchEmbedding,
    pos_embed: LearnedPositionalEmbedding,
    blocks: Vec<TransformerBlock>,
    head: VoxelHead,
    dropout: f32,
}

impl SegmentationTransformer3D {
    /// # Arguments
    /// * `config` - Model hyperparameters
    /// * `num_classes` - Number of output classes
    /// * `dropout` - Dropout probability used while training
    /// * `vb` - VarBuilder for parameter initialization
    pub fn new(
        config: ModelConfig,
        num_classes: usize,
        dropout: f32,
        vb: VarBuilder,
    ) -> crate::Result<Self> {
        let num_patches = config.num_patches();

        let patch_embed = PatchEmbedding::new(
            config.input_channels,
            config.patch_size,
            config.embed_size,
            vb.pp("patch_embed"),
        )?;
        let pos_embed =
            LearnedPositionalEmbedding::new(num_patches, config.embed_size, vb.pp("pos_embed"))?;

        let mut blocks = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            blocks.push(TransformerBlock::new(
                &config,
                dropout,
                vb.pp(format!("blocks.{}", i)),
            )?);
        }

        let head = VoxelHead::new(&config, num_classes, vb.pp("head"))?;

        log::debug!(
            "SegmentationTransformer3D: {} patches of {}^3, {} blocks, embed {}",
            num_patches,
            config.patch_size,
            config.num_layers,
            config.embed_size
        );

        Ok(Self {
            config,
            num_classes,
            patch_embed,
            pos_embed,
            blocks,
            head,
            dropout,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `input` - Volume [batch, C, D, H, W]
    /// * `train` - Enable dropout
    ///
    /// # Returns
    /// Logits [batch, num_classes, D, H, W]
    pub fn forward(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        let tokens = self.patch_embed.forward(input)?;
        let tokens = self.pos_embed.forward(&tokens)?;
        let mut hidden_states = dropout(tokens, self.dropout, train)?;

        for block in &self.blocks {
            hidden_states = block.forward(&hidden_states, train)?;
        }

        self.head.forward(&hidden_states, input)
    }
}
