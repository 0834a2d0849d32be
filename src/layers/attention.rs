/// Multi-head self-attention over patch tokens
use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::linear::Linear;

/// Bidirectional multi-head self-attention
///
/// Every patch attends to every other patch of the same volume; there is no
/// causal mask and no positional rotation (positions are added to the tokens
/// before the first block).
pub struct Attention {
    head_dim: usize,
    num_heads: usize,
    dropout: f32,

    qkv_proj: Linear,
    o_proj: Linear,
}

impl Attention {
    /// # Arguments
    /// * `hidden_size` - Input/output dimension
    /// * `num_heads` - Number of attention heads
    /// * `dropout` - Dropout probability on the attention weights
    /// * `vb` - VarBuilder for parameter initialization
    pub fn new(hidden_size: usize, num_heads: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        if hidden_size % num_heads != 0 {
            candle_core::bail!(
                "hidden_size {} not divisible by num_heads {}",
                hidden_size,
                num_heads
            );
        }
        let head_dim = hidden_size / num_heads;

        let qkv_proj = Linear::new(hidden_size, 3 * hidden_size, true, vb.pp("qkv_proj"))?;
        let o_proj = Linear::new(hidden_size, hidden_size, true, vb.pp("o_proj"))?;

        Ok(Self {
            head_dim,
            num_heads,
            dropout,
            qkv_proj,
            o_proj,
        })
    }

    /// Forward pass
    ///
    /// # Arguments
    /// * `hidden_states` - Input tensor [batch, tokens, hidden_size]
    /// * `train` - Apply attention dropout
    pub fn forward(&self, hidden_states: &Tensor, train: bool) -> Result<Tensor> {
        let (batch_size, seq_len, hidden_size) = hidden_states.dims3()?;

        // [batch, tokens, 3 * hidden] -> [3, batch, heads, tokens, head_dim]
        let qkv = self
            .qkv_proj
            .forward(hidden_states)?
            .reshape((batch_size, seq_len, 3, self.num_heads, self.head_dim))?
            .permute((2, 0, 3, 1, 4))?;

        let query = qkv.get(0)?.contiguous()?;
        let key = qkv.get(1)?.contiguous()?;
        let value = qkv.get(2)?.contiguous()?;

        let attn_output = scaled_dot_product_attention(&query, &key, &value, self.dropout, train)?;

        // [batch, heads, tokens, head_dim] -> [batch, tokens, hidden]
        let attn_output = attn_output
            .transpose(1, 2)?
            .reshape((batch_size, seq_len, hidden_size))?;

        self.o_proj.forward(&attn_output)
    }
}

/// softmax(Q @ K^T / sqrt(d_k)) @ V
///
/// All inputs are [batch, num_heads, tokens, head_dim].
fn scaled_dot_product_attention(
    query: &Tensor,
    key: &Tensor,
    value: &Tensor,
    dropout: f32,
    train: bool,
) -> Result<Tensor> {
    let head_dim = query.dim(3)?;
    let scale = 1.0 / (head_dim as f64).sqrt();

    let scores = (query.matmul(&key.t()?.contiguous()?)? * scale)?;
    let attn_weights = candle_nn::ops::softmax_last_dim(&scores)?;

    let attn_weights = if train && dropout > 0.0 {
        candle_nn::ops::dropout(&attn_weights, dropout)?
    } else {
        attn_weights
    };

    attn_weights.matmul(value)
}
