/// Gated feed-forward sublayer
use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

use super::linear::Linear;

/// Smallest multiple of b that is >= a
fn find_multiple(a: usize, b: usize) -> usize {
    ((a + b - 1) / b) * b
}

/// SwiGLU: down_proj(silu(gate) * up)
pub struct SwiGLU {
    gate_up_proj: Linear,
    down_proj: Linear,
    inter_size: usize,
}

impl SwiGLU {
    /// # Arguments
    /// * `hidden_size` - Input/output dimension
    /// * `expansion` - Expansion factor for intermediate dimension
    /// * `vb` - VarBuilder for parameter initialization
    pub fn new(hidden_size: usize, expansion: f32, vb: VarBuilder) -> Result<Self> {
        // 2/3 keeps the parameter count of a plain 2-matrix FFN
        let inter_size = find_multiple(
            (expansion * hidden_size as f32 * 2.0 / 3.0).round().max(1.0) as usize,
            8,
        );

        let gate_up_proj = Linear::new(hidden_size, inter_size * 2, false, vb.pp("gate_up_proj"))?;
        let down_proj = Linear::new(inter_size, hidden_size, false, vb.pp("down_proj"))?;

        Ok(Self {
            gate_up_proj,
            down_proj,
            inter_size,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gate_up = self.gate_up_proj.forward(x)?;

        let last_dim = gate_up.rank() - 1;
        let gate = gate_up.narrow(last_dim, 0, self.inter_size)?;
        let up = gate_up.narrow(last_dim, self.inter_size, self.inter_size)?;

        let gated = candle_nn::ops::silu(&gate)?.mul(&up)?;
        self.down_proj.forward(&gated)
    }
}
