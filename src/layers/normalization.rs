/// RMS Layer Normalization
use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

/// Normalize by the root mean square of the last dimension
///
/// The computation is done in f32, then cast back to the input dtype.
pub fn rms_norm(hidden_states: &Tensor, variance_epsilon: f64) -> Result<Tensor> {
    let input_dtype = hidden_states.dtype();
    let hidden_states = hidden_states.to_dtype(DType::F32)?;

    let variance = hidden_states.sqr()?.mean_keepdim(D::Minus1)?;
    let normalized = hidden_states.broadcast_div(&(variance + variance_epsilon)?.sqrt()?)?;

    normalized.to_dtype(input_dtype)
}

/// RMS Normalization layer with learnable scale
pub struct RMSNorm {
    weight: Tensor,
    eps: f64,
}

impl RMSNorm {
    pub fn new(hidden_size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints((hidden_size,), "weight", Init::Const(1.0))?;
        Ok(Self { weight, eps })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        rms_norm(x, self.eps)?.broadcast_mul(&self.weight)
    }
}
