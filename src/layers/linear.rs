/// Token-wise linear projection
use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

/// Linear layer applied over the last dimension of any-rank input
///
/// Leading dimensions are folded into one matmul, so the same layer serves
/// patch tokens `[batch, tokens, features]` and channels-last voxels
/// `[batch, depth, height, width, features]`.
pub struct Linear {
    weight: Tensor,
    bias: Option<Tensor>,
    out_features: usize,
}

impl Linear {
    /// # Arguments
    /// * `in_features` - Input dimension
    /// * `out_features` - Output dimension
    /// * `bias` - Whether to include bias
    /// * `vb` - VarBuilder for parameter initialization
    pub fn new(in_features: usize, out_features: usize, bias: bool, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(
            (out_features, in_features),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;

        let bias = if bias {
            let bound = 1. / (in_features as f64).sqrt();
            let init_bs = Init::Uniform { lo: -bound, up: bound };
            Some(vb.get_with_hints(out_features, "bias", init_bs)?)
        } else {
            None
        };

        Ok(Self {
            weight,
            bias,
            out_features,
        })
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let dims = input.dims().to_vec();
        let in_features = dims[dims.len() - 1];
        let rows = input.elem_count() / in_features;

        // [..., in] -> [rows, in] @ [in, out]
        let flat = input.reshape((rows, in_features))?;
        let output = flat.matmul(&self.weight.t()?)?;

        let output = match &self.bias {
            Some(bias) => output.broadcast_add(bias)?,
            None => output,
        };

        let mut out_dims = dims;
        let last = out_dims.len() - 1;
        out_dims[last] = self.out_features;
        output.reshape(out_dims)
    }
}
