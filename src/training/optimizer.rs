/// Adam optimizer with L2 weight decay and AMSGrad
///
/// Weight decay is coupled: it is added to the gradient before the moment
/// updates, unlike AdamW.
use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use candle_nn::Optimizer;

/// Adam optimizer configuration
#[derive(Debug, Clone)]
pub struct AdamConfig {
    /// Learning rate
    pub lr: f64,
    /// Coefficient for computing running averages of gradient (beta1)
    pub beta1: f64,
    /// Coefficient for computing running averages of squared gradient (beta2)
    pub beta2: f64,
    /// Term added to denominator for numerical stability
    pub eps: f64,
    /// L2 penalty coefficient
    pub weight_decay: f64,
    /// Use the running maximum of the second moment (AMSGrad)
    pub amsgrad: bool,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            amsgrad: false,
        }
    }
}

/// Per-variable optimizer state
struct ParamState {
    var: Var,
    /// First moment estimate
    m: Tensor,
    /// Second moment estimate
    v: Tensor,
    /// Running maximum of `v`, AMSGrad only
    v_max: Option<Tensor>,
    /// Updates applied to this variable
    step: usize,
}

/// Adam optimizer
///
/// Implements "Adam: A Method for Stochastic Optimization" (Kingma & Ba,
/// 2015) with the AMSGrad variant from "On the Convergence of Adam and
/// Beyond" (Reddi et al., 2018).
pub struct Adam {
    config: AdamConfig,
    states: Vec<ParamState>,
    step_count: usize,
}

impl Adam {
    /// Number of `step` calls so far
    pub fn step_count(&self) -> usize {
        self.step_count
    }

    /// Number of variables being optimized
    pub fn num_vars(&self) -> usize {
        self.states.len()
    }

    pub fn config(&self) -> &AdamConfig {
        &self.config
    }
}

impl Optimizer for Adam {
    type Config = AdamConfig;

    fn new(vars: Vec<Var>, config: AdamConfig) -> Result<Self> {
        let states = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let m = var.zeros_like()?;
                let v = var.zeros_like()?;
                let v_max = if config.amsgrad {
                    Some(var.zeros_like()?)
                } else {
                    None
                };
                Ok(ParamState {
                    var,
                    m,
                    v,
                    v_max,
                    step: 0,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config,
            states,
            step_count: 0,
        })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let config = &self.config;
        self.step_count += 1;

        for state in self.states.iter_mut() {
            // Variables outside the loss graph keep their value and state
            let Some(grad) = grads.get(state.var.as_tensor()) else {
                continue;
            };
            state.step += 1;

            let param = state.var.as_tensor().detach();

            // L2 penalty: grad = grad + weight_decay * param
            let grad = if config.weight_decay > 0.0 {
                (grad + (&param * config.weight_decay)?)?
            } else {
                grad.clone()
            };

            // m = beta1 * m + (1 - beta1) * grad
            state.m = ((&state.m * config.beta1)? + (&grad * (1.0 - config.beta1))?)?;

            // v = beta2 * v + (1 - beta2) * grad^2
            state.v = ((&state.v * config.beta2)? + (grad.sqr()? * (1.0 - config.beta2))?)?;

            let bias_correction1 = 1.0 - config.beta1.powi(state.step as i32);
            let bias_correction2 = 1.0 - config.beta2.powi(state.step as i32);

            let second_moment = match state.v_max.as_mut() {
                Some(v_max) => {
                    *v_max = v_max.maximum(&state.v)?;
                    v_max.clone()
                }
                None => state.v.clone(),
            };

            // param -= lr / bc1 * m / (sqrt(v) / sqrt(bc2) + eps)
            let denom = ((second_moment.sqrt()? / bias_correction2.sqrt())? + config.eps)?;
            let update = ((&state.m / &denom)? * (config.lr / bias_correction1))?;

            state.var.set(&(param - update)?)?;
        }

        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }
}
