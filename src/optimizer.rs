//! Adam optimizer with global gradient-norm clipping.

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::{Optimizer, ParamsAdamW, VarMap};

use crate::error::{KoopmanError, KoopmanResult};

/// Adam hyperparameters.
#[derive(Debug, Clone)]
pub struct OptimizerConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Beta1 for Adam
    pub beta1: f64,
    /// Beta2 for Adam
    pub beta2: f64,
    /// Epsilon for numerical stability
    pub eps: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

impl OptimizerConfig {
    /// Config with the default betas and the given learning rate.
    pub fn with_learning_rate(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            ..Self::default()
        }
    }

    /// Build an optimizer over every variable in `var_map`.
    ///
    /// Weight decay is fixed at zero: the only parameter penalty is the
    /// explicit L2 term of the loss.
    pub fn build_adam(&self, var_map: &VarMap) -> KoopmanResult<AdamOptimizer> {
        let vars = var_map.all_vars();
        let params = ParamsAdamW {
            lr: self.learning_rate,
            beta1: self.beta1,
            beta2: self.beta2,
            eps: self.eps,
            weight_decay: 0.0,
        };

        let inner = candle_nn::AdamW::new(vars.clone(), params)
            .map_err(|e| KoopmanError::training(format!("Failed to create Adam: {e}")))?;

        Ok(AdamOptimizer { inner, vars })
    }
}

/// Adam wrapper that clips the global gradient norm before every update.
pub struct AdamOptimizer {
    inner: candle_nn::AdamW,
    vars: Vec<Var>,
}

impl AdamOptimizer {
    /// Backpropagate `loss`, clip gradients to `max_norm` and apply one update.
    ///
    /// Returns the gradient norm measured before clipping.
    pub fn step(&mut self, loss: &Tensor, max_norm: f64) -> KoopmanResult<f64> {
        let mut grads = loss.backward()?;
        self.clip_then_update(&mut grads, max_norm)
    }

    /// Clip `grads` in place to `max_norm`, then apply them.
    ///
    /// Returns the gradient norm measured before clipping.
    pub fn clip_then_update(&mut self, grads: &mut GradStore, max_norm: f64) -> KoopmanResult<f64> {
        let norm = clip_grad_norm(&self.vars, grads, max_norm)?;
        self.inner
            .step(grads)
            .map_err(|e| KoopmanError::training(format!("Optimizer step failed: {e}")))?;
        Ok(norm)
    }

    /// Get current learning rate.
    pub fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }
}

/// L2 norm of all gradients in `grads` that belong to `vars`.
pub fn global_grad_norm(vars: &[Var], grads: &GradStore) -> KoopmanResult<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            total += grad
                .sqr()?
                .sum_all()?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
        }
    }
    Ok(total.sqrt())
}

/// Rescale gradients in place so their global norm does not exceed `max_norm`.
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> KoopmanResult<f64> {
    let total_norm = global_grad_norm(vars, grads)?;

    if total_norm > max_norm {
        let clip_coef = max_norm / (total_norm + 1e-6);
        for var in vars {
            let scaled = match grads.get(var.as_tensor()) {
                Some(grad) => (grad * clip_coef)?,
                None => continue,
            };
            grads.insert(var.as_tensor(), scaled);
        }
    }

    Ok(total_norm)
}
