//! Composite training objective over rolled-out latent trajectories.
//!
//! [`total_loss`] combines six mean-squared-error style terms:
//!
//! | Term   | Measures                                                         |
//! |--------|------------------------------------------------------------------|
//! | `L_gx` | state reconstruction `dec_x(enc_x(x))` vs `x`                    |
//! | `L_gu` | input reconstruction `dec_u(x, enc_u(x, u))` vs `u`              |
//! | `L3`   | latent rollout from `y_0` over the horizon vs `enc_x(x_k)`       |
//! | `L4`   | the same rollout decoded vs `x_k`                                |
//! | `L5`   | every `S_p`-state window rolled from its own start, decoded      |
//! | `L6`   | squared L2 norm of all trainable parameters                      |
//!
//! The horizon `T` and shift `S_p` both count states, so a horizon of `T`
//! predicts `T - 1` steps ahead of the initial state.
//!
//! Nothing is cached between calls; every graph built here is dropped with
//! the returned [`LossTerms`].

use std::ops::AddAssign;

use candle_core::{DType, Device, Tensor, D};
use candle_nn::loss::mse;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::config::LossWeights;
use crate::error::{KoopmanError, KoopmanResult};
use crate::model::KoopmanModel;

/// Graph-connected loss tensors from one call to [`total_loss`].
#[derive(Debug, Clone)]
pub struct LossTerms {
    /// Weighted sum, the tensor to backpropagate
    pub total: Tensor,
    /// State reconstruction
    pub l_gx: Tensor,
    /// Input reconstruction
    pub l_gu: Tensor,
    /// Multi-step latent prediction
    pub l3: Tensor,
    /// Multi-step decoded prediction over the horizon
    pub l4: Tensor,
    /// Shift-window consistency
    pub l5: Tensor,
    /// Parameter magnitude
    pub l6: Tensor,
}

impl LossTerms {
    /// Read every term back to the host.
    pub fn components(&self) -> KoopmanResult<LossComponents> {
        let read = |t: &Tensor| -> KoopmanResult<f64> {
            Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
        };
        Ok(LossComponents {
            total: read(&self.total)?,
            l_gx: read(&self.l_gx)?,
            l_gu: read(&self.l_gu)?,
            l3: read(&self.l3)?,
            l4: read(&self.l4)?,
            l5: read(&self.l5)?,
            l6: read(&self.l6)?,
        })
    }
}

/// Host-side values of the total loss and its six terms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LossComponents {
    /// Weighted total
    pub total: f64,
    /// State reconstruction
    pub l_gx: f64,
    /// Input reconstruction
    pub l_gu: f64,
    /// Multi-step latent prediction
    pub l3: f64,
    /// Multi-step decoded prediction
    pub l4: f64,
    /// Shift-window consistency
    pub l5: f64,
    /// Parameter magnitude
    pub l6: f64,
}

impl LossComponents {
    /// Recombine the six terms with `weights`.
    pub fn weighted_sum(&self, weights: &LossWeights) -> f64 {
        weights.reconstruction * (self.l_gx + self.l_gu)
            + weights.prediction * (self.l3 + self.l4 + self.l5)
            + weights.regularization * self.l6
    }

    /// Whether every value is finite.
    pub fn is_finite(&self) -> bool {
        [
            self.total, self.l_gx, self.l_gu, self.l3, self.l4, self.l5, self.l6,
        ]
        .iter()
        .all(|v| v.is_finite())
    }
}

impl AddAssign for LossComponents {
    fn add_assign(&mut self, rhs: Self) {
        self.total += rhs.total;
        self.l_gx += rhs.l_gx;
        self.l_gu += rhs.l_gu;
        self.l3 += rhs.l3;
        self.l4 += rhs.l4;
        self.l5 += rhs.l5;
        self.l6 += rhs.l6;
    }
}

/// Compute the composite objective for one batch.
///
/// # Arguments
/// * `weights` - Sub-loss weights (`alpha`)
/// * `batch` - Trajectories, shape (batch, time, num_meas + num_inputs) with `time >= horizon`
/// * `num_meas` - Measured state dimension, must match the model
/// * `num_x_obsv` - Latent state dimension, must match the model's encoder
/// * `horizon` - Prediction horizon `T` in states
/// * `shift` - Window length `S_p` in states, `1..=horizon`
/// * `model` - The network being trained
///
/// # Errors
/// Shape disagreements between batch, arguments and model are returned as
/// [`KoopmanError::ShapeMismatch`]; backend failures propagate unchanged.
pub fn total_loss<M: KoopmanModel>(
    weights: &LossWeights,
    batch: &Tensor,
    num_meas: usize,
    num_x_obsv: usize,
    horizon: usize,
    shift: usize,
    model: &M,
) -> KoopmanResult<LossTerms> {
    let hp = model.hyperparams();
    if num_meas != hp.num_meas {
        return Err(KoopmanError::shape_mismatch(
            format!("num_meas = {}", hp.num_meas),
            format!("num_meas = {num_meas}"),
        ));
    }
    if horizon == 0 || shift == 0 || shift > horizon {
        return Err(KoopmanError::shape_mismatch(
            "1 <= shift <= horizon",
            format!("shift = {shift}, horizon = {horizon}"),
        ));
    }

    let out = model.forward(batch)?;
    let time = out.states.dim(1)?;
    if time < horizon {
        return Err(KoopmanError::shape_mismatch(
            format!("at least {horizon} time steps"),
            format!("{time} time steps"),
        ));
    }
    let latent_dim = out.latent_states.dim(D::Minus1)?;
    if latent_dim != num_x_obsv {
        return Err(KoopmanError::shape_mismatch(
            format!("latent dimension {num_x_obsv}"),
            format!("latent dimension {latent_dim}"),
        ));
    }

    let device = batch.device();
    let l_gx = mse(&out.state_reconstruction, &out.states)?;
    let l_gu = mse(&out.input_reconstruction, &out.inputs)?;

    let (l3, l4) = if horizon > 1 {
        let steps = horizon - 1;
        let mut y = time_slice(&out.latent_states, 0)?;
        let mut predicted = Vec::with_capacity(steps);
        for k in 0..steps {
            let v = time_slice(&out.latent_inputs, k)?;
            y = model.advance(&y, &v)?;
            predicted.push(y.clone());
        }
        let predicted = Tensor::stack(&predicted, 1)?;
        let l3 = mse(&predicted, &out.latent_states.narrow(1, 1, steps)?)?;
        let decoded = model.decode_state(&predicted)?;
        let l4 = mse(&decoded, &out.states.narrow(1, 1, steps)?)?;
        (l3, l4)
    } else {
        (scalar_zero(device)?, scalar_zero(device)?)
    };

    // All windows are advanced together: window k starts at y_k and after
    // j steps has consumed v_k..v_{k+j-1}.
    let windows = horizon - shift + 1;
    let mut z = out.latent_states.narrow(1, 0, windows)?.contiguous()?;
    for j in 0..shift - 1 {
        let v = out.latent_inputs.narrow(1, j, windows)?.contiguous()?;
        z = model.advance(&z, &v)?;
    }
    let l5 = mse(
        &model.decode_state(&z)?,
        &out.states.narrow(1, shift - 1, windows)?,
    )?;

    let l6 = parameter_penalty(model.var_map(), device)?;

    let reconstruction = ((&l_gx + &l_gu)? * weights.reconstruction)?;
    let prediction = (((&l3 + &l4)? + &l5)? * weights.prediction)?;
    let regularization = (&l6 * weights.regularization)?;
    let total = ((reconstruction + prediction)? + regularization)?;

    Ok(LossTerms {
        total,
        l_gx,
        l_gu,
        l3,
        l4,
        l5,
        l6,
    })
}

/// Sum of squares of every parameter in `var_map`.
pub fn parameter_penalty(var_map: &VarMap, device: &Device) -> KoopmanResult<Tensor> {
    let mut penalty = scalar_zero(device)?;
    for var in var_map.all_vars() {
        let sq = var.as_tensor().sqr()?.sum_all()?.to_dtype(DType::F32)?;
        penalty = (penalty + sq)?;
    }
    Ok(penalty)
}

/// `(batch, time, f)` -> contiguous `(batch, f)` at time index `k`.
pub(crate) fn time_slice(t: &Tensor, k: usize) -> candle_core::Result<Tensor> {
    t.narrow(1, k, 1)?.squeeze(1)?.contiguous()
}

fn scalar_zero(device: &Device) -> candle_core::Result<Tensor> {
    Tensor::zeros((), DType::F32, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelHyperparams;
    use crate::model::KoopmanAutoencoder;

    fn setup(time: usize) -> (KoopmanAutoencoder, Tensor) {
        let hp = ModelHyperparams::test();
        let model = KoopmanAutoencoder::build(&hp, &Device::Cpu).unwrap();
        let batch = Tensor::randn(0f32, 1f32, (4, time, hp.feature_dim()), &Device::Cpu).unwrap();
        (model, batch)
    }

    #[test]
    fn test_total_is_weighted_sum_of_six_terms() {
        let (model, batch) = setup(6);
        let weights = LossWeights::from([0.3, 1.5, 1e-3]);
        let terms = total_loss(&weights, &batch, 2, 4, 5, 3, &model).unwrap();
        let c = terms.components().unwrap();

        let expected = c.weighted_sum(&weights);
        assert!((c.total - expected).abs() <= 1e-5 * expected.abs().max(1.0));
        assert!(c.is_finite());
        assert!(c.l6 > 0.0);
    }

    #[test]
    fn test_deterministic_for_fixed_batch() {
        let (model, batch) = setup(6);
        let weights = LossWeights::default();
        let a = total_loss(&weights, &batch, 2, 4, 4, 2, &model)
            .unwrap()
            .components()
            .unwrap();
        let b = total_loss(&weights, &batch, 2, 4, 4, 2, &model)
            .unwrap()
            .components()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_horizon_one_zeroes_rollout_terms() {
        let (model, batch) = setup(3);
        let c = total_loss(&LossWeights::default(), &batch, 2, 4, 1, 1, &model)
            .unwrap()
            .components()
            .unwrap();
        assert_eq!(c.l3, 0.0);
        assert_eq!(c.l4, 0.0);
    }

    #[test]
    fn test_unit_shift_matches_reconstruction_over_horizon() {
        let (model, batch) = setup(5);
        // With S_p = 1 and T = time, L5 decodes the unrolled encodings of every state.
        let c = total_loss(&LossWeights::default(), &batch, 2, 4, 5, 1, &model)
            .unwrap()
            .components()
            .unwrap();
        assert!((c.l5 - c.l_gx).abs() < 1e-6);
    }

    #[test]
    fn test_shift_equal_to_horizon() {
        let (model, batch) = setup(4);
        let c = total_loss(&LossWeights::default(), &batch, 2, 4, 4, 4, &model)
            .unwrap()
            .components()
            .unwrap();
        assert!(c.is_finite());
    }

    #[test]
    fn test_short_batch_is_shape_error() {
        let (model, batch) = setup(3);
        let err = total_loss(&LossWeights::default(), &batch, 2, 4, 5, 2, &model).unwrap_err();
        assert!(matches!(err, KoopmanError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_wrong_dimensions_are_shape_errors() {
        let (model, batch) = setup(5);
        let weights = LossWeights::default();
        assert!(matches!(
            total_loss(&weights, &batch, 3, 4, 4, 2, &model),
            Err(KoopmanError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            total_loss(&weights, &batch, 2, 5, 4, 2, &model),
            Err(KoopmanError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_gradients_reach_every_parameter() {
        let (model, batch) = setup(6);
        let terms = total_loss(&LossWeights::default(), &batch, 2, 4, 5, 2, &model).unwrap();
        let grads = terms.total.backward().unwrap();
        for var in model.var_map().all_vars() {
            assert!(grads.get(var.as_tensor()).is_some());
        }
    }

    #[test]
    fn test_components_accumulate() {
        let mut sum = LossComponents::default();
        let step = LossComponents {
            total: 1.0,
            l_gx: 0.1,
            l_gu: 0.2,
            l3: 0.3,
            l4: 0.4,
            l5: 0.5,
            l6: 0.6,
        };
        sum += step;
        sum += step;
        assert_eq!(sum.total, 2.0);
        assert!((sum.l5 - 1.0).abs() < 1e-12);
    }
}
