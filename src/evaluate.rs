//! Closed-loop (self-feeding) evaluation.
//!
//! Unlike the training objective, which always encodes ground-truth states,
//! the self-feeding rollout encodes the initial state once and from then on
//! only sees its own decoded predictions. The control input encoder is fed
//! the predicted state, so errors compound the way they do when the model is
//! deployed as a simulator.
//!
//! The evaluator never calls `backward`, and the returned trajectory is
//! detached from the parameter graph.

use candle_core::{DType, Tensor};
use candle_nn::loss::mse;

use crate::error::{KoopmanError, KoopmanResult};
use crate::loss::time_slice;
use crate::model::{split_batch, KoopmanModel};

/// Roll `model` forward on its own predictions over the whole batch.
///
/// Returns the predicted state trajectory `(batch, time, num_meas)` and its
/// mean squared error against the measured states. Any batch size works,
/// including a final partial batch.
pub fn enc_self_feeding<M: KoopmanModel>(
    model: &M,
    batch: &Tensor,
    num_meas: usize,
) -> KoopmanResult<(Tensor, f64)> {
    let hp = model.hyperparams();
    if num_meas != hp.num_meas {
        return Err(KoopmanError::shape_mismatch(
            format!("num_meas = {}", hp.num_meas),
            format!("num_meas = {num_meas}"),
        ));
    }
    let (states, inputs) = split_batch(batch, hp)?;
    let time = states.dim(1)?;
    if time == 0 {
        return Err(KoopmanError::shape_mismatch(
            "at least one time step",
            "0 time steps",
        ));
    }

    let mut y = model.encode_state(&time_slice(&states, 0)?)?;
    let mut predicted = Vec::with_capacity(time);
    predicted.push(model.decode_state(&y)?);
    for k in 0..time - 1 {
        let x_hat = &predicted[k];
        let v = model.encode_input(x_hat, &time_slice(&inputs, k)?)?;
        y = model.advance(&y, &v)?;
        predicted.push(model.decode_state(&y)?);
    }

    let trajectory = Tensor::stack(&predicted, 1)?.detach();
    let loss = mse(&trajectory, &states)?
        .to_dtype(DType::F64)?
        .to_scalar::<f64>()?;
    Ok((trajectory, loss))
}
