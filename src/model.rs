//! Koopman autoencoder contract and the reference network.
//!
//! The training core only talks to [`KoopmanModel`]. Any network that can
//! encode states and inputs into latent coordinates, decode them back and
//! advance the latent state linearly can be trained by the ensemble.
//!
//! Latent dynamics: `y_{k+1} = K y_k + B v_k`, with `y = enc_x(x)` and
//! `v = enc_u(x, u)`.
//!
//! # Example
//!
//! ```no_run
//! use candle_core::{Device, Tensor};
//! use koopman_ensemble_rs::config::ModelHyperparams;
//! use koopman_ensemble_rs::model::{KoopmanAutoencoder, KoopmanModel};
//!
//! let hp = ModelHyperparams::test();
//! let model = KoopmanAutoencoder::build(&hp, &Device::Cpu).unwrap();
//! let batch = Tensor::zeros((4, 10, hp.feature_dim()), candle_core::DType::F32, &Device::Cpu).unwrap();
//! let out = model.forward(&batch).unwrap();
//! assert_eq!(out.latent_states.dims(), &[4, 10, hp.num_x_obsv]);
//! ```

use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{Linear, Module, VarBuilder, VarMap};

use crate::config::ModelHyperparams;
use crate::error::{KoopmanError, KoopmanResult};

/// Latent codes and reconstructions for one trajectory batch.
#[derive(Debug, Clone)]
pub struct KoopmanForward {
    /// Measured states: (batch, time, num_meas)
    pub states: Tensor,
    /// Control inputs: (batch, time, num_inputs)
    pub inputs: Tensor,
    /// Encoded states: (batch, time, num_x_obsv)
    pub latent_states: Tensor,
    /// Encoded inputs: (batch, time, num_u_obsv)
    pub latent_inputs: Tensor,
    /// Decoded states: (batch, time, num_meas)
    pub state_reconstruction: Tensor,
    /// Decoded inputs: (batch, time, num_inputs)
    pub input_reconstruction: Tensor,
}

/// A trainable Koopman autoencoder.
///
/// All tensor methods accept any number of leading dimensions; only the last
/// (feature) dimension is interpreted.
pub trait KoopmanModel: Sized {
    /// Build a freshly initialised model on `device`.
    fn build(hyperparams: &ModelHyperparams, device: &Device) -> KoopmanResult<Self>;

    /// Architecture this model was built from.
    fn hyperparams(&self) -> &ModelHyperparams;

    /// All trainable parameters.
    fn var_map(&self) -> &VarMap;

    /// `x -> y`
    fn encode_state(&self, x: &Tensor) -> Result<Tensor>;

    /// `y -> x`
    fn decode_state(&self, y: &Tensor) -> Result<Tensor>;

    /// `(x, u) -> v`
    fn encode_input(&self, x: &Tensor, u: &Tensor) -> Result<Tensor>;

    /// `(x, v) -> u`
    fn decode_input(&self, x: &Tensor, v: &Tensor) -> Result<Tensor>;

    /// One step of the latent linear dynamics, `K y + B v`.
    fn advance(&self, y: &Tensor, v: &Tensor) -> Result<Tensor>;

    /// Encode and reconstruct a whole trajectory batch.
    fn forward(&self, batch: &Tensor) -> KoopmanResult<KoopmanForward> {
        let (states, inputs) = split_batch(batch, self.hyperparams())?;
        let latent_states = self.encode_state(&states)?;
        let latent_inputs = self.encode_input(&states, &inputs)?;
        let state_reconstruction = self.decode_state(&latent_states)?;
        let input_reconstruction = self.decode_input(&states, &latent_inputs)?;
        Ok(KoopmanForward {
            states,
            inputs,
            latent_states,
            latent_inputs,
            state_reconstruction,
            input_reconstruction,
        })
    }

    /// Number of scalar parameters.
    fn parameter_count(&self) -> usize {
        self.var_map()
            .all_vars()
            .iter()
            .map(|v| v.elem_count())
            .sum()
    }
}

/// Split a `(batch, time, num_meas + num_inputs)` tensor into states and inputs.
pub fn split_batch(batch: &Tensor, hp: &ModelHyperparams) -> KoopmanResult<(Tensor, Tensor)> {
    let dims = batch.dims();
    if dims.len() != 3 || dims[2] != hp.feature_dim() {
        return Err(KoopmanError::shape_mismatch(
            format!("(batch, time, {})", hp.feature_dim()),
            format!("{dims:?}"),
        ));
    }
    // matmul needs contiguous rows
    let states = batch.narrow(2, 0, hp.num_meas)?.contiguous()?;
    let inputs = batch.narrow(2, hp.num_meas, hp.num_inputs)?.contiguous()?;
    Ok((states, inputs))
}

/// Fully connected stack with ReLU between layers and a linear output.
pub struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    /// `input -> [width] * hidden -> output`
    pub fn new(
        input: usize,
        width: usize,
        hidden: usize,
        output: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(hidden + 1);
        let mut fan_in = input;
        for i in 0..hidden {
            layers.push(candle_nn::linear(fan_in, width, vb.pp(format!("hidden_{i}")))?);
            fan_in = width;
        }
        layers.push(candle_nn::linear(fan_in, output, vb.pp("out"))?);
        Ok(Self { layers })
    }
}

impl Module for Mlp {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let last = self.layers.len() - 1;
        let mut h = x.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h)?;
            if i < last {
                h = h.relu()?;
            }
        }
        Ok(h)
    }
}

/// Reference Koopman autoencoder with MLP encoders and decoders.
pub struct KoopmanAutoencoder {
    hyperparams: ModelHyperparams,
    var_map: VarMap,
    x_encoder: Mlp,
    x_decoder: Mlp,
    u_encoder: Mlp,
    u_decoder: Mlp,
    /// Latent state operator K (no bias)
    x_koopman: Linear,
    /// Latent input operator B (no bias)
    u_koopman: Linear,
}

impl KoopmanAutoencoder {
    /// Create model from a VarBuilder (for loading weights)
    pub fn from_varbuilder(
        hp: &ModelHyperparams,
        vb: VarBuilder,
        var_map: VarMap,
    ) -> KoopmanResult<Self> {
        let x_encoder = Mlp::new(
            hp.num_meas,
            hp.num_x_neurons,
            hp.num_hidden_x_encoder,
            hp.num_x_obsv,
            vb.pp("x_encoder"),
        )?;
        let x_decoder = Mlp::new(
            hp.num_x_obsv,
            hp.num_x_neurons,
            hp.num_hidden_x_decoder,
            hp.num_meas,
            vb.pp("x_decoder"),
        )?;
        let u_encoder = Mlp::new(
            hp.num_meas + hp.num_inputs,
            hp.num_u_neurons,
            hp.num_hidden_u_encoder,
            hp.num_u_obsv,
            vb.pp("u_encoder"),
        )?;
        let u_decoder = Mlp::new(
            hp.num_meas + hp.num_u_obsv,
            hp.num_u_neurons,
            hp.num_hidden_u_decoder,
            hp.num_inputs,
            vb.pp("u_decoder"),
        )?;
        let x_koopman = candle_nn::linear_no_bias(hp.num_x_obsv, hp.num_x_obsv, vb.pp("x_koopman"))?;
        let u_koopman = candle_nn::linear_no_bias(hp.num_u_obsv, hp.num_x_obsv, vb.pp("u_koopman"))?;

        Ok(Self {
            hyperparams: hp.clone(),
            var_map,
            x_encoder,
            x_decoder,
            u_encoder,
            u_decoder,
            x_koopman,
            u_koopman,
        })
    }

    /// Weight matrix of the latent state operator K
    pub fn koopman_operator(&self) -> &Tensor {
        self.x_koopman.weight()
    }
}

impl KoopmanModel for KoopmanAutoencoder {
    fn build(hyperparams: &ModelHyperparams, device: &Device) -> KoopmanResult<Self> {
        hyperparams.validate()?;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);
        Self::from_varbuilder(hyperparams, vb, var_map)
    }

    fn hyperparams(&self) -> &ModelHyperparams {
        &self.hyperparams
    }

    fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    fn encode_state(&self, x: &Tensor) -> Result<Tensor> {
        self.x_encoder.forward(x)
    }

    fn decode_state(&self, y: &Tensor) -> Result<Tensor> {
        self.x_decoder.forward(y)
    }

    fn encode_input(&self, x: &Tensor, u: &Tensor) -> Result<Tensor> {
        let xu = Tensor::cat(&[x, u], D::Minus1)?;
        self.u_encoder.forward(&xu)
    }

    fn decode_input(&self, x: &Tensor, v: &Tensor) -> Result<Tensor> {
        let xv = Tensor::cat(&[x, v], D::Minus1)?;
        self.u_decoder.forward(&xv)
    }

    fn advance(&self, y: &Tensor, v: &Tensor) -> Result<Tensor> {
        self.x_koopman.forward(y)? + self.u_koopman.forward(v)?
    }
}
