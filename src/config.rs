//! Model and training configuration.
//!
//! [`ModelHyperparams`] describes the autoencoder architecture and is what a
//! checkpoint stores next to the weights. [`TrainingConfig`] holds everything
//! the epoch loop and the ensemble orchestrator need. Both round-trip through
//! TOML via [`ExperimentConfig`].
//!
//! # Example
//!
//! ```
//! use koopman_ensemble_rs::config::{ModelHyperparams, TrainingConfig};
//!
//! let model = ModelHyperparams::new(2, 1).with_observables(6, 3);
//! let training = TrainingConfig::default()
//!     .with_epochs(40)
//!     .with_check_epoch(10)
//!     .with_ensemble_size(3);
//!
//! assert!(model.validate().is_ok());
//! assert!(training.validate().is_ok());
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::device::DeviceChoice;
use crate::error::{KoopmanError, KoopmanResult};

/// Gradient-norm ceiling applied after every backward pass.
pub const MAX_GRAD_NORM: f64 = 2.0;

/// Architecture of one Koopman autoencoder plus its sampling interval.
///
/// Field names follow the checkpoint keys (`Num_meas` -> `num_meas`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelHyperparams {
    /// Measured state dimension
    pub num_meas: usize,
    /// Control input dimension
    pub num_inputs: usize,
    /// Latent state dimension
    pub num_x_obsv: usize,
    /// Hidden width of the state encoder/decoder
    pub num_x_neurons: usize,
    /// Latent input dimension
    pub num_u_obsv: usize,
    /// Hidden width of the input encoder/decoder
    pub num_u_neurons: usize,
    /// Hidden layers in the state encoder
    pub num_hidden_x_encoder: usize,
    /// Hidden layers in the state decoder
    pub num_hidden_x_decoder: usize,
    /// Hidden layers in the input encoder
    pub num_hidden_u_encoder: usize,
    /// Hidden layers in the input decoder
    pub num_hidden_u_decoder: usize,
    /// Sampling interval of the trajectories
    pub dt: f64,
}

impl Default for ModelHyperparams {
    fn default() -> Self {
        Self {
            num_meas: 2,
            num_inputs: 1,
            num_x_obsv: 8,
            num_x_neurons: 32,
            num_u_obsv: 4,
            num_u_neurons: 32,
            num_hidden_x_encoder: 2,
            num_hidden_x_decoder: 2,
            num_hidden_u_encoder: 2,
            num_hidden_u_decoder: 2,
            dt: 0.01,
        }
    }
}

impl ModelHyperparams {
    /// Default architecture for the given measurement and input dimensions.
    pub fn new(num_meas: usize, num_inputs: usize) -> Self {
        Self {
            num_meas,
            num_inputs,
            ..Self::default()
        }
    }

    /// Minimal architecture for unit tests
    pub fn test() -> Self {
        Self {
            num_meas: 2,
            num_inputs: 1,
            num_x_obsv: 4,
            num_x_neurons: 8,
            num_u_obsv: 2,
            num_u_neurons: 8,
            num_hidden_x_encoder: 1,
            num_hidden_x_decoder: 1,
            num_hidden_u_encoder: 1,
            num_hidden_u_decoder: 1,
            dt: 0.05,
        }
    }

    /// Set latent state and latent input dimensions
    pub fn with_observables(mut self, num_x_obsv: usize, num_u_obsv: usize) -> Self {
        self.num_x_obsv = num_x_obsv;
        self.num_u_obsv = num_u_obsv;
        self
    }

    /// Set hidden widths of the state and input networks
    pub fn with_neurons(mut self, num_x_neurons: usize, num_u_neurons: usize) -> Self {
        self.num_x_neurons = num_x_neurons;
        self.num_u_neurons = num_u_neurons;
        self
    }

    /// Use the same hidden layer count for all four sub-networks
    pub fn with_hidden_layers(mut self, layers: usize) -> Self {
        self.num_hidden_x_encoder = layers;
        self.num_hidden_x_decoder = layers;
        self.num_hidden_u_encoder = layers;
        self.num_hidden_u_decoder = layers;
        self
    }

    /// Set the sampling interval
    pub fn with_dt(mut self, dt: f64) -> Self {
        self.dt = dt;
        self
    }

    /// Feature width of a raw trajectory batch (`num_meas + num_inputs`).
    pub fn feature_dim(&self) -> usize {
        self.num_meas + self.num_inputs
    }

    /// Check that every dimension is usable.
    pub fn validate(&self) -> KoopmanResult<()> {
        let dims = [
            ("num_meas", self.num_meas),
            ("num_inputs", self.num_inputs),
            ("num_x_obsv", self.num_x_obsv),
            ("num_x_neurons", self.num_x_neurons),
            ("num_u_obsv", self.num_u_obsv),
            ("num_u_neurons", self.num_u_neurons),
        ];
        for (name, value) in dims {
            if value == 0 {
                return Err(KoopmanError::invalid_config(format!("{name} must be > 0")));
            }
        }
        if !self.dt.is_finite() || self.dt <= 0.0 {
            return Err(KoopmanError::invalid_config(format!(
                "dt must be positive and finite, got {}",
                self.dt
            )));
        }
        Ok(())
    }
}

/// Weights combining the six sub-losses into one scalar.
///
/// `loss = reconstruction * (L_gx + L_gu) + prediction * (L3 + L4 + L5) + regularization * L6`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossWeights {
    /// Weight of the state and input reconstruction terms
    pub reconstruction: f64,
    /// Weight of the latent, horizon and shift prediction terms
    pub prediction: f64,
    /// Weight of the parameter magnitude penalty
    pub regularization: f64,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self::from(0.1)
    }
}

impl From<f64> for LossWeights {
    /// Scalar `alpha` trades reconstruction fidelity against prediction.
    fn from(alpha: f64) -> Self {
        Self {
            reconstruction: alpha,
            prediction: 1.0,
            regularization: 1e-7,
        }
    }
}

impl From<[f64; 3]> for LossWeights {
    fn from(alpha: [f64; 3]) -> Self {
        Self {
            reconstruction: alpha[0],
            prediction: alpha[1],
            regularization: alpha[2],
        }
    }
}

impl LossWeights {
    /// All three weights must be finite and non-negative.
    pub fn validate(&self) -> KoopmanResult<()> {
        for (name, w) in [
            ("reconstruction", self.reconstruction),
            ("prediction", self.prediction),
            ("regularization", self.regularization),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(KoopmanError::invalid_config(format!(
                    "loss weight `{name}` must be finite and >= 0, got {w}"
                )));
            }
        }
        Ok(())
    }
}

/// Hyperparameters shared by every member of an ensemble run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Number of epochs per member (`eps`)
    pub epochs: usize,
    /// Validate and maybe checkpoint every N epochs
    pub check_epoch: usize,
    /// Adam learning rate
    pub learning_rate: f64,
    /// Mini-batch size for both loaders
    pub batch_size: usize,
    /// Look-ahead shift of the consistency term (`S_p`)
    pub shift: usize,
    /// Prediction horizon in time steps (`T`)
    pub horizon: usize,
    /// Number of ensemble members (`M`)
    pub ensemble_size: usize,
    /// Seed for the training loader shuffle
    pub seed: u64,
    /// Directory holding one checkpoint per member
    pub checkpoint_dir: PathBuf,
    /// Compute device request, resolved once per run
    pub device: DeviceChoice,
    /// Sub-loss weights
    pub loss_weights: LossWeights,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            check_epoch: 20,
            learning_rate: 1e-3,
            batch_size: 64,
            shift: 10,
            horizon: 30,
            ensemble_size: 1,
            seed: 42,
            checkpoint_dir: PathBuf::from("checkpoints"),
            device: DeviceChoice::Auto,
            loss_weights: LossWeights::default(),
        }
    }
}

impl TrainingConfig {
    /// Tiny configuration for unit tests
    pub fn test() -> Self {
        Self {
            epochs: 2,
            check_epoch: 1,
            learning_rate: 1e-3,
            batch_size: 4,
            shift: 2,
            horizon: 4,
            ensemble_size: 1,
            seed: 7,
            checkpoint_dir: PathBuf::from("checkpoints"),
            device: DeviceChoice::Cpu,
            loss_weights: LossWeights::default(),
        }
    }

    /// Set the epoch count
    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    /// Set the checkpoint evaluation period
    pub fn with_check_epoch(mut self, check_epoch: usize) -> Self {
        self.check_epoch = check_epoch;
        self
    }

    /// Set the learning rate
    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Set the batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set horizon `T` and shift `S_p`
    pub fn with_horizon(mut self, horizon: usize, shift: usize) -> Self {
        self.horizon = horizon;
        self.shift = shift;
        self
    }

    /// Set the number of ensemble members
    pub fn with_ensemble_size(mut self, ensemble_size: usize) -> Self {
        self.ensemble_size = ensemble_size;
        self
    }

    /// Set the checkpoint directory
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }

    /// Set the device request
    pub fn with_device(mut self, device: DeviceChoice) -> Self {
        self.device = device;
        self
    }

    /// Set the loss weights from a scalar alpha or a weight triple
    pub fn with_loss_weights(mut self, weights: impl Into<LossWeights>) -> Self {
        self.loss_weights = weights.into();
        self
    }

    /// Check the run parameters before any model is built.
    ///
    /// `check_epoch` must lie in `1..=epochs`: a run that never validates
    /// never writes the checkpoint its members are restored from.
    pub fn validate(&self) -> KoopmanResult<()> {
        if self.epochs == 0 {
            return Err(KoopmanError::invalid_config("epochs must be > 0"));
        }
        if self.check_epoch == 0 || self.check_epoch > self.epochs {
            return Err(KoopmanError::invalid_config(format!(
                "check_epoch must be in 1..={}, got {}",
                self.epochs, self.check_epoch
            )));
        }
        if self.batch_size == 0 {
            return Err(KoopmanError::invalid_config("batch_size must be > 0"));
        }
        if self.ensemble_size == 0 {
            return Err(KoopmanError::invalid_config("ensemble_size must be > 0"));
        }
        if self.horizon == 0 || self.shift == 0 {
            return Err(KoopmanError::invalid_config(
                "horizon and shift must both be > 0",
            ));
        }
        if self.shift > self.horizon {
            return Err(KoopmanError::invalid_config(format!(
                "shift ({}) must not exceed horizon ({})",
                self.shift, self.horizon
            )));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(KoopmanError::invalid_config(format!(
                "learning_rate must be positive and finite, got {}",
                self.learning_rate
            )));
        }
        self.loss_weights.validate()
    }
}

/// A complete experiment: architecture plus training run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Autoencoder architecture
    pub model: ModelHyperparams,
    /// Training and ensemble parameters
    pub training: TrainingConfig,
}

impl ExperimentConfig {
    /// Load an experiment from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> KoopmanResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Ok(toml::from_str(&content)?)
    }

    /// Write the experiment as pretty TOML.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> KoopmanResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Validate both halves.
    pub fn validate(&self) -> KoopmanResult<()> {
        self.model.validate()?;
        self.training.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs_are_valid() {
        assert!(ModelHyperparams::default().validate().is_ok());
        assert!(ModelHyperparams::test().validate().is_ok());
        assert!(TrainingConfig::default().validate().is_ok());
        assert!(TrainingConfig::test().validate().is_ok());
    }

    #[test]
    fn test_feature_dim() {
        let hp = ModelHyperparams::new(3, 2);
        assert_eq!(hp.feature_dim(), 5);
    }

    #[test]
    fn test_zero_dimension_rejected() {
        let mut hp = ModelHyperparams::test();
        hp.num_u_obsv = 0;
        let err = hp.validate().unwrap_err();
        assert!(err.to_string().contains("num_u_obsv"));
    }

    #[test]
    fn test_bad_dt_rejected() {
        assert!(ModelHyperparams::test().with_dt(0.0).validate().is_err());
        assert!(ModelHyperparams::test().with_dt(f64::NAN).validate().is_err());
    }

    #[test]
    fn test_check_epoch_bounds() {
        let config = TrainingConfig::test().with_epochs(10).with_check_epoch(11);
        assert!(config.validate().is_err());

        let config = TrainingConfig::test().with_epochs(10).with_check_epoch(0);
        assert!(config.validate().is_err());

        // Not a divisor of eps is fine; the tail epochs just never validate.
        let config = TrainingConfig::test().with_epochs(10).with_check_epoch(3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_shift_must_not_exceed_horizon() {
        let config = TrainingConfig::test().with_horizon(4, 5);
        assert!(config.validate().is_err());

        let config = TrainingConfig::test().with_horizon(4, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_loss_weights_from_alpha() {
        let w = LossWeights::from(0.5);
        assert_eq!(w.reconstruction, 0.5);
        assert_eq!(w.prediction, 1.0);

        let w = LossWeights::from([0.1, 2.0, 0.0]);
        assert_eq!(w.prediction, 2.0);
        assert_eq!(w.regularization, 0.0);
    }

    #[test]
    fn test_negative_loss_weight_rejected() {
        let config = TrainingConfig::test().with_loss_weights([1.0, -1.0, 0.0]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_experiment_toml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment.toml");

        let config = ExperimentConfig {
            model: ModelHyperparams::test(),
            training: TrainingConfig::test()
                .with_ensemble_size(3)
                .with_device(DeviceChoice::Cuda(1)),
        };
        config.to_file(&path).unwrap();

        let loaded = ExperimentConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(loaded.validate().is_ok());
    }

    #[test]
    fn test_partial_training_table_uses_defaults() {
        let toml_str = r#"
            [model]
            num_meas = 2
            num_inputs = 1
            num_x_obsv = 4
            num_x_neurons = 8
            num_u_obsv = 2
            num_u_neurons = 8
            num_hidden_x_encoder = 1
            num_hidden_x_decoder = 1
            num_hidden_u_encoder = 1
            num_hidden_u_decoder = 1
            dt = 0.1

            [training]
            epochs = 5
            check_epoch = 5
        "#;
        let config: ExperimentConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.training.epochs, 5);
        assert_eq!(config.training.batch_size, 64);
        assert_eq!(config.training.device, DeviceChoice::Auto);
    }
}
