//! Ensemble training of deep Koopman autoencoders in pure Rust.
//!
//! A Koopman autoencoder lifts the measured state `x` of a controlled
//! nonlinear system into latent observables `y` in which the dynamics are
//! linear, `y_{k+1} = K y_k + B v_k`, with `v` an encoding of the control
//! input. This crate provides:
//! - A composite training objective with six sub-losses ([`loss`])
//! - Closed-loop self-feeding evaluation ([`evaluate`])
//! - A per-member training loop with gradient clipping and best-checkpoint
//!   tracking ([`trainer`])
//! - Sequential ensemble training and best-member selection ([`ensemble`])
//! - Self-describing safetensors checkpoints ([`checkpoint`])
//!
//! Tensors, autodiff and the Adam optimizer come from candle.
//!
//! # Example
//!
//! ```no_run
//! use candle_core::{Device, Tensor};
//! use koopman_ensemble_rs::prelude::*;
//!
//! let hp = ModelHyperparams::new(2, 1).with_observables(8, 4);
//! let config = TrainingConfig::default()
//!     .with_epochs(200)
//!     .with_check_epoch(20)
//!     .with_ensemble_size(5)
//!     .with_checkpoint_dir("runs/koopman");
//!
//! let train = Tensor::randn(0f32, 1f32, (256, 40, hp.feature_dim()), &Device::Cpu).unwrap();
//! let test = Tensor::randn(0f32, 1f32, (64, 40, hp.feature_dim()), &Device::Cpu).unwrap();
//!
//! let report = EnsembleTrainer::new(hp, config)
//!     .unwrap()
//!     .train::<KoopmanAutoencoder>(&train, &test)
//!     .unwrap();
//! println!("{:?}", report.summary);
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod ensemble;
pub mod error;
pub mod evaluate;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod trainer;

pub use checkpoint::{
    load_model, read_checkpoint, restore_into, save_checkpoint, CheckpointDir, CheckpointRecord,
    ModelPathNaming,
};
pub use config::{ExperimentConfig, LossWeights, ModelHyperparams, TrainingConfig, MAX_GRAD_NORM};
pub use data::TrajectoryLoader;
pub use device::DeviceChoice;
pub use ensemble::{select_best, EnsembleReport, EnsembleSummary, EnsembleTrainer};
pub use error::{KoopmanError, KoopmanResult};
pub use evaluate::enc_self_feeding;
pub use loss::{total_loss, LossComponents, LossTerms};
pub use metrics::{format_hms, CheckpointEvent, LossComponent, MetricHistory};
pub use model::{KoopmanAutoencoder, KoopmanForward, KoopmanModel};
pub use optimizer::{clip_grad_norm, global_grad_norm, AdamOptimizer, OptimizerConfig};
pub use trainer::{validation_loss, MemberOutcome, MemberTrainer};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::checkpoint::{load_model, CheckpointDir, ModelPathNaming};
    pub use crate::config::{ExperimentConfig, LossWeights, ModelHyperparams, TrainingConfig};
    pub use crate::device::DeviceChoice;
    pub use crate::ensemble::{EnsembleReport, EnsembleSummary, EnsembleTrainer};
    pub use crate::error::{KoopmanError, KoopmanResult};
    pub use crate::model::{KoopmanAutoencoder, KoopmanModel};
}
