//! Ensemble orchestration.
//!
//! Trains `ensemble_size` independently initialised members one after the
//! other on the same data and picks the member with the lowest validation
//! loss. Two entry points share one selection rule:
//!
//! - [`EnsembleTrainer::train`] keeps per-epoch loss histories and logs
//!   progress at `info`.
//! - [`EnsembleTrainer::train_lean`] returns only the scalar results and logs
//!   at `debug`, for outer search loops that run many ensembles.
//!
//! The first failing member aborts the whole run. Checkpoints already written
//! by earlier members stay on disk.
//!
//! ```no_run
//! use candle_core::{DType, Device, Tensor};
//! use koopman_ensemble_rs::config::{ModelHyperparams, TrainingConfig};
//! use koopman_ensemble_rs::ensemble::EnsembleTrainer;
//! use koopman_ensemble_rs::model::KoopmanAutoencoder;
//!
//! let hp = ModelHyperparams::test();
//! let config = TrainingConfig::test().with_ensemble_size(3);
//! let train = Tensor::randn(0f32, 1f32, (32, 10, hp.feature_dim()), &Device::Cpu).unwrap();
//! let test = Tensor::randn(0f32, 1f32, (8, 10, hp.feature_dim()), &Device::Cpu).unwrap();
//!
//! let summary = EnsembleTrainer::new(hp, config)
//!     .unwrap()
//!     .train_lean::<KoopmanAutoencoder>(&train, &test)
//!     .unwrap();
//! println!("best member {} at {}", summary.best_index, summary.best_model_path.display());
//! ```

use std::path::PathBuf;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{CheckpointDir, ModelPathNaming};
use crate::config::{ModelHyperparams, TrainingConfig};
use crate::data::TrajectoryLoader;
use crate::error::{KoopmanError, KoopmanResult};
use crate::metrics::{CheckpointEvent, MetricHistory};
use crate::model::KoopmanModel;
use crate::trainer::{MemberOutcome, MemberTrainer};

/// Scalar outcome of an ensemble run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleSummary {
    /// Best validation loss over all members
    pub lowest_loss: f64,
    /// Best validation loss of each member
    pub model_losses: Vec<f64>,
    /// Checkpoint of the selected member
    pub best_model_path: PathBuf,
    /// Index of the selected member
    pub best_index: usize,
}

/// Diagnostic outcome: the summary plus everything recorded on the way.
pub struct EnsembleReport<M> {
    /// Selection result
    pub summary: EnsembleSummary,
    /// Epoch-summed training losses, `ensemble_size x epochs`
    pub histories: MetricHistory,
    /// Validation checkpoints of each member
    pub events: Vec<Vec<CheckpointEvent>>,
    /// The selected member, restored from its best checkpoint
    pub best_model: M,
}

/// Index of the first minimum in `losses`, skipping NaN entries.
pub fn select_best(losses: &[f64]) -> KoopmanResult<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &loss) in losses.iter().enumerate() {
        if loss.is_nan() {
            continue;
        }
        match best {
            Some((_, current)) if loss >= current => {}
            _ => best = Some((i, loss)),
        }
    }
    best.map(|(i, _)| i).ok_or_else(|| {
        KoopmanError::training(format!(
            "no member has a comparable validation loss: {losses:?}"
        ))
    })
}

/// Sequential ensemble trainer.
pub struct EnsembleTrainer<N = CheckpointDir> {
    hyperparams: ModelHyperparams,
    config: TrainingConfig,
    naming: N,
}

impl EnsembleTrainer<CheckpointDir> {
    /// Validate the configuration; checkpoints go to
    /// `<checkpoint_dir>/model_<i>.safetensors`.
    pub fn new(hyperparams: ModelHyperparams, config: TrainingConfig) -> KoopmanResult<Self> {
        hyperparams.validate()?;
        config.validate()?;
        let naming = CheckpointDir::new(config.checkpoint_dir.clone());
        Ok(Self {
            hyperparams,
            config,
            naming,
        })
    }
}

impl<N: ModelPathNaming> EnsembleTrainer<N> {
    /// Use another checkpoint naming scheme.
    pub fn with_naming<P: ModelPathNaming>(self, naming: P) -> EnsembleTrainer<P> {
        EnsembleTrainer {
            hyperparams: self.hyperparams,
            config: self.config,
            naming,
        }
    }

    /// Shared architecture.
    pub fn hyperparams(&self) -> &ModelHyperparams {
        &self.hyperparams
    }

    /// Shared run parameters.
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Checkpoint path of every member, in ensemble order.
    pub fn model_paths(&self) -> Vec<PathBuf> {
        (0..self.config.ensemble_size)
            .map(|i| self.naming.model_path(i))
            .collect()
    }

    /// Train every member and keep full diagnostics.
    pub fn train<M: KoopmanModel>(
        &self,
        train_data: &Tensor,
        validation_data: &Tensor,
    ) -> KoopmanResult<EnsembleReport<M>> {
        let device = self.config.device.resolve()?;
        let (mut train_loader, mut validation_loader) =
            self.loaders(train_data, validation_data, &device)?;
        let trainer = MemberTrainer::new(&self.hyperparams, &self.config, &device);

        let mut histories = MetricHistory::new(self.config.ensemble_size, self.config.epochs);
        let mut events = Vec::with_capacity(self.config.ensemble_size);
        let mut losses = Vec::with_capacity(self.config.ensemble_size);
        let mut best: Option<MemberOutcome<M>> = None;

        for (index, path) in self.model_paths().into_iter().enumerate() {
            let mut outcome: MemberOutcome<M> =
                trainer.train(index, &path, &mut train_loader, &mut validation_loader)?;
            if let Some(row) = outcome.history.take() {
                for (epoch, losses) in row.into_iter().enumerate() {
                    histories.record(index, epoch, losses)?;
                }
            }
            events.push(outcome.events.clone());
            losses.push(outcome.best_loss);

            let keep = match &best {
                Some(current) => outcome.best_loss < current.best_loss,
                None => !outcome.best_loss.is_nan(),
            };
            if keep {
                best = Some(outcome);
            }
        }

        let summary = self.summarize(losses)?;
        tracing::info!(
            "The best model has a running loss of {} and is model nr. {}",
            summary.lowest_loss,
            summary.best_index
        );
        let best_model = best
            .map(|outcome| outcome.model)
            .ok_or_else(|| KoopmanError::training("ensemble produced no usable member"))?;

        Ok(EnsembleReport {
            summary,
            histories,
            events,
            best_model,
        })
    }

    /// Train every member and return only the selection result.
    pub fn train_lean<M: KoopmanModel>(
        &self,
        train_data: &Tensor,
        validation_data: &Tensor,
    ) -> KoopmanResult<EnsembleSummary> {
        let device = self.config.device.resolve()?;
        let (mut train_loader, mut validation_loader) =
            self.loaders(train_data, validation_data, &device)?;
        let trainer = MemberTrainer::new(&self.hyperparams, &self.config, &device).lean();

        let mut losses = Vec::with_capacity(self.config.ensemble_size);
        for (index, path) in self.model_paths().into_iter().enumerate() {
            let outcome: MemberOutcome<M> =
                trainer.train(index, &path, &mut train_loader, &mut validation_loader)?;
            losses.push(outcome.best_loss);
        }

        let summary = self.summarize(losses)?;
        tracing::debug!(
            "Best member {} with validation loss {}",
            summary.best_index,
            summary.lowest_loss
        );
        Ok(summary)
    }

    fn loaders(
        &self,
        train_data: &Tensor,
        validation_data: &Tensor,
        device: &Device,
    ) -> KoopmanResult<(TrajectoryLoader, TrajectoryLoader)> {
        let train = TrajectoryLoader::new(train_data.clone(), self.config.batch_size, device)?
            .with_shuffle(self.config.seed);
        let validation = TrajectoryLoader::new(validation_data.clone(), self.config.batch_size, device)?;
        Ok((train, validation))
    }

    fn summarize(&self, model_losses: Vec<f64>) -> KoopmanResult<EnsembleSummary> {
        let best_index = select_best(&model_losses)?;
        Ok(EnsembleSummary {
            lowest_loss: model_losses[best_index],
            best_model_path: self.naming.model_path(best_index),
            best_index,
            model_losses,
        })
    }
}
