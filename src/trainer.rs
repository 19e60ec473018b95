//! Training loop for a single ensemble member.
//!
//! Each member gets a fresh model and its own Adam state. Every epoch walks
//! the shuffled training loader once; every `check_epoch` epochs the model is
//! scored with the self-feeding evaluator over the whole validation loader
//! and written to disk if that score strictly beats everything seen before.
//! When the epochs run out the member is restored from its best checkpoint,
//! so the caller never receives final-epoch weights that validated worse.

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::Device;

use crate::checkpoint::{restore_into, save_checkpoint};
use crate::config::{ModelHyperparams, TrainingConfig, MAX_GRAD_NORM};
use crate::data::TrajectoryLoader;
use crate::error::{KoopmanError, KoopmanResult};
use crate::evaluate::enc_self_feeding;
use crate::loss::{total_loss, LossComponents};
use crate::metrics::{eta_seconds, format_hms, CheckpointEvent};
use crate::model::KoopmanModel;
use crate::optimizer::{AdamOptimizer, OptimizerConfig};

/// Result of training one member.
pub struct MemberOutcome<M> {
    /// Position in the ensemble
    pub index: usize,
    /// Model restored from its best checkpoint
    pub model: M,
    /// Lowest validation loss seen at any checkpoint
    pub best_loss: f64,
    /// Where the best checkpoint lives
    pub checkpoint_path: PathBuf,
    /// Every validation checkpoint, in order
    pub events: Vec<CheckpointEvent>,
    /// Epoch-summed training losses (verbose runs only)
    pub history: Option<Vec<LossComponents>>,
}

impl<M> MemberOutcome<M> {
    /// Number of times the checkpoint file was written.
    pub fn checkpoint_writes(&self) -> usize {
        self.events.iter().filter(|e| e.improved).count()
    }
}

/// Member state after the last epoch, before the best checkpoint is restored.
pub(crate) struct FittedMember<M> {
    pub(crate) model: M,
    pub(crate) best_loss: f64,
    pub(crate) events: Vec<CheckpointEvent>,
    pub(crate) history: Option<Vec<LossComponents>>,
}

/// Trains one member at a time with shared hyperparameters.
pub struct MemberTrainer<'a> {
    hyperparams: &'a ModelHyperparams,
    config: &'a TrainingConfig,
    device: &'a Device,
    verbose: bool,
}

impl<'a> MemberTrainer<'a> {
    /// Trainer that tracks metric histories and logs at `info`.
    pub fn new(hyperparams: &'a ModelHyperparams, config: &'a TrainingConfig, device: &'a Device) -> Self {
        Self {
            hyperparams,
            config,
            device,
            verbose: true,
        }
    }

    /// Skip metric histories and log progress at `debug` only.
    pub fn lean(mut self) -> Self {
        self.verbose = false;
        self
    }

    /// Train member `index` from scratch and return its best state.
    pub fn train<M: KoopmanModel>(
        &self,
        index: usize,
        checkpoint_path: &Path,
        train_loader: &mut TrajectoryLoader,
        validation_loader: &mut TrajectoryLoader,
    ) -> KoopmanResult<MemberOutcome<M>> {
        let fitted = self.fit(index, checkpoint_path, train_loader, validation_loader)?;
        self.restore_best(index, checkpoint_path, fitted)
    }

    /// Run every epoch; the returned model still holds final-epoch weights.
    pub(crate) fn fit<M: KoopmanModel>(
        &self,
        index: usize,
        checkpoint_path: &Path,
        train_loader: &mut TrajectoryLoader,
        validation_loader: &mut TrajectoryLoader,
    ) -> KoopmanResult<FittedMember<M>> {
        let epochs = self.config.epochs;
        let model = M::build(self.hyperparams, self.device)?;
        let mut optimizer =
            OptimizerConfig::with_learning_rate(self.config.learning_rate).build_adam(model.var_map())?;
        let mut best_loss = f64::INFINITY;
        let mut events = Vec::new();
        let mut history = self.verbose.then(|| Vec::with_capacity(epochs));

        self.progress(format_args!(
            "Member {}: {} parameters, {} epochs",
            index,
            model.parameter_count(),
            epochs
        ));
        let start = Instant::now();

        for epoch in 0..epochs {
            let running = self.train_epoch(&model, &mut optimizer, train_loader)?;
            if !running.is_finite() {
                tracing::warn!(
                    "Member {}: non-finite training loss at epoch {}: {:?}",
                    index,
                    epoch + 1,
                    running
                );
            }
            if let Some(history) = history.as_mut() {
                history.push(running);
            }

            if (epoch + 1) % self.config.check_epoch != 0 {
                continue;
            }

            let elapsed = start.elapsed().as_secs_f64();
            self.progress(format_args!(
                "Epoch {}/{}, Train Loss: {:.3e}, Elapsed: {}, ETA: {}",
                epoch + 1,
                epochs,
                running.total,
                format_hms(elapsed),
                format_hms(eta_seconds(elapsed, epoch + 1, epochs))
            ));

            let validation_loss = validation_loss(&model, validation_loader)?;
            self.progress(format_args!(
                "Checkpoint at Epoch {}: Test Running Loss: {:.3e}",
                epoch + 1,
                validation_loss
            ));

            let improved = validation_loss < best_loss;
            if improved {
                best_loss = validation_loss;
                save_checkpoint(&model, checkpoint_path)?;
                self.progress(format_args!(
                    "Checkpoint at Epoch {}: New best test loss, model saved.",
                    epoch + 1
                ));
            }
            events.push(CheckpointEvent {
                epoch: epoch + 1,
                validation_loss,
                improved,
            });
        }

        Ok(FittedMember {
            model,
            best_loss,
            events,
            history,
        })
    }

    /// Load the best checkpoint back into the fitted model.
    pub(crate) fn restore_best<M: KoopmanModel>(
        &self,
        index: usize,
        checkpoint_path: &Path,
        fitted: FittedMember<M>,
    ) -> KoopmanResult<MemberOutcome<M>> {
        if !fitted.events.iter().any(|e| e.improved) {
            return Err(KoopmanError::training(format!(
                "member {index} never produced a finite validation loss; no checkpoint to restore"
            )));
        }
        restore_into(&fitted.model, checkpoint_path)?;

        Ok(MemberOutcome {
            index,
            model: fitted.model,
            best_loss: fitted.best_loss,
            checkpoint_path: checkpoint_path.to_path_buf(),
            events: fitted.events,
            history: fitted.history,
        })
    }

    /// Progress goes to `info` when verbose, otherwise to `debug`.
    fn progress(&self, message: std::fmt::Arguments<'_>) {
        if self.verbose {
            tracing::info!("{message}");
        } else {
            tracing::debug!("{message}");
        }
    }

    /// One pass over the training loader; returns the summed losses.
    fn train_epoch<M: KoopmanModel>(
        &self,
        model: &M,
        optimizer: &mut AdamOptimizer,
        loader: &mut TrajectoryLoader,
    ) -> KoopmanResult<LossComponents> {
        let mut running = LossComponents::default();
        for batch in loader.epoch() {
            let batch = batch?;
            let terms = total_loss(
                &self.config.loss_weights,
                &batch,
                self.hyperparams.num_meas,
                self.hyperparams.num_x_obsv,
                self.config.horizon,
                self.config.shift,
                model,
            )?;
            optimizer.step(&terms.total, MAX_GRAD_NORM)?;
            running += terms.components()?;
        }
        Ok(running)
    }
}

/// Summed self-feeding loss over every batch of `loader`.
pub fn validation_loss<M: KoopmanModel>(model: &M, loader: &mut TrajectoryLoader) -> KoopmanResult<f64> {
    let num_meas = model.hyperparams().num_meas;
    let mut total = 0.0;
    for batch in loader.epoch() {
        let (_, loss) = enc_self_feeding(model, &batch?, num_meas)?;
        total += loss;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::load_model;
    use crate::model::KoopmanAutoencoder;
    use candle_core::Tensor;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn weights<M: KoopmanModel>(model: &M) -> BTreeMap<String, Vec<f32>> {
        let data = model.var_map().data().lock().unwrap();
        data.iter()
            .map(|(name, var)| {
                let values = var.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
                (name.clone(), values)
            })
            .collect()
    }

    fn loaders(hp: &ModelHyperparams, config: &TrainingConfig) -> (TrajectoryLoader, TrajectoryLoader) {
        let train = Tensor::randn(0f32, 1f32, (6, 5, hp.feature_dim()), &Device::Cpu).unwrap();
        let val = Tensor::randn(0f32, 1f32, (3, 5, hp.feature_dim()), &Device::Cpu).unwrap();
        (
            TrajectoryLoader::new(train, config.batch_size, &Device::Cpu)
                .unwrap()
                .with_shuffle(config.seed),
            TrajectoryLoader::new(val, config.batch_size, &Device::Cpu).unwrap(),
        )
    }

    #[test]
    fn test_checkpoint_events_are_monotone() {
        let dir = TempDir::new().unwrap();
        let hp = ModelHyperparams::test();
        let config = TrainingConfig::test().with_epochs(6).with_check_epoch(2);
        let (mut train, mut val) = loaders(&hp, &config);

        let outcome: MemberOutcome<KoopmanAutoencoder> = MemberTrainer::new(&hp, &config, &Device::Cpu)
            .train(0, &dir.path().join("m.safetensors"), &mut train, &mut val)
            .unwrap();

        let epochs: Vec<usize> = outcome.events.iter().map(|e| e.epoch).collect();
        assert_eq!(epochs, vec![2, 4, 6]);
        assert!(outcome.events[0].improved);

        let mut best = f64::INFINITY;
        for event in &outcome.events {
            assert_eq!(event.improved, event.validation_loss < best);
            if event.improved {
                best = event.validation_loss;
            }
        }
        assert_eq!(outcome.best_loss, best);
        assert_eq!(outcome.history.as_ref().map(Vec::len), Some(6));
    }

    #[test]
    fn test_restored_model_reproduces_best_loss() {
        let dir = TempDir::new().unwrap();
        let hp = ModelHyperparams::test();
        let config = TrainingConfig::test().with_epochs(3);
        let (mut train, mut val) = loaders(&hp, &config);

        let outcome: MemberOutcome<KoopmanAutoencoder> = MemberTrainer::new(&hp, &config, &Device::Cpu)
            .train(0, &dir.path().join("m.safetensors"), &mut train, &mut val)
            .unwrap();

        let again = validation_loss(&outcome.model, &mut val).unwrap();
        assert!((again - outcome.best_loss).abs() <= 1e-6 * outcome.best_loss.max(1.0));
    }

    #[test]
    fn test_lean_skips_history() {
        let dir = TempDir::new().unwrap();
        let hp = ModelHyperparams::test();
        let config = TrainingConfig::test();
        let (mut train, mut val) = loaders(&hp, &config);

        let outcome: MemberOutcome<KoopmanAutoencoder> = MemberTrainer::new(&hp, &config, &Device::Cpu)
            .lean()
            .train(0, &dir.path().join("m.safetensors"), &mut train, &mut val)
            .unwrap();
        assert!(outcome.history.is_none());
        assert!(outcome.checkpoint_writes() >= 1);
    }

    #[test]
    fn test_short_trajectories_abort() {
        let dir = TempDir::new().unwrap();
        let hp = ModelHyperparams::test();
        let config = TrainingConfig::test().with_horizon(8, 2);
        let (mut train, mut val) = loaders(&hp, &config);

        let result: KoopmanResult<MemberOutcome<KoopmanAutoencoder>> =
            MemberTrainer::new(&hp, &config, &Device::Cpu).train(
                0,
                &dir.path().join("m.safetensors"),
                &mut train,
                &mut val,
            );
        assert!(matches!(result, Err(KoopmanError::ShapeMismatch { .. })));
        assert!(!dir.path().join("m.safetensors").exists());
    }

    #[test]
    fn test_no_validation_past_last_multiple() {
        let dir = TempDir::new().unwrap();
        let hp = ModelHyperparams::test();
        let config = TrainingConfig::test().with_epochs(3).with_check_epoch(2);
        let (mut train, mut val) = loaders(&hp, &config);

        let outcome: MemberOutcome<KoopmanAutoencoder> = MemberTrainer::new(&hp, &config, &Device::Cpu)
            .train(0, &dir.path().join("m.safetensors"), &mut train, &mut val)
            .unwrap();

        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].epoch, 2);
        assert_eq!(outcome.history.map(|h| h.len()), Some(3));
    }

    #[test]
    fn test_best_checkpoint_replaces_final_epoch_weights() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.safetensors");
        let hp = ModelHyperparams::test();
        let config = TrainingConfig::test().with_epochs(3).with_check_epoch(2);
        let (mut train, mut val) = loaders(&hp, &config);
        let trainer = MemberTrainer::new(&hp, &config, &Device::Cpu);

        let fitted: FittedMember<KoopmanAutoencoder> = trainer.fit(0, &path, &mut train, &mut val).unwrap();
        assert_eq!(fitted.events.len(), 1);
        assert!(fitted.events[0].improved);

        let final_epoch = weights(&fitted.model);
        let saved: KoopmanAutoencoder = load_model(&path, &Device::Cpu).unwrap();
        let saved = weights(&saved);
        assert_ne!(final_epoch, saved);

        let outcome = trainer.restore_best(0, &path, fitted).unwrap();
        assert_eq!(weights(&outcome.model), saved);
        assert_eq!(outcome.history.map(|h| h.len()), Some(3));
    }

    #[test]
    fn test_train_returns_checkpointed_weights() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.safetensors");
        let hp = ModelHyperparams::test();
        let config = TrainingConfig::test().with_epochs(3).with_check_epoch(2);
        let (mut train, mut val) = loaders(&hp, &config);

        let outcome: MemberOutcome<KoopmanAutoencoder> = MemberTrainer::new(&hp, &config, &Device::Cpu)
            .train(0, &path, &mut train, &mut val)
            .unwrap();
        let saved: KoopmanAutoencoder = load_model(&path, &Device::Cpu).unwrap();
        assert_eq!(weights(&outcome.model), weights(&saved));
    }
}
