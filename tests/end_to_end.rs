//! End-to-end integration tests for koopman-ensemble-rs

use std::fs;
use std::path::Path;

use candle_core::{Device, Tensor};
use koopman_ensemble_rs::prelude::*;
use koopman_ensemble_rs::{select_best, validation_loss, TrajectoryLoader};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

/// Trajectories of a damped oscillator driven by a random input.
///
/// Shape `(samples, steps, 3)`: two states then one input.
fn forced_oscillator(samples: usize, steps: usize, seed: u64) -> Tensor {
    let mut rng = StdRng::seed_from_u64(seed);
    let dt = 0.05f32;
    let mut values = Vec::with_capacity(samples * steps * 3);
    for _ in 0..samples {
        let mut x = [rng.gen_range(-1.0f32..1.0), rng.gen_range(-1.0f32..1.0)];
        for _ in 0..steps {
            let u = rng.gen_range(-0.5f32..0.5);
            values.extend_from_slice(&[x[0], x[1], u]);
            x = [
                x[0] + dt * x[1],
                x[1] + dt * (-x[0] - 0.2 * x[1] + u),
            ];
        }
    }
    Tensor::from_vec(values, (samples, steps, 3), &Device::Cpu).unwrap()
}

fn checkpoint_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| entries.filter_map(Result::ok).count())
        .unwrap_or(0)
}

#[test]
fn test_single_member_single_epoch() {
    let dir = TempDir::new().unwrap();
    let hp = ModelHyperparams::test();
    let config = TrainingConfig::test()
        .with_epochs(1)
        .with_check_epoch(1)
        .with_ensemble_size(1)
        .with_horizon(4, 2)
        .with_checkpoint_dir(dir.path());

    let train = forced_oscillator(4, 4, 1);
    let test = forced_oscillator(4, 4, 2);

    let report = EnsembleTrainer::new(hp, config)
        .unwrap()
        .train::<KoopmanAutoencoder>(&train, &test)
        .unwrap();

    assert_eq!(report.summary.model_losses.len(), 1);
    assert_eq!(report.summary.best_index, 0);
    assert_eq!(report.events.len(), 1);
    assert_eq!(report.events[0].len(), 1);
    assert!(report.events[0][0].improved);
    assert!(report.summary.best_model_path.exists());
    assert_eq!(checkpoint_files(dir.path()), 1);
}

#[test]
fn test_reload_reproduces_validation_loss() {
    let dir = TempDir::new().unwrap();
    let hp = ModelHyperparams::test();
    let config = TrainingConfig::test()
        .with_epochs(4)
        .with_check_epoch(2)
        .with_ensemble_size(2)
        .with_checkpoint_dir(dir.path());

    let train = forced_oscillator(8, 6, 3);
    let test = forced_oscillator(5, 6, 4);

    let summary = EnsembleTrainer::new(hp, config.clone())
        .unwrap()
        .train_lean::<KoopmanAutoencoder>(&train, &test)
        .unwrap();

    // The checkpoint alone is enough to rebuild the network.
    let model: KoopmanAutoencoder = load_model(&summary.best_model_path, &Device::Cpu).unwrap();
    let mut loader = TrajectoryLoader::new(test, config.batch_size, &Device::Cpu).unwrap();
    let reloaded = validation_loss(&model, &mut loader).unwrap();

    let tolerance = 1e-6 * summary.lowest_loss.abs().max(1.0);
    assert!(
        (reloaded - summary.lowest_loss).abs() <= tolerance,
        "reloaded {reloaded} vs recorded {}",
        summary.lowest_loss
    );
}

#[test]
fn test_ensemble_selects_first_minimum() {
    let dir = TempDir::new().unwrap();
    let hp = ModelHyperparams::test();
    let config = TrainingConfig::test()
        .with_epochs(2)
        .with_ensemble_size(3)
        .with_checkpoint_dir(dir.path());

    let train = forced_oscillator(6, 5, 5);
    let test = forced_oscillator(3, 5, 6);

    let report = EnsembleTrainer::new(hp, config)
        .unwrap()
        .train::<KoopmanAutoencoder>(&train, &test)
        .unwrap();

    let losses = &report.summary.model_losses;
    assert_eq!(losses.len(), 3);
    assert_eq!(report.summary.best_index, select_best(losses).unwrap());
    assert!(losses.iter().all(|l| *l >= report.summary.lowest_loss));
    assert_eq!(checkpoint_files(dir.path()), 3);

    for member in 0..3 {
        let row = report.histories.row(member).unwrap();
        assert_eq!(row.len(), 2);
        assert!(row.iter().all(|c| c.total > 0.0));
    }
}

#[test]
fn test_persisted_losses_never_increase() {
    let dir = TempDir::new().unwrap();
    let hp = ModelHyperparams::test();
    let config = TrainingConfig::test()
        .with_epochs(6)
        .with_check_epoch(1)
        .with_learning_rate(5e-2)
        .with_checkpoint_dir(dir.path());

    let train = forced_oscillator(8, 5, 7);
    let test = forced_oscillator(4, 5, 8);

    let report = EnsembleTrainer::new(hp, config)
        .unwrap()
        .train::<KoopmanAutoencoder>(&train, &test)
        .unwrap();

    let persisted: Vec<f64> = report.events[0]
        .iter()
        .filter(|e| e.improved)
        .map(|e| e.validation_loss)
        .collect();
    assert!(!persisted.is_empty());
    assert!(persisted.windows(2).all(|w| w[1] < w[0]));
    assert_eq!(
        persisted.last().copied(),
        Some(report.summary.lowest_loss)
    );
}

#[test]
fn test_epochs_past_last_check_are_not_validated() {
    let dir = TempDir::new().unwrap();
    let hp = ModelHyperparams::test();
    let config = TrainingConfig::test()
        .with_epochs(5)
        .with_check_epoch(2)
        .with_checkpoint_dir(dir.path());

    let train = forced_oscillator(4, 5, 9);
    let test = forced_oscillator(2, 5, 10);

    let report = EnsembleTrainer::new(hp, config)
        .unwrap()
        .train::<KoopmanAutoencoder>(&train, &test)
        .unwrap();

    let epochs: Vec<usize> = report.events[0].iter().map(|e| e.epoch).collect();
    assert_eq!(epochs, vec![2, 4]);
    assert_eq!(report.histories.row(0).unwrap().len(), 5);
}

#[test]
fn test_bad_validation_data_aborts_run() {
    let dir = TempDir::new().unwrap();
    let hp = ModelHyperparams::test();
    let config = TrainingConfig::test()
        .with_ensemble_size(2)
        .with_checkpoint_dir(dir.path());

    let train = forced_oscillator(4, 5, 11);
    let wrong_width = Tensor::zeros((2, 5, 5), candle_core::DType::F32, &Device::Cpu).unwrap();

    let result = EnsembleTrainer::new(hp, config)
        .unwrap()
        .train_lean::<KoopmanAutoencoder>(&train, &wrong_width);
    assert!(matches!(result, Err(KoopmanError::ShapeMismatch { .. })));
    assert_eq!(checkpoint_files(dir.path()), 0);
}

#[test]
fn test_experiment_file_drives_a_run() {
    let dir = TempDir::new().unwrap();
    let experiment = ExperimentConfig {
        model: ModelHyperparams::test(),
        training: TrainingConfig::test().with_checkpoint_dir(dir.path().join("ckpt")),
    };
    let path = dir.path().join("experiment.toml");
    experiment.to_file(&path).unwrap();

    let loaded = ExperimentConfig::from_file(&path).unwrap();
    assert_eq!(loaded, experiment);

    let summary = EnsembleTrainer::new(loaded.model, loaded.training)
        .unwrap()
        .train_lean::<KoopmanAutoencoder>(&forced_oscillator(4, 5, 12), &forced_oscillator(2, 5, 13))
        .unwrap();
    assert!(summary.best_model_path.starts_with(dir.path().join("ckpt")));
}
