//! Train a small Koopman ensemble on a simulated forced Duffing oscillator.
//!
//! ```text
//! RUST_LOG=info cargo run --example synthetic_ensemble -- --members 3 --epochs 40
//! RUST_LOG=debug cargo run --example synthetic_ensemble -- --config experiment.toml --lean
//! ```

use std::path::PathBuf;

use anyhow::Context;
use candle_core::{Device, Tensor};
use clap::Parser;
use koopman_ensemble_rs::metrics::LossComponent;
use koopman_ensemble_rs::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "synthetic_ensemble")]
#[command(about = "Ensemble-train Koopman autoencoders on a forced Duffing oscillator")]
struct Cli {
    /// Experiment TOML; overrides the flags below
    #[arg(long)]
    config: Option<PathBuf>,
    /// Ensemble size
    #[arg(long, default_value_t = 3)]
    members: usize,
    /// Epochs per member
    #[arg(long, default_value_t = 40)]
    epochs: usize,
    /// Checkpoint directory
    #[arg(long, default_value = "checkpoints/synthetic")]
    out: PathBuf,
    /// Skip metric histories
    #[arg(long)]
    lean: bool,
}

/// `x'' = -x - 0.3 x' - x^3 + u`, sampled every `dt`.
fn duffing(samples: usize, steps: usize, dt: f32, seed: u64) -> anyhow::Result<Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut values = Vec::with_capacity(samples * steps * 3);
    for _ in 0..samples {
        let (mut p, mut v) = (rng.gen_range(-1.5f32..1.5), rng.gen_range(-1.0f32..1.0));
        let mut u = 0.0f32;
        for k in 0..steps {
            if k % 10 == 0 {
                u = rng.gen_range(-1.0f32..1.0);
            }
            values.extend_from_slice(&[p, v, u]);
            let a = -p - 0.3 * v - p * p * p + u;
            p += dt * v;
            v += dt * a;
        }
    }
    Ok(Tensor::from_vec(values, (samples, steps, 3), &Device::Cpu)?)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let experiment = match &cli.config {
        Some(path) => ExperimentConfig::from_file(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => ExperimentConfig {
            model: ModelHyperparams::new(2, 1)
                .with_observables(8, 3)
                .with_neurons(32, 16)
                .with_dt(0.02),
            training: TrainingConfig::default()
                .with_epochs(cli.epochs)
                .with_check_epoch((cli.epochs / 4).max(1))
                .with_batch_size(32)
                .with_horizon(20, 5)
                .with_ensemble_size(cli.members)
                .with_device(DeviceChoice::Cpu)
                .with_checkpoint_dir(&cli.out),
        },
    };
    experiment.validate()?;

    let dt = experiment.model.dt as f32;
    let steps = experiment.training.horizon + 10;
    let train = duffing(256, steps, dt, 1)?;
    let test = duffing(64, steps, dt, 2)?;

    let trainer = EnsembleTrainer::new(experiment.model, experiment.training)?;
    let summary = if cli.lean {
        trainer.train_lean::<KoopmanAutoencoder>(&train, &test)?
    } else {
        let report = trainer.train::<KoopmanAutoencoder>(&train, &test)?;
        for member in 0..report.histories.ensemble_size() {
            let totals = report.histories.series(member, LossComponent::Total);
            if let (Some(first), Some(last)) = (totals.first(), totals.last()) {
                println!("member {member}: train loss {first:.3e} -> {last:.3e}");
            }
        }
        report.summary
    };

    println!("validation losses: {:?}", summary.model_losses);
    println!(
        "best member {} (loss {:.3e}) at {}",
        summary.best_index,
        summary.lowest_loss,
        summary.best_model_path.display()
    );

    let best: KoopmanAutoencoder = load_model(&summary.best_model_path, &Device::Cpu)?;
    println!("reloaded {} parameters", best.parameter_count());
    Ok(())
}
