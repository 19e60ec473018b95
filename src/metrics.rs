//! Per-epoch loss histories, checkpoint events and progress formatting.

use serde::{Deserialize, Serialize};

use crate::error::{KoopmanError, KoopmanResult};
use crate::loss::LossComponents;

/// Selects one series out of [`LossComponents`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LossComponent {
    /// Weighted total (running loss)
    Total,
    /// State reconstruction
    Gx,
    /// Input reconstruction
    Gu,
    /// Multi-step latent prediction
    L3,
    /// Multi-step decoded prediction
    L4,
    /// Shift-window consistency
    L5,
    /// Parameter magnitude
    L6,
}

impl LossComponent {
    /// Every component, in storage order.
    pub const ALL: [LossComponent; 7] = [
        LossComponent::Total,
        LossComponent::Gx,
        LossComponent::Gu,
        LossComponent::L3,
        LossComponent::L4,
        LossComponent::L5,
        LossComponent::L6,
    ];

    /// Read this component from `c`.
    pub fn of(self, c: &LossComponents) -> f64 {
        match self {
            LossComponent::Total => c.total,
            LossComponent::Gx => c.l_gx,
            LossComponent::Gu => c.l_gu,
            LossComponent::L3 => c.l3,
            LossComponent::L4 => c.l4,
            LossComponent::L5 => c.l5,
            LossComponent::L6 => c.l6,
        }
    }
}

/// Epoch-summed training losses for every member of an ensemble.
///
/// Pre-sized to `ensemble_size x epochs`; entries that are never written
/// stay zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricHistory {
    ensemble_size: usize,
    epochs: usize,
    rows: Vec<Vec<LossComponents>>,
}

impl MetricHistory {
    /// Zero-filled grid.
    pub fn new(ensemble_size: usize, epochs: usize) -> Self {
        Self {
            ensemble_size,
            epochs,
            rows: vec![vec![LossComponents::default(); epochs]; ensemble_size],
        }
    }

    /// Number of members (rows).
    pub fn ensemble_size(&self) -> usize {
        self.ensemble_size
    }

    /// Number of epochs (columns).
    pub fn epochs(&self) -> usize {
        self.epochs
    }

    /// Store the summed losses of `member` at `epoch`.
    pub fn record(&mut self, member: usize, epoch: usize, losses: LossComponents) -> KoopmanResult<()> {
        let cell = self
            .rows
            .get_mut(member)
            .and_then(|row| row.get_mut(epoch))
            .ok_or_else(|| {
                KoopmanError::training(format!(
                    "metric index ({member}, {epoch}) outside {}x{}",
                    self.ensemble_size, self.epochs
                ))
            })?;
        *cell = losses;
        Ok(())
    }

    /// Losses of `member` at `epoch`.
    pub fn get(&self, member: usize, epoch: usize) -> Option<&LossComponents> {
        self.rows.get(member).and_then(|row| row.get(epoch))
    }

    /// All epochs of `member`.
    pub fn row(&self, member: usize) -> Option<&[LossComponents]> {
        self.rows.get(member).map(Vec::as_slice)
    }

    /// One component of `member` over all epochs.
    pub fn series(&self, member: usize, component: LossComponent) -> Vec<f64> {
        self.row(member)
            .map(|row| row.iter().map(|c| component.of(c)).collect())
            .unwrap_or_default()
    }

    /// One component as an `ensemble_size x epochs` matrix.
    pub fn matrix(&self, component: LossComponent) -> Vec<Vec<f64>> {
        (0..self.ensemble_size)
            .map(|m| self.series(m, component))
            .collect()
    }

    /// Export as JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Outcome of one validation checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEvent {
    /// 1-indexed epoch at which validation ran
    pub epoch: usize,
    /// Summed self-feeding loss over the validation loader
    pub validation_loss: f64,
    /// Whether this strictly beat the previous best and was written to disk
    pub improved: bool,
}

/// Render whole seconds as `H:MM:SS`, or `N day(s), H:MM:SS` past 24 hours.
pub fn format_hms(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds as u64
    } else {
        0
    };
    let days = total / 86_400;
    let h = (total % 86_400) / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    match days {
        0 => format!("{h}:{m:02}:{s:02}"),
        1 => format!("1 day, {h}:{m:02}:{s:02}"),
        d => format!("{d} days, {h}:{m:02}:{s:02}"),
    }
}

/// Remaining time from the average epoch duration so far.
pub fn eta_seconds(elapsed: f64, epochs_done: usize, epochs_total: usize) -> f64 {
    if epochs_done == 0 {
        return 0.0;
    }
    let avg = elapsed / epochs_done as f64;
    avg * epochs_total.saturating_sub(epochs_done) as f64
}
