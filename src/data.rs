//! Mini-batch loading over in-memory trajectory tensors.
//!
//! A dataset is a single `(N, time, num_meas + num_inputs)` tensor. The
//! training loader reshuffles its sample order at the start of every epoch
//! from a seeded RNG, the validation loader always walks samples in storage
//! order. Both keep the final partial batch and move each batch to the
//! compute device right before it is handed out.
//!
//! ```no_run
//! use candle_core::{DType, Device, Tensor};
//! use koopman_ensemble_rs::data::TrajectoryLoader;
//!
//! let data = Tensor::zeros((10, 20, 3), DType::F32, &Device::Cpu).unwrap();
//! let mut loader = TrajectoryLoader::new(data, 4, &Device::Cpu).unwrap().with_shuffle(42);
//! for batch in loader.epoch() {
//!     let batch = batch.unwrap();
//!     assert_eq!(batch.dims()[1], 20);
//! }
//! ```

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::device::pin_memory_hint;
use crate::error::{KoopmanError, KoopmanResult};

/// Batched view over a trajectory tensor.
pub struct TrajectoryLoader {
    data: Tensor,
    batch_size: usize,
    device: Device,
    rng: Option<StdRng>,
    pin_memory: bool,
}

impl TrajectoryLoader {
    /// Fixed-order loader over `data` with the given batch size.
    pub fn new(data: Tensor, batch_size: usize, device: &Device) -> KoopmanResult<Self> {
        if data.rank() != 3 {
            return Err(KoopmanError::data(format!(
                "trajectory data must be (samples, time, features), got {:?}",
                data.dims()
            )));
        }
        if data.dim(0)? == 0 {
            return Err(KoopmanError::data("trajectory data is empty"));
        }
        if batch_size == 0 {
            return Err(KoopmanError::data("batch_size must be > 0"));
        }

        let pin_memory = pin_memory_hint(device);
        if pin_memory {
            tracing::debug!("Loader will stage batches for an accelerator (pin_memory hint set)");
        }

        Ok(Self {
            data,
            batch_size,
            device: device.clone(),
            rng: None,
            pin_memory,
        })
    }

    /// Reshuffle sample order every epoch, seeded for reproducibility.
    pub fn with_shuffle(mut self, seed: u64) -> Self {
        self.rng = Some(StdRng::seed_from_u64(seed));
        self
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.data.dims()[0]
    }

    /// Always false for a constructed loader.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of batches per epoch, counting a final partial batch.
    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    /// Batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Whether batches are destined for an accelerator.
    pub fn pin_memory(&self) -> bool {
        self.pin_memory
    }

    /// Whether the sample order changes between epochs.
    pub fn shuffles(&self) -> bool {
        self.rng.is_some()
    }

    /// Start a new pass over the data.
    pub fn epoch(&mut self) -> EpochBatches<'_> {
        let n = self.len();
        let order = self.rng.as_mut().map(|rng| {
            let mut order: Vec<u32> = (0..n as u32).collect();
            order.shuffle(rng);
            order
        });
        EpochBatches {
            loader: self,
            order,
            cursor: 0,
        }
    }
}

/// Iterator over the batches of one epoch.
pub struct EpochBatches<'a> {
    loader: &'a TrajectoryLoader,
    order: Option<Vec<u32>>,
    cursor: usize,
}

impl EpochBatches<'_> {
    fn next_batch(&mut self, len: usize) -> KoopmanResult<Tensor> {
        let data = &self.loader.data;
        let batch = match &self.order {
            Some(order) => {
                let idx = &order[self.cursor..self.cursor + len];
                let idx = Tensor::new(idx, data.device())?;
                data.index_select(&idx, 0)?
            }
            None => data.narrow(0, self.cursor, len)?,
        };
        Ok(batch.to_device(&self.loader.device)?)
    }
}

impl Iterator for EpochBatches<'_> {
    type Item = KoopmanResult<Tensor>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.loader.len().saturating_sub(self.cursor);
        if remaining == 0 {
            return None;
        }
        let len = remaining.min(self.loader.batch_size);
        let batch = self.next_batch(len);
        self.cursor += len;
        Some(batch)
    }
}
