//! Best-model checkpoints.
//!
//! One safetensors file per ensemble member. Parameters are stored as
//! `state_dict.<var name>` and the architecture travels in the file header as
//! flat string metadata, so a checkpoint alone is enough to rebuild and load
//! the exact network:
//!
//! | key                    | value                         |
//! |------------------------|-------------------------------|
//! | `Num_meas`             | measurement dimension         |
//! | `Num_inputs`           | control input dimension       |
//! | `Num_x_Obsv`           | state observables             |
//! | `Num_x_Neurons`        | state MLP width               |
//! | `Num_u_Obsv`           | input observables             |
//! | `Num_u_Neurons`        | input MLP width               |
//! | `Num_hidden_x_encoder` | hidden layers, state encoder  |
//! | `Num_hidden_u_encoder` | hidden layers, input encoder  |
//! | `Num_hidden_x_decoder` | hidden layers, state decoder  |
//! | `Num_hidden_u_decoder` | hidden layers, input decoder  |
//! | `dt`                   | sampling interval             |
//! | `format_version`       | header layout version         |
//!
//! The decoder counts are optional when reading and default to the matching
//! encoder counts. Files are overwritten in place.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use candle_core::{Device, Tensor};
use safetensors::SafeTensors;

use crate::config::ModelHyperparams;
use crate::error::{KoopmanError, KoopmanResult};
use crate::model::KoopmanModel;

/// Header layout written by this version.
pub const FORMAT_VERSION: &str = "1";

const STATE_DICT_PREFIX: &str = "state_dict.";

/// Maps an ensemble index to the checkpoint file for that member.
pub trait ModelPathNaming {
    /// Checkpoint path of member `index`.
    fn model_path(&self, index: usize) -> PathBuf;
}

impl<F> ModelPathNaming for F
where
    F: Fn(usize) -> PathBuf,
{
    fn model_path(&self, index: usize) -> PathBuf {
        self(index)
    }
}

/// `<root>/<prefix>_<index>.safetensors`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointDir {
    /// Directory holding all member checkpoints
    pub root: PathBuf,
    /// File stem shared by every member
    pub prefix: String,
}

impl CheckpointDir {
    /// Naming scheme rooted at `root` with the default `model` prefix.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            prefix: "model".to_string(),
        }
    }

    /// Set the file stem.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

impl ModelPathNaming for CheckpointDir {
    fn model_path(&self, index: usize) -> PathBuf {
        self.root
            .join(format!("{}_{}.safetensors", self.prefix, index))
    }
}

/// Contents of a checkpoint file.
#[derive(Debug)]
pub struct CheckpointRecord {
    /// Architecture recovered from the header
    pub hyperparams: ModelHyperparams,
    /// Parameters keyed by var name, without the `state_dict.` prefix
    pub tensors: HashMap<String, Tensor>,
}

fn header(hp: &ModelHyperparams) -> HashMap<String, String> {
    let entries = [
        ("Num_meas", hp.num_meas.to_string()),
        ("Num_inputs", hp.num_inputs.to_string()),
        ("Num_x_Obsv", hp.num_x_obsv.to_string()),
        ("Num_x_Neurons", hp.num_x_neurons.to_string()),
        ("Num_u_Obsv", hp.num_u_obsv.to_string()),
        ("Num_u_Neurons", hp.num_u_neurons.to_string()),
        ("Num_hidden_x_encoder", hp.num_hidden_x_encoder.to_string()),
        ("Num_hidden_u_encoder", hp.num_hidden_u_encoder.to_string()),
        ("Num_hidden_x_decoder", hp.num_hidden_x_decoder.to_string()),
        ("Num_hidden_u_decoder", hp.num_hidden_u_decoder.to_string()),
        ("dt", hp.dt.to_string()),
        ("format_version", FORMAT_VERSION.to_string()),
    ];
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn field<T: FromStr>(meta: &HashMap<String, String>, key: &str) -> KoopmanResult<T> {
    let raw = meta
        .get(key)
        .ok_or_else(|| KoopmanError::checkpoint(format!("missing header key {key}")))?;
    raw.parse()
        .map_err(|_| KoopmanError::checkpoint(format!("bad value for {key}: {raw:?}")))
}

fn hyperparams_from_header(meta: &HashMap<String, String>) -> KoopmanResult<ModelHyperparams> {
    let num_hidden_x_encoder = field(meta, "Num_hidden_x_encoder")?;
    let num_hidden_u_encoder = field(meta, "Num_hidden_u_encoder")?;
    let num_hidden_x_decoder = match meta.contains_key("Num_hidden_x_decoder") {
        true => field(meta, "Num_hidden_x_decoder")?,
        false => num_hidden_x_encoder,
    };
    let num_hidden_u_decoder = match meta.contains_key("Num_hidden_u_decoder") {
        true => field(meta, "Num_hidden_u_decoder")?,
        false => num_hidden_u_encoder,
    };

    let hp = ModelHyperparams {
        num_meas: field(meta, "Num_meas")?,
        num_inputs: field(meta, "Num_inputs")?,
        num_x_obsv: field(meta, "Num_x_Obsv")?,
        num_x_neurons: field(meta, "Num_x_Neurons")?,
        num_u_obsv: field(meta, "Num_u_Obsv")?,
        num_u_neurons: field(meta, "Num_u_Neurons")?,
        num_hidden_x_encoder,
        num_hidden_x_decoder,
        num_hidden_u_encoder,
        num_hidden_u_decoder,
        dt: field(meta, "dt")?,
    };
    hp.validate()?;
    Ok(hp)
}

/// Write the parameters and architecture of `model` to `path`.
///
/// Creates the parent directory when needed and replaces any existing file.
pub fn save_checkpoint<M: KoopmanModel>(model: &M, path: &Path) -> KoopmanResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tensors: Vec<(String, Tensor)> = {
        let data = model
            .var_map()
            .data()
            .lock()
            .map_err(|_| KoopmanError::checkpoint("parameter map lock poisoned"))?;
        data.iter()
            .map(|(name, var)| {
                (
                    format!("{STATE_DICT_PREFIX}{name}"),
                    var.as_tensor().detach(),
                )
            })
            .collect()
    };

    safetensors::tensor::serialize_to_file(tensors, &Some(header(model.hyperparams())), path)?;
    tracing::debug!("Wrote checkpoint {}", path.display());
    Ok(())
}

/// Read a checkpoint, placing its tensors on `device`.
pub fn read_checkpoint(path: &Path, device: &Device) -> KoopmanResult<CheckpointRecord> {
    let buffer = fs::read(path).map_err(|e| {
        KoopmanError::checkpoint(format!("cannot read {}: {e}", path.display()))
    })?;

    let (_, metadata) = SafeTensors::read_metadata(&buffer)?;
    let meta = metadata
        .metadata()
        .as_ref()
        .ok_or_else(|| KoopmanError::checkpoint(format!("{} has no header", path.display())))?;
    let hyperparams = hyperparams_from_header(meta)?;

    let tensors = candle_core::safetensors::load_buffer(&buffer, device)?
        .into_iter()
        .filter_map(|(name, tensor)| {
            name.strip_prefix(STATE_DICT_PREFIX)
                .map(|stripped| (stripped.to_string(), tensor))
        })
        .collect();

    Ok(CheckpointRecord {
        hyperparams,
        tensors,
    })
}

/// Overwrite the parameters of `model` with those stored at `path`.
///
/// Loading is strict: the architecture must match and every parameter must
/// be present with the right shape, with nothing left over.
pub fn restore_into<M: KoopmanModel>(model: &M, path: &Path) -> KoopmanResult<()> {
    let device = model
        .var_map()
        .all_vars()
        .first()
        .map(|v| v.device().clone())
        .unwrap_or(Device::Cpu);
    let record = read_checkpoint(path, &device)?;

    if &record.hyperparams != model.hyperparams() {
        return Err(KoopmanError::checkpoint(format!(
            "{} was written for a different architecture: {:?}",
            path.display(),
            record.hyperparams
        )));
    }
    apply_tensors(model, &record.tensors)
}

fn apply_tensors<M: KoopmanModel>(model: &M, tensors: &HashMap<String, Tensor>) -> KoopmanResult<()> {
    let data = model
        .var_map()
        .data()
        .lock()
        .map_err(|_| KoopmanError::checkpoint("parameter map lock poisoned"))?;

    if let Some(extra) = tensors.keys().find(|name| !data.contains_key(*name)) {
        return Err(KoopmanError::checkpoint(format!(
            "unexpected parameter {extra}"
        )));
    }

    for (name, var) in data.iter() {
        let tensor = tensors
            .get(name)
            .ok_or_else(|| KoopmanError::checkpoint(format!("missing parameter {name}")))?;
        if tensor.dims() != var.dims() {
            return Err(KoopmanError::shape_mismatch(
                format!("{name} {:?}", var.dims()),
                format!("{:?}", tensor.dims()),
            ));
        }
        var.set(&tensor.to_dtype(var.dtype())?)?;
    }
    Ok(())
}

/// Rebuild a model from a checkpoint without any external configuration.
pub fn load_model<M: KoopmanModel>(path: &Path, device: &Device) -> KoopmanResult<M> {
    let record = read_checkpoint(path, device)?;
    let model = M::build(&record.hyperparams, device)?;
    apply_tensors(&model, &record.tensors)?;
    tracing::debug!(
        "Loaded {} parameters from {}",
        model.parameter_count(),
        path.display()
    );
    Ok(model)
}
