//! Checkpoint directories: `config.json` with the construction config and
//! epoch counter, `model.safetensors` with the parameters.

use asr_core::AsrResult;
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::config::TransformerConfig;
use crate::model::Transformer;

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Contents of `config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub config: TransformerConfig,
    pub epoch: usize,
}

impl CheckpointMeta {
    pub fn from_json_file(path: impl AsRef<Path>) -> AsrResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let meta: Self = serde_json::from_str(&content)?;
        meta.config.validate()?;
        Ok(meta)
    }
}

/// Write `model` into `dir`, creating it if needed.
pub fn save_checkpoint(model: &Transformer, epoch: usize, dir: impl AsRef<Path>) -> AsrResult<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    let meta = CheckpointMeta {
        config: model.config().clone(),
        epoch,
    };
    std::fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(&meta)?)?;
    model.save_weights(dir.join(WEIGHTS_FILE))?;

    info!(dir = %dir.display(), epoch, "checkpoint saved");
    Ok(())
}

/// Rebuild the model stored in `dir`. Returns the model and its epoch counter.
pub fn load_checkpoint(dir: impl AsRef<Path>, device: &Device) -> AsrResult<(Transformer, usize)> {
    let dir = dir.as_ref();
    let meta = CheckpointMeta::from_json_file(dir.join(CONFIG_FILE))?;

    let mut model = Transformer::new(meta.config, device)?;
    model.load_weights(dir.join(WEIGHTS_FILE))?;

    info!(dir = %dir.display(), epoch = meta.epoch, "checkpoint loaded");
    Ok((model, meta.epoch))
}
