use std::path::Path;

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LoaderError, Result};
use crate::weights::WeightMap;

/// ControlNet `config.json`; unknown fields pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlNetConfig {
    #[serde(default)]
    pub in_channels: Option<usize>,
    #[serde(default)]
    pub num_layers: Option<usize>,
    #[serde(default)]
    pub out_proj_dim: Option<usize>,
    #[serde(default)]
    pub downscale_coef: Option<usize>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ControlNetModel {
    pub name: String,
    pub config: ControlNetConfig,
    pub weights: WeightMap,
}

impl ControlNetModel {
    pub fn from_pretrained(dir: &Path, name: &str, device: &Device) -> Result<Self> {
        let config_path = dir.join("config.json");
        if !config_path.exists() {
            return Err(LoaderError::MissingWeights(config_path));
        }
        let config: ControlNetConfig =
            serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;
        let weights = WeightMap::load(dir, device)?;
        info!(
            "Loaded ControlNet {} ({} parameters, {} layers)",
            name,
            weights.len(),
            config.num_layers.unwrap_or(0)
        );
        Ok(Self {
            name: name.to_string(),
            config,
            weights,
        })
    }
}
