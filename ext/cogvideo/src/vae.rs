use std::fmt;
use std::path::Path;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LoaderError, Result};
use crate::transformer::ArchFamily;
use crate::weights::WeightMap;

const VAE_CONFIG: &str = include_str!("../configs/vae_config.json");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaeConfig {
    pub latent_channels: usize,
    pub block_out_channels: Vec<usize>,
    #[serde(default = "default_scaling_factor")]
    pub scaling_factor: f64,
    #[serde(default = "default_temporal_compression")]
    pub temporal_compression_ratio: usize,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_scaling_factor() -> f64 {
    1.15258426
}

fn default_temporal_compression() -> usize {
    4
}

impl VaeConfig {
    pub fn preset() -> Result<Self> {
        Ok(serde_json::from_str(VAE_CONFIG)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }

    /// Spatial downsampling, one halving per block after the first.
    pub fn spatial_compression_ratio(&self) -> usize {
        1 << self.block_out_channels.len().saturating_sub(1)
    }
}

/// Video autoencoder weights; the family follows the transformer's.
pub struct Vae {
    family: ArchFamily,
    config: VaeConfig,
    weights: WeightMap,
    dtype: DType,
}

impl fmt::Debug for Vae {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vae")
            .field("family", &self.family)
            .field("latent_channels", &self.config.latent_channels)
            .field("parameters", &self.weights.len())
            .field("dtype", &self.dtype)
            .finish()
    }
}

impl Vae {
    /// Load a diffusers `vae/` directory.
    pub fn from_pretrained(dir: &Path, family: ArchFamily, device: &Device) -> Result<Self> {
        let config_path = dir.join("config.json");
        if !config_path.exists() {
            return Err(LoaderError::MissingWeights(config_path));
        }
        let config = VaeConfig::from_file(&config_path)?;
        let weights = WeightMap::load(dir, device)?;
        info!("Loaded VAE ({} parameters) from {}", weights.len(), dir.display());
        Ok(Self::new(family, config, weights))
    }

    /// Load a standalone checkpoint against the shipped configuration.
    pub fn from_single_file(path: &Path, family: ArchFamily, device: &Device) -> Result<Self> {
        let weights = WeightMap::load(path, device)?;
        Ok(Self::new(family, VaeConfig::preset()?, weights))
    }

    pub fn new(family: ArchFamily, config: VaeConfig, weights: WeightMap) -> Self {
        let dtype = weights
            .iter()
            .find_map(|(_, w)| w.dtype().filter(|d| d.is_float()))
            .unwrap_or(DType::F32);
        Self {
            family,
            config,
            weights,
            dtype,
        }
    }

    pub fn family(&self) -> ArchFamily {
        self.family
    }

    pub fn config(&self) -> &VaeConfig {
        &self.config
    }

    pub fn weights(&self) -> &WeightMap {
        &self.weights
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn cast(&mut self, dtype: DType) -> Result<()> {
        self.weights.cast(dtype)?;
        self.dtype = dtype;
        Ok(())
    }

    pub fn to_device(&mut self, device: &Device) -> Result<()> {
        self.weights.to_device(device)
    }

    pub fn var_builder(&self, device: &Device) -> Result<VarBuilder<'static>> {
        self.weights.var_builder(self.dtype, device)
    }
}
