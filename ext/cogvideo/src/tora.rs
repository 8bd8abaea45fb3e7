//! Trajectory-conditioning add-on: one fuser per transformer layer plus a
//! trajectory feature extractor.

use std::collections::BTreeMap;
use std::path::Path;

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LoaderError, Result};
use crate::weights::WeightMap;

pub const TORA_NUM_LAYERS: usize = 42;
pub const TORA_HIDDEN_SIZE: usize = 3072;
pub const FUSER_CHANNELS: usize = 128;

/// Motion-guidance fuser for one transformer layer.
#[derive(Debug, Clone)]
pub struct FuserModule {
    pub layer: usize,
    pub channels: usize,
    pub hidden_size: usize,
    pub weights: WeightMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrajExtractorConfig {
    pub vae_downsize: (usize, usize, usize),
    pub patch_size: usize,
    pub nums_rb: usize,
    pub cin: usize,
    pub channels: Vec<usize>,
    pub sk: bool,
    pub use_conv: bool,
}

impl Default for TrajExtractorConfig {
    fn default() -> Self {
        Self {
            vae_downsize: (4, 8, 8),
            patch_size: 2,
            nums_rb: 2,
            cin: 16,
            channels: vec![FUSER_CHANNELS; TORA_NUM_LAYERS],
            sk: true,
            use_conv: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrajExtractor {
    pub config: TrajExtractorConfig,
    pub weights: WeightMap,
}

/// The bundle the Tora loader node returns.
#[derive(Debug, Clone)]
pub struct ToraModel {
    pub fuser_list: Vec<FuserModule>,
    pub traj_extractor: TrajExtractor,
}

/// Split a flat `<layer>.<param>` state dict into per-layer fusers.
///
/// Every layer in `0..num_layers` must carry at least one tensor.
pub fn split_fuser_weights(weights: WeightMap, num_layers: usize) -> Result<Vec<FuserModule>> {
    let mut layers: BTreeMap<usize, WeightMap> = BTreeMap::new();
    for (name, weight) in weights.into_inner() {
        let (index, param) = name
            .split_once('.')
            .ok_or_else(|| LoaderError::InvalidTora(format!("unexpected key '{}'", name)))?;
        let layer: usize = index
            .parse()
            .map_err(|_| LoaderError::InvalidTora(format!("unexpected key '{}'", name)))?;
        if layer >= num_layers {
            return Err(LoaderError::InvalidTora(format!(
                "fuser layer {} out of range for {} layers",
                layer, num_layers
            )));
        }
        layers.entry(layer).or_default().insert(param, weight);
    }

    (0..num_layers)
        .map(|layer| {
            let weights = layers
                .remove(&layer)
                .filter(|w| !w.is_empty())
                .ok_or_else(|| LoaderError::InvalidTora(format!("fuser layer {} has no weights", layer)))?;
            Ok(FuserModule {
                layer,
                channels: FUSER_CHANNELS,
                hidden_size: TORA_HIDDEN_SIZE,
                weights,
            })
        })
        .collect()
}

/// Load the fuser list in fp16 onto `device`.
///
/// Tensors are materialized straight from the checkpoint, so there is no
/// separate empty-allocation path and the dtype does not depend on which
/// allocation helpers are installed.
pub fn load_fuser(path: &Path, device: &Device) -> Result<Vec<FuserModule>> {
    let mut weights = WeightMap::load(path, device)?;
    weights.cast(DType::F16)?;
    let fusers = split_fuser_weights(weights, TORA_NUM_LAYERS)?;
    info!("Loaded {} fuser modules from {}", fusers.len(), path.display());
    Ok(fusers)
}

/// Load the trajectory extractor in fp32 onto `device`.
pub fn load_traj_extractor(path: &Path, device: &Device) -> Result<TrajExtractor> {
    let mut weights = WeightMap::load(path, device)?;
    weights.cast(DType::F32)?;
    info!("Loaded trajectory extractor from {}", path.display());
    Ok(TrajExtractor {
        config: TrajExtractorConfig::default(),
        weights,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;

    fn flat(keys: &[&str]) -> WeightMap {
        WeightMap::from_tensors(keys.iter().map(|k| {
            (
                k.to_string(),
                Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap(),
            )
        }))
    }

    #[test]
    fn test_split_per_layer() {
        let fusers = split_fuser_weights(
            flat(&["0.conv.weight", "0.conv.bias", "1.norm.weight", "2.norm.weight"]),
            3,
        )
        .unwrap();
        assert_eq!(fusers.len(), 3);
        assert_eq!(fusers[0].weights.len(), 2);
        assert!(fusers[0].weights.contains("conv.bias"));
        assert_eq!(fusers[1].layer, 1);
        assert!(fusers[2].weights.contains("norm.weight"));
    }

    #[test]
    fn test_missing_layer_rejected() {
        let err = split_fuser_weights(
            flat(&["0.conv.weight", "2.conv.weight"]),
            3,
        )
        .unwrap_err();
        assert!(matches!(err, LoaderError::InvalidTora(ref msg) if msg.contains("layer 1")));
    }

    #[test]
    fn test_bad_keys() {
        assert!(matches!(
            split_fuser_weights(flat(&["42.conv.weight"]), TORA_NUM_LAYERS),
            Err(LoaderError::InvalidTora(_))
        ));
        assert!(matches!(
            split_fuser_weights(flat(&["conv.weight"]), TORA_NUM_LAYERS),
            Err(LoaderError::InvalidTora(_))
        ));
    }

    #[test]
    fn test_extractor_defaults() {
        let config = TrajExtractorConfig::default();
        assert_eq!(config.channels.len(), 42);
        assert_eq!(config.vae_downsize, (4, 8, 8));
        assert!(config.sk && !config.use_conv);
    }
}
