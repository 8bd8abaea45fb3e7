//! LoRA application.
//!
//! Fun transformers get LoRA deltas merged straight into their weights. Every
//! other transformer keeps its base weights and carries the adapter matrices
//! as extra parameters that [`Transformer::linear`] adds at run time.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{LoaderError, Result};
use crate::transformer::{ArchFamily, LoraAdapter, Transformer};
use crate::weights::{Weight, WeightMap};

/// One entry of the host's LoRA list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraSpec {
    pub path: PathBuf,
    #[serde(default = "default_strength")]
    pub strength: f64,
    /// Adapter name, defaults to the file stem
    #[serde(default)]
    pub name: Option<String>,
}

fn default_strength() -> f64 {
    1.0
}

impl LoraSpec {
    pub fn new(path: impl Into<PathBuf>, strength: f64) -> Self {
        Self {
            path: path.into(),
            strength,
            name: None,
        }
    }

    pub fn adapter_name(&self) -> String {
        let raw = self.name.clone().unwrap_or_else(|| {
            self.path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "lora".to_string())
        });
        // parameter names are dot separated
        raw.replace('.', "_")
    }
}

/// The low-rank pair for one target module.
#[derive(Debug, Clone)]
struct LoraModule {
    /// `(rank, in)` or `(rank, in, ...)`
    down: Tensor,
    /// `(out, rank)` or `(out, rank, ...)`
    up: Tensor,
    alpha: Option<f64>,
}

impl LoraModule {
    fn rank(&self) -> usize {
        self.down.dims().first().copied().unwrap_or(0)
    }

    /// `alpha / rank`, or 1 when the file carries no alpha.
    fn scale(&self) -> f64 {
        match (self.alpha, self.rank()) {
            (Some(alpha), rank) if rank > 0 => alpha / rank as f64,
            _ => 1.0,
        }
    }

    /// `up @ down` shaped like the target weight, in f32.
    fn delta(&self, target_dims: &[usize]) -> Result<Tensor> {
        let rank = self.rank();
        let up = self.up.to_dtype(DType::F32)?;
        let down = self.down.to_dtype(DType::F32)?;
        let out = self.up.dims().first().copied().unwrap_or(0);
        let up = up.reshape((out, rank))?;
        let down = down.reshape((rank, down.elem_count() / rank.max(1)))?;
        Ok(up.matmul(&down)?.reshape(target_dims)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Down,
    Up,
    Alpha,
}

const SUFFIXES: &[(&str, Role)] = &[
    (".lora_down.weight", Role::Down),
    (".lora_up.weight", Role::Up),
    (".lora_A.weight", Role::Down),
    (".lora_B.weight", Role::Up),
    (".alpha", Role::Alpha),
];

const FLAT_PREFIXES: &[&str] = &["lora_unet_", "lora_transformer_"];
const DOTTED_PREFIXES: &[&str] = &["base_model.model.", "transformer.", "diffusion_model."];

fn split_key(key: &str) -> Option<(&str, Role)> {
    SUFFIXES
        .iter()
        .find_map(|(suffix, role)| key.strip_suffix(suffix).map(|m| (m, *role)))
}

/// Map a LoRA module key onto a module prefix of `weights`.
///
/// Kohya-style keys flatten the module path with underscores, so they are
/// matched against the flattened form of every existing module.
fn resolve_target(
    module_key: &str,
    weights: &WeightMap,
    flat_index: &HashMap<String, String>,
) -> Option<String> {
    for prefix in FLAT_PREFIXES {
        if let Some(flat) = module_key.strip_prefix(prefix) {
            return flat_index.get(flat).cloned();
        }
    }
    let mut dotted = module_key;
    for prefix in DOTTED_PREFIXES {
        dotted = dotted.strip_prefix(prefix).unwrap_or(dotted);
    }
    weights
        .contains(&format!("{}.weight", dotted))
        .then(|| dotted.to_string())
}

fn flat_index(weights: &WeightMap) -> HashMap<String, String> {
    weights
        .names()
        .filter_map(|name| name.strip_suffix(".weight"))
        .map(|module| (module.replace('.', "_"), module.to_string()))
        .collect()
}

/// Parse a LoRA file into target module prefix -> low-rank pair.
fn load_modules(path: &Path, weights: &WeightMap) -> Result<BTreeMap<String, LoraModule>> {
    let invalid = |reason: String| LoaderError::InvalidLora {
        path: path.to_path_buf(),
        reason,
    };
    let file = WeightMap::load(path, &Device::Cpu)?;
    let index = flat_index(weights);

    let mut parts: BTreeMap<String, (Option<Tensor>, Option<Tensor>, Option<f64>)> =
        BTreeMap::new();
    for (key, weight) in file.iter() {
        let Some((module_key, role)) = split_key(key) else {
            debug!("ignoring LoRA key {}", key);
            continue;
        };
        let target = resolve_target(module_key, weights, &index)
            .ok_or_else(|| invalid(format!("target module '{}' not found", module_key)))?;
        let tensor = weight.to_dense(DType::F32)?;
        let entry = parts.entry(target).or_default();
        match role {
            Role::Down => entry.0 = Some(tensor),
            Role::Up => entry.1 = Some(tensor),
            Role::Alpha => {
                entry.2 = tensor.flatten_all()?.to_vec1::<f32>()?.first().map(|a| *a as f64)
            }
        }
    }

    if parts.is_empty() {
        return Err(invalid("no LoRA weights found".to_string()));
    }

    parts
        .into_iter()
        .map(|(target, (down, up, alpha))| match (down, up) {
            (Some(down), Some(up)) if down.rank() == 0 || up.rank() == 0 => Err(invalid(format!(
                "'{}' has a scalar up or down matrix",
                target
            ))),
            (Some(down), Some(up)) => Ok((target, LoraModule { down, up, alpha })),
            _ => Err(invalid(format!("'{}' is missing its up or down matrix", target))),
        })
        .collect()
}

/// Apply a LoRA list. An empty list changes nothing.
pub fn apply_lora(transformer: &mut Transformer, specs: &[LoraSpec]) -> Result<()> {
    if specs.is_empty() {
        return Ok(());
    }
    match transformer.arch().family() {
        ArchFamily::Fun => {
            for spec in specs {
                info!(
                    "Merging LoRA weights from {} with strength {}",
                    spec.path.display(),
                    spec.strength
                );
                merge_lora(transformer, spec)?;
            }
            Ok(())
        }
        ArchFamily::Standard => {
            for spec in specs {
                inject_lora(transformer, spec)?;
            }
            Ok(())
        }
    }
}

/// `W += strength · (alpha / rank) · (up @ down)` for every module in the file.
pub fn merge_lora(transformer: &mut Transformer, spec: &LoraSpec) -> Result<()> {
    let modules = load_modules(&spec.path, transformer.weights())?;
    let weights = transformer.weights_mut();
    for (target, module) in &modules {
        let name = format!("{}.weight", target);
        let weight = weights.require(&name)?;
        let Weight::Dense(base) = weight else {
            return Err(LoaderError::InvalidLora {
                path: spec.path.clone(),
                reason: format!("cannot merge into '{}' stored as {}", name, weight.storage_name()),
            });
        };
        let delta = (module.delta(base.dims())? * (spec.strength * module.scale()))?;
        let merged = (base.to_dtype(DType::F32)? + delta.to_device(base.device())?)?
            .to_dtype(base.dtype())?;
        weights.insert(name, Weight::Dense(merged));
    }
    debug!("merged {} LoRA modules", modules.len());
    Ok(())
}

/// Add the adapter matrices as `<module>.lora_A.<name>.weight` /
/// `<module>.lora_B.<name>.weight` and record the adapter.
pub fn inject_lora(transformer: &mut Transformer, spec: &LoraSpec) -> Result<()> {
    let name = spec.adapter_name();
    if transformer.adapters().iter().any(|a| a.name == name) {
        return Err(LoaderError::InvalidLora {
            path: spec.path.clone(),
            reason: format!("adapter '{}' is already loaded", name),
        });
    }
    let modules = load_modules(&spec.path, transformer.weights())?;
    let scale = modules.values().next().map(LoraModule::scale).unwrap_or(1.0);
    let dtype = transformer.compute_dtype();

    let mut targets = Vec::with_capacity(modules.len());
    for (target, module) in modules {
        let device = transformer
            .weights()
            .require(&format!("{}.weight", target))?
            .device();
        let mut up = module.up.clone();
        // modules with their own alpha keep it relative to the adapter scale
        let relative = module.scale() / scale;
        if (relative - 1.0).abs() > f64::EPSILON {
            up = (up * relative)?;
        }
        let down = flatten_2d(&module.down)?.to_dtype(dtype)?.to_device(&device)?;
        let up = flatten_2d(&up)?.to_dtype(dtype)?.to_device(&device)?;

        let weights = transformer.weights_mut();
        weights.insert(format!("{}.lora_A.{}.weight", target, name), Weight::Dense(down));
        weights.insert(format!("{}.lora_B.{}.weight", target, name), Weight::Dense(up));
        targets.push(target);
    }

    info!(
        "Loaded LoRA adapter '{}' into {} modules (strength {}, scale {})",
        name,
        targets.len(),
        spec.strength,
        scale
    );
    transformer.push_adapter(LoraAdapter {
        name,
        strength: spec.strength,
        scale,
        targets,
    });
    Ok(())
}

fn flatten_2d(t: &Tensor) -> Result<Tensor> {
    let rows = t.dims().first().copied().unwrap_or(1);
    Ok(t.reshape((rows, t.elem_count() / rows.max(1)))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Module;

    use crate::transformer::{Architecture, TransformerConfig};
    use crate::variant::{Family, FunRelease, ModelSize};

    fn transformer(family: Family) -> Transformer {
        let w = Tensor::new(&[[1.0f32, 0.0], [0.0, 1.0]], &Device::Cpu).unwrap();
        Transformer::from_config(
            TransformerConfig::preset(ModelSize::TwoB).unwrap(),
            Architecture::select(family, None),
            WeightMap::from_tensors([("blocks.0.proj.weight".to_string(), w)]),
        )
    }

    fn write_lora(dir: &Path, keys: &[(&str, Tensor)]) -> PathBuf {
        let path = dir.join("style.safetensors");
        let tensors: HashMap<String, Tensor> =
            keys.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        candle_core::safetensors::save(&tensors, &path).unwrap();
        path
    }

    fn kohya_pair() -> Vec<(&'static str, Tensor)> {
        vec![
            (
                "lora_unet_blocks_0_proj.lora_down.weight",
                Tensor::new(&[[1.0f32, 2.0]], &Device::Cpu).unwrap(),
            ),
            (
                "lora_unet_blocks_0_proj.lora_up.weight",
                Tensor::new(&[[1.0f32], [0.0]], &Device::Cpu).unwrap(),
            ),
            ("lora_unet_blocks_0_proj.alpha", Tensor::new(&[2.0f32], &Device::Cpu).unwrap()),
        ]
    }

    #[test]
    fn test_merge_math() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lora(dir.path(), &kohya_pair());
        let mut t = transformer(Family::Fun(FunRelease::V1_1));
        apply_lora(&mut t, &[LoraSpec::new(&path, 0.5)]).unwrap();

        // 0.5 * (2 / 1) * [[1, 2], [0, 0]]
        let w = t
            .weights()
            .require("blocks.0.proj.weight")
            .unwrap()
            .to_dense(DType::F32)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(w, vec![vec![2.0, 2.0], vec![0.0, 1.0]]);
        assert!(t.adapters().is_empty());
    }

    #[test]
    fn test_empty_list_is_noop() {
        let mut t = transformer(Family::Fun(FunRelease::Pruned));
        let before = t.weights().require("blocks.0.proj.weight").unwrap().to_dense(DType::F32).unwrap();
        apply_lora(&mut t, &[]).unwrap();
        let after = t.weights().require("blocks.0.proj.weight").unwrap().to_dense(DType::F32).unwrap();
        assert_eq!(before.to_vec2::<f32>().unwrap(), after.to_vec2::<f32>().unwrap());
        assert_eq!(t.weights().len(), 1);
    }

    #[test]
    fn test_injection_matches_merge() {
        let dir = tempfile::tempdir().unwrap();
        let peft = vec![
            (
                "transformer.blocks.0.proj.lora_A.weight",
                Tensor::new(&[[1.0f32, 2.0]], &Device::Cpu).unwrap(),
            ),
            (
                "transformer.blocks.0.proj.lora_B.weight",
                Tensor::new(&[[1.0f32], [0.0]], &Device::Cpu).unwrap(),
            ),
        ];
        let path = write_lora(dir.path(), &peft);
        let mut t = transformer(Family::CogVideoX);
        apply_lora(&mut t, &[LoraSpec::new(&path, 0.5)]).unwrap();

        assert!(t.weights().contains("blocks.0.proj.lora_A.style.weight"));
        assert!(t.weights().contains("blocks.0.proj.lora_B.style.weight"));
        let adapter = &t.adapters()[0];
        assert_eq!(adapter.name, "style");
        assert_eq!(adapter.scale, 1.0);
        assert_eq!(adapter.targets, vec!["blocks.0.proj".to_string()]);

        let layer = t.linear("blocks.0.proj").unwrap();
        assert_eq!(layer.num_adapters(), 1);
        let x = Tensor::new(&[[1.0f32, 1.0]], &Device::Cpu).unwrap();
        let y = layer.forward(&x).unwrap().to_vec2::<f32>().unwrap();
        // identity + 0.5 * [[1, 2], [0, 0]]
        assert_eq!(y, vec![vec![2.5, 1.0]]);
    }

    #[test]
    fn test_unknown_target_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lora(
            dir.path(),
            &[(
                "lora_unet_nowhere.lora_down.weight",
                Tensor::new(&[[1.0f32, 2.0]], &Device::Cpu).unwrap(),
            )],
        );
        let mut t = transformer(Family::CogVideoX);
        let err = apply_lora(&mut t, &[LoraSpec::new(&path, 1.0)]).unwrap_err();
        assert!(matches!(err, LoaderError::InvalidLora { .. }));
        assert!(t.adapters().is_empty());
    }

    #[test]
    fn test_scalar_up_matrix_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_lora(
            dir.path(),
            &[
                (
                    "lora_unet_blocks_0_proj.lora_down.weight",
                    Tensor::new(&[[1.0f32, 2.0]], &Device::Cpu).unwrap(),
                ),
                (
                    "lora_unet_blocks_0_proj.lora_up.weight",
                    Tensor::new(1.0f32, &Device::Cpu).unwrap(),
                ),
            ],
        );
        let mut t = transformer(Family::Fun(FunRelease::V1_1));
        let before = t.weights().get("blocks.0.proj.weight").unwrap().to_dense(DType::F32).unwrap();
        let err = apply_lora(&mut t, &[LoraSpec::new(&path, 1.0)]).unwrap_err();
        assert!(matches!(err, LoaderError::InvalidLora { .. }));
        let after = t.weights().get("blocks.0.proj.weight").unwrap().to_dense(DType::F32).unwrap();
        assert_eq!(before.to_vec2::<f32>().unwrap(), after.to_vec2::<f32>().unwrap());
    }
}
