//! The video transformer parameter container.
//!
//! Network code outside this crate builds its layers from a [`Transformer`]
//! through [`Transformer::var_builder`] and [`Transformer::linear`]; both honor
//! whatever storage the transform stages left each weight in.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use candle_core::{DType, Device, Module, Result as CandleResult, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::quantized_nn;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LoaderError, Result};
use crate::patch::BlockPatch;
use crate::transform::compile::BlockCompilation;
use crate::variant::{Family, ModelSize};
use crate::weights::{Fp8Linear, Weight, WeightMap};

const TRANSFORMER_2B: &str = include_str!("../configs/transformer_config_2b.json");
const TRANSFORMER_5B: &str = include_str!("../configs/transformer_config_5b.json");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArchFamily {
    Standard,
    Fun,
}

/// Transformer architecture: base family plus an optional block patch.
#[derive(Debug, Clone)]
pub struct Architecture {
    family: ArchFamily,
    patch: Option<Arc<dyn BlockPatch>>,
}

impl Architecture {
    /// Pure function of the model family and whether a patch was requested.
    pub fn select(family: Family, patch: Option<Arc<dyn BlockPatch>>) -> Self {
        let family = if family.is_fun() {
            ArchFamily::Fun
        } else {
            ArchFamily::Standard
        };
        Self { family, patch }
    }

    pub fn family(&self) -> ArchFamily {
        self.family
    }

    pub fn patch(&self) -> Option<&Arc<dyn BlockPatch>> {
        self.patch.as_ref()
    }

    pub fn is_patched(&self) -> bool {
        self.patch.is_some()
    }

    pub fn name(&self) -> String {
        let base = match self.family {
            ArchFamily::Standard => "CogVideoXTransformer3DModel",
            ArchFamily::Fun => "CogVideoXTransformer3DModelFun",
        };
        match &self.patch {
            Some(patch) => format!("{}+{}", base, patch.name()),
            None => base.to_string(),
        }
    }
}

/// `config.json` of a transformer checkpoint.
///
/// Fields the loader reads are typed; the rest is carried verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    pub num_attention_heads: usize,
    pub attention_head_dim: usize,
    pub in_channels: usize,
    #[serde(default)]
    pub out_channels: Option<usize>,
    pub num_layers: usize,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default)]
    pub text_embed_dim: Option<usize>,
    #[serde(default)]
    pub use_rotary_positional_embeddings: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_patch_size() -> usize {
    2
}

impl TransformerConfig {
    /// Shipped configuration for single-file checkpoints, which carry none.
    pub fn preset(size: ModelSize) -> Result<Self> {
        let raw = match size {
            ModelSize::TwoB => TRANSFORMER_2B,
            ModelSize::FiveB => TRANSFORMER_5B,
        };
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn hidden_size(&self) -> usize {
        self.num_attention_heads * self.attention_head_dim
    }
}

/// Injected low-rank adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct LoraAdapter {
    pub name: String,
    pub strength: f64,
    /// `alpha / rank`
    pub scale: f64,
    /// Module prefixes carrying `lora_A.<name>` / `lora_B.<name>` weights
    pub targets: Vec<String>,
}

impl LoraAdapter {
    pub fn effective_scale(&self) -> f64 {
        self.strength * self.scale
    }
}

/// How fp8 linear weights are computed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fp8Compute {
    pub dtype: DType,
    /// Quantize activations as well as weights
    pub fast: bool,
}

pub struct Transformer {
    arch: Architecture,
    config: TransformerConfig,
    weights: WeightMap,
    adapters: Vec<LoraAdapter>,
    compute_dtype: DType,
    fp8_compute: Option<Fp8Compute>,
    compilation: Option<BlockCompilation>,
}

impl fmt::Debug for Transformer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transformer")
            .field("arch", &self.arch.name())
            .field("num_layers", &self.config.num_layers)
            .field("parameters", &self.weights.len())
            .field("adapters", &self.adapters.len())
            .field("compute_dtype", &self.compute_dtype)
            .field("fp8_compute", &self.fp8_compute)
            .field("compiled", &self.compilation.is_some())
            .finish()
    }
}

impl Transformer {
    /// Load `config.json` and every safetensors shard of a diffusers
    /// `transformer/` directory.
    pub fn from_pretrained(dir: &Path, arch: Architecture, device: &Device) -> Result<Self> {
        let config_path = dir.join("config.json");
        if !config_path.exists() {
            return Err(LoaderError::MissingWeights(config_path));
        }
        let config = TransformerConfig::from_file(&config_path)?;
        let weights = WeightMap::load(dir, device)?;
        info!(
            "Loaded {} ({} parameters) from {}",
            arch.name(),
            weights.len(),
            dir.display()
        );
        Ok(Self::from_config(config, arch, weights))
    }

    pub fn from_config(config: TransformerConfig, arch: Architecture, weights: WeightMap) -> Self {
        let compute_dtype = weights
            .iter()
            .find_map(|(_, w)| w.dtype().filter(|d| d.is_float()))
            .unwrap_or(DType::F32);
        Self {
            arch,
            config,
            weights,
            adapters: Vec::new(),
            compute_dtype,
            fp8_compute: None,
            compilation: None,
        }
    }

    pub fn arch(&self) -> &Architecture {
        &self.arch
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    pub(crate) fn config_mut(&mut self) -> &mut TransformerConfig {
        &mut self.config
    }

    pub fn weights(&self) -> &WeightMap {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut WeightMap {
        &mut self.weights
    }

    pub fn num_blocks(&self) -> usize {
        self.config.num_layers
    }

    pub fn adapters(&self) -> &[LoraAdapter] {
        &self.adapters
    }

    pub(crate) fn adapters_mut(&mut self) -> &mut Vec<LoraAdapter> {
        &mut self.adapters
    }

    pub(crate) fn push_adapter(&mut self, adapter: LoraAdapter) {
        self.adapters.push(adapter);
    }

    pub fn compute_dtype(&self) -> DType {
        self.compute_dtype
    }

    pub(crate) fn set_compute_dtype(&mut self, dtype: DType) {
        self.compute_dtype = dtype;
    }

    pub fn fp8_compute(&self) -> Option<Fp8Compute> {
        self.fp8_compute
    }

    pub(crate) fn set_fp8_compute(&mut self, compute: Fp8Compute) {
        self.fp8_compute = Some(compute);
    }

    pub fn compilation(&self) -> Option<&BlockCompilation> {
        self.compilation.as_ref()
    }

    pub(crate) fn set_compilation(&mut self, compilation: BlockCompilation) {
        self.compilation = Some(compilation);
    }

    pub fn to_device(&mut self, device: &Device) -> Result<()> {
        self.weights.to_device(device)
    }

    pub fn var_builder(&self, device: &Device) -> Result<VarBuilder<'static>> {
        self.weights.var_builder(self.compute_dtype, device)
    }

    /// The linear layer stored under `prefix` (`<prefix>.weight`, optional
    /// `<prefix>.bias`), with any injected adapters targeting it.
    pub fn linear(&self, prefix: &str) -> Result<AdaptedLinear> {
        let weight = self.weights.require(&format!("{}.weight", prefix))?;
        let bias = match self.weights.get(&format!("{}.bias", prefix)) {
            Some(b) => Some(b.to_dense(self.compute_dtype)?),
            None => None,
        };

        let base = match weight {
            Weight::Dense(w) => BaseLinear::Dense(candle_nn::Linear::new(w.clone(), bias)),
            Weight::Fp8(w) => {
                let compute = self.fp8_compute.unwrap_or(Fp8Compute {
                    dtype: self.compute_dtype,
                    fast: false,
                });
                BaseLinear::Fp8(Fp8Linear::new(w.clone(), bias, compute.dtype, compute.fast))
            }
            Weight::Quantized(q) => {
                let bias = bias.map(|b| b.to_dtype(DType::F32)).transpose()?;
                BaseLinear::Quantized(quantized_nn::Linear::from_arc(q.clone(), bias)?)
            }
        };

        let mut branches = Vec::new();
        for adapter in self.adapters.iter().filter(|a| a.targets.iter().any(|t| t == prefix)) {
            let down = self
                .weights
                .require(&format!("{}.lora_A.{}.weight", prefix, adapter.name))?
                .to_dense(self.compute_dtype)?;
            let up = self
                .weights
                .require(&format!("{}.lora_B.{}.weight", prefix, adapter.name))?
                .to_dense(self.compute_dtype)?;
            branches.push(LoraBranch {
                down: candle_nn::Linear::new(down, None),
                up: candle_nn::Linear::new(up, None),
                scale: adapter.effective_scale(),
            });
        }

        Ok(AdaptedLinear { base, branches })
    }
}

#[derive(Debug, Clone)]
enum BaseLinear {
    Dense(candle_nn::Linear),
    Fp8(Fp8Linear),
    Quantized(quantized_nn::Linear),
}

#[derive(Debug, Clone)]
struct LoraBranch {
    down: candle_nn::Linear,
    up: candle_nn::Linear,
    scale: f64,
}

/// A linear layer in whatever storage its weight is in, plus adapter branches.
///
/// `y = base(x) + Σ scale · up(down(x))`
#[derive(Debug, Clone)]
pub struct AdaptedLinear {
    base: BaseLinear,
    branches: Vec<LoraBranch>,
}

impl AdaptedLinear {
    pub fn num_adapters(&self) -> usize {
        self.branches.len()
    }

    pub fn is_fp8(&self) -> bool {
        matches!(self.base, BaseLinear::Fp8(_))
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self.base, BaseLinear::Quantized(_))
    }
}

impl Module for AdaptedLinear {
    fn forward(&self, xs: &Tensor) -> CandleResult<Tensor> {
        let mut ys = match &self.base {
            BaseLinear::Dense(l) => l.forward(xs)?,
            BaseLinear::Fp8(l) => l.forward(xs)?,
            BaseLinear::Quantized(l) => l.forward(&xs.to_dtype(DType::F32)?)?.to_dtype(xs.dtype())?,
        };
        for branch in &self.branches {
            let delta = branch.up.forward(&branch.down.forward(xs)?)?;
            ys = (&ys + (delta.to_dtype(ys.dtype())? * branch.scale)?)?;
        }
        Ok(ys)
    }
}
