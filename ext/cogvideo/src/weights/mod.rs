//! Named weight storage shared by every model container.

pub mod fp8;
pub mod gguf;

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::quantized::QTensor;
use candle_core::safetensors::Load;
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use memmap2::MmapOptions;
use safetensors::SafeTensors;
use tracing::debug;

use crate::error::{LoaderError, Result};

pub use fp8::{Fp8E4M3, Fp8Linear, Fp8Tensor};
pub use gguf::GgufMetadata;

/// One stored parameter.
#[derive(Debug, Clone)]
pub enum Weight {
    Dense(Tensor),
    Fp8(Fp8Tensor),
    Quantized(Arc<QTensor>),
}

impl Weight {
    pub fn dims(&self) -> &[usize] {
        match self {
            Self::Dense(t) => t.dims(),
            Self::Fp8(t) => t.dims(),
            Self::Quantized(q) => q.shape().dims(),
        }
    }

    pub fn device(&self) -> Device {
        match self {
            Self::Dense(t) => t.device().clone(),
            Self::Fp8(t) => t.device().clone(),
            Self::Quantized(q) => q.device(),
        }
    }

    /// Whether this weight carries floating point values a precision cast applies to.
    pub fn is_float(&self) -> bool {
        match self {
            Self::Dense(t) => t.dtype().is_float(),
            Self::Fp8(_) => true,
            Self::Quantized(_) => false,
        }
    }

    pub fn is_fp8(&self) -> bool {
        matches!(self, Self::Fp8(_))
    }

    /// The dense dtype, `None` for fp8 and quantized storage.
    pub fn dtype(&self) -> Option<DType> {
        match self {
            Self::Dense(t) => Some(t.dtype()),
            _ => None,
        }
    }

    /// Short storage description, e.g. `bf16`, `f8e4m3`, `q4_0`.
    pub fn storage_name(&self) -> String {
        match self {
            Self::Dense(t) => t.dtype().as_str().to_string(),
            Self::Fp8(_) => "f8e4m3".to_string(),
            Self::Quantized(q) => format!("{:?}", q.dtype()).to_lowercase(),
        }
    }

    /// A dense tensor of `dtype`, widening fp8 and dequantizing blocks.
    pub fn to_dense(&self, dtype: DType) -> Result<Tensor> {
        let t = match self {
            Self::Dense(t) => t.to_dtype(dtype)?,
            Self::Fp8(t) => t.dequantize(dtype)?,
            Self::Quantized(q) => q.dequantize(&q.device())?.to_dtype(dtype)?,
        };
        Ok(t)
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        let moved = match self {
            Self::Dense(t) => Self::Dense(t.to_device(device)?),
            Self::Fp8(t) => Self::Fp8(t.to_device(device)?),
            Self::Quantized(q) => {
                if q.device().same_device(device) {
                    Self::Quantized(q.clone())
                } else {
                    // QTensor has no direct transfer; round-trip through the block format
                    let dense = q.dequantize(device)?;
                    Self::Quantized(Arc::new(QTensor::quantize(&dense, q.dtype())?))
                }
            }
        };
        Ok(moved)
    }
}

/// `transformer_blocks.<i>.` index of a parameter name, if any.
pub fn block_index(name: &str) -> Option<usize> {
    let rest = name.strip_prefix("transformer_blocks.")?;
    let (index, _) = rest.split_once('.')?;
    index.parse().ok()
}

/// Ordered name to weight map.
#[derive(Debug, Clone, Default)]
pub struct WeightMap {
    tensors: BTreeMap<String, Weight>,
}

impl WeightMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tensors(tensors: impl IntoIterator<Item = (String, Tensor)>) -> Self {
        Self {
            tensors: tensors
                .into_iter()
                .map(|(name, t)| (name, Weight::Dense(t)))
                .collect(),
        }
    }

    /// Load a checkpoint from a file or a directory of (sharded) safetensors.
    pub fn load(path: &Path, device: &Device) -> Result<Self> {
        if path.is_dir() {
            let files = safetensors_files(path)?;
            if files.is_empty() {
                return Err(LoaderError::MissingWeights(path.to_path_buf()));
            }
            let mut map = Self::new();
            for file in files {
                map.tensors.extend(load_safetensors(&file, device)?);
            }
            return Ok(map);
        }
        if !path.exists() {
            return Err(LoaderError::MissingWeights(path.to_path_buf()));
        }
        let tensors = match path.extension().and_then(|e| e.to_str()) {
            Some("gguf") => gguf::load_gguf(path, device)?,
            _ => load_safetensors(path, device)?,
        };
        Ok(Self { tensors })
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Weight> {
        self.tensors.get(name)
    }

    /// Like `get`, but a missing name is an error.
    pub fn require(&self, name: &str) -> Result<&Weight> {
        self.get(name)
            .ok_or_else(|| LoaderError::MissingTensor(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, weight: Weight) -> Option<Weight> {
        self.tensors.insert(name.into(), weight)
    }

    pub fn remove(&mut self, name: &str) -> Option<Weight> {
        self.tensors.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Weight)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Weight)> {
        self.tensors.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    pub fn retain(&mut self, f: impl FnMut(&String, &mut Weight) -> bool) {
        self.tensors.retain(f)
    }

    pub fn into_inner(self) -> BTreeMap<String, Weight> {
        self.tensors
    }

    /// Cast every floating parameter to `dtype`. Integer payloads and
    /// block-quantized tensors are left as they are.
    pub fn cast(&mut self, dtype: DType) -> Result<()> {
        for weight in self.tensors.values_mut() {
            match weight {
                Weight::Dense(t) if t.dtype().is_float() && t.dtype() != dtype => {
                    *t = t.to_dtype(dtype)?;
                }
                Weight::Fp8(t) => *weight = Weight::Dense(t.dequantize(dtype)?),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn to_device(&mut self, device: &Device) -> Result<()> {
        for weight in self.tensors.values_mut() {
            *weight = weight.to_device(device)?;
        }
        Ok(())
    }

    /// Number of `transformer_blocks.<i>` groups present.
    pub fn num_blocks(&self) -> usize {
        self.names()
            .filter_map(block_index)
            .map(|i| i + 1)
            .max()
            .unwrap_or(0)
    }

    /// A `VarBuilder` over dense views of every weight.
    pub fn var_builder(&self, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
        let mut tensors = HashMap::with_capacity(self.tensors.len());
        for (name, weight) in &self.tensors {
            let dense = weight.to_dense(dtype)?.to_device(device)?;
            tensors.insert(name.clone(), dense);
        }
        Ok(VarBuilder::from_tensors(tensors, dtype, device))
    }
}

impl FromIterator<(String, Weight)> for WeightMap {
    fn from_iter<I: IntoIterator<Item = (String, Weight)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

fn safetensors_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "safetensors"))
        .collect();
    files.sort();
    Ok(files)
}

/// Load a safetensors file.
///
/// `F8_E4M3` views keep their bit patterns as [`Fp8Tensor`]s; `I8` payloads
/// (packed quantized blocks) are reinterpreted byte for byte as `U8`.
pub fn load_safetensors(path: &Path, device: &Device) -> Result<BTreeMap<String, Weight>> {
    let file = File::open(path)?;
    let mmap = unsafe { MmapOptions::new().map(&file)? };
    let safetensors = SafeTensors::deserialize(&mmap).map_err(|e| {
        candle_core::Error::Msg(format!(
            "Failed to deserialize safetensors {}: {}",
            path.display(),
            e
        ))
    })?;

    let mut tensors = BTreeMap::new();
    for (name, view) in safetensors.tensors() {
        // Check dtype as string since F8_E4M3 is not in every safetensors release
        let dtype_str = format!("{:?}", view.dtype());
        let weight = if dtype_str.contains("F8_E4M3") {
            Weight::Fp8(Fp8Tensor::from_raw(view.data(), view.shape(), device)?)
        } else if matches!(view.dtype(), safetensors::Dtype::I8) {
            Weight::Dense(Tensor::from_vec(view.data().to_vec(), view.shape(), device)?)
        } else {
            Weight::Dense(view.load(device)?)
        };
        debug!("{} {:?} {}", name, weight.dims(), weight.storage_name());
        tensors.insert(name, weight);
    }
    Ok(tensors)
}
