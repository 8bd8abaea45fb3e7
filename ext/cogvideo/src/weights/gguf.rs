use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use candle_core::quantized::{gguf_file, GgmlDType};
use candle_core::Device;
use tracing::debug;

use super::Weight;
use crate::error::Result;

/// Metadata extracted from a GGUF file
#[derive(Debug, Clone)]
pub struct GgufMetadata {
    pub architecture: Option<String>,
    pub quantization_version: u32,
    pub model_name: Option<String>,
    pub tensor_count: usize,
    /// Number of tensors per ggml type, e.g. `Q4_0 -> 1200`
    pub dtype_counts: BTreeMap<String, usize>,
    /// Highest `transformer_blocks.<i>` index plus one
    pub num_blocks: usize,
}

impl GgufMetadata {
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let content = gguf_file::Content::read(&mut file)?;
        Ok(Self::from_content(&content))
    }

    pub fn from_content(content: &gguf_file::Content) -> Self {
        let metadata = &content.metadata;
        let string = |key: &str| match metadata.get(key) {
            Some(gguf_file::Value::String(s)) => Some(s.clone()),
            _ => None,
        };

        let quantization_version = match metadata.get("general.quantization_version") {
            Some(gguf_file::Value::U32(n)) => *n,
            _ => 2,
        };

        let mut dtype_counts = BTreeMap::new();
        for info in content.tensor_infos.values() {
            *dtype_counts
                .entry(format!("{:?}", info.ggml_dtype))
                .or_insert(0) += 1;
        }

        let num_blocks = content
            .tensor_infos
            .keys()
            .filter_map(|name| super::block_index(name))
            .map(|i| i + 1)
            .max()
            .unwrap_or(0);

        Self {
            architecture: string("general.architecture"),
            quantization_version,
            model_name: string("general.name"),
            tensor_count: content.tensor_infos.len(),
            dtype_counts,
            num_blocks,
        }
    }
}

/// Read every tensor of a `.gguf` file.
///
/// Float tensors are widened into dense tensors; block-quantized ones are kept
/// as `QTensor`s for the quantized matmul kernels.
pub fn load_gguf(path: &Path, device: &Device) -> Result<BTreeMap<String, Weight>> {
    let mut file = std::fs::File::open(path)?;
    let content = gguf_file::Content::read(&mut file)?;
    let metadata = GgufMetadata::from_content(&content);
    debug!(
        "{}: {} tensors {:?}",
        path.display(),
        metadata.tensor_count,
        metadata.dtype_counts
    );

    let mut weights = BTreeMap::new();
    for name in content.tensor_infos.keys() {
        let qtensor = content.tensor(&mut file, name, device)?;
        let weight = match qtensor.dtype() {
            GgmlDType::F32 | GgmlDType::F16 | GgmlDType::BF16 => {
                Weight::Dense(qtensor.dequantize(device)?)
            }
            _ => Weight::Quantized(Arc::new(qtensor)),
        };
        weights.insert(name.clone(), weight);
    }
    Ok(weights)
}
