use std::fmt;
use std::str::FromStr;

use candle_core::DType;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LoaderError, Result};
use crate::transformer::{Fp8Compute, Transformer};
use crate::variant::ModelSize;
use crate::weights::{Fp8Tensor, Weight};

/// Parameter names containing any of these keep their precision.
pub const FP8_PROTECTED: &[&str] = &["patch_embed", "lora", "pos_embedding"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fp8Mode {
    #[default]
    Disabled,
    Enabled,
    /// Enabled, plus fp8 activations in linear layers
    FastMode,
}

impl Fp8Mode {
    pub const CHOICES: &'static [&'static str] = &["disabled", "enabled", "fastmode"];
}

impl FromStr for Fp8Mode {
    type Err = LoaderError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "disabled" => Ok(Self::Disabled),
            "enabled" => Ok(Self::Enabled),
            "fastmode" => Ok(Self::FastMode),
            other => Err(LoaderError::invalid_input(
                "fp8_transformer",
                format!("unknown mode '{}'", other),
            )),
        }
    }
}

impl fmt::Display for Fp8Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disabled => "disabled",
            Self::Enabled => "enabled",
            Self::FastMode => "fastmode",
        };
        f.write_str(name)
    }
}

pub fn is_protected(name: &str) -> bool {
    FP8_PROTECTED.iter().any(|keyword| name.contains(keyword))
}

fn to_fp8(weight: &mut Weight) -> Result<bool> {
    if let Weight::Dense(t) = weight {
        if t.dtype().is_float() {
            *weight = Weight::Fp8(Fp8Tensor::quantize(t)?);
            return Ok(true);
        }
    }
    Ok(false)
}

/// Store every unprotected floating parameter as fp8. Returns how many
/// parameters were converted.
pub fn convert_to_fp8(transformer: &mut Transformer, mode: Fp8Mode) -> Result<usize> {
    if mode == Fp8Mode::Disabled {
        return Ok(0);
    }
    let mut converted = 0;
    for (name, weight) in transformer.weights_mut().iter_mut() {
        if !is_protected(name) && to_fp8(weight)? {
            converted += 1;
        }
    }
    let compute = Fp8Compute {
        dtype: transformer.compute_dtype(),
        fast: mode == Fp8Mode::FastMode,
    };
    transformer.set_fp8_compute(compute);
    info!("Converted {} parameters to fp8 ({})", converted, mode);
    Ok(converted)
}

/// Storage for quantized single-file checkpoints: the 2b model keeps its
/// positional embedding in fp16, everything else floating goes to fp8.
pub fn apply_quantized_policy(transformer: &mut Transformer, size: ModelSize) -> Result<usize> {
    let mut converted = 0;
    for (name, weight) in transformer.weights_mut().iter_mut() {
        if size == ModelSize::TwoB && name == "pos_embedding" {
            if let Weight::Dense(t) = weight {
                *t = t.to_dtype(DType::F16)?;
            }
            continue;
        }
        if to_fp8(weight)? {
            converted += 1;
        }
    }
    info!("Stored {} parameters as fp8 ({})", converted, size.tag());
    Ok(converted)
}

/// Compute fp8 linear layers in `dtype` with fp8 activations.
pub fn enable_fp8_linear(transformer: &mut Transformer, dtype: DType) {
    transformer.set_fp8_compute(Fp8Compute { dtype, fast: true });
}
