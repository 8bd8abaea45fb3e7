//! Ordered, individually skippable parameter transforms.
//!
//! Stages run in the order given and mutate the transformer in place. A
//! failing stage leaves the work of earlier stages applied.

pub mod blocks;
pub mod cast;
pub mod compile;
pub mod fp8;
pub mod lora;

use candle_core::DType;
use tracing::debug;

use crate::device::{DeviceManager, DeviceTier};
use crate::error::Result;
use crate::transformer::Transformer;
use crate::variant::ModelSize;

pub use compile::{BlockCompilation, CompileMode, MemoryFormat, PipelineCompilation};
pub use fp8::Fp8Mode;
pub use lora::LoraSpec;

/// One transform step.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// Cast floating parameters and move them to a device tier
    Cast { dtype: DType, tier: DeviceTier },
    /// Move parameters without changing precision
    Place(DeviceTier),
    Lora(Vec<LoraSpec>),
    RemoveBlocks(Vec<usize>),
    /// Convert unprotected floating parameters to fp8
    Fp8 { mode: Fp8Mode },
    /// Storage policy for quantized single-file checkpoints
    QuantizedFp8(ModelSize),
    /// fp8 linear computation in `dtype`, used with quantized checkpoints
    Fp8FastMode(DType),
    /// Per-block compilation
    CompileBlocks { channels_last: bool },
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cast { .. } => "cast",
            Self::Place(_) => "place",
            Self::Lora(_) => "lora",
            Self::RemoveBlocks(_) => "remove_blocks",
            Self::Fp8 { .. } => "fp8",
            Self::QuantizedFp8(_) => "quantized_fp8",
            Self::Fp8FastMode(_) => "fp8_fastmode",
            Self::CompileBlocks { .. } => "compile_blocks",
        }
    }
}

pub fn apply_stages(
    transformer: &mut Transformer,
    stages: &[Stage],
    devices: &dyn DeviceManager,
) -> Result<()> {
    for stage in stages {
        debug!("transform stage {}", stage.name());
        match stage {
            Stage::Cast { dtype, tier } => {
                cast::cast_and_place(transformer, *dtype, devices.device(*tier))?
            }
            Stage::Place(tier) => transformer.to_device(devices.device(*tier))?,
            Stage::Lora(specs) => lora::apply_lora(transformer, specs)?,
            Stage::RemoveBlocks(indices) => blocks::remove_blocks(transformer, indices)?,
            Stage::Fp8 { mode } => {
                fp8::convert_to_fp8(transformer, *mode)?;
            }
            Stage::QuantizedFp8(size) => {
                fp8::apply_quantized_policy(transformer, *size)?;
            }
            Stage::Fp8FastMode(dtype) => fp8::enable_fp8_linear(transformer, *dtype),
            Stage::CompileBlocks { channels_last } => {
                compile::compile_blocks(transformer, *channels_last)
            }
        }
    }
    Ok(())
}
