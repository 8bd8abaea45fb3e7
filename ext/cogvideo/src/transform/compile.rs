//! Compilation plans.
//!
//! Compilation itself belongs to an external backend; the loader only records
//! what should be compiled and with which options.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{LoaderError, Result};
use crate::transformer::Transformer;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompileMode {
    #[default]
    Disabled,
    Onediff,
    Torch,
}

impl CompileMode {
    pub const CHOICES: &'static [&'static str] = &["disabled", "onediff", "torch"];
    /// Quantized checkpoints cannot go through the whole-pipeline backend.
    pub const QUANTIZED_CHOICES: &'static [&'static str] = &["disabled", "torch"];
}

impl FromStr for CompileMode {
    type Err = LoaderError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "disabled" => Ok(Self::Disabled),
            "onediff" => Ok(Self::Onediff),
            "torch" => Ok(Self::Torch),
            other => Err(LoaderError::invalid_input(
                "compile",
                format!("unknown compile mode '{}'", other),
            )),
        }
    }
}

impl fmt::Display for CompileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disabled => "disabled",
            Self::Onediff => "onediff",
            Self::Torch => "torch",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryFormat {
    #[default]
    Contiguous,
    ChannelsLast,
}

/// Each transformer block compiled on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCompilation {
    pub backend: String,
    pub fullgraph: bool,
    pub dynamic: bool,
    /// Fall back to eager execution when a block fails to compile
    pub suppress_errors: bool,
    pub memory_format: MemoryFormat,
    pub blocks: Vec<usize>,
}

/// Ahead-of-time compilation of the whole pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineCompilation {
    pub backend: String,
    pub mode: String,
    pub memory_format: MemoryFormat,
    pub options: BTreeMap<String, serde_json::Value>,
    /// Pipeline components left uncompiled
    pub ignores: Vec<String>,
    pub fuse_qkv_projections: bool,
    /// Environment the backend expects to be set before it runs
    pub env: Vec<(String, String)>,
}

pub fn compile_blocks(transformer: &mut Transformer, channels_last: bool) {
    let plan = BlockCompilation {
        backend: "inductor".to_string(),
        fullgraph: false,
        dynamic: false,
        suppress_errors: true,
        memory_format: if channels_last {
            MemoryFormat::ChannelsLast
        } else {
            MemoryFormat::Contiguous
        },
        blocks: (0..transformer.num_blocks()).collect(),
    };
    info!("Compiling {} transformer blocks", plan.blocks.len());
    transformer.set_compilation(plan);
}

/// Plan for the whole-pipeline backend. Patched attention blocks cannot have
/// their QKV projections fused.
pub fn plan_pipeline(patched: bool) -> PipelineCompilation {
    let options = BTreeMap::from([
        (
            "inductor.optimize_linear_epilogue".to_string(),
            serde_json::Value::Bool(false),
        ),
        (
            "triton.fuse_attention_allow_fp16_reduction".to_string(),
            serde_json::Value::Bool(false),
        ),
    ]);
    PipelineCompilation {
        backend: "nexfort".to_string(),
        mode: "max-optimize:max-autotune:max-autotune".to_string(),
        memory_format: MemoryFormat::ChannelsLast,
        options,
        ignores: vec!["vae".to_string()],
        fuse_qkv_projections: !patched,
        env: vec![("NEXFORT_FX_FORCE_TRITON_SDPA".to_string(), "1".to_string())],
    }
}
