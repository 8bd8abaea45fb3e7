use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::{parse_inputs, InputField, Node, NodeContext, NodeOutput, NodeSchema, CATEGORY, PIPELINE_TYPE};
use crate::device::{DeviceTier, Precision};
use crate::error::{LoaderError, Result};
use crate::hub::ensure_snapshot;
use crate::patch::{BlockPatch, PabConfig};
use crate::pipeline::{Pipeline, PipelineHandle, PipelineKind};
use crate::resolve::{resolve_gguf, resolve_gguf_vae};
use crate::scheduler::DdimScheduler;
use crate::transform::{apply_stages, CompileMode, Stage};
use crate::transformer::{Architecture, Transformer, TransformerConfig};
use crate::vae::Vae;
use crate::variant::GgufVariant;
use crate::weights::WeightMap;

#[derive(Debug, Clone, Deserialize)]
pub struct GgufInputs {
    pub model: String,
    #[serde(default)]
    pub vae_precision: Precision,
    #[serde(default)]
    pub fp8_fastmode: bool,
    #[serde(default)]
    pub load_device: DeviceTier,
    #[serde(default)]
    pub enable_sequential_cpu_offload: bool,
    #[serde(default)]
    pub pab_config: Option<PabConfig>,
    #[serde(default)]
    pub block_edit: Option<Vec<usize>>,
    #[serde(default)]
    pub compile: CompileMode,
}

impl GgufInputs {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            vae_precision: Precision::default(),
            fp8_fastmode: false,
            load_device: DeviceTier::Main,
            enable_sequential_cpu_offload: false,
            pab_config: None,
            block_edit: None,
            compile: CompileMode::Disabled,
        }
    }
}

/// `DownloadAndLoadCogVideoGGUFModel`
#[derive(Debug, Clone, Copy, Default)]
pub struct GgufModelLoader;

impl GgufModelLoader {
    pub fn load(&self, ctx: &NodeContext, inputs: GgufInputs) -> Result<PipelineHandle> {
        ctx.begin_load()?;
        if inputs.compile == CompileMode::Onediff {
            return Err(LoaderError::invalid_input(
                "compile",
                "quantized checkpoints only support per-block compilation",
            ));
        }
        let variant = GgufVariant::parse(&inputs.model)?;
        let vae_dtype = inputs.vae_precision.dtype();
        let offload_device = ctx.devices.offload_device();

        let resolution = resolve_gguf(&variant, &ctx.paths);
        ensure_snapshot(
            ctx.fetcher.as_ref(),
            &resolution.snapshot_request(),
            &resolution.model_path,
        )?;

        let mut config = TransformerConfig::preset(variant.size())?;
        config.in_channels = variant.in_channels();
        let patch = inputs
            .pab_config
            .map(|config| Arc::new(config) as Arc<dyn BlockPatch>);
        let arch = Architecture::select(variant.family(), patch);
        let weights = WeightMap::load(&resolution.model_path, offload_device)?;
        let mut transformer = Transformer::from_config(config, arch, weights);

        let mut stages = vec![Stage::QuantizedFp8(variant.size())];
        if let Some(blocks) = inputs.block_edit.filter(|b| !b.is_empty()) {
            stages.push(Stage::RemoveBlocks(blocks));
        }
        stages.push(Stage::Place(inputs.load_device));
        if inputs.fp8_fastmode {
            stages.push(Stage::Fp8FastMode(vae_dtype));
        }
        if inputs.compile == CompileMode::Torch {
            stages.push(Stage::CompileBlocks {
                channels_last: false,
            });
        }
        apply_stages(&mut transformer, &stages, ctx.devices.as_ref())?;

        let scheduler_config = resolution.scheduler.json()?;
        let scheduler = DdimScheduler::from_preset(resolution.scheduler)?;

        let vae_resolution = resolve_gguf_vae(&ctx.paths);
        ensure_snapshot(
            ctx.fetcher.as_ref(),
            &vae_resolution.snapshot_request(),
            &vae_resolution.vae_path,
        )?;
        let mut vae = Vae::from_single_file(
            &vae_resolution.vae_path,
            transformer.arch().family(),
            offload_device,
        )?;
        vae.cast(vae_dtype)?;

        let kind = PipelineKind::select(variant.family(), variant.capability());
        let mut pipe = Pipeline::new(kind, transformer, vae, scheduler);
        if inputs.enable_sequential_cpu_offload {
            pipe.enable_sequential_cpu_offload(ctx.devices.as_ref())?;
        }

        info!("Loaded {} as {}", variant, kind.name());
        Ok(PipelineHandle::new(
            pipe,
            vae_dtype,
            variant.file_name(),
            false,
            scheduler_config,
            variant.file_name(),
        ))
    }
}

impl Node for GgufModelLoader {
    fn schema(&self) -> NodeSchema {
        NodeSchema {
            name: "DownloadAndLoadCogVideoGGUFModel",
            display_name: "(Down)load CogVideo GGUF Model",
            category: CATEGORY,
            description: "Downloads and loads a quantized single-file CogVideo transformer with the shared VAE",
            required: vec![
                InputField::choice("model", GgufVariant::KNOWN, None),
                InputField::choice("vae_precision", Precision::CHOICES, Some("bf16"))
                    .with_tooltip("VAE dtype"),
                InputField::boolean("fp8_fastmode", false)
                    .with_tooltip("also quantizes linear layer activations to fp8, needs hardware fp8 support"),
                InputField::choice(
                    "load_device",
                    &["main_device", "offload_device"],
                    Some("main_device"),
                ),
                InputField::boolean("enable_sequential_cpu_offload", false)
                    .with_tooltip("keeps weights on the offload device between modules, lower memory use at the cost of speed"),
            ],
            optional: vec![
                InputField::custom("pab_config", "PAB_CONFIG"),
                InputField::custom("block_edit", "TRANSFORMERBLOCKS"),
                InputField::choice("compile", CompileMode::QUANTIZED_CHOICES, Some("disabled")),
            ],
            return_types: vec![PIPELINE_TYPE],
            return_names: vec!["cogvideo_pipe"],
        }
    }

    fn invoke(&self, ctx: &NodeContext, inputs: Value) -> Result<Vec<NodeOutput>> {
        let inputs: GgufInputs = parse_inputs(inputs)?;
        Ok(vec![NodeOutput::Pipeline(self.load(ctx, inputs)?)])
    }
}
