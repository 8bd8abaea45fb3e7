use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::{parse_inputs, InputField, Node, NodeContext, NodeOutput, NodeSchema, CATEGORY, PIPELINE_TYPE};
use crate::device::{DeviceTier, Precision};
use crate::error::Result;
use crate::hub::ensure_snapshot;
use crate::patch::{BlockPatch, PabConfig};
use crate::pipeline::{Pipeline, PipelineHandle, PipelineKind};
use crate::resolve::resolve;
use crate::scheduler::DdimScheduler;
use crate::transform::compile::plan_pipeline;
use crate::transform::{apply_stages, CompileMode, Fp8Mode, LoraSpec, Stage};
use crate::transformer::{Architecture, Transformer};
use crate::vae::Vae;
use crate::variant::{Capability, ModelVariant};

#[derive(Debug, Clone, Deserialize)]
pub struct ModelInputs {
    pub model: String,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default)]
    pub fp8_transformer: Fp8Mode,
    #[serde(default)]
    pub compile: CompileMode,
    #[serde(default)]
    pub enable_sequential_cpu_offload: bool,
    #[serde(default)]
    pub pab_config: Option<PabConfig>,
    #[serde(default)]
    pub block_edit: Option<Vec<usize>>,
    #[serde(default)]
    pub lora: Option<Vec<LoraSpec>>,
}

impl ModelInputs {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            precision: Precision::default(),
            fp8_transformer: Fp8Mode::Disabled,
            compile: CompileMode::Disabled,
            enable_sequential_cpu_offload: false,
            pab_config: None,
            block_edit: None,
            lora: None,
        }
    }
}

/// `DownloadAndLoadCogVideoModel`
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelLoader;

impl ModelLoader {
    pub fn load(&self, ctx: &NodeContext, inputs: ModelInputs) -> Result<PipelineHandle> {
        ctx.begin_load()?;
        let variant = ModelVariant::parse(&inputs.model)?;
        let dtype = inputs.precision.dtype();
        let offload_device = ctx.devices.offload_device();

        let resolution = resolve(&variant, &ctx.paths);
        ensure_snapshot(
            ctx.fetcher.as_ref(),
            &resolution.snapshot_request(),
            &resolution.marker(),
        )?;

        let patch = inputs
            .pab_config
            .map(|config| Arc::new(config) as Arc<dyn BlockPatch>);
        let arch = Architecture::select(variant.family(), patch);
        let mut transformer =
            Transformer::from_pretrained(&resolution.transformer_dir(), arch, offload_device)?;

        let mut stages = vec![Stage::Cast {
            dtype,
            tier: DeviceTier::Offload,
        }];
        if let Some(lora) = inputs.lora.filter(|l| !l.is_empty()) {
            stages.push(Stage::Lora(lora));
        }
        if let Some(blocks) = inputs.block_edit.filter(|b| !b.is_empty()) {
            stages.push(Stage::RemoveBlocks(blocks));
        }
        if inputs.fp8_transformer != Fp8Mode::Disabled {
            stages.push(Stage::Fp8 {
                mode: inputs.fp8_transformer,
            });
        }
        if inputs.compile == CompileMode::Torch {
            stages.push(Stage::CompileBlocks {
                channels_last: true,
            });
        }
        apply_stages(&mut transformer, &stages, ctx.devices.as_ref())?;

        let scheduler_config = resolution.scheduler.json()?;
        let scheduler = DdimScheduler::from_preset(resolution.scheduler)?;

        let mut vae = Vae::from_pretrained(
            &resolution.vae_dir(),
            transformer.arch().family(),
            offload_device,
        )?;
        vae.cast(dtype)?;

        let kind = PipelineKind::select(variant.family(), variant.capability());
        let mut pipe = Pipeline::new(kind, transformer, vae, scheduler);
        if variant.capability() == Capability::PaddedImageToVideo {
            pipe.set_input_with_padding(false);
        }
        if inputs.enable_sequential_cpu_offload {
            pipe.enable_sequential_cpu_offload(ctx.devices.as_ref())?;
        }
        let onediff = inputs.compile == CompileMode::Onediff;
        if onediff {
            let plan = plan_pipeline(pipe.patch().is_some());
            pipe.compile(plan);
        }

        info!("Loaded {} as {}", variant, kind.name());
        Ok(PipelineHandle::new(
            pipe,
            dtype,
            resolution.base_path,
            onediff,
            scheduler_config,
            variant.repo_id(),
        ))
    }
}

impl Node for ModelLoader {
    fn schema(&self) -> NodeSchema {
        NodeSchema {
            name: "DownloadAndLoadCogVideoModel",
            display_name: "(Down)load CogVideo Model",
            category: CATEGORY,
            description: "Downloads and loads the selected CogVideo model from Huggingface to 'ComfyUI/models/CogVideo'",
            required: vec![InputField::choice("model", ModelVariant::KNOWN, None)],
            optional: vec![
                InputField::choice("precision", Precision::CHOICES, Some("bf16"))
                    .with_tooltip("official recommendation is that 2b model should be fp16, 5b model should be bf16"),
                InputField::choice("fp8_transformer", Fp8Mode::CHOICES, Some("disabled"))
                    .with_tooltip("enabled stores the transformer weights as float8 e4m3fn, fastmode also runs linear layers in fp8"),
                InputField::choice("compile", CompileMode::CHOICES, Some("disabled"))
                    .with_tooltip("torch compiles each transformer block, onediff compiles the whole pipeline ahead of time"),
                InputField::boolean("enable_sequential_cpu_offload", false)
                    .with_tooltip("keeps weights on the offload device between modules, lower memory use at the cost of speed"),
                InputField::custom("pab_config", "PAB_CONFIG"),
                InputField::custom("block_edit", "TRANSFORMERBLOCKS"),
                InputField::custom("lora", "COGLORA"),
            ],
            return_types: vec![PIPELINE_TYPE],
            return_names: vec!["cogvideo_pipe"],
        }
    }

    fn invoke(&self, ctx: &NodeContext, inputs: Value) -> Result<Vec<NodeOutput>> {
        let inputs: ModelInputs = parse_inputs(inputs)?;
        Ok(vec![NodeOutput::Pipeline(self.load(ctx, inputs)?)])
    }
}
