use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use super::{parse_inputs, InputField, Node, NodeContext, NodeOutput, NodeSchema, CATEGORY, CONTROLNET_TYPE};
use crate::controlnet::ControlNetModel;
use crate::error::Result;
use crate::hub::ensure_snapshot;
use crate::resolve::resolve_controlnet;
use crate::variant::ControlNetVariant;

#[derive(Debug, Clone, Deserialize)]
pub struct ControlNetInputs {
    pub model: String,
}

/// `DownloadAndLoadCogVideoControlNet`
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlNetLoader;

impl ControlNetLoader {
    pub fn load(&self, ctx: &NodeContext, inputs: ControlNetInputs) -> Result<ControlNetModel> {
        ctx.begin_load()?;
        let variant = ControlNetVariant::parse(&inputs.model)?;
        let resolution = resolve_controlnet(&variant, &ctx.paths);
        ensure_snapshot(
            ctx.fetcher.as_ref(),
            &resolution.snapshot_request(),
            resolution.marker(),
        )?;
        ControlNetModel::from_pretrained(
            &resolution.base_path,
            variant.repo_id(),
            ctx.devices.offload_device(),
        )
    }
}

impl Node for ControlNetLoader {
    fn schema(&self) -> NodeSchema {
        NodeSchema {
            name: "DownloadAndLoadCogVideoControlNet",
            display_name: "(Down)load CogVideo ControlNet",
            category: CATEGORY,
            description: "Downloads and loads a CogVideoX ControlNet",
            required: vec![InputField::choice("model", ControlNetVariant::KNOWN, None)],
            optional: Vec::new(),
            return_types: vec![CONTROLNET_TYPE],
            return_names: vec!["cogvideo_controlnet"],
        }
    }

    fn invoke(&self, ctx: &NodeContext, inputs: Value) -> Result<Vec<NodeOutput>> {
        let inputs: ControlNetInputs = parse_inputs(inputs)?;
        Ok(vec![NodeOutput::ControlNet(Arc::new(self.load(ctx, inputs)?))])
    }
}
