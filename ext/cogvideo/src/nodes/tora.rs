use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::{parse_inputs, InputField, Node, NodeContext, NodeOutput, NodeSchema, CATEGORY, TORA_TYPE};
use crate::error::Result;
use crate::hub::ensure_snapshot;
use crate::resolve::resolve_tora;
use crate::tora::{load_fuser, load_traj_extractor, ToraModel};
use crate::variant::ToraVariant;

#[derive(Debug, Clone, Deserialize)]
pub struct ToraInputs {
    pub model: String,
}

/// `DownloadAndLoadToraModel`
#[derive(Debug, Clone, Copy, Default)]
pub struct ToraLoader;

impl ToraLoader {
    pub fn load(&self, ctx: &NodeContext, inputs: ToraInputs) -> Result<ToraModel> {
        ctx.begin_load()?;
        let variant = ToraVariant::parse(&inputs.model)?;
        let resolution = resolve_tora(&variant, &ctx.paths);
        for component in [&resolution.fuser, &resolution.traj_extractor] {
            ensure_snapshot(
                ctx.fetcher.as_ref(),
                &resolution.snapshot_request(component),
                &component.path,
            )?;
        }

        let device = ctx.devices.compute_device();
        let fuser_list = load_fuser(&resolution.fuser.path, device)?;
        let traj_extractor = load_traj_extractor(&resolution.traj_extractor.path, device)?;
        info!("Loaded Tora model {}", variant.repo_id());
        Ok(ToraModel {
            fuser_list,
            traj_extractor,
        })
    }
}

impl Node for ToraLoader {
    fn schema(&self) -> NodeSchema {
        NodeSchema {
            name: "DownloadAndLoadToraModel",
            display_name: "(Down)load Tora Model",
            category: CATEGORY,
            description: "Downloads and loads the Tora trajectory fuser and extractor",
            required: vec![InputField::choice("model", ToraVariant::KNOWN, None)],
            optional: Vec::new(),
            return_types: vec![TORA_TYPE],
            return_names: vec!["tora_model"],
        }
    }

    fn invoke(&self, ctx: &NodeContext, inputs: Value) -> Result<Vec<NodeOutput>> {
        let inputs: ToraInputs = parse_inputs(inputs)?;
        Ok(vec![NodeOutput::Tora(Arc::new(self.load(ctx, inputs)?))])
    }
}
