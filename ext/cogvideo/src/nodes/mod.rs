//! Loader nodes exposed to the graph host.
//!
//! Every node declares a [`NodeSchema`] the host renders and validates
//! against, and an `invoke` that runs one synchronous load:
//! version check, cache clear, resolve, fetch, construct, transform, assemble.

pub mod controlnet;
pub mod gguf;
pub mod model;
pub mod tora;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::compat::check_backend_version;
use crate::config::{LoaderConfig, ModelPaths};
use crate::controlnet::ControlNetModel;
use crate::device::{CandleDevices, DeviceManager};
use crate::error::{LoaderError, Result};
use crate::hub::{HfHubFetcher, SnapshotFetcher};
use crate::pipeline::PipelineHandle;
use crate::tora::ToraModel;

pub use controlnet::ControlNetLoader;
pub use gguf::GgufModelLoader;
pub use model::ModelLoader;
pub use tora::ToraLoader;

pub const CATEGORY: &str = "CogVideoWrapper";

pub const PIPELINE_TYPE: &str = "COGVIDEOPIPE";
pub const CONTROLNET_TYPE: &str = "COGVIDECONTROLNETMODEL";
pub const TORA_TYPE: &str = "TORAMODEL";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputKind {
    Choice {
        options: Vec<String>,
        default: Option<String>,
    },
    Boolean {
        default: bool,
    },
    /// Value produced by another node, passed through as JSON
    Custom {
        type_tag: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputField {
    pub name: String,
    #[serde(flatten)]
    pub kind: InputKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tooltip: Option<String>,
}

impl InputField {
    pub fn choice(name: &str, options: &[&str], default: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            kind: InputKind::Choice {
                options: options.iter().map(|o| o.to_string()).collect(),
                default: default.map(str::to_string),
            },
            tooltip: None,
        }
    }

    pub fn boolean(name: &str, default: bool) -> Self {
        Self {
            name: name.to_string(),
            kind: InputKind::Boolean { default },
            tooltip: None,
        }
    }

    pub fn custom(name: &str, type_tag: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: InputKind::Custom {
                type_tag: type_tag.to_string(),
            },
            tooltip: None,
        }
    }

    pub fn with_tooltip(mut self, tooltip: &str) -> Self {
        self.tooltip = Some(tooltip.to_string());
        self
    }

    fn has_default(&self) -> bool {
        match &self.kind {
            InputKind::Choice { default, .. } => default.is_some(),
            InputKind::Boolean { .. } => true,
            InputKind::Custom { .. } => false,
        }
    }

    fn validate(&self, value: &Value) -> Result<()> {
        match &self.kind {
            InputKind::Choice { options, .. } => {
                let choice = value.as_str().ok_or_else(|| {
                    LoaderError::invalid_input(&self.name, format!("expected a string, got {}", value))
                })?;
                if !options.iter().any(|o| o == choice) {
                    return Err(LoaderError::invalid_input(
                        &self.name,
                        format!("'{}' is not one of [{}]", choice, options.join(", ")),
                    ));
                }
            }
            InputKind::Boolean { .. } => {
                if !value.is_boolean() {
                    return Err(LoaderError::invalid_input(
                        &self.name,
                        format!("expected a boolean, got {}", value),
                    ));
                }
            }
            InputKind::Custom { .. } => {}
        }
        Ok(())
    }
}

/// What a node declares to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSchema {
    pub name: &'static str,
    pub display_name: &'static str,
    pub category: &'static str,
    pub description: &'static str,
    pub required: Vec<InputField>,
    pub optional: Vec<InputField>,
    pub return_types: Vec<&'static str>,
    pub return_names: Vec<&'static str>,
}

impl NodeSchema {
    /// Check raw host inputs against the declared fields.
    ///
    /// Optional fields may be absent or null. Unknown keys are ignored.
    pub fn validate(&self, inputs: &Value) -> Result<()> {
        let map = inputs.as_object().ok_or_else(|| {
            LoaderError::invalid_input("inputs", format!("expected an object, got {}", inputs))
        })?;

        for field in &self.required {
            match map.get(&field.name) {
                Some(value) => field.validate(value)?,
                None if field.has_default() => {}
                None => {
                    return Err(LoaderError::invalid_input(
                        &field.name,
                        "missing required input",
                    ))
                }
            }
        }
        for field in &self.optional {
            match map.get(&field.name) {
                Some(Value::Null) | None => {}
                Some(value) => field.validate(value)?,
            }
        }
        for key in map.keys() {
            let declared = self
                .required
                .iter()
                .chain(&self.optional)
                .any(|f| &f.name == key);
            if !declared {
                warn!("{}: ignoring unknown input '{}'", self.name, key);
            }
        }
        Ok(())
    }
}

/// A single value returned to the host.
#[derive(Debug, Clone)]
pub enum NodeOutput {
    Pipeline(PipelineHandle),
    ControlNet(Arc<ControlNetModel>),
    Tora(Arc<ToraModel>),
}

impl NodeOutput {
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Pipeline(_) => PIPELINE_TYPE,
            Self::ControlNet(_) => CONTROLNET_TYPE,
            Self::Tora(_) => TORA_TYPE,
        }
    }

    pub fn into_pipeline(self) -> Option<PipelineHandle> {
        match self {
            Self::Pipeline(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn into_controlnet(self) -> Option<Arc<ControlNetModel>> {
        match self {
            Self::ControlNet(model) => Some(model),
            _ => None,
        }
    }

    pub fn into_tora(self) -> Option<Arc<ToraModel>> {
        match self {
            Self::Tora(model) => Some(model),
            _ => None,
        }
    }
}

/// Host services a node needs for one invocation.
#[derive(Clone)]
pub struct NodeContext {
    pub paths: ModelPaths,
    pub devices: Arc<dyn DeviceManager>,
    pub fetcher: Arc<dyn SnapshotFetcher>,
    /// Pipeline backend version reported by the host
    pub backend_version: String,
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("paths", &self.paths)
            .field("compute_device", self.devices.compute_device())
            .field("offload_device", self.devices.offload_device())
            .field("backend_version", &self.backend_version)
            .finish()
    }
}

impl NodeContext {
    pub fn new(
        paths: ModelPaths,
        devices: Arc<dyn DeviceManager>,
        fetcher: Arc<dyn SnapshotFetcher>,
        backend_version: impl Into<String>,
    ) -> Self {
        Self {
            paths,
            devices,
            fetcher,
            backend_version: backend_version.into(),
        }
    }

    /// Candle devices and the hub client, as configured.
    pub fn from_config(config: &LoaderConfig) -> Result<Self> {
        let devices = CandleDevices::from_kinds(config.device, config.offload_device)?;
        let fetcher = HfHubFetcher::new()
            .with_cache_dir(config.hf_cache_dir.clone())
            .with_token(config.hf_token.clone())
            .with_progress(config.show_progress);
        Ok(Self::new(
            config.paths(),
            Arc::new(devices),
            Arc::new(fetcher),
            config.backend_version.clone(),
        ))
    }

    /// Run at the start of every load.
    pub(crate) fn begin_load(&self) -> Result<()> {
        check_backend_version(&self.backend_version)?;
        self.devices.soft_empty_cache();
        Ok(())
    }
}

pub trait Node: Send + Sync {
    fn schema(&self) -> NodeSchema;

    /// Run the node on already validated inputs.
    fn invoke(&self, ctx: &NodeContext, inputs: Value) -> Result<Vec<NodeOutput>>;
}

/// Deserialize validated host inputs into a node's typed input struct.
pub(crate) fn parse_inputs<T: DeserializeOwned>(inputs: Value) -> Result<T> {
    // optional inputs the host left unconnected arrive as null
    let inputs = match inputs {
        Value::Object(map) => Value::Object(map.into_iter().filter(|(_, v)| !v.is_null()).collect()),
        other => other,
    };
    serde_json::from_value(inputs).map_err(|e| LoaderError::invalid_input("inputs", e.to_string()))
}

/// Node type name to node.
pub struct NodeRegistry {
    nodes: BTreeMap<&'static str, Box<dyn Node>>,
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.nodes.keys()).finish()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(ModelLoader));
        registry.register(Box::new(GgufModelLoader));
        registry.register(Box::new(ControlNetLoader));
        registry.register(Box::new(ToraLoader));
        registry
    }
}

impl NodeRegistry {
    /// The four loader nodes.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn empty() -> Self {
        Self {
            nodes: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, node: Box<dyn Node>) {
        let name = node.schema().name;
        if self.nodes.insert(name, node).is_some() {
            warn!("node {} registered twice, keeping the last one", name);
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.nodes.keys().copied()
    }

    pub fn display_names(&self) -> BTreeMap<&'static str, &'static str> {
        self.nodes
            .values()
            .map(|node| {
                let schema = node.schema();
                (schema.name, schema.display_name)
            })
            .collect()
    }

    pub fn schema(&self, name: &str) -> Result<NodeSchema> {
        Ok(self.node(name)?.schema())
    }

    pub fn invoke(&self, name: &str, ctx: &NodeContext, inputs: &Value) -> Result<Vec<NodeOutput>> {
        let node = self.node(name)?;
        let schema = node.schema();
        schema.validate(inputs)?;
        debug!("invoking {}", name);
        let outputs = node.invoke(ctx, inputs.clone())?;
        debug_assert_eq!(outputs.len(), schema.return_types.len());
        Ok(outputs)
    }

    fn node(&self, name: &str) -> Result<&dyn Node> {
        self.nodes
            .get(name)
            .map(|n| n.as_ref())
            .ok_or_else(|| LoaderError::UnknownNode(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_names() {
        let registry = NodeRegistry::new();
        let names: Vec<_> = registry.names().collect();
        assert_eq!(
            names,
            vec![
                "DownloadAndLoadCogVideoControlNet",
                "DownloadAndLoadCogVideoGGUFModel",
                "DownloadAndLoadCogVideoModel",
                "DownloadAndLoadToraModel",
            ]
        );
        let display = registry.display_names();
        assert_eq!(display["DownloadAndLoadCogVideoModel"], "(Down)load CogVideo Model");
        assert_eq!(display["DownloadAndLoadToraModel"], "(Down)load Tora Model");
    }

    #[test]
    fn test_every_schema_in_category() {
        let registry = NodeRegistry::new();
        for name in registry.names() {
            let schema = registry.schema(name).unwrap();
            assert_eq!(schema.category, CATEGORY);
            assert_eq!(schema.return_types.len(), schema.return_names.len());
        }
    }

    #[test]
    fn test_validate_choices() {
        let schema = ModelLoader.schema();
        assert!(schema
            .validate(&json!({"model": "THUDM/CogVideoX-2b", "precision": "fp16"}))
            .is_ok());

        let err = schema
            .validate(&json!({"model": "THUDM/CogVideoX-2b", "precision": "int4"}))
            .unwrap_err();
        assert!(matches!(err, LoaderError::InvalidInput { ref field, .. } if field == "precision"));

        let err = schema
            .validate(&json!({"model": "someone/unlisted"}))
            .unwrap_err();
        assert!(matches!(err, LoaderError::InvalidInput { ref field, .. } if field == "model"));

        assert!(schema
            .validate(&json!({"model": "THUDM/CogVideoX-2b", "enable_sequential_cpu_offload": "yes"}))
            .is_err());
        assert!(schema.validate(&json!({"precision": "fp16"})).is_err());
        assert!(schema.validate(&json!(["THUDM/CogVideoX-2b"])).is_err());
    }

    #[test]
    fn test_validate_optional_null() {
        let schema = ModelLoader.schema();
        assert!(schema
            .validate(&json!({"model": "THUDM/CogVideoX-5b", "pab_config": null, "lora": null}))
            .is_ok());
    }

    #[test]
    fn test_unknown_node() {
        let registry = NodeRegistry::new();
        let ctx = NodeContext::new(
            ModelPaths::new("/nonexistent"),
            Arc::new(CandleDevices::cpu()),
            Arc::new(HfHubFetcher::new()),
            "0.31.0",
        );
        let err = registry.invoke("LoadSomethingElse", &ctx, &json!({})).unwrap_err();
        assert!(matches!(err, LoaderError::UnknownNode(_)));
    }

    #[test]
    fn test_parse_inputs_drops_nulls() {
        #[derive(serde::Deserialize)]
        struct Inputs {
            #[serde(default)]
            block_edit: Option<Vec<usize>>,
        }
        let parsed: Inputs = parse_inputs(json!({"block_edit": null})).unwrap();
        assert!(parsed.block_edit.is_none());
    }
}
