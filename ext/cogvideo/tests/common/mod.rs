#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Tensor};
use cogvideo::hub::{SnapshotFetcher, SnapshotRequest};
use cogvideo::{CandleDevices, ModelPaths, NodeContext, Result};

pub const HIDDEN: usize = 8;

pub fn tensor(dims: &[usize]) -> Tensor {
    Tensor::randn(0f32, 1f32, dims, &Device::Cpu).unwrap()
}

pub fn save(path: &Path, tensors: Vec<(&str, Tensor)>) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let map: HashMap<String, Tensor> = tensors
        .into_iter()
        .map(|(name, t)| (name.to_string(), t))
        .collect();
    candle_core::safetensors::save(&map, path).unwrap();
}

pub fn transformer_config(num_layers: usize) -> serde_json::Value {
    serde_json::json!({
        "_class_name": "CogVideoXTransformer3DModel",
        "num_attention_heads": 2,
        "attention_head_dim": 4,
        "in_channels": 16,
        "out_channels": 16,
        "num_layers": num_layers,
        "patch_size": 2,
        "text_embed_dim": 4096,
        "use_rotary_positional_embeddings": true
    })
}

pub fn transformer_tensors(num_layers: usize) -> Vec<(String, Tensor)> {
    let mut tensors = vec![
        ("patch_embed.proj.weight".to_string(), tensor(&[HIDDEN, 16])),
        ("patch_embed.proj.bias".to_string(), tensor(&[HIDDEN])),
        ("embedding_pos_embedding".to_string(), tensor(&[4, HIDDEN])),
        ("norm_final.weight".to_string(), tensor(&[HIDDEN])),
        ("proj_out.weight".to_string(), tensor(&[16, HIDDEN])),
    ];
    for i in 0..num_layers {
        for proj in ["to_q", "to_k", "to_v"] {
            tensors.push((
                format!("transformer_blocks.{}.attn1.{}.weight", i, proj),
                tensor(&[HIDDEN, HIDDEN]),
            ));
            tensors.push((
                format!("transformer_blocks.{}.attn1.{}.bias", i, proj),
                tensor(&[HIDDEN]),
            ));
        }
    }
    tensors
}

/// Diffusers layout: `transformer/` and `vae/` under `base`.
pub fn write_model(base: &Path, num_layers: usize) {
    let transformer = base.join("transformer");
    std::fs::create_dir_all(&transformer).unwrap();
    std::fs::write(
        transformer.join("config.json"),
        transformer_config(num_layers).to_string(),
    )
    .unwrap();
    let tensors = transformer_tensors(num_layers);
    let (first, second) = tensors.split_at(tensors.len() / 2);
    // two shards
    save(
        &transformer.join("diffusion_pytorch_model-00001-of-00002.safetensors"),
        first.iter().map(|(n, t)| (n.as_str(), t.clone())).collect(),
    );
    save(
        &transformer.join("diffusion_pytorch_model-00002-of-00002.safetensors"),
        second.iter().map(|(n, t)| (n.as_str(), t.clone())).collect(),
    );

    let vae = base.join("vae");
    std::fs::create_dir_all(&vae).unwrap();
    std::fs::write(
        vae.join("config.json"),
        r#"{"latent_channels": 16, "block_out_channels": [8, 16], "scaling_factor": 0.7}"#,
    )
    .unwrap();
    write_vae_file(&vae.join("diffusion_pytorch_model.safetensors"));
}

pub fn write_vae_file(path: &Path) {
    save(
        path,
        vec![
            ("encoder.conv_in.weight", tensor(&[8, 3, 3, 3])),
            ("decoder.conv_out.weight", tensor(&[3, 8, 3, 3])),
        ],
    );
}

type Populate = Box<dyn Fn(&SnapshotRequest) + Send + Sync>;

/// Records every snapshot request and writes fixture files in place of a
/// real download.
pub struct FakeHub {
    pub requests: Mutex<Vec<SnapshotRequest>>,
    populate: Populate,
}

impl FakeHub {
    pub fn new(populate: impl Fn(&SnapshotRequest) + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            populate: Box::new(populate),
        })
    }

    /// A hub that writes nothing.
    pub fn empty() -> Arc<Self> {
        Self::new(|_| {})
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, i: usize) -> SnapshotRequest {
        self.requests.lock().unwrap()[i].clone()
    }
}

impl SnapshotFetcher for FakeHub {
    fn snapshot(&self, request: &SnapshotRequest) -> Result<()> {
        self.requests.lock().unwrap().push(request.clone());
        (self.populate)(request);
        Ok(())
    }
}

pub fn context(models_dir: &Path, hub: Arc<FakeHub>) -> NodeContext {
    context_with_version(models_dir, hub, "0.31.0")
}

pub fn context_with_version(models_dir: &Path, hub: Arc<FakeHub>, version: &str) -> NodeContext {
    NodeContext::new(
        ModelPaths::new(models_dir),
        Arc::new(CandleDevices::cpu()),
        hub,
        version,
    )
}

pub fn float_dtypes(weights: &cogvideo::weights::WeightMap) -> Vec<(String, Option<DType>)> {
    weights
        .iter()
        .map(|(name, w)| (name.to_string(), w.dtype()))
        .collect()
}
