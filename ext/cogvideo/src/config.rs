use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::device::DeviceKind;

/// Minimum pipeline backend version the loader nodes are written against.
pub const MIN_BACKEND_VERSION: &str = "0.31.0";

/// Loader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Root of the host's model folders
    pub models_dir: PathBuf,
    /// Override for `<models_dir>/CogVideo`
    pub cogvideo_dir: Option<PathBuf>,
    /// Hub cache directory, defaults to the hub client's own
    pub hf_cache_dir: Option<PathBuf>,
    /// Access token for gated repositories
    pub hf_token: Option<String>,
    /// Show hub download progress bars
    pub show_progress: bool,
    /// Version of the pipeline backend the host runs
    pub backend_version: String,
    /// Compute device
    pub device: DeviceKind,
    /// Device weights are parked on
    pub offload_device: DeviceKind,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            cogvideo_dir: None,
            hf_cache_dir: None,
            hf_token: None,
            show_progress: false,
            backend_version: MIN_BACKEND_VERSION.to_string(),
            device: DeviceKind::Auto,
            offload_device: DeviceKind::Cpu,
        }
    }
}

impl LoaderConfig {
    /// Defaults overridden by `COGVIDEO_*` / `HF_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("COGVIDEO_MODELS_DIR") {
            config.models_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("COGVIDEO_DIR") {
            config.cogvideo_dir = Some(PathBuf::from(dir));
        }
        if let Ok(dir) = std::env::var("HF_HUB_CACHE") {
            config.hf_cache_dir = Some(PathBuf::from(dir));
        }
        if let Ok(token) = std::env::var("HF_TOKEN") {
            config.hf_token = Some(token);
        }
        if let Ok(version) = std::env::var("COGVIDEO_BACKEND_VERSION") {
            config.backend_version = version;
        }
        if let Some(kind) = std::env::var("COGVIDEO_DEVICE")
            .ok()
            .and_then(|d| d.parse().ok())
        {
            config.device = kind;
        }
        config
    }

    pub fn paths(&self) -> ModelPaths {
        let cogvideo = self
            .cogvideo_dir
            .clone()
            .unwrap_or_else(|| self.models_dir.join("CogVideo"));
        ModelPaths {
            models_dir: self.models_dir.clone(),
            cogvideo_dir: cogvideo,
        }
    }
}

/// On-disk layout of the weight cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    models_dir: PathBuf,
    cogvideo_dir: PathBuf,
}

impl ModelPaths {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        let models_dir = models_dir.into();
        let cogvideo_dir = models_dir.join("CogVideo");
        Self {
            models_dir,
            cogvideo_dir,
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// `<models>/CogVideo`, the default download location
    pub fn cogvideo_dir(&self) -> &Path {
        &self.cogvideo_dir
    }

    /// Where the official Fun releases are installed by their own tooling
    pub fn fun_official_dir(&self) -> PathBuf {
        self.models_dir.join("CogVideoX_Fun")
    }

    /// Shared folder other node packs put single-file diffusion models in
    pub fn diffusion_models_dir(&self) -> PathBuf {
        self.models_dir.join("diffusion_models")
    }

    pub fn gguf_dir(&self) -> PathBuf {
        self.cogvideo_dir.join("GGUF")
    }

    pub fn vae_dir(&self) -> PathBuf {
        self.cogvideo_dir.join("VAE")
    }

    pub fn controlnet_dir(&self) -> PathBuf {
        self.cogvideo_dir.join("ControlNet")
    }

    pub fn tora_dir(&self) -> PathBuf {
        self.cogvideo_dir.join("CogVideoX-5b-Tora")
    }
}
