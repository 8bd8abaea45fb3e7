//! Model-loading nodes for CogVideoX video diffusion pipelines.
//!
//! The crate resolves model identifiers to local paths and hub repositories,
//! fetches missing weights, builds the transformer, VAE and scheduler
//! containers, applies precision and structural transforms, and hands the
//! host an opaque [`PipelineHandle`].

pub mod compat;
pub mod config;
pub mod controlnet;
pub mod device;
pub mod error;
pub mod hub;
pub mod nodes;
pub mod patch;
pub mod pipeline;
pub mod resolve;
pub mod scheduler;
pub mod tora;
pub mod transform;
pub mod transformer;
pub mod vae;
pub mod variant;
pub mod weights;

pub use config::{LoaderConfig, ModelPaths};
pub use device::{CandleDevices, DeviceManager, DeviceTier, Precision};
pub use error::{LoaderError, Result};
pub use hub::{HfHubFetcher, SnapshotFetcher, SnapshotRequest};
pub use nodes::{Node, NodeContext, NodeOutput, NodeRegistry, NodeSchema};
pub use pipeline::{Pipeline, PipelineHandle, PipelineKind};
pub use variant::{ControlNetVariant, GgufVariant, ModelVariant, ToraVariant};

// Configuration detection from build.rs
#[cfg(all(has_metal, not(force_cpu)))]
const DEFAULT_DEVICE: &str = "metal";

#[cfg(all(has_cuda, not(has_metal), not(force_cpu)))]
const DEFAULT_DEVICE: &str = "cuda";

#[cfg(any(force_cpu, not(any(has_metal, has_cuda))))]
const DEFAULT_DEVICE: &str = "cpu";

/// Acceleration compiled into this build.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BuildInfo {
    pub default_device: &'static str,
    pub cuda_available: bool,
    pub metal_available: bool,
    pub mkl_available: bool,
    pub accelerate_available: bool,
    pub cudnn_available: bool,
}

pub fn build_info() -> BuildInfo {
    BuildInfo {
        default_device: DEFAULT_DEVICE,
        cuda_available: cfg!(feature = "cuda"),
        metal_available: cfg!(feature = "metal"),
        mkl_available: cfg!(feature = "mkl"),
        accelerate_available: cfg!(feature = "accelerate"),
        cudnn_available: cfg!(feature = "cudnn"),
    }
}
