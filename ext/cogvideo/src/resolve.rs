//! Maps parsed identifiers to local paths, remote repos and fetch filters.
//!
//! Resolution only reads the filesystem to pick between an officially
//! installed copy and the download location; it never writes.

use std::path::{Path, PathBuf};

use crate::config::ModelPaths;
use crate::hub::SnapshotRequest;
use crate::scheduler::SchedulerPreset;
use crate::variant::{
    ControlNetVariant, Family, FunRelease, GgufVariant, ModelSize, ModelVariant, ToraVariant,
};

pub const FUN_PRUNED_REPO: &str = "kijai/CogVideoX-Fun-pruned";
pub const KIJAI_GGUF_REPO: &str = "Kijai/CogVideoX_GGUF";
pub const MZ_GGUF_REPO: &str = "MinusZoneAI/ComfyUI-CogVideoX-MZ";
pub const GGUF_VAE_REPO: &str = "Kijai/CogVideoX-Fun-pruned";
pub const GGUF_VAE_FILE: &str = "cogvideox_vae.safetensors";

/// Text encoders and tokenizers are loaded by separate nodes.
pub const IGNORE_TEXT_STACK: &[&str] = &["*text_encoder*", "*tokenizer*"];

/// Allow / ignore glob lists applied to a repo listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filters {
    pub allow: Vec<String>,
    pub ignore: Vec<String>,
}

impl Filters {
    pub fn ignore_text_stack() -> Self {
        Self {
            allow: Vec::new(),
            ignore: IGNORE_TEXT_STACK.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn allow_containing(name: &str) -> Self {
        Self {
            allow: vec![format!("*{}*", name)],
            ignore: Vec::new(),
        }
    }
}

/// Where a diffusers-layout model lives and how to obtain it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub repo_id: String,
    /// Directory holding `transformer/` and `vae/`
    pub base_path: PathBuf,
    /// Directory the snapshot is written into
    pub download_dir: PathBuf,
    pub scheduler: SchedulerPreset,
    pub filters: Filters,
}

impl Resolution {
    pub fn transformer_dir(&self) -> PathBuf {
        self.base_path.join("transformer")
    }

    pub fn vae_dir(&self) -> PathBuf {
        self.base_path.join("vae")
    }

    /// Path whose absence triggers a download.
    pub fn marker(&self) -> PathBuf {
        self.transformer_dir()
    }

    pub fn snapshot_request(&self) -> SnapshotRequest {
        SnapshotRequest::new(&self.repo_id, &self.download_dir)
            .allow(self.filters.allow.iter().cloned())
            .ignore(self.filters.ignore.iter().cloned())
    }
}

fn scheduler_for(size: ModelSize) -> SchedulerPreset {
    match size {
        ModelSize::TwoB => SchedulerPreset::TwoB,
        ModelSize::FiveB => SchedulerPreset::FiveB,
    }
}

/// First candidate that exists, else the fallback.
fn installed_or(official: PathBuf, fallback: PathBuf) -> PathBuf {
    if official.exists() {
        official
    } else {
        fallback
    }
}

pub fn resolve(variant: &ModelVariant, paths: &ModelPaths) -> Resolution {
    let cogvideo = paths.cogvideo_dir();
    let repo_id = variant.repo_id().to_string();
    let scheduler = scheduler_for(variant.size());
    let filters = Filters::ignore_text_stack();

    let (repo_id, base_path, download_dir) = match variant.family() {
        Family::Fun(FunRelease::Pruned) => {
            // the pruned repo holds both sizes, each in its own folder
            let dir_name = format!("CogVideoX-Fun-{}-InP", variant.size().tag());
            let base_path = installed_or(
                paths.fun_official_dir().join(&dir_name),
                cogvideo.join(&dir_name),
            );
            (FUN_PRUNED_REPO.to_string(), base_path, cogvideo.to_path_buf())
        }
        Family::Fun(FunRelease::V1_1) => {
            let base_path = installed_or(
                paths.fun_official_dir().join(variant.dir_name()),
                cogvideo.join(variant.dir_name()),
            );
            (repo_id, base_path.clone(), base_path)
        }
        Family::CogVideoX if variant.size() == ModelSize::TwoB => {
            let dir_name = if variant.repo_id().contains("img2vid") {
                "cogvideox-2b-img2vid"
            } else {
                "CogVideo2B"
            };
            let base_path = cogvideo.join(dir_name);
            (repo_id, base_path.clone(), base_path)
        }
        Family::CogVideoX => {
            let base_path = cogvideo.join(variant.dir_name());
            (repo_id, base_path.clone(), base_path)
        }
    };

    Resolution {
        repo_id,
        base_path,
        download_dir,
        scheduler,
        filters,
    }
}

/// Where a single-file quantized checkpoint lives and how to obtain it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufResolution {
    pub model_path: PathBuf,
    pub download_dir: PathBuf,
    pub repo_id: &'static str,
    pub scheduler: SchedulerPreset,
    pub filters: Filters,
}

impl GgufResolution {
    pub fn snapshot_request(&self) -> SnapshotRequest {
        SnapshotRequest::new(self.repo_id, &self.download_dir)
            .allow(self.filters.allow.iter().cloned())
    }
}

pub fn resolve_gguf(variant: &GgufVariant, paths: &ModelPaths) -> GgufResolution {
    let download_dir = paths.gguf_dir();
    let model_path = installed_or(
        paths.diffusion_models_dir().join(variant.file_name()),
        download_dir.join(variant.file_name()),
    );
    let repo_id = if variant.hosted_by_kijai() {
        KIJAI_GGUF_REPO
    } else {
        MZ_GGUF_REPO
    };

    GgufResolution {
        model_path,
        download_dir,
        repo_id,
        scheduler: scheduler_for(variant.size()),
        filters: Filters::allow_containing(variant.file_name()),
    }
}

/// The standalone VAE used with quantized transformers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaeResolution {
    pub vae_path: PathBuf,
    pub download_dir: PathBuf,
    pub repo_id: &'static str,
    pub filters: Filters,
}

impl VaeResolution {
    pub fn snapshot_request(&self) -> SnapshotRequest {
        SnapshotRequest::new(self.repo_id, &self.download_dir)
            .allow(self.filters.allow.iter().cloned())
    }
}

pub fn resolve_gguf_vae(paths: &ModelPaths) -> VaeResolution {
    let download_dir = paths.vae_dir();
    VaeResolution {
        vae_path: download_dir.join(GGUF_VAE_FILE),
        download_dir,
        repo_id: GGUF_VAE_REPO,
        filters: Filters::allow_containing(GGUF_VAE_FILE),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlNetResolution {
    pub repo_id: String,
    pub base_path: PathBuf,
    pub filters: Filters,
}

impl ControlNetResolution {
    pub fn snapshot_request(&self) -> SnapshotRequest {
        SnapshotRequest::new(&self.repo_id, &self.base_path)
            .ignore(self.filters.ignore.iter().cloned())
    }

    /// The whole directory acts as the download marker.
    pub fn marker(&self) -> &Path {
        &self.base_path
    }
}

pub fn resolve_controlnet(variant: &ControlNetVariant, paths: &ModelPaths) -> ControlNetResolution {
    ControlNetResolution {
        repo_id: variant.repo_id().to_string(),
        base_path: paths.controlnet_dir().join(variant.dir_name()),
        filters: Filters::ignore_text_stack(),
    }
}

/// One component file of the Tora bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToraComponent {
    pub path: PathBuf,
    pub repo_id: String,
    pub filters: Filters,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToraResolution {
    pub download_dir: PathBuf,
    pub fuser: ToraComponent,
    pub traj_extractor: ToraComponent,
}

impl ToraResolution {
    pub fn snapshot_request(&self, component: &ToraComponent) -> SnapshotRequest {
        SnapshotRequest::new(&component.repo_id, &self.download_dir)
            .allow(component.filters.allow.iter().cloned())
    }
}

pub fn resolve_tora(variant: &ToraVariant, paths: &ModelPaths) -> ToraResolution {
    let download_dir = paths.tora_dir();
    let component = |sub: &str| {
        let file = format!("{}.safetensors", sub);
        ToraComponent {
            path: download_dir.join(sub).join(&file),
            repo_id: variant.repo_id().to_string(),
            filters: Filters::allow_containing(&file),
        }
    };
    ToraResolution {
        fuser: component("fuser"),
        traj_extractor: component("traj_extractor"),
        download_dir: download_dir.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_id(id: &str, paths: &ModelPaths) -> Resolution {
        resolve(&ModelVariant::parse(id).unwrap(), paths)
    }

    #[test]
    fn test_generic_rule() {
        let paths = ModelPaths::new("/m");
        let r = resolve_id("THUDM/CogVideoX-5b-I2V", &paths);
        assert_eq!(r.repo_id, "THUDM/CogVideoX-5b-I2V");
        assert_eq!(r.base_path, PathBuf::from("/m/CogVideo/CogVideoX-5b-I2V"));
        assert_eq!(r.download_dir, r.base_path);
        assert_eq!(r.scheduler, SchedulerPreset::FiveB);
        assert_eq!(r.marker(), PathBuf::from("/m/CogVideo/CogVideoX-5b-I2V/transformer"));
    }

    #[test]
    fn test_two_b_rules() {
        let paths = ModelPaths::new("/m");
        let r = resolve_id("THUDM/CogVideoX-2b", &paths);
        assert_eq!(r.base_path, PathBuf::from("/m/CogVideo/CogVideo2B"));
        assert_eq!(r.scheduler, SchedulerPreset::TwoB);

        let r = resolve_id("NimVideo/cogvideox-2b-img2vid", &paths);
        assert_eq!(r.base_path, PathBuf::from("/m/CogVideo/cogvideox-2b-img2vid"));
        assert_eq!(r.repo_id, "NimVideo/cogvideox-2b-img2vid");
    }

    #[test]
    fn test_fun_pruned_downloads_into_shared_dir() {
        let paths = ModelPaths::new("/nonexistent/models");
        let r = resolve_id("kijai/CogVideoX-Fun-5b", &paths);
        assert_eq!(r.repo_id, FUN_PRUNED_REPO);
        assert_eq!(
            r.base_path,
            PathBuf::from("/nonexistent/models/CogVideo/CogVideoX-Fun-5b-InP")
        );
        assert_eq!(r.download_dir, PathBuf::from("/nonexistent/models/CogVideo"));
    }

    #[test]
    fn test_filters() {
        let paths = ModelPaths::new("/m");
        let r = resolve_id("THUDM/CogVideoX-5b", &paths);
        let req = r.snapshot_request();
        assert!(!req.matches("text_encoder/model.safetensors"));
        assert!(!req.matches("tokenizer/spiece.model"));
        assert!(req.matches("transformer/diffusion_pytorch_model.safetensors"));
    }

    #[test]
    fn test_gguf_repos() {
        let paths = ModelPaths::new("/nonexistent");
        let repo = |name: &str| resolve_gguf(&GgufVariant::parse(name).unwrap(), &paths).repo_id;
        assert_eq!(repo("CogVideoX_5b_GGUF_Q4_0.safetensors"), MZ_GGUF_REPO);
        assert_eq!(repo("CogVideoX_5b_fun_GGUF_Q4_0.safetensors"), MZ_GGUF_REPO);
        assert_eq!(repo("CogVideoX_5b_I2V_GGUF_Q4_0.safetensors"), KIJAI_GGUF_REPO);
        assert_eq!(repo("CogVideoX_5b_fun_1_1_GGUF_Q4_0.safetensors"), KIJAI_GGUF_REPO);
        assert_eq!(repo("CogVideoX_5b_Tora_GGUF_Q4_0.safetensors"), KIJAI_GGUF_REPO);
    }

    #[test]
    fn test_tora_layout() {
        let paths = ModelPaths::new("/m");
        let r = resolve_tora(&ToraVariant::parse("kijai/CogVideoX-5b-Tora").unwrap(), &paths);
        assert_eq!(
            r.fuser.path,
            PathBuf::from("/m/CogVideo/CogVideoX-5b-Tora/fuser/fuser.safetensors")
        );
        assert_eq!(
            r.traj_extractor.path,
            PathBuf::from("/m/CogVideo/CogVideoX-5b-Tora/traj_extractor/traj_extractor.safetensors")
        );
        assert_eq!(r.fuser.filters.allow, vec!["*fuser.safetensors*".to_string()]);
    }
}
