//! Model identifier parsing.
//!
//! Identifiers arrive from the host as strings whose substrings encode family,
//! size and capability. They are parsed exactly once, at the node boundary,
//! into the closed types below; everything downstream matches on those types
//! instead of searching the string again.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{LoaderError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FunRelease {
    /// The first Fun releases, served from the pruned mirror
    Pruned,
    /// alibaba-pai V1.1 releases, served from their own repos
    V1_1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    CogVideoX,
    Fun(FunRelease),
}

impl Family {
    pub fn is_fun(&self) -> bool {
        matches!(self, Self::Fun(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelSize {
    TwoB,
    FiveB,
}

impl ModelSize {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::TwoB => "2b",
            Self::FiveB => "5b",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    TextToVideo,
    ImageToVideo,
    /// Image-to-video release whose pipeline runs without input padding
    PaddedImageToVideo,
    Inpaint,
    Pose,
    Interpolation,
    Tora,
}

/// A parsed diffusers-layout model identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelVariant {
    repo_id: String,
    family: Family,
    size: ModelSize,
    capability: Capability,
}

impl ModelVariant {
    /// Identifiers offered by the standard loader node.
    pub const KNOWN: &'static [&'static str] = &[
        "THUDM/CogVideoX-2b",
        "THUDM/CogVideoX-5b",
        "THUDM/CogVideoX-5b-I2V",
        "bertjiazheng/KoolCogVideoX-5b",
        "kijai/CogVideoX-Fun-2b",
        "kijai/CogVideoX-Fun-5b",
        "kijai/CogVideoX-5b-Tora",
        "alibaba-pai/CogVideoX-Fun-V1.1-2b-InP",
        "alibaba-pai/CogVideoX-Fun-V1.1-5b-InP",
        "alibaba-pai/CogVideoX-Fun-V1.1-2b-Pose",
        "alibaba-pai/CogVideoX-Fun-V1.1-5b-Pose",
        "feizhengcong/CogvideoX-Interpolation",
        "NimVideo/cogvideox-2b-img2vid",
    ];

    /// Parse an identifier.
    ///
    /// Unknown identifiers still parse: they get the plain family, are sized
    /// 5b unless they mention 2b, and resolve through the generic path rule.
    pub fn parse(input: &str) -> Result<Self> {
        let repo_id = input.trim();
        if repo_id.is_empty() {
            return Err(LoaderError::invalid_input("model", "empty model identifier"));
        }

        let family = if repo_id.contains("Fun") {
            if repo_id.contains("1.1") {
                Family::Fun(FunRelease::V1_1)
            } else {
                Family::Fun(FunRelease::Pruned)
            }
        } else {
            Family::CogVideoX
        };

        let size = if repo_id.contains("2b") {
            ModelSize::TwoB
        } else if repo_id.contains("5b") || family != Family::Fun(FunRelease::Pruned) {
            ModelSize::FiveB
        } else {
            // the pruned mirror holds one directory per size, so there is no fallback
            return Err(LoaderError::UnknownModelSize(repo_id.to_string()));
        };

        let capability = if repo_id.contains("Pose") {
            Capability::Pose
        } else if family.is_fun() {
            Capability::Inpaint
        } else if repo_id.contains("img2vid") {
            Capability::PaddedImageToVideo
        } else if repo_id.contains("I2V") {
            Capability::ImageToVideo
        } else if repo_id.contains("Interpolation") {
            Capability::Interpolation
        } else if repo_id.contains("Tora") {
            Capability::Tora
        } else {
            Capability::TextToVideo
        };

        Ok(Self {
            repo_id: repo_id.to_string(),
            family,
            size,
            capability,
        })
    }

    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn size(&self) -> ModelSize {
        self.size
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    /// Last path segment of the identifier, used as the local directory name.
    pub fn dir_name(&self) -> &str {
        last_segment(&self.repo_id)
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repo_id)
    }
}

/// A single-file quantized transformer checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GgufVariant {
    file_name: String,
    size: ModelSize,
    fun: bool,
    fun_v1_1: bool,
    image_conditioned: bool,
    capability: Capability,
}

impl GgufVariant {
    pub const KNOWN: &'static [&'static str] = &[
        "CogVideoX_5b_GGUF_Q4_0.safetensors",
        "CogVideoX_5b_I2V_GGUF_Q4_0.safetensors",
        "CogVideoX_5b_fun_GGUF_Q4_0.safetensors",
        "CogVideoX_5b_fun_1_1_GGUF_Q4_0.safetensors",
        "CogVideoX_5b_fun_1_1_Pose_GGUF_Q4_0.safetensors",
        "CogVideoX_5b_Interpolation_GGUF_Q4_0.safetensors",
        "CogVideoX_5b_Tora_GGUF_Q4_0.safetensors",
    ];

    pub fn parse(input: &str) -> Result<Self> {
        let file_name = input.trim();
        if file_name.is_empty() {
            return Err(LoaderError::invalid_input("model", "empty model file name"));
        }

        // the shipped configs only cover these two sizes
        let size = if file_name.contains("5b") {
            ModelSize::FiveB
        } else if file_name.contains("2b") {
            ModelSize::TwoB
        } else {
            return Err(LoaderError::UnknownModelSize(file_name.to_string()));
        };

        let fun = file_name.contains("fun");
        let capability = if file_name.contains("Pose") {
            Capability::Pose
        } else if fun {
            Capability::Inpaint
        } else if file_name.contains("I2V") {
            Capability::ImageToVideo
        } else if file_name.contains("Interpolation") {
            Capability::Interpolation
        } else if file_name.contains("Tora") {
            Capability::Tora
        } else {
            Capability::TextToVideo
        };

        Ok(Self {
            file_name: file_name.to_string(),
            size,
            fun,
            fun_v1_1: file_name.contains("1_1"),
            image_conditioned: file_name.contains("I2V") || file_name.contains("Interpolation"),
            capability,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn size(&self) -> ModelSize {
        self.size
    }

    pub fn is_fun(&self) -> bool {
        self.fun
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn family(&self) -> Family {
        match (self.fun, self.fun_v1_1) {
            (false, _) => Family::CogVideoX,
            (true, false) => Family::Fun(FunRelease::Pruned),
            (true, true) => Family::Fun(FunRelease::V1_1),
        }
    }

    /// Checkpoints newer than the original MZ conversions live in a separate repo.
    pub fn hosted_by_kijai(&self) -> bool {
        self.fun_v1_1
            || matches!(
                self.capability,
                Capability::ImageToVideo | Capability::Interpolation | Capability::Tora
            )
    }

    /// Transformer input channels implied by the file name: fun checkpoints
    /// first (Pose 32, otherwise 33), then image-conditioned ones (32).
    /// A Pose keyword outside the fun family does not change the width.
    pub fn in_channels(&self) -> usize {
        if self.fun {
            if self.capability == Capability::Pose {
                32
            } else {
                33
            }
        } else if self.image_conditioned {
            32
        } else {
            16
        }
    }
}

impl fmt::Display for GgufVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name)
    }
}

/// ControlNet checkpoints, one per conditioning signal and base size.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControlNetVariant {
    repo_id: String,
}

impl ControlNetVariant {
    pub const KNOWN: &'static [&'static str] = &[
        "TheDenk/cogvideox-2b-controlnet-hed-v1",
        "TheDenk/cogvideox-2b-controlnet-canny-v1",
        "TheDenk/cogvideox-5b-controlnet-hed-v1",
        "TheDenk/cogvideox-5b-controlnet-canny-v1",
    ];

    pub fn parse(input: &str) -> Result<Self> {
        let repo_id = input.trim();
        if repo_id.is_empty() {
            return Err(LoaderError::invalid_input("model", "empty model identifier"));
        }
        Ok(Self {
            repo_id: repo_id.to_string(),
        })
    }

    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }

    pub fn dir_name(&self) -> &str {
        last_segment(&self.repo_id)
    }
}

/// Trajectory add-on repositories.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToraVariant {
    repo_id: String,
}

impl ToraVariant {
    pub const KNOWN: &'static [&'static str] = &["kijai/CogVideoX-5b-Tora"];

    pub fn parse(input: &str) -> Result<Self> {
        let repo_id = input.trim();
        if repo_id.is_empty() {
            return Err(LoaderError::invalid_input("model", "empty model identifier"));
        }
        Ok(Self {
            repo_id: repo_id.to_string(),
        })
    }

    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }
}

fn last_segment(id: &str) -> &str {
    id.rsplit('/').next().unwrap_or(id)
}
