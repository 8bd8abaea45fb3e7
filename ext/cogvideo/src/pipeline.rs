use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::DType;
use tracing::info;

use crate::device::DeviceManager;
use crate::error::Result;
use crate::patch::BlockPatch;
use crate::scheduler::DdimScheduler;
use crate::transform::PipelineCompilation;
use crate::transformer::Transformer;
use crate::vae::Vae;
use crate::variant::{Capability, Family};

/// Sampling pipeline flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Standard,
    FunInpaint,
    FunControl,
}

impl PipelineKind {
    pub fn select(family: Family, capability: Capability) -> Self {
        match (family.is_fun(), capability) {
            (true, Capability::Pose) => Self::FunControl,
            (true, _) => Self::FunInpaint,
            (false, _) => Self::Standard,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Standard => "CogVideoXPipeline",
            Self::FunInpaint => "CogVideoX_Fun_Pipeline_Inpaint",
            Self::FunControl => "CogVideoX_Fun_Pipeline_Control",
        }
    }
}

/// Transformer, VAE and scheduler assembled for sampling.
#[derive(Debug)]
pub struct Pipeline {
    kind: PipelineKind,
    transformer: Transformer,
    vae: Vae,
    scheduler: DdimScheduler,
    patch: Option<Arc<dyn BlockPatch>>,
    input_with_padding: bool,
    sequential_offload: bool,
    compilation: Option<PipelineCompilation>,
}

impl Pipeline {
    pub fn new(kind: PipelineKind, transformer: Transformer, vae: Vae, scheduler: DdimScheduler) -> Self {
        let patch = transformer.arch().patch().cloned();
        Self {
            kind,
            transformer,
            vae,
            scheduler,
            patch,
            input_with_padding: true,
            sequential_offload: false,
            compilation: None,
        }
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn transformer(&self) -> &Transformer {
        &self.transformer
    }

    pub fn vae(&self) -> &Vae {
        &self.vae
    }

    pub fn scheduler(&self) -> &DdimScheduler {
        &self.scheduler
    }

    pub fn patch(&self) -> Option<&Arc<dyn BlockPatch>> {
        self.patch.as_ref()
    }

    /// Whether image conditioning is padded to the full frame count
    pub fn input_with_padding(&self) -> bool {
        self.input_with_padding
    }

    pub fn set_input_with_padding(&mut self, padding: bool) {
        self.input_with_padding = padding;
    }

    pub fn sequential_offload(&self) -> bool {
        self.sequential_offload
    }

    /// Park every weight on the offload device; modules are streamed to the
    /// compute device one at a time while sampling.
    pub fn enable_sequential_cpu_offload(&mut self, devices: &dyn DeviceManager) -> Result<()> {
        let offload = devices.offload_device();
        self.transformer.to_device(offload)?;
        self.vae.to_device(offload)?;
        self.sequential_offload = true;
        info!("Sequential offload enabled for {}", self.kind.name());
        Ok(())
    }

    pub fn compilation(&self) -> Option<&PipelineCompilation> {
        self.compilation.as_ref()
    }

    pub fn compile(&mut self, plan: PipelineCompilation) {
        info!(
            "Compiling {} with {} ({})",
            self.kind.name(),
            plan.backend,
            plan.mode
        );
        self.compilation = Some(plan);
    }
}

struct HandleData {
    pipe: Pipeline,
    dtype: DType,
    base_path: PathBuf,
    onediff: bool,
    cpu_offloading: bool,
    scheduler_config: serde_json::Value,
    model_name: String,
}

/// The value a model loader node returns. Cloning shares the pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    inner: Arc<HandleData>,
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("model_name", &self.inner.model_name)
            .field("kind", &self.inner.pipe.kind())
            .field("dtype", &self.inner.dtype)
            .field("base_path", &self.inner.base_path)
            .field("onediff", &self.inner.onediff)
            .field("cpu_offloading", &self.inner.cpu_offloading)
            .finish()
    }
}

impl PipelineHandle {
    pub fn new(
        pipe: Pipeline,
        dtype: DType,
        base_path: impl Into<PathBuf>,
        onediff: bool,
        scheduler_config: serde_json::Value,
        model_name: impl Into<String>,
    ) -> Self {
        let cpu_offloading = pipe.sequential_offload();
        Self {
            inner: Arc::new(HandleData {
                pipe,
                dtype,
                base_path: base_path.into(),
                onediff,
                cpu_offloading,
                scheduler_config,
                model_name: model_name.into(),
            }),
        }
    }

    pub fn pipe(&self) -> &Pipeline {
        &self.inner.pipe
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn base_path(&self) -> &Path {
        &self.inner.base_path
    }

    pub fn onediff(&self) -> bool {
        self.inner.onediff
    }

    pub fn cpu_offloading(&self) -> bool {
        self.inner.cpu_offloading
    }

    pub fn scheduler_config(&self) -> &serde_json::Value {
        &self.inner.scheduler_config
    }

    pub fn model_name(&self) -> &str {
        &self.inner.model_name
    }
}
