//! Attention patches applied on top of the base transformer blocks.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttentionKind {
    Spatial,
    Temporal,
    Cross,
}

/// Behavior a patched architecture adds to every transformer block.
pub trait BlockPatch: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the attention output cached at an earlier step may be reused
    /// at `timestep` instead of recomputing it. `step` counts calls for this
    /// attention kind within the current sampling run.
    fn should_reuse(&self, kind: AttentionKind, timestep: u32, step: usize) -> bool;
}

/// Reuse window for one attention kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastWindow {
    pub broadcast: bool,
    /// `[end, start]`: reuse only while `end < timestep < start`
    pub threshold: [u32; 2],
    /// Recompute every `range` steps
    pub range: usize,
}

impl BroadcastWindow {
    fn covers(&self, timestep: u32, step: usize) -> bool {
        self.broadcast
            && self.range > 0
            && step % self.range != 0
            && self.threshold[0] < timestep
            && timestep < self.threshold[1]
    }
}

/// Pyramid attention broadcast settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PabConfig {
    pub steps: usize,
    pub spatial: BroadcastWindow,
    pub temporal: BroadcastWindow,
    pub cross: BroadcastWindow,
}

impl Default for PabConfig {
    fn default() -> Self {
        Self {
            steps: 50,
            spatial: BroadcastWindow {
                broadcast: true,
                threshold: [100, 850],
                range: 2,
            },
            temporal: BroadcastWindow {
                broadcast: false,
                threshold: [100, 850],
                range: 4,
            },
            cross: BroadcastWindow {
                broadcast: false,
                threshold: [100, 850],
                range: 6,
            },
        }
    }
}

impl PabConfig {
    pub fn window(&self, kind: AttentionKind) -> &BroadcastWindow {
        match kind {
            AttentionKind::Spatial => &self.spatial,
            AttentionKind::Temporal => &self.temporal,
            AttentionKind::Cross => &self.cross,
        }
    }
}

impl BlockPatch for PabConfig {
    fn name(&self) -> &'static str {
        "pab"
    }

    fn should_reuse(&self, kind: AttentionKind, timestep: u32, step: usize) -> bool {
        self.window(kind).covers(timestep, step)
    }
}
