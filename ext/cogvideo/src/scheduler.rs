use serde::{Deserialize, Serialize};

use crate::error::{LoaderError, Result};

const SCHEDULER_2B: &str = include_str!("../configs/scheduler_config_2b.json");
const SCHEDULER_5B: &str = include_str!("../configs/scheduler_config_5b.json");

/// Shipped scheduler configurations, one per model size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerPreset {
    TwoB,
    FiveB,
}

impl SchedulerPreset {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::TwoB => "scheduler_config_2b.json",
            Self::FiveB => "scheduler_config_5b.json",
        }
    }

    pub fn raw(&self) -> &'static str {
        match self {
            Self::TwoB => SCHEDULER_2B,
            Self::FiveB => SCHEDULER_5B,
        }
    }

    /// The configuration as loose JSON, handed verbatim to the pipeline handle.
    pub fn json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(self.raw())?)
    }

    pub fn config(&self) -> Result<SchedulerConfig> {
        Ok(serde_json::from_str(self.raw())?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    Linear,
    ScaledLinear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestepSpacing {
    Linspace,
    Leading,
    Trailing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    Epsilon,
    VPrediction,
}

/// DDIM configuration as written by the CogVideoX releases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: BetaSchedule,
    #[serde(default)]
    pub rescale_betas_zero_snr: bool,
    #[serde(default = "default_snr_shift_scale")]
    pub snr_shift_scale: f64,
    pub timestep_spacing: TimestepSpacing,
    pub prediction_type: PredictionType,
    #[serde(default = "default_true")]
    pub set_alpha_to_one: bool,
    #[serde(default)]
    pub steps_offset: usize,
}

fn default_snr_shift_scale() -> f64 {
    3.0
}

fn default_true() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: BetaSchedule::ScaledLinear,
            rescale_betas_zero_snr: true,
            snr_shift_scale: 3.0,
            timestep_spacing: TimestepSpacing::Trailing,
            prediction_type: PredictionType::VPrediction,
            set_alpha_to_one: true,
            steps_offset: 0,
        }
    }
}

/// DDIM noise schedule with the CogVideoX SNR shift, handed to the sampler
/// together with its configuration.
#[derive(Debug, Clone)]
pub struct DdimScheduler {
    config: SchedulerConfig,
    alphas_cumprod: Vec<f64>,
}

impl DdimScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        let n = config.num_train_timesteps;
        if n == 0 {
            return Err(LoaderError::invalid_input(
                "num_train_timesteps",
                "must be positive",
            ));
        }

        let betas: Vec<f64> = match config.beta_schedule {
            BetaSchedule::Linear => linspace(config.beta_start, config.beta_end, n),
            BetaSchedule::ScaledLinear => {
                linspace(config.beta_start.sqrt(), config.beta_end.sqrt(), n)
                    .into_iter()
                    .map(|b| b * b)
                    .collect()
            }
        };

        let mut acc = 1.0;
        let mut alphas_cumprod: Vec<f64> = betas
            .iter()
            .map(|b| {
                acc *= 1.0 - b;
                acc
            })
            .collect();

        let shift = config.snr_shift_scale;
        for a in alphas_cumprod.iter_mut() {
            *a /= shift + (1.0 - shift) * *a;
        }

        if config.rescale_betas_zero_snr {
            rescale_zero_terminal_snr(&mut alphas_cumprod);
        }

        Ok(Self {
            config,
            alphas_cumprod,
        })
    }

    pub fn from_preset(preset: SchedulerPreset) -> Result<Self> {
        Self::new(preset.config()?)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let step = (end - start) / (n - 1) as f64;
    (0..n).map(|i| start + step * i as f64).collect()
}

fn rescale_zero_terminal_snr(alphas_cumprod: &mut [f64]) {
    let (Some(&first), Some(&last)) = (alphas_cumprod.first(), alphas_cumprod.last()) else {
        return;
    };
    let a0 = first.sqrt();
    let at = last.sqrt();
    if (a0 - at).abs() < f64::EPSILON {
        return;
    }
    for a in alphas_cumprod.iter_mut() {
        let s = (a.sqrt() - at) * a0 / (a0 - at);
        *a = s * s;
    }
}
