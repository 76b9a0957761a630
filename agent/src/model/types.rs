use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Tile conditioning network built ahead of variation pipelines.
pub const TILE_CONDITIONING_NETWORK: &str = "lllyasviel/control_v11f1e_sd15_tile";

/// Replacement autoencoder swapped into generation and upscale pipelines.
pub const REPLACEMENT_VAE: &str = "stabilityai/sd-vae-ft-mse";

/// Construction faults. Always local to the job that requested the artifact.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("failed to build {model_id} for {mode}: {reason}")]
    Build {
        model_id: String,
        mode: ExecutionMode,
        reason: String,
    },

    #[error("unknown scheduler `{0}`")]
    UnknownScheduler(String),

    #[error("invalid scheduler config: {0}")]
    InvalidScheduler(String),

    #[error("failed to place {model_id}: {reason}")]
    Placement { model_id: String, reason: String },

    #[error("worker pool unavailable: {0}")]
    Pool(String),
}

/// Failure reported by a model artifact or builder.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct ArtifactError(pub String);

impl From<String> for ArtifactError {
    fn from(message: String) -> Self {
        ArtifactError(message)
    }
}

impl From<&str> for ArtifactError {
    fn from(message: &str) -> Self {
        ArtifactError(message.to_string())
    }
}

/// What a cached pipeline is configured to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    TextToImage,
    ImageToImage,
    Upscale,
    Variation,
}

impl ExecutionMode {
    /// Resolve request flags. Image-to-image wins over variation, which wins
    /// over upscale; with no flag set the mode is text-to-image.
    pub fn from_flags(image_to_image: bool, variation: bool, upscale: bool) -> Self {
        if image_to_image {
            ExecutionMode::ImageToImage
        } else if variation {
            ExecutionMode::Variation
        } else if upscale {
            ExecutionMode::Upscale
        } else {
            ExecutionMode::TextToImage
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::TextToImage => "text2img",
            ExecutionMode::ImageToImage => "img2img",
            ExecutionMode::Upscale => "upscaler",
            ExecutionMode::Variation => "variation",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduler selection as supplied by the hub.
///
/// `name` identifies the configuration for cache matching; `scheduler` is the
/// scheduler class. A name of `default` keeps the pipeline's own scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub name: String,
    pub scheduler: String,
}

impl SchedulerConfig {
    pub const DEFAULT_NAME: &'static str = "default";

    pub fn new(name: impl Into<String>, scheduler: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scheduler: scheduler.into(),
        }
    }

    pub fn pipeline_default() -> Self {
        Self::new(Self::DEFAULT_NAME, Self::DEFAULT_NAME)
    }

    pub fn is_pipeline_default(&self) -> bool {
        self.name == Self::DEFAULT_NAME
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::pipeline_default()
    }
}

/// Supported noise schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulerKind {
    DpmSolverMultistep,
    Pndm,
    EulerAncestralDiscrete,
    EulerDiscrete,
    Kdpm2AncestralDiscrete,
    Ddim,
    Kdpm2Discrete,
    Ipndm,
    KarrasVe,
    UniPcMultistep,
}

impl SchedulerKind {
    pub fn class_name(&self) -> &'static str {
        match self {
            SchedulerKind::DpmSolverMultistep => "DPMSolverMultistepScheduler",
            SchedulerKind::Pndm => "PNDMScheduler",
            SchedulerKind::EulerAncestralDiscrete => "EulerAncestralDiscreteScheduler",
            SchedulerKind::EulerDiscrete => "EulerDiscreteScheduler",
            SchedulerKind::Kdpm2AncestralDiscrete => "KDPM2AncestralDiscreteScheduler",
            SchedulerKind::Ddim => "DDIMScheduler",
            SchedulerKind::Kdpm2Discrete => "KDPM2DiscreteScheduler",
            SchedulerKind::Ipndm => "IPNDMScheduler",
            SchedulerKind::KarrasVe => "KarrasVeScheduler",
            SchedulerKind::UniPcMultistep => "UniPCMultistepScheduler",
        }
    }
}

impl FromStr for SchedulerKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "DPMSolverMultistepScheduler" => SchedulerKind::DpmSolverMultistep,
            "PNDMScheduler" => SchedulerKind::Pndm,
            "EulerAncestralDiscreteScheduler" => SchedulerKind::EulerAncestralDiscrete,
            "EulerDiscreteScheduler" => SchedulerKind::EulerDiscrete,
            "KDPM2AncestralDiscreteScheduler" => SchedulerKind::Kdpm2AncestralDiscrete,
            "DDIMScheduler" => SchedulerKind::Ddim,
            "KDPM2DiscreteScheduler" => SchedulerKind::Kdpm2Discrete,
            "IPNDMScheduler" => SchedulerKind::Ipndm,
            "KarrasVeScheduler" => SchedulerKind::KarrasVe,
            "UniPCMultistepScheduler" => SchedulerKind::UniPcMultistep,
            other => return Err(CacheError::UnknownScheduler(other.to_string())),
        };
        Ok(kind)
    }
}

/// Scheduler to install on a freshly built pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerChoice {
    /// Keep whatever scheduler the pipeline ships with.
    PipelineDefault,
    Configured {
        kind: SchedulerKind,
        /// Solver variant, only set for DPM-Solver multistep
        algorithm_type: Option<&'static str>,
    },
}

impl SchedulerChoice {
    /// Decide the scheduler for `mode`. Variation pipelines always run UniPC.
    pub fn resolve(mode: ExecutionMode, config: &SchedulerConfig) -> Result<Self, CacheError> {
        if config.name.trim().is_empty() {
            return Err(CacheError::InvalidScheduler(
                "scheduler config must have a name".to_string(),
            ));
        }

        if mode == ExecutionMode::Variation {
            return Ok(SchedulerChoice::Configured {
                kind: SchedulerKind::UniPcMultistep,
                algorithm_type: None,
            });
        }

        if config.is_pipeline_default() {
            return Ok(SchedulerChoice::PipelineDefault);
        }

        if config.scheduler.trim().is_empty() {
            return Err(CacheError::InvalidScheduler(format!(
                "scheduler config `{}` must name a scheduler",
                config.name
            )));
        }

        let kind: SchedulerKind = config.scheduler.parse()?;
        let algorithm_type = match kind {
            SchedulerKind::DpmSolverMultistep => Some("dpmsolver++"),
            _ => None,
        };

        Ok(SchedulerChoice::Configured {
            kind,
            algorithm_type,
        })
    }
}

/// Where model weights live while resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Accelerator,
    /// Weights stay in host memory and move to the accelerator on use
    HostOffload { sequential: bool },
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Accelerator => f.write_str("accelerator"),
            Placement::HostOffload { sequential: false } => f.write_str("host_offload"),
            Placement::HostOffload { sequential: true } => f.write_str("sequential_offload"),
        }
    }
}

/// Floating point precision of loaded weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Half,
    Full,
}

/// Request hints that influence placement and decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionHints {
    pub width: u32,
    pub height: u32,
    /// Decode in tiles to bound peak memory
    pub enable_tiling: bool,
}

impl Default for ResolutionHints {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            enable_tiling: true,
        }
    }
}

/// Pipeline family a recipe builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    /// Text or image conditioned generation with long prompt weighting
    LongPromptWeighting,
    /// Image-to-image driven by a conditioning network
    ConditionedImageToImage,
    Upscale,
}

/// Everything a [`ModelBuilder`](super::ModelBuilder) needs to construct one
/// pipeline for a given mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecipe {
    pub mode: ExecutionMode,
    pub pipeline: PipelineKind,
    /// Auxiliary network to build before the pipeline itself
    pub conditioning_network: Option<&'static str>,
    pub vae_override: Option<&'static str>,
    pub precision: Precision,
    pub disable_safety_checker: bool,
}

impl BuildRecipe {
    pub fn for_mode(mode: ExecutionMode, precision: Precision) -> Self {
        let (pipeline, conditioning_network, vae_override) = match mode {
            ExecutionMode::Variation => (
                PipelineKind::ConditionedImageToImage,
                Some(TILE_CONDITIONING_NETWORK),
                None,
            ),
            ExecutionMode::TextToImage | ExecutionMode::ImageToImage => (
                PipelineKind::LongPromptWeighting,
                None,
                Some(REPLACEMENT_VAE),
            ),
            ExecutionMode::Upscale => (PipelineKind::Upscale, None, Some(REPLACEMENT_VAE)),
        };

        Self {
            mode,
            pipeline,
            conditioning_network,
            vae_override,
            precision,
            disable_safety_checker: true,
        }
    }
}
