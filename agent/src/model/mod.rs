//! Model instance management
//!
//! Constructed model pipelines are expensive (seconds to build, gigabytes of
//! accelerator memory), so they are cached per model id and swapped in and out
//! according to the requested execution mode and the hardware's capacity.
//!
//! This module owns only the bookkeeping. Building and running pipelines is
//! delegated to a [`ModelBuilder`] and the [`ModelArtifact`]s it returns.

mod builder;
mod cache;
mod types;

pub use builder::{ModelArtifact, ModelBuilder, UnavailableBuilder};
pub use cache::{
    ArtifactLease, CachePolicy, ModelInstanceCache, ResidentArtifact, ResidentEntry,
};
pub use types::{
    ArtifactError, BuildRecipe, CacheError, ExecutionMode, PipelineKind, Placement, Precision,
    ResolutionHints, SchedulerChoice, SchedulerConfig, SchedulerKind, REPLACEMENT_VAE,
    TILE_CONDITIONING_NETWORK,
};
