use super::types::{ArtifactError, BuildRecipe, Placement, SchedulerChoice};
use serde_json::Value;

/// A constructed, memory-resident model pipeline.
///
/// Implementations wrap the numerical runtime. Methods are called from the
/// blocking worker pool and may take seconds.
pub trait ModelArtifact: Send + Sync {
    /// Replace the pipeline's scheduler.
    fn apply_scheduler(&mut self, choice: &SchedulerChoice) -> Result<(), ArtifactError>;

    /// Move weights to their resident location.
    fn place(&mut self, placement: Placement) -> Result<(), ArtifactError>;

    /// Toggle tiled decoding.
    fn set_tiling(&self, enabled: bool);

    /// Run the pipeline on a job's arguments.
    fn execute(&self, request: &Value) -> Result<Value, ArtifactError>;

    /// Free the memory held by this artifact.
    fn release(&self) -> Result<(), ArtifactError>;
}

/// Constructs artifacts from a model id and a recipe.
///
/// When `recipe.conditioning_network` is set the builder loads that network
/// first and wires it into the pipeline.
pub trait ModelBuilder: Send + Sync {
    fn build(
        &self,
        model_id: &str,
        recipe: &BuildRecipe,
    ) -> Result<Box<dyn ModelArtifact>, ArtifactError>;

    /// Ask the runtime to return cached accelerator memory.
    fn release_cached_memory(&self) {}
}

/// Builder used when no model runtime is linked into the worker.
///
/// Every build fails, so generation jobs report a construction fault while
/// the rest of the worker keeps serving.
#[derive(Debug, Clone, Default)]
pub struct UnavailableBuilder;

impl ModelBuilder for UnavailableBuilder {
    fn build(
        &self,
        model_id: &str,
        _recipe: &BuildRecipe,
    ) -> Result<Box<dyn ModelArtifact>, ArtifactError> {
        Err(ArtifactError(format!(
            "no model runtime available to build {}",
            model_id
        )))
    }
}
