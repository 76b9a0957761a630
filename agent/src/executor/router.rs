use super::handlers::{HardwareInfoHandler, ImageGenerationHandler};
use super::types::JobError;
use crate::context::AgentContext;
use crate::protocol::{CommandId, Envelope, JobMessage};
use crate::session::SessionSender;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// What a handler gets besides the job itself.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: Uuid,
    /// Session the job arrived on
    pub session: SessionSender,
    pub agent: Arc<AgentContext>,
}

/// Maps a decoded job to the replies it produces.
#[async_trait]
pub trait CommandRouter: Send + Sync {
    async fn handle(&self, job: &JobMessage, ctx: &JobContext) -> Result<Vec<Envelope>, JobError>;
}

/// One (module, command) handler.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, job: &JobMessage, ctx: &JobContext) -> Result<Vec<Envelope>, JobError>;
}

/// Table-driven router keyed by [`CommandId`].
#[derive(Default)]
pub struct ModuleRouter {
    handlers: HashMap<CommandId, Arc<dyn CommandHandler>>,
}

impl ModuleRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Router with the handlers every worker serves.
    pub fn with_builtin_handlers() -> Self {
        let image = Arc::new(ImageGenerationHandler);
        Self::new()
            .register(
                CommandId::new("system", "hardware_info"),
                Arc::new(HardwareInfoHandler),
            )
            .register(CommandId::new("image_generation", "generate"), image.clone())
            .register(CommandId::new("image_generation", "variation"), image.clone())
            .register(CommandId::new("image_generation", "upscale"), image)
    }

    /// Add or replace the handler for `command`.
    pub fn register(mut self, command: CommandId, handler: Arc<dyn CommandHandler>) -> Self {
        self.handlers.insert(command, handler);
        self
    }

    pub fn handles(&self, command: &CommandId) -> bool {
        self.handlers.contains_key(command)
    }
}

#[async_trait]
impl CommandRouter for ModuleRouter {
    async fn handle(&self, job: &JobMessage, ctx: &JobContext) -> Result<Vec<Envelope>, JobError> {
        let handler = self
            .handlers
            .get(&job.command)
            .ok_or_else(|| JobError::UnknownCommand(job.command.to_string()))?;

        debug!(job_id = %ctx.job_id, command = %job.command, "Routing job");
        handler.handle(job, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_routes() {
        let router = ModuleRouter::with_builtin_handlers();
        assert!(router.handles(&CommandId::new("system", "hardware_info")));
        assert!(router.handles(&CommandId::new("image_generation", "generate")));
        assert!(router.handles(&CommandId::new("image_generation", "variation")));
        assert!(router.handles(&CommandId::new("image_generation", "upscale")));
        assert!(!router.handles(&CommandId::new("image_generation", "paint")));
    }
}
