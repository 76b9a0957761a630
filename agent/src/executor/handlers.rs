//! Built-in command handlers.

use super::router::{CommandHandler, JobContext};
use super::types::JobError;
use crate::model::{ExecutionMode, ResolutionHints, SchedulerConfig};
use crate::protocol::{Envelope, JobMessage};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{info, instrument};

/// `system`/`hardware_info`: reply with the current machine description.
pub struct HardwareInfoHandler;

#[async_trait]
impl CommandHandler for HardwareInfoHandler {
    async fn handle(&self, job: &JobMessage, ctx: &JobContext) -> Result<Vec<Envelope>, JobError> {
        let info = ctx.agent.probe.machine_info();
        let mut arguments = serde_json::to_value(&info)
            .map_err(|e| JobError::Execution(format!("encode machine info: {}", e)))?;
        if let Value::Object(fields) = &mut arguments {
            fields.insert(
                "context".to_string(),
                job.context.clone().unwrap_or(Value::Null),
            );
        }

        Ok(vec![
            Envelope::new("hardware_info", "system", "update").with_arguments(arguments)
        ])
    }
}

#[derive(Debug, Deserialize)]
struct Resolution {
    width: u32,
    height: u32,
}

/// Generation parameters read from a job's arguments.
#[derive(Debug, Deserialize)]
struct GenerationRequest {
    #[serde(alias = "model_id")]
    model: String,
    #[serde(default)]
    resolution: Option<Resolution>,
    #[serde(default)]
    scheduler_config: Option<SchedulerConfig>,
    #[serde(default)]
    img2img: bool,
    #[serde(default)]
    promptless_variation: bool,
    #[serde(default)]
    upscaler: bool,
    #[serde(default)]
    enable_tiling: Option<bool>,
}

impl GenerationRequest {
    fn parse(job: &JobMessage) -> Result<Self, JobError> {
        let mut request: GenerationRequest = serde_json::from_value(job.arguments.clone())
            .map_err(|e| JobError::InvalidPayload(format!("generation arguments: {}", e)))?;

        // Older hubs send the scheduler next to the arguments
        if request.scheduler_config.is_none() {
            if let Some(value) = job.field("scheduler_config") {
                let config = serde_json::from_value(value.clone())
                    .map_err(|e| JobError::InvalidPayload(format!("scheduler_config: {}", e)))?;
                request.scheduler_config = Some(config);
            }
        }

        Ok(request)
    }

    fn mode(&self, action: &str) -> ExecutionMode {
        ExecutionMode::from_flags(
            self.img2img,
            self.promptless_variation || action == "variation",
            self.upscaler || action == "upscale",
        )
    }

    fn hints(&self) -> ResolutionHints {
        let defaults = ResolutionHints::default();
        ResolutionHints {
            width: self.resolution.as_ref().map_or(defaults.width, |r| r.width),
            height: self.resolution.as_ref().map_or(defaults.height, |r| r.height),
            enable_tiling: self.enable_tiling.unwrap_or(defaults.enable_tiling),
        }
    }
}

/// `image_generation`/{`generate`, `variation`, `upscale`}.
///
/// Acquires a matching pipeline from the model cache, runs it on the worker
/// pool and replies with the pipeline output as `data`.
pub struct ImageGenerationHandler;

#[async_trait]
impl CommandHandler for ImageGenerationHandler {
    #[instrument(skip_all, fields(job_id = %ctx.job_id, command = %job.command))]
    async fn handle(&self, job: &JobMessage, ctx: &JobContext) -> Result<Vec<Envelope>, JobError> {
        let request = GenerationRequest::parse(job)?;
        let mode = request.mode(&job.command.action);
        let scheduler = request.scheduler_config.clone().unwrap_or_default();
        let hints = request.hints();

        let lease = ctx
            .agent
            .cache
            .acquire(&request.model, mode, &scheduler, &hints)
            .await?;

        let started = Instant::now();
        let handle = lease.handle.clone();
        let arguments = job.arguments.clone();
        let output = ctx
            .agent
            .pool
            .run(move || handle.execute(&arguments))
            .await??;
        ctx.agent.cache.clear_memory_cache();

        info!(
            model_id = %lease.model_id,
            mode = %mode,
            placement = %lease.placement,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Generation finished"
        );

        let reply = Envelope::new("job_result", &job.command.module, &job.command.action)
            .with_data(output)
            .with_arguments(json!({
                "context": job.context.clone().unwrap_or(Value::Null),
                "model_id": lease.model_id,
                "mode": mode.as_str(),
            }));
        Ok(vec![reply])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(frame: Value) -> JobMessage {
        JobMessage::decode(&frame.to_string()).unwrap()
    }

    #[test]
    fn test_parse_from_config_section() {
        let message = job(json!({
            "job_type": "gpu",
            "module_name": "image_generation",
            "module_command": "generate",
            "config": {
                "model": "runwayml/stable-diffusion-v1-5",
                "resolution": {"width": 768, "height": 512}
            },
            "scheduler_config": {"name": "dpm", "scheduler": "DPMSolverMultistepScheduler"}
        }));

        let request = GenerationRequest::parse(&message).unwrap();
        assert_eq!(request.model, "runwayml/stable-diffusion-v1-5");
        assert_eq!(request.mode("generate"), ExecutionMode::TextToImage);
        assert_eq!(
            request.scheduler_config,
            Some(SchedulerConfig::new("dpm", "DPMSolverMultistepScheduler"))
        );

        let hints = request.hints();
        assert_eq!((hints.width, hints.height), (768, 512));
        assert!(hints.enable_tiling);
    }

    #[test]
    fn test_mode_from_command() {
        let message = job(json!({
            "module_name": "image_generation",
            "module_command": "variation",
            "arguments": {"model_id": "sd-1.5", "enable_tiling": false}
        }));

        let request = GenerationRequest::parse(&message).unwrap();
        assert_eq!(request.mode("variation"), ExecutionMode::Variation);
        assert_eq!(request.mode("upscale"), ExecutionMode::Upscale);
        assert!(request.scheduler_config.is_none());
        assert!(!request.hints().enable_tiling);
        assert_eq!(request.hints().width, 512);
    }

    #[test]
    fn test_missing_model_is_invalid_payload() {
        let message = job(json!({
            "module_name": "image_generation",
            "module_command": "generate",
            "arguments": {"resolution": {"width": 512, "height": 512}}
        }));

        let err = GenerationRequest::parse(&message).unwrap_err();
        assert_eq!(err.kind(), "invalid_payload");
    }
}
