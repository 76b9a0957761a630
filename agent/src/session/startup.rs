use crate::context::AgentContext;
use crate::protocol::Envelope;
use serde_json::{json, Value};

/// Frames sent once, in order, after every successful handshake.
///
/// 1. `hello_world` (`worker`/`register`) announcing capabilities and identity
/// 2. `hardware_info` (`system`/`update`) with the machine description
pub fn startup_sequence(ctx: &AgentContext) -> Vec<Envelope> {
    let report = ctx.probe.capacity_snapshot();
    let machine = serde_json::to_value(ctx.probe.machine_info()).unwrap_or(Value::Null);

    let register = Envelope::new("hello_world", "worker", "register").with_arguments(json!({
        "supported_job_types": report.supported_job_types(&ctx.config.worker.enabled_modules),
        "hardware_limits": report.hardware_limits(),
        "worker_id": ctx.worker_id,
        "hardware": machine,
    }));
    let hardware = Envelope::new("hardware_info", "system", "update").with_arguments(machine);

    vec![register, hardware]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use crate::config::AgentConfig;
    use crate::context::AgentContextBuilder;
    use crate::hardware::{HardwareCapacityReport, HardwareProbe};
    use std::sync::Arc;

    struct FixedProbe(HardwareCapacityReport);

    impl HardwareProbe for FixedProbe {
        fn capacity_snapshot(&self) -> HardwareCapacityReport {
            self.0
        }
    }

    #[test]
    fn test_startup_sequence_order_and_content() {
        let mut config = AgentConfig::default();
        config.worker.enabled_modules = vec!["llama".to_string()];
        let probe = FixedProbe(HardwareCapacityReport {
            accelerator_memory_gib: Some(24.0),
            system_memory_gib: 64,
            cpu_cores: 8,
        });
        let ctx = AgentContextBuilder::new(config)
            .with_worker_id("render-box-2")
            .with_auth(Arc::new(StaticToken("t".into())))
            .with_probe(Arc::new(probe))
            .build()
            .unwrap();

        let frames = startup_sequence(&ctx);
        assert_eq!(frames.len(), 2);

        let register = &frames[0];
        assert_eq!(register.message_type, "hello_world");
        assert_eq!(register.module_name, "worker");
        assert_eq!(register.module_command, "register");
        assert_eq!(register.arguments["worker_id"], "render-box-2");
        assert_eq!(register.arguments["supported_job_types"]["gpu"], true);
        assert_eq!(register.arguments["supported_job_types"]["llama"], true);
        assert!(register.arguments["supported_job_types"].get("compute").is_none());
        assert_eq!(register.arguments["hardware_limits"]["memory"], 64);
        assert_eq!(register.arguments["hardware"]["cpu_count"], 8);

        let hardware = &frames[1];
        assert_eq!(hardware.message_type, "hardware_info");
        assert_eq!(hardware.module_name, "system");
        assert_eq!(hardware.module_command, "update");
        assert_eq!(hardware.arguments["video_memory_amount"], 24.0);
    }
}
